//! Batch orchestrator
//!
//! Fetches unmapped source rows, resolves their values through the matching
//! engine and writes the resolved ids back, one transaction per record.

pub mod runner;
pub mod values;


pub use crate::monitoring::RunOutcome;
pub use runner::{EtlRunner, RecordOutcome, ValueOutcome, run_etl};
pub use values::{ValueSplitter, ValueValidator};

use crate::config::{Config, ConfigError, ContextFieldConfig, MappingMode};
use crate::database::models::{PendingFilter, SourceRecord, SourceSelect};
use crate::matching::ContextEntry;
use crate::schema::{SchemaRegistry, TableDescriptor};

/// Where resolved ids are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBack {
    /// Single-valued: the first resolved id goes into this source column
    MappingId { field: String },
    /// Multi-valued: one junction row per resolved id
    Junction {
        table: String,
        source_field: String,
        target_field: String,
    },
}

/// An ETL type resolved against the schema registry, ready to run.
#[derive(Debug, Clone)]
pub struct EtlPlan {
    pub etl_type: String,
    pub source: TableDescriptor,
    pub target: TableDescriptor,
    pub synonyms: Option<TableDescriptor>,
    pub value_field: String,
    pub write_back: WriteBack,
    pub context_fields: Vec<ContextFieldConfig>,
    pub splitter: ValueSplitter,
    pub validator: ValueValidator,
    /// ETL override, else the configured default
    pub similarity_threshold: f32,
    pub batch_size: u32,
    pub max_iterations: u32,
    pub progress_interval: u32,
}

impl EtlPlan {
    pub fn resolve(
        config: &Config,
        registry: &SchemaRegistry,
        etl_type: &str,
    ) -> Result<Self, ConfigError> {
        let etl = config.etl_type(etl_type)?;

        let source = registry.table(&etl.source_table)?.clone();
        let target = registry.table(&etl.table_name)?.clone();
        let synonyms = etl
            .dictionary_table
            .as_deref()
            .map(|key| registry.table(key).cloned())
            .transpose()?;

        source.require_column("id")?;
        source.require_column(&etl.value_field)?;
        target.require_column("id")?;
        target.require_column("name")?;
        for context in &etl.context_fields {
            source.require_column(&context.field)?;
        }

        let write_back = match etl.mapping_mode(etl_type)? {
            MappingMode::Single { mapping_id_field } => {
                source.require_column(&mapping_id_field)?;
                WriteBack::MappingId {
                    field: mapping_id_field,
                }
            }
            MappingMode::Multi {
                junction_table,
                source_field,
                target_field,
            } => {
                let junction = registry.table(&junction_table)?;
                junction.require_column(&source_field)?;
                junction.require_column(&target_field)?;
                WriteBack::Junction {
                    table: junction.name.clone(),
                    source_field,
                    target_field,
                }
            }
        };

        let splitter = if etl.multiple_values {
            ValueSplitter::separator(etl.separator())?
        } else {
            ValueSplitter::Whole
        };

        Ok(Self {
            etl_type: etl_type.to_string(),
            source,
            target,
            synonyms,
            value_field: etl.value_field.clone(),
            write_back,
            context_fields: etl.context_fields.clone(),
            splitter,
            validator: ValueValidator::new(etl.skip_pattern())?,
            similarity_threshold: etl
                .similarity_threshold
                .unwrap_or(config.matching.similarity_threshold),
            batch_size: config.settings.batch_size,
            max_iterations: config.settings.max_iterations,
            progress_interval: config.settings.progress_interval,
        })
    }

    #[inline]
    pub fn is_multi_valued(&self) -> bool {
        matches!(self.write_back, WriteBack::Junction { .. })
    }

    /// Shape of the unmapped-record query for this plan
    pub fn source_select(&self) -> SourceSelect {
        let pending = match &self.write_back {
            WriteBack::MappingId { field } => PendingFilter::NullMappingId {
                mapping_id_field: field.clone(),
            },
            WriteBack::Junction {
                table,
                source_field,
                ..
            } => PendingFilter::NoJunctionRow {
                junction_table: table.clone(),
                source_field: source_field.clone(),
            },
        };

        SourceSelect {
            table_name: self.source.name.clone(),
            value_field: self.value_field.clone(),
            context_fields: self
                .context_fields
                .iter()
                .map(|c| c.field.clone())
                .collect(),
            pending,
        }
    }

    /// Weighted context entries for every configured field with a non-empty value, in order
    pub fn context_for(&self, record: &SourceRecord) -> Vec<ContextEntry> {
        self.context_fields
            .iter()
            .filter_map(|context| {
                record
                    .context_value(&context.field)
                    .filter(|value| !value.is_empty())
                    .map(|value| ContextEntry::weighted(&context.field, value, context.weight))
            })
            .collect()
    }
}
