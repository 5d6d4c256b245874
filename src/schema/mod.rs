//! Schema registry
//!
//! Resolves the declarative table specs of the configuration into typed
//! descriptors once at startup. Everything that needs to know a table's
//! physical name or columns receives a `&SchemaRegistry`; there is no
//! process-wide model registry.


use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::config::{
    ColumnSpec, Config, ConfigError, DEFAULT_SYNONYM_TABLE, TableSpec, validate_identifier,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    UnsignedInteger,
    Varchar(u32),
    Timestamp,
    Boolean,
    Text,
}

impl ColumnType {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let normalized = raw.trim().to_lowercase();
        let column_type = match normalized.as_str() {
            "int" | "integer" => Self::Integer,
            "int unsigned" => Self::UnsignedInteger,
            "timestamp" => Self::Timestamp,
            "tinyint" => Self::Boolean,
            "text" => Self::Text,
            other => {
                let length = other
                    .strip_prefix("varchar(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|len| len.trim().parse::<u32>().ok())
                    .ok_or_else(|| ConfigError::UnsupportedColumnType(raw.to_string()))?;
                Self::Varchar(length)
            }
        };
        Ok(column_type)
    }

    /// SQLite storage class used in generated DDL
    #[inline]
    pub fn sqlite_type(self) -> &'static str {
        match self {
            Self::Integer | Self::UnsignedInteger | Self::Boolean => "INTEGER",
            Self::Varchar(_) | Self::Text | Self::Timestamp => "TEXT",
        }
    }

    #[inline]
    pub fn is_integer(self) -> bool {
        matches!(self, Self::Integer | Self::UnsignedInteger)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    pub primary: bool,
    pub nullable: bool,
    pub auto_increment: bool,
    /// `(table, column)` as written in the column config
    pub references: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub key: String,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub synonym_table: bool,
}

impl TableDescriptor {
    fn from_spec(key: &str, spec: &TableSpec, synonym_table: bool) -> Result<Self, ConfigError> {
        validate_identifier(key)?;
        validate_identifier(&spec.name)?;

        let columns = spec
            .columns
            .iter()
            .map(|(name, column)| ColumnDescriptor::from_spec(name, column))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            key: key.to_string(),
            name: spec.name.clone(),
            columns,
            synonym_table,
        })
    }

    #[inline]
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[inline]
    pub fn require_column(&self, name: &str) -> Result<&ColumnDescriptor, ConfigError> {
        self.column(name).ok_or_else(|| ConfigError::UnknownColumn {
            table: self.key.clone(),
            column: name.to_string(),
        })
    }

    /// Physical table name, quoted for interpolation into SQL
    #[inline]
    pub fn quoted_name(&self) -> String {
        quote_identifier(&self.name)
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for SQLite
    pub fn create_table_sql(&self, registry: &SchemaRegistry) -> String {
        let column_defs: Vec<String> = self
            .columns
            .iter()
            .map(|column| column.definition_sql(registry))
            .collect();

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quoted_name(),
            column_defs.join(", ")
        )
    }

    /// Synonym tables get a lookup index on `(table_name, name)`. It is not
    /// unique: existing dictionaries may hold case variants, and uniqueness of
    /// learned synonyms is checked before insert.
    pub fn index_sql(&self) -> Option<String> {
        if !self.synonym_table {
            return None;
        }
        Some(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (\"table_name\", \"name\")",
            quote_identifier(&format!("{}_scope_lookup", self.name)),
            self.quoted_name()
        ))
    }
}

impl ColumnDescriptor {
    fn from_spec(name: &str, spec: &ColumnSpec) -> Result<Self, ConfigError> {
        validate_identifier(name)?;
        let column_type = ColumnType::parse(&spec.column_type)?;

        let references = match &spec.references {
            Some(reference) => {
                let (table, column) = reference.split_once('.').ok_or_else(|| {
                    ConfigError::InvalidIdentifier(reference.clone())
                })?;
                validate_identifier(table)?;
                validate_identifier(column)?;
                Some((table.to_string(), column.to_string()))
            }
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            column_type,
            primary: spec.primary,
            nullable: spec.nullable && !spec.primary,
            auto_increment: spec.auto_increment,
            references,
        })
    }

    fn definition_sql(&self, registry: &SchemaRegistry) -> String {
        let mut sql = format!(
            "{} {}",
            quote_identifier(&self.name),
            self.column_type.sqlite_type()
        );

        if self.primary {
            sql.push_str(" PRIMARY KEY");
            if self.auto_increment && self.column_type.is_integer() {
                sql.push_str(" AUTOINCREMENT");
            }
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }

        if let Some((table, column)) = &self.references {
            // Specs may reference either a table key or a physical name
            let physical = registry
                .get(table)
                .map_or(table.as_str(), |t| t.name.as_str());
            let _ = write!(
                sql,
                " REFERENCES {}({})",
                quote_identifier(physical),
                quote_identifier(column)
            );
        }

        sql
    }
}

/// Table descriptors keyed by their config key. Built once per process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableDescriptor>,
}

impl SchemaRegistry {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let synonym_tables: BTreeSet<&str> = config
            .etl_types
            .values()
            .filter_map(|etl| etl.dictionary_table.as_deref())
            .collect();

        let mut tables = BTreeMap::new();
        for (key, spec) in &config.tables {
            let descriptor =
                TableDescriptor::from_spec(key, spec, synonym_tables.contains(key.as_str()))?;
            tables.insert(key.clone(), descriptor);
        }

        if !tables.contains_key(DEFAULT_SYNONYM_TABLE) {
            let descriptor = TableDescriptor::from_spec(
                DEFAULT_SYNONYM_TABLE,
                &default_synonym_table_spec(),
                true,
            )?;
            tables.insert(DEFAULT_SYNONYM_TABLE.to_string(), descriptor);
        }

        Ok(Self { tables })
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&TableDescriptor> {
        self.tables.get(key)
    }

    #[inline]
    pub fn table(&self, key: &str) -> Result<&TableDescriptor, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::UnregisteredTable(key.to_string()))
    }

    #[inline]
    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    /// DDL for every registered table, referenced tables first where possible
    pub fn schema_sql(&self) -> Vec<String> {
        let mut ordered: Vec<&TableDescriptor> = self.tables.values().collect();
        ordered.sort_by_key(|table| {
            table
                .columns
                .iter()
                .any(|column| column.references.is_some())
        });

        let mut statements = Vec::new();
        for table in ordered {
            statements.push(table.create_table_sql(self));
            if let Some(index) = table.index_sql() {
                statements.push(index);
            }
        }
        statements
    }
}

/// Identifiers are validated at registry construction; quoting guards keywords.
#[inline]
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

fn default_synonym_table_spec() -> TableSpec {
    let column = |column_type: &str, nullable: bool| ColumnSpec {
        column_type: column_type.to_string(),
        primary: false,
        nullable,
        auto_increment: false,
        references: None,
    };

    let mut columns = BTreeMap::new();
    columns.insert(
        "id".to_string(),
        ColumnSpec {
            column_type: "int unsigned".to_string(),
            primary: true,
            nullable: false,
            auto_increment: true,
            references: None,
        },
    );
    columns.insert("created".to_string(), column("timestamp", true));
    columns.insert("modified".to_string(), column("timestamp", true));
    columns.insert("table_name_id".to_string(), column("int unsigned", false));
    columns.insert("table_name".to_string(), column("varchar(255)", false));
    columns.insert("name".to_string(), column("varchar(255)", false));
    columns.insert("ai_match_message".to_string(), column("text", true));

    TableSpec {
        name: DEFAULT_SYNONYM_TABLE.to_string(),
        columns,
    }
}
