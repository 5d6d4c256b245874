
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::text::{TermExpansion, default_expansions};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;
pub const DEFAULT_VALUE_SEPARATOR: &str = "[/,]";
pub const DEFAULT_SYNONYM_TABLE: &str = "dicosynonymes";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub settings: RunSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tables: BTreeMap<String, TableSpec>,
    #[serde(default)]
    pub etl_types: BTreeMap<String, EtlTypeConfig>,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub batch_size: u32,
    pub timeout_seconds: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "paraphrase-multilingual:latest".to_string(),
            batch_size: 64,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchingConfig {
    pub similarity_threshold: f32,
    pub term_expansions: Vec<TermExpansion>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            term_expansions: default_expansions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunSettings {
    pub batch_size: u32,
    pub max_iterations: u32,
    pub progress_interval: u32,
    pub database_path: PathBuf,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_iterations: 1,
            progress_interval: 50,
            database_path: PathBuf::from("linkage.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

/// Declarative description of one table, keyed by its config name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub columns: BTreeMap<String, ColumnSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnSpec {
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EtlTypeConfig {
    #[serde(default)]
    pub description: String,
    pub source_table: String,
    /// Target table key. Also the scope under which synonyms are recorded.
    pub table_name: String,
    pub value_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_id_field: Option<String>,
    #[serde(default)]
    pub multiple_values: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub junction_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub junction_mapping: Option<JunctionMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_separator: Option<String>,
    #[serde(default)]
    pub context_fields: Vec<ContextFieldConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_threshold: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JunctionMapping {
    pub source_field: String,
    pub target_field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextFieldConfig {
    pub field: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

fn default_weight() -> f32 {
    1.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_matches: Option<String>,
}

/// How resolved ids are written back to the source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingMode {
    /// One id column on the source row.
    Single { mapping_id_field: String },
    /// One junction row per resolved id.
    Multi {
        junction_table: String,
        source_field: String,
        target_field: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Unknown ETL type: {0}")]
    UnknownEtlType(String),
    #[error("ETL type '{etl_type}' references unknown table '{table}'")]
    UnknownTable { etl_type: String, table: String },
    #[error("Table '{0}' is not registered")]
    UnregisteredTable(String),
    #[error("Table '{table}' has no column '{column}'")]
    UnknownColumn { table: String, column: String },
    #[error("ETL type '{etl_type}' is missing required key '{key}'")]
    MissingKey { etl_type: String, key: String },
    #[error("Invalid identifier: '{0}' (letters, digits and underscores only)")]
    InvalidIdentifier(String),
    #[error("Unsupported column type: {0}")]
    UnsupportedColumnType(String),
    #[error("Invalid regex '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("Invalid context weight for field '{0}' (must be finite and non-negative)")]
    InvalidWeight(String),
    #[error("Invalid similarity threshold: {0} (must be between 0 and 2)")]
    InvalidThreshold(f32),
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid embedding batch size: {0} (must be between 1 and 1000)")]
    InvalidEmbeddingBatchSize(u32),
    #[error("Invalid batch size: {0} (must be between 1 and 100000)")]
    InvalidBatchSize(u32),
    #[error("Invalid max iterations: {0} (must be at least 1)")]
    InvalidMaxIterations(u32),
    #[error("Invalid progress interval: {0} (must be at least 1)")]
    InvalidProgressInterval(u32),
    #[error("Invalid retry policy: {0}")]
    InvalidRetry(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Load and validate a configuration file. A missing file yields the defaults.
    #[inline]
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();
        let base_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        if !config_path.exists() {
            return Ok(Self {
                base_dir,
                ..Self::default()
            });
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = base_dir;

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    #[inline]
    pub fn save(&self, config_path: &Path) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Default location of the configuration file
    #[inline]
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::DirectoryError)?;
        Ok(dir.join("linkage-etl").join("config.toml"))
    }

    /// SQLite database location; relative paths resolve against the config file's directory
    #[inline]
    pub fn database_path(&self) -> PathBuf {
        if self.settings.database_path.is_absolute() {
            self.settings.database_path.clone()
        } else {
            self.base_dir.join(&self.settings.database_path)
        }
    }

    #[inline]
    pub fn etl_type(&self, key: &str) -> Result<&EtlTypeConfig, ConfigError> {
        self.etl_types
            .get(key)
            .ok_or_else(|| ConfigError::UnknownEtlType(key.to_string()))
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.embedding.validate()?;
        self.matching.validate()?;
        self.settings.validate()?;
        self.retry.validate()?;

        for (key, table) in &self.tables {
            validate_identifier(key)?;
            validate_identifier(&table.name)?;
            for column in table.columns.keys() {
                validate_identifier(column)?;
            }
        }

        for (key, etl) in &self.etl_types {
            self.validate_etl_type(key, etl)?;
        }

        Ok(())
    }

    fn validate_etl_type(&self, key: &str, etl: &EtlTypeConfig) -> Result<(), ConfigError> {
        let source = self.table_for(key, &etl.source_table)?;
        let target = self.table_for(key, &etl.table_name)?;

        require_column(&etl.source_table, source, "id")?;
        require_column(&etl.source_table, source, &etl.value_field)?;
        require_column(&etl.table_name, target, "id")?;
        require_column(&etl.table_name, target, "name")?;

        for context in &etl.context_fields {
            require_column(&etl.source_table, source, &context.field)?;
            if !context.weight.is_finite() || context.weight < 0.0 {
                return Err(ConfigError::InvalidWeight(context.field.clone()));
            }
        }

        match etl.mapping_mode(key)? {
            MappingMode::Single { mapping_id_field } => {
                require_column(&etl.source_table, source, &mapping_id_field)?;
            }
            MappingMode::Multi {
                junction_table,
                source_field,
                target_field,
            } => {
                let junction = self.table_for(key, &junction_table)?;
                require_column(&junction_table, junction, &source_field)?;
                require_column(&junction_table, junction, &target_field)?;
            }
        }

        // The default synonym table is injected by the schema registry when absent
        if let Some(dictionary) = &etl.dictionary_table {
            if dictionary != DEFAULT_SYNONYM_TABLE || self.tables.contains_key(dictionary) {
                let table = self.table_for(key, dictionary)?;
                for column in ["table_name", "table_name_id", "name", "ai_match_message"] {
                    require_column(dictionary, table, column)?;
                }
            }
        }

        if let Some(separator) = &etl.value_separator {
            compile_pattern(separator)?;
        }
        if let Some(pattern) = etl
            .validation
            .as_ref()
            .and_then(|v| v.skip_if_matches.as_ref())
        {
            compile_pattern(pattern)?;
        }
        if let Some(threshold) = etl.similarity_threshold {
            validate_threshold(threshold)?;
        }

        Ok(())
    }

    fn table_for(&self, etl_type: &str, table: &str) -> Result<&TableSpec, ConfigError> {
        self.tables
            .get(table)
            .ok_or_else(|| ConfigError::UnknownTable {
                etl_type: etl_type.to_string(),
                table: table.to_string(),
            })
    }
}

impl EtlTypeConfig {
    /// Resolve the write-back strategy, failing when required keys are missing.
    #[inline]
    pub fn mapping_mode(&self, etl_type: &str) -> Result<MappingMode, ConfigError> {
        let missing = |key: &str| ConfigError::MissingKey {
            etl_type: etl_type.to_string(),
            key: key.to_string(),
        };

        if self.multiple_values {
            let junction_table = self
                .junction_table
                .clone()
                .ok_or_else(|| missing("junction_table"))?;
            let mapping = self
                .junction_mapping
                .clone()
                .ok_or_else(|| missing("junction_mapping"))?;
            Ok(MappingMode::Multi {
                junction_table,
                source_field: mapping.source_field,
                target_field: mapping.target_field,
            })
        } else {
            let mapping_id_field = self
                .mapping_id_field
                .clone()
                .ok_or_else(|| missing("mapping_id_field"))?;
            Ok(MappingMode::Single { mapping_id_field })
        }
    }

    #[inline]
    pub fn separator(&self) -> &str {
        self.value_separator
            .as_deref()
            .unwrap_or(DEFAULT_VALUE_SEPARATOR)
    }

    #[inline]
    pub fn skip_pattern(&self) -> Option<&str> {
        self.validation
            .as_ref()
            .and_then(|v| v.skip_if_matches.as_deref())
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        self.base_url()?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidEmbeddingBatchSize(self.batch_size));
        }

        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl MatchingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_threshold(self.similarity_threshold)
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > 100_000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidMaxIterations(self.max_iterations));
        }
        if self.progress_interval == 0 {
            return Err(ConfigError::InvalidProgressInterval(
                self.progress_interval,
            ));
        }
        Ok(())
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetry(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidRetry(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::InvalidRetry(format!(
                "max_delay_ms ({}) is below initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        Ok(())
    }
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`, the only names ever interpolated into SQL.
pub fn validate_identifier(identifier: &str) -> Result<(), ConfigError> {
    let mut chars = identifier.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(identifier.to_string()))
    }
}

pub fn compile_pattern(pattern: &str) -> Result<fancy_regex::Regex, ConfigError> {
    fancy_regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Similarity thresholds are finite and within [0, 2]; boosted scores may exceed 1.
pub fn validate_threshold(threshold: f32) -> Result<(), ConfigError> {
    if threshold.is_finite() && (0.0..=2.0).contains(&threshold) {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold(threshold))
    }
}

fn require_column(table_key: &str, table: &TableSpec, column: &str) -> Result<(), ConfigError> {
    if table.columns.contains_key(column) {
        Ok(())
    } else {
        Err(ConfigError::UnknownColumn {
            table: table_key.to_string(),
            column: column.to_string(),
        })
    }
}
