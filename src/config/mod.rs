// Configuration management module
// Loads the TOML file describing the embedding backend, tables and ETL types

pub mod settings;


pub use settings::{
    ColumnSpec, Config, ConfigError, ContextFieldConfig, DEFAULT_SIMILARITY_THRESHOLD,
    DEFAULT_SYNONYM_TABLE, DEFAULT_VALUE_SEPARATOR, EmbeddingConfig, EtlTypeConfig,
    JunctionMapping, MappingMode, MatchingConfig, RetryConfig, RunSettings, TableSpec,
    ValidationConfig, compile_pattern, validate_identifier, validate_threshold,
};

/// Resolve the configuration file path, falling back to the platform config directory
#[inline]
pub fn resolve_config_path(
    explicit: Option<std::path::PathBuf>,
) -> Result<std::path::PathBuf, ConfigError> {
    match explicit {
        Some(path) => Ok(path),
        None => Config::default_path(),
    }
}
