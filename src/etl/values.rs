use anyhow::{Context, Result};
use fancy_regex::Regex;

use crate::config::{ConfigError, compile_pattern};

/// Turns a raw field into candidate values.
#[derive(Debug, Clone)]
pub enum ValueSplitter {
    /// Single-valued fields: the raw value is the only candidate
    Whole,
    /// Multi-valued fields: split on the separator, trim, drop empties
    Separator(Regex),
}

impl ValueSplitter {
    pub fn separator(pattern: &str) -> Result<Self, ConfigError> {
        Ok(Self::Separator(compile_pattern(pattern)?))
    }

    pub fn split(&self, raw: &str) -> Result<Vec<String>> {
        let Self::Separator(separator) = self else {
            return Ok(vec![raw.to_string()]);
        };

        let mut values = Vec::new();
        let mut start = 0;
        for found in separator.find_iter(raw) {
            let found = found.context("Failed to split value")?;
            push_trimmed(&mut values, raw.get(start..found.start()));
            start = found.end();
        }
        push_trimmed(&mut values, raw.get(start..));

        Ok(values)
    }
}

fn push_trimmed(values: &mut Vec<String>, part: Option<&str>) {
    if let Some(part) = part.map(str::trim).filter(|p| !p.is_empty()) {
        values.push(part.to_string());
    }
}

/// Per-ETL-type candidate validation.
#[derive(Debug, Clone, Default)]
pub struct ValueValidator {
    skip: Option<Regex>,
}

impl ValueValidator {
    /// `skip_if_matches` is anchored at the start of the trimmed value.
    pub fn new(skip_if_matches: Option<&str>) -> Result<Self, ConfigError> {
        let skip = skip_if_matches
            .map(|pattern| compile_pattern(&format!("^(?:{})", pattern)))
            .transpose()?;
        Ok(Self { skip })
    }

    /// Blank values and values matching the skip pattern are invalid.
    pub fn is_valid(&self, value: &str) -> Result<bool> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(false);
        }

        match &self.skip {
            Some(skip) => Ok(!skip
                .is_match(trimmed)
                .context("Failed to evaluate skip pattern")?),
            None => Ok(true),
        }
    }
}
