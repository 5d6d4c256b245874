// Text normalization
// Canonicalizes free text before it is embedded or compared


use serde::{Deserialize, Serialize};
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

/// Built-in domain expansions: a term containing the key gets the value appended.
pub const DEFAULT_TERM_EXPANSIONS: &[(&str, &str)] = &[
    ("tibia perone", "jambe"),
    ("femur", "jambe"),
    ("rachis cervical", "cou"),
    ("rachis lombaire", "dos"),
    ("rachis dorsal", "dos"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermExpansion {
    pub term: String,
    pub expansion: String,
}

/// Lowercase and trim.
#[inline]
pub fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Decompose (NFKD) and drop every non-ASCII code point, removing accents.
#[inline]
pub fn strip_diacritics(text: &str) -> String {
    text.nfkd().filter(char::is_ascii).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextNormalizer {
    expansions: Vec<TermExpansion>,
}

/// The built-in expansion table as owned config values.
pub fn default_expansions() -> Vec<TermExpansion> {
    DEFAULT_TERM_EXPANSIONS
        .iter()
        .map(|(term, expansion)| TermExpansion {
            term: (*term).to_string(),
            expansion: (*expansion).to_string(),
        })
        .collect()
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new(default_expansions())
    }
}

impl TextNormalizer {
    /// Expansion terms are matched against normalized text, so they are normalized too.
    #[inline]
    pub fn new(expansions: Vec<TermExpansion>) -> Self {
        let expansions = expansions
            .into_iter()
            .map(|e| TermExpansion {
                term: strip_diacritics(&normalize_text(&e.term)),
                expansion: e.expansion,
            })
            .filter(|e| !e.term.is_empty())
            .collect();
        Self { expansions }
    }

    /// Normalize a domain term: lowercase, trim, strip accents, then append the
    /// expansion token of every known term the text contains. Never removes text.
    pub fn normalize_term(&self, text: &str) -> String {
        let mut normalized = strip_diacritics(&normalize_text(text));
        let original_len = normalized.len();

        for expansion in &self.expansions {
            if normalized.contains(expansion.term.as_str()) {
                normalized.push(' ');
                normalized.push_str(&expansion.expansion);
            }
        }

        if normalized.len() != original_len {
            debug!("Expanded term '{}' to '{}'", text, normalized);
        }

        normalized
    }
}
