//! Core domain model for the TCG Pocket catalog sync.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tcgp-core";

/// Special/secret rarity tier used when the source shows zero rarity glyphs.
pub const SECRET_RARITY_TIER: u8 = 5;

/// Maps a source rarity glyph count to a rarity tier.
///
/// The source renders rarity as 1-4 diamond glyphs; cards rendered with none
/// are the secret-rarity convention and map to tier 5.
pub fn rarity_tier_from_glyphs(glyph_count: usize) -> u8 {
    if glyph_count == 0 {
        SECRET_RARITY_TIER
    } else {
        glyph_count as u8
    }
}

/// Stable identity key for a card.
///
/// Derived only from source-language attributes so the key survives
/// relocalization; dependent user records pin to this value.
pub fn card_identity(source_name: &str, source_set: &str, rarity_tier: u8) -> String {
    format!("{source_name} {source_set} {rarity_tier}")
}

/// One scraped catalog element, before localization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCardRecord {
    /// Source-language card name.
    pub source_name: String,
    /// Source-language set label, trailing parenthetical already stripped.
    pub source_set: String,
    pub rarity_tier: u8,
    /// Absolute image URL.
    pub image_ref: String,
}

impl RawCardRecord {
    pub fn identity(&self) -> String {
        card_identity(&self.source_name, &self.source_set, self.rarity_tier)
    }
}

/// Canonical catalog entry as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    /// Localized name, falling back to the source-language name.
    pub display_name: String,
    /// Localized set label, falling back to the source-language label.
    pub set_label: String,
    /// Source-language set label, retained for identity stability and re-lookup.
    pub source_set_code: String,
    /// Rarity tier in `[1, 5]`.
    pub rarity_tier: u8,
    pub image_ref: String,
}

/// One source-language -> preferred-language term mapping, immutable for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizationTable {
    terms: HashMap<String, String>,
}

impl LocalizationTable {
    pub fn new(terms: HashMap<String, String>) -> Self {
        Self { terms }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Resolves a term to its preferred-language form.
    ///
    /// Returns the resolved term plus whether the source term was used as a
    /// fallback. Empty input is returned unchanged and never counts as a
    /// fallback.
    pub fn resolve<'a>(&'a self, term: &'a str) -> (&'a str, bool) {
        if term.is_empty() {
            return (term, false);
        }
        match self.terms.get(term) {
            Some(preferred) => (preferred.as_str(), false),
            None => (term, true),
        }
    }
}

/// Splits a trailing case-insensitive `ex` variant marker off a card name.
///
/// Returns the base name and the marker exactly as it appeared, so callers
/// can reattach it verbatim after localization.
pub fn split_variant_marker(name: &str) -> (&str, Option<&str>) {
    let trimmed = name.trim_end();
    if trimmed.len() >= 3 && trimmed.is_char_boundary(trimmed.len() - 2) {
        let (head, tail) = trimmed.split_at(trimmed.len() - 2);
        if tail.eq_ignore_ascii_case("ex") && head.ends_with(char::is_whitespace) {
            return (head.trim_end(), Some(tail));
        }
    }
    (trimmed, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_glyphs_map_to_secret_tier() {
        assert_eq!(rarity_tier_from_glyphs(0), 5);
        for glyphs in 1..=4 {
            assert_eq!(rarity_tier_from_glyphs(glyphs), glyphs as u8);
        }
    }

    #[test]
    fn identity_is_stable_for_identical_source_attributes() {
        let a = card_identity("Pikachu", "Genetic Apex", 2);
        let b = card_identity("Pikachu", "Genetic Apex", 2);
        assert_eq!(a, b);
        assert_eq!(a, "Pikachu Genetic Apex 2");
    }

    #[test]
    fn identity_distinguishes_rarity_tiers() {
        assert_ne!(
            card_identity("Mewtwo", "Genetic Apex", 3),
            card_identity("Mewtwo", "Genetic Apex", 5)
        );
    }

    #[test]
    fn resolve_prefers_table_entry_and_flags_fallback() {
        let table = LocalizationTable::new(HashMap::from([(
            "Pikachu".to_string(),
            "Pikachu".to_string(),
        )]));
        assert_eq!(table.resolve("Pikachu"), ("Pikachu", false));
        assert_eq!(table.resolve("Mewtwo"), ("Mewtwo", true));
    }

    #[test]
    fn resolve_passes_empty_terms_through() {
        let table = LocalizationTable::empty();
        assert_eq!(table.resolve(""), ("", false));
    }

    #[test]
    fn variant_marker_is_split_case_insensitively() {
        assert_eq!(split_variant_marker("Mewtwo ex"), ("Mewtwo", Some("ex")));
        assert_eq!(split_variant_marker("Mewtwo EX"), ("Mewtwo", Some("EX")));
        assert_eq!(split_variant_marker("Mewtwo  Ex "), ("Mewtwo", Some("Ex")));
    }

    #[test]
    fn names_without_marker_are_untouched() {
        assert_eq!(split_variant_marker("Exeggcute"), ("Exeggcute", None));
        assert_eq!(split_variant_marker("ex"), ("ex", None));
        assert_eq!(split_variant_marker(""), ("", None));
    }
}
