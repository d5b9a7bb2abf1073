//! Builds the card-name localization table from a public species API.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tcgp_storage::HttpFetcher;
use tokio::fs;
use tracing::{info, warn};

pub const DEFAULT_SPECIES_API: &str = "https://pokeapi.co/api/v2/pokemon-species?limit=20000";

const PER_SPECIES_PAUSE: Duration = Duration::from_millis(50);
const BATCH_PAUSE: Duration = Duration::from_millis(200);
const BATCH_SIZE: usize = 50;

/// Source language of the scraped catalog; keys of the table.
const SOURCE_LANG: &str = "en";
/// Preferred display language; values of the table.
const PREFERRED_LANG: &str = "fr";

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn localized_name(names: &[Value], lang: &str) -> Option<String> {
    names
        .iter()
        .find(|entry| {
            entry
                .get("language")
                .and_then(|language| language.get("name"))
                .and_then(Value::as_str)
                .map(|name| name.eq_ignore_ascii_case(lang))
                .unwrap_or(false)
        })
        .and_then(|entry| entry.get("name"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// Walks the species list and writes a sorted source-language to
/// preferred-language name table as JSON.
///
/// Per-species failures are warned and skipped; short pauses keep the
/// client cooperative with the public API.
pub async fn build_card_dictionary(
    http: &HttpFetcher,
    species_api: &str,
    out_path: &Path,
) -> Result<usize> {
    let listing = http
        .fetch_json(species_api)
        .await
        .context("fetching species list")?;
    let species = listing
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    info!(count = species.len(), "resolving localized species names");

    let mut dict = BTreeMap::new();
    for (index, entry) in species.iter().enumerate() {
        let Some(url) = entry.get("url").and_then(Value::as_str) else {
            continue;
        };
        match http.fetch_json(url).await {
            Ok(detail) => {
                let names = detail
                    .get("names")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let preferred = localized_name(&names, PREFERRED_LANG);
                let source = localized_name(&names, SOURCE_LANG).or_else(|| {
                    detail
                        .get("name")
                        .and_then(Value::as_str)
                        .map(capitalize)
                });
                if let (Some(source), Some(preferred)) = (source, preferred) {
                    dict.insert(capitalize(&source), preferred);
                }
            }
            Err(err) => {
                warn!(species = ?entry.get("name"), error = %err, "skipping species");
            }
        }

        if (index + 1) % BATCH_SIZE == 0 {
            info!(done = index + 1, total = species.len(), "dictionary progress");
            tokio::time::sleep(BATCH_PAUSE).await;
        } else {
            tokio::time::sleep(PER_SPECIES_PAUSE).await;
        }
    }

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&dict).context("serializing dictionary")?;
    fs::write(out_path, json)
        .await
        .with_context(|| format!("writing {}", out_path.display()))?;

    info!(entries = dict.len(), path = %out_path.display(), "card dictionary written");
    Ok(dict.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capitalize_uppercases_only_the_first_letter() {
        assert_eq!(capitalize("bulbasaur"), "Bulbasaur");
        assert_eq!(capitalize("Bulbasaur"), "Bulbasaur");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn localized_names_are_picked_by_language() {
        let names = vec![
            json!({ "language": { "name": "en" }, "name": "Bulbasaur" }),
            json!({ "language": { "name": "fr" }, "name": "Bulbizarre" }),
        ];
        assert_eq!(
            localized_name(&names, "fr"),
            Some("Bulbizarre".to_string())
        );
        assert_eq!(
            localized_name(&names, "en"),
            Some("Bulbasaur".to_string())
        );
        assert_eq!(localized_name(&names, "ja"), None);
    }
}
