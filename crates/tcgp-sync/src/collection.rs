//! Third-party collection import: single source, no localization, no prune.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use tcgp_storage::{CollectionStore, HttpFetcher};
use tracing::info;

/// Default endpoint serving a player's collection payload.
pub const DEFAULT_COLLECTION_API: &str = "https://www.pokemon-zone.com/api/cards/search";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionEntry {
    pub card_id: String,
    pub name: String,
    pub set_code: Option<String>,
    pub rarity: Option<String>,
    pub language: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSnapshot {
    pub player_id: String,
    pub cards: Vec<CollectionEntry>,
}

impl CollectionSnapshot {
    pub fn unique_cards(&self) -> usize {
        self.cards.len()
    }

    pub fn total_copies(&self) -> u64 {
        self.cards.iter().map(|card| u64::from(card.quantity)).sum()
    }
}

/// Extracts the numeric player id from a `…/players/{id}/cards…` page URL.
pub fn player_id_from_url(url: &str) -> Result<String> {
    if !url.contains("/cards") {
        return Err(anyhow!("not a player cards URL: {url}"));
    }
    let mut segments = url.split('/').skip_while(|segment| *segment != "players");
    segments.next();
    segments
        .next()
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("not a player cards URL: {url}"))
}

fn string_field(entry: &Value, key: &str) -> Option<String> {
    match entry.get(key) {
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

/// Normalizes the source payload into a snapshot. Tolerates both `results`
/// and `cards` arrays and the field spellings the endpoint has used over
/// time; entries without an id or name are dropped.
pub fn normalize_collection(payload: &Value, player_id: &str) -> CollectionSnapshot {
    let entries = payload
        .get("results")
        .or_else(|| payload.get("cards"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let cards = entries
        .iter()
        .filter_map(|entry| {
            let card_id = string_field(entry, "id").or_else(|| string_field(entry, "code"))?;
            let name = string_field(entry, "name")?;
            let set_code = match entry.get("set") {
                Some(Value::Object(set)) => set
                    .get("code")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                Some(Value::String(code)) => Some(code.clone()),
                _ => None,
            };
            let quantity = entry
                .get("count")
                .or_else(|| entry.get("quantity"))
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32;
            Some(CollectionEntry {
                card_id,
                name,
                set_code,
                rarity: string_field(entry, "rarity"),
                language: string_field(entry, "language").unwrap_or_else(|| "FR".to_string()),
                quantity,
            })
        })
        .collect();

    CollectionSnapshot {
        player_id: player_id.to_string(),
        cards,
    }
}

/// Fetches, normalizes, and stores one player's collection for a user.
/// Latest import wins per user.
pub async fn import_collection(
    http: &HttpFetcher,
    store: &dyn CollectionStore,
    api_base: &str,
    user_id: &str,
    page_url: &str,
) -> Result<CollectionSnapshot> {
    let player_id = player_id_from_url(page_url)?;
    let url = format!("{}/?player={}", api_base.trim_end_matches('/'), player_id);
    let payload = http
        .fetch_json(&url)
        .await
        .with_context(|| format!("fetching collection for player {player_id}"))?;

    let snapshot = normalize_collection(&payload, &player_id);
    let payload_json = serde_json::to_value(&snapshot).context("serializing collection snapshot")?;
    store
        .upsert_collection_snapshot(user_id, &player_id, &payload_json)
        .await
        .context("storing collection snapshot")?;

    info!(
        player_id = %snapshot.player_id,
        uniques = snapshot.unique_cards(),
        copies = snapshot.total_copies(),
        "collection imported"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tcgp_storage::MemoryCatalogStore;

    #[test]
    fn player_id_is_extracted_from_cards_urls() {
        let id = player_id_from_url("https://www.pokemon-zone.com/players/123456/cards/")
            .expect("player id");
        assert_eq!(id, "123456");
    }

    #[test]
    fn non_player_urls_are_rejected() {
        assert!(player_id_from_url("https://www.pokemon-zone.com/decks/123/").is_err());
        assert!(player_id_from_url("https://www.pokemon-zone.com/players//cards/").is_err());
        assert!(player_id_from_url("https://www.pokemon-zone.com/players/abc/cards/").is_err());
    }

    #[test]
    fn normalize_accepts_both_payload_shapes() {
        let payload = json!({
            "results": [
                { "id": "A1-025", "name": "Pikachu", "set": { "code": "A1" }, "rarity": "C", "count": 3 },
                { "code": "A1-094", "name": "Eevee", "set": "A1", "quantity": 1 },
                { "name": "missing id, dropped" },
            ]
        });
        let snapshot = normalize_collection(&payload, "123456");
        assert_eq!(snapshot.player_id, "123456");
        assert_eq!(snapshot.unique_cards(), 2);
        assert_eq!(snapshot.total_copies(), 4);

        let first = &snapshot.cards[0];
        assert_eq!(first.card_id, "A1-025");
        assert_eq!(first.set_code.as_deref(), Some("A1"));
        assert_eq!(first.language, "FR");
        assert_eq!(first.quantity, 3);
        assert_eq!(snapshot.cards[1].set_code.as_deref(), Some("A1"));
    }

    #[test]
    fn normalize_defaults_missing_quantity_to_one() {
        let payload = json!({ "cards": [ { "id": 42, "name": "Mew" } ] });
        let snapshot = normalize_collection(&payload, "9");
        assert_eq!(snapshot.cards[0].card_id, "42");
        assert_eq!(snapshot.cards[0].quantity, 1);
    }

    #[tokio::test]
    async fn snapshots_are_stored_latest_wins_per_user() {
        let store = MemoryCatalogStore::new();
        let snapshot = normalize_collection(
            &json!({ "results": [ { "id": "A1-025", "name": "Pikachu", "count": 2 } ] }),
            "123456",
        );
        let payload = serde_json::to_value(&snapshot).expect("payload");
        store
            .upsert_collection_snapshot("user-1", "123456", &payload)
            .await
            .expect("first upsert");
        store
            .upsert_collection_snapshot("user-1", "777", &payload)
            .await
            .expect("second upsert");

        let (player_id, _stored) = store.snapshot_for("user-1").await.expect("snapshot");
        assert_eq!(player_id, "777");
    }
}
