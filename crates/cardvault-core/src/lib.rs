//! Core card model shared by the catalogue, normalizer, store and sync crates.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "cardvault-core";

/// Raw, loosely-typed card object as returned inside the catalogue's `data` envelope.
///
/// Only `id` and the nested `set` object are relied on; everything else is
/// projected opportunistically by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRecord(pub JsonValue);

impl RemoteRecord {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    /// The reconciliation key: a non-empty JSON string, taken verbatim.
    pub fn id(&self) -> Option<&str> {
        self.0
            .get("id")
            .and_then(JsonValue::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Top-level field lookup; JSON `null` is reported as absent.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.0
    }
}

impl From<JsonValue> for RemoteRecord {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}

/// Fixed-schema card row. `id` is the stable primary key across syncs.
///
/// Semi-structured payloads (attacks, abilities, legalities, ...) are kept as
/// opaque JSON rather than decomposed into tables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedCard {
    pub id: String,
    pub name: String,
    #[serde(rename = "set")]
    pub set_id: Option<String>,
    pub series: Option<String>,
    pub publisher: Option<String>,
    pub generation: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub artist: Option<String>,
    pub set_num: Option<String>,
    pub types: Option<Vec<String>>,
    pub supertype: Option<String>,
    pub subtypes: Option<Vec<String>>,
    pub level: Option<String>,
    pub hp: Option<String>,
    pub evolves_from: Option<String>,
    pub evolves_to: Option<Vec<String>>,
    pub abilities: Option<JsonValue>,
    pub attacks: Option<JsonValue>,
    pub weaknesses: Option<JsonValue>,
    pub retreat_cost: Option<Vec<String>>,
    pub converted_retreat_cost: Option<i64>,
    pub rarity: Option<String>,
    pub flavor_text: Option<String>,
    pub national_pokedex_numbers: Option<Vec<i64>>,
    pub legalities: Option<JsonValue>,
    pub resistances: Option<JsonValue>,
    pub rules: Option<Vec<String>>,
    pub regulation_mark: Option<String>,
    pub ancient_trait: Option<JsonValue>,
}

impl NormalizedCard {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Overwrite every field with the incoming values, nulls included.
    ///
    /// The destructure is exhaustive so a new column cannot be silently skipped.
    pub fn overwrite_with(&mut self, incoming: NormalizedCard) {
        let NormalizedCard {
            id,
            name,
            set_id,
            series,
            publisher,
            generation,
            release_date,
            artist,
            set_num,
            types,
            supertype,
            subtypes,
            level,
            hp,
            evolves_from,
            evolves_to,
            abilities,
            attacks,
            weaknesses,
            retreat_cost,
            converted_retreat_cost,
            rarity,
            flavor_text,
            national_pokedex_numbers,
            legalities,
            resistances,
            rules,
            regulation_mark,
            ancient_trait,
        } = incoming;

        self.id = id;
        self.name = name;
        self.set_id = set_id;
        self.series = series;
        self.publisher = publisher;
        self.generation = generation;
        self.release_date = release_date;
        self.artist = artist;
        self.set_num = set_num;
        self.types = types;
        self.supertype = supertype;
        self.subtypes = subtypes;
        self.level = level;
        self.hp = hp;
        self.evolves_from = evolves_from;
        self.evolves_to = evolves_to;
        self.abilities = abilities;
        self.attacks = attacks;
        self.weaknesses = weaknesses;
        self.retreat_cost = retreat_cost;
        self.converted_retreat_cost = converted_retreat_cost;
        self.rarity = rarity;
        self.flavor_text = flavor_text;
        self.national_pokedex_numbers = national_pokedex_numbers;
        self.legalities = legalities;
        self.resistances = resistances;
        self.rules = rules;
        self.regulation_mark = regulation_mark;
        self.ancient_trait = ancient_trait;
    }
}

/// A card as it exists in the local store after a committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCard {
    #[serde(flatten)]
    pub card: NormalizedCard,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedCard {
    pub fn id(&self) -> &str {
        &self.card.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_record_treats_null_as_absent() {
        let record = RemoteRecord::new(json!({"id": "xy1-1", "level": null, "hp": "180"}));
        assert_eq!(record.id(), Some("xy1-1"));
        assert!(record.get("level").is_none());
        assert!(record.get("missing").is_none());
        assert_eq!(record.get("hp"), Some(&json!("180")));
    }

    #[test]
    fn remote_id_is_taken_verbatim() {
        assert_eq!(RemoteRecord::new(json!({"id": "xy1-1 "})).id(), Some("xy1-1 "));
        assert_eq!(RemoteRecord::new(json!({"id": ""})).id(), None);
        assert_eq!(RemoteRecord::new(json!({"id": 42})).id(), None);
    }

    #[test]
    fn overwrite_replaces_values_and_clears_dropped_fields() {
        let mut stored = NormalizedCard {
            rarity: Some("Rare".into()),
            hp: Some("60".into()),
            attacks: Some(json!([{"name": "Tackle"}])),
            ..NormalizedCard::new("base1-1", "A")
        };
        let incoming = NormalizedCard {
            hp: Some("70".into()),
            ..NormalizedCard::new("base1-1", "B")
        };

        stored.overwrite_with(incoming.clone());

        assert_eq!(stored, incoming);
        assert_eq!(stored.name, "B");
        assert!(stored.rarity.is_none());
        assert!(stored.attacks.is_none());
    }

    #[test]
    fn set_id_serializes_under_set_key() {
        let card = NormalizedCard {
            set_id: Some("xy1".into()),
            ..NormalizedCard::new("xy1-1", "Venusaur-EX")
        };
        let value = serde_json::to_value(&card).unwrap();
        assert_eq!(value["set"], json!("xy1"));
        assert!(value.get("set_id").is_none());
    }
}
