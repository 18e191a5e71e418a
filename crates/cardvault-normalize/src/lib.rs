//! Projection of raw catalogue records onto the fixed `NormalizedCard` schema.

use cardvault_core::{NormalizedCard, RemoteRecord};
use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "cardvault-normalize";

const SLASH_DATE_FORMAT: &str = "%Y/%m/%d";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("record has no usable `{0}` field")]
    MissingField(&'static str),
}

/// Map a raw catalogue record onto the local schema. Pure; performs no I/O.
///
/// Absent or null fields become `None`. Only a missing `id` or `name` is an
/// error, since the store cannot hold a card without them. The `id` is kept
/// exactly as the catalogue lists it.
pub fn normalize(raw: &RemoteRecord) -> Result<NormalizedCard, NormalizeError> {
    let value = raw.as_value();
    let id = raw
        .id()
        .map(ToString::to_string)
        .ok_or(NormalizeError::MissingField("id"))?;
    let name = json_text(value, &["name"]).ok_or(NormalizeError::MissingField("name"))?;

    Ok(NormalizedCard {
        id,
        name,
        set_id: json_text(value, &["set", "id"]),
        series: json_text(value, &["set", "series"]),
        publisher: None,
        generation: None,
        release_date: json_str(value, &["set", "releaseDate"]).and_then(parse_release_date),
        artist: json_text(value, &["artist"]),
        set_num: json_text(value, &["number"]),
        types: json_string_vec(value, &["types"]),
        supertype: json_text(value, &["supertype"]),
        subtypes: json_string_vec(value, &["subtypes"]),
        level: json_text(value, &["level"]),
        hp: json_text(value, &["hp"]),
        evolves_from: json_text(value, &["evolvesFrom"]),
        evolves_to: json_string_vec(value, &["evolvesTo"]),
        abilities: json_opaque(value, &["abilities"]),
        attacks: json_opaque(value, &["attacks"]),
        weaknesses: json_opaque(value, &["weaknesses"]),
        retreat_cost: json_string_vec(value, &["retreatCost"]),
        converted_retreat_cost: json_i64(value, &["convertedRetreatCost"]),
        rarity: json_text(value, &["rarity"]),
        flavor_text: json_text(value, &["flavorText"]),
        national_pokedex_numbers: json_i64_vec(value, &["nationalPokedexNumbers"]),
        legalities: json_opaque(value, &["legalities"]),
        resistances: json_opaque(value, &["resistances"]),
        rules: json_string_vec(value, &["rules"]),
        regulation_mark: json_text(value, &["regulationMark"]),
        ancient_trait: json_opaque(value, &["ancientTrait"]),
    })
}

/// ISO-8601 (`YYYY-MM-DD`) first, then the catalogue's `YYYY/MM/DD`; anything else is `None`.
pub fn parse_release_date(input: &str) -> Option<NaiveDate> {
    let trimmed = input.trim();
    trimmed
        .parse::<NaiveDate>()
        .or_else(|_| NaiveDate::parse_from_str(trimmed, SLASH_DATE_FORMAT))
        .ok()
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

/// Strings pass through; numbers are rendered as text (`"hp": 60` and `"hp": "60"` agree).
fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    let text = match json_at(value, path)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    json_at(value, path)?.as_i64()
}

fn json_string_vec(value: &JsonValue, path: &[&str]) -> Option<Vec<String>> {
    let arr = json_at(value, path)?.as_array()?;
    Some(
        arr.iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect(),
    )
}

fn json_i64_vec(value: &JsonValue, path: &[&str]) -> Option<Vec<i64>> {
    let arr = json_at(value, path)?.as_array()?;
    Some(arr.iter().filter_map(JsonValue::as_i64).collect())
}

fn json_opaque(value: &JsonValue, path: &[&str]) -> Option<JsonValue> {
    json_at(value, path).cloned()
}
