//! SQLite-backed card store: local id listing and transactional upsert.

use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use cardvault_core::{NormalizedCard, PersistedCard};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::types::Json;
use sqlx::{Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "cardvault-store";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://cardvault.db";

const CREATE_CARDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cards (
    id                       TEXT PRIMARY KEY NOT NULL,
    name                     TEXT NOT NULL,
    set_id                   TEXT,
    series                   TEXT,
    publisher                TEXT,
    generation               TEXT,
    release_date             TEXT,
    artist                   TEXT,
    set_num                  TEXT,
    types                    TEXT,
    supertype                TEXT,
    subtypes                 TEXT,
    level                    TEXT,
    hp                       TEXT,
    evolves_from             TEXT,
    evolves_to               TEXT,
    abilities                TEXT,
    attacks                  TEXT,
    weaknesses               TEXT,
    retreat_cost             TEXT,
    converted_retreat_cost   INTEGER,
    rarity                   TEXT,
    flavor_text              TEXT,
    national_pokedex_numbers TEXT,
    legalities               TEXT,
    resistances              TEXT,
    rules                    TEXT,
    regulation_mark          TEXT,
    ancient_trait            TEXT,
    created_at               TEXT NOT NULL,
    updated_at               TEXT NOT NULL
)
"#;

const SELECT_CARD: &str = r#"
SELECT id, name, set_id, series, publisher, generation, release_date, artist, set_num,
       types, supertype, subtypes, level, hp, evolves_from, evolves_to, abilities, attacks,
       weaknesses, retreat_cost, converted_retreat_cost, rarity, flavor_text,
       national_pokedex_numbers, legalities, resistances, rules, regulation_mark,
       ancient_trait, created_at, updated_at
  FROM cards
 WHERE id = ?
"#;

// Placeholder order: id, the 28 value columns, created_at, updated_at.
const INSERT_CARD: &str = r#"
INSERT INTO cards (
    id, name, set_id, series, publisher, generation, release_date, artist, set_num,
    types, supertype, subtypes, level, hp, evolves_from, evolves_to, abilities, attacks,
    weaknesses, retreat_cost, converted_retreat_cost, rarity, flavor_text,
    national_pokedex_numbers, legalities, resistances, rules, regulation_mark,
    ancient_trait, created_at, updated_at
) VALUES (
    ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
)
"#;

// Placeholder order: the 28 value columns, updated_at, id.
const UPDATE_CARD: &str = r#"
UPDATE cards
   SET name = ?, set_id = ?, series = ?, publisher = ?, generation = ?, release_date = ?,
       artist = ?, set_num = ?, types = ?, supertype = ?, subtypes = ?, level = ?, hp = ?,
       evolves_from = ?, evolves_to = ?, abilities = ?, attacks = ?, weaknesses = ?,
       retreat_cost = ?, converted_retreat_cost = ?, rarity = ?, flavor_text = ?,
       national_pokedex_numbers = ?, legalities = ?, resistances = ?, rules = ?,
       regulation_mark = ?, ancient_trait = ?, updated_at = ?
 WHERE id = ?
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("card {0} missing after write")]
    MissingAfterWrite(String),
}

/// Local persistence for normalized cards, keyed by card id.
#[async_trait]
pub trait CardStore: Send + Sync {
    async fn list_all_local_ids(&self) -> Result<HashSet<String>, StoreError>;

    /// Insert when absent, otherwise overwrite every field. One transaction per call.
    async fn upsert(&self, card: &NormalizedCard) -> Result<PersistedCard, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<PersistedCard>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteCardStore {
    pool: SqlitePool,
}

impl SqliteCardStore {
    /// Open (or create) the database behind `database_url` and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_CARDS_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CardStore for SqliteCardStore {
    async fn list_all_local_ids(&self) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM cards")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn upsert(&self, card: &NormalizedCard) -> Result<PersistedCard, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(SELECT_CARD)
            .bind(&card.id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| card_from_row(&row))
            .transpose()?;

        match existing {
            Some(mut persisted) => {
                persisted.card.overwrite_with(card.clone());
                bind_value_columns(sqlx::query(UPDATE_CARD), &persisted.card)
                    .bind(now)
                    .bind(&card.id)
                    .execute(&mut *tx)
                    .await?;
                debug!(card_id = %card.id, "card updated");
            }
            None => {
                bind_value_columns(sqlx::query(INSERT_CARD).bind(&card.id), card)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                debug!(card_id = %card.id, "card inserted");
            }
        }

        let stored = sqlx::query(SELECT_CARD)
            .bind(&card.id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| card_from_row(&row))
            .transpose()?
            .ok_or_else(|| StoreError::MissingAfterWrite(card.id.clone()))?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<Option<PersistedCard>, StoreError> {
        let row = sqlx::query(SELECT_CARD)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| card_from_row(&row)).transpose()?)
    }
}

/// Binds every column except `id` and the timestamps, in table order.
fn bind_value_columns<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    card: &'q NormalizedCard,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(card.name.as_str())
        .bind(card.set_id.as_deref())
        .bind(card.series.as_deref())
        .bind(card.publisher.as_deref())
        .bind(card.generation.as_deref())
        .bind(card.release_date)
        .bind(card.artist.as_deref())
        .bind(card.set_num.as_deref())
        .bind(card.types.as_ref().map(Json))
        .bind(card.supertype.as_deref())
        .bind(card.subtypes.as_ref().map(Json))
        .bind(card.level.as_deref())
        .bind(card.hp.as_deref())
        .bind(card.evolves_from.as_deref())
        .bind(card.evolves_to.as_ref().map(Json))
        .bind(card.abilities.as_ref().map(Json))
        .bind(card.attacks.as_ref().map(Json))
        .bind(card.weaknesses.as_ref().map(Json))
        .bind(card.retreat_cost.as_ref().map(Json))
        .bind(card.converted_retreat_cost)
        .bind(card.rarity.as_deref())
        .bind(card.flavor_text.as_deref())
        .bind(card.national_pokedex_numbers.as_ref().map(Json))
        .bind(card.legalities.as_ref().map(Json))
        .bind(card.resistances.as_ref().map(Json))
        .bind(card.rules.as_ref().map(Json))
        .bind(card.regulation_mark.as_deref())
        .bind(card.ancient_trait.as_ref().map(Json))
}

fn json_column<T>(row: &SqliteRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: DeserializeOwned + 'static,
{
    let value: Option<Json<T>> = row.try_get(column)?;
    Ok(value.map(|Json(inner)| inner))
}

fn card_from_row(row: &SqliteRow) -> Result<PersistedCard, sqlx::Error> {
    let card = NormalizedCard {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        set_id: row.try_get("set_id")?,
        series: row.try_get("series")?,
        publisher: row.try_get("publisher")?,
        generation: row.try_get("generation")?,
        release_date: row.try_get("release_date")?,
        artist: row.try_get("artist")?,
        set_num: row.try_get("set_num")?,
        types: json_column::<Vec<String>>(row, "types")?,
        supertype: row.try_get("supertype")?,
        subtypes: json_column::<Vec<String>>(row, "subtypes")?,
        level: row.try_get("level")?,
        hp: row.try_get("hp")?,
        evolves_from: row.try_get("evolves_from")?,
        evolves_to: json_column::<Vec<String>>(row, "evolves_to")?,
        abilities: json_column::<JsonValue>(row, "abilities")?,
        attacks: json_column::<JsonValue>(row, "attacks")?,
        weaknesses: json_column::<JsonValue>(row, "weaknesses")?,
        retreat_cost: json_column::<Vec<String>>(row, "retreat_cost")?,
        converted_retreat_cost: row.try_get("converted_retreat_cost")?,
        rarity: row.try_get("rarity")?,
        flavor_text: row.try_get("flavor_text")?,
        national_pokedex_numbers: json_column::<Vec<i64>>(row, "national_pokedex_numbers")?,
        legalities: json_column::<JsonValue>(row, "legalities")?,
        resistances: json_column::<JsonValue>(row, "resistances")?,
        rules: json_column::<Vec<String>>(row, "rules")?,
        regulation_mark: row.try_get("regulation_mark")?,
        ancient_trait: json_column::<JsonValue>(row, "ancient_trait")?,
    };
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(PersistedCard {
        card,
        created_at,
        updated_at,
    })
}
