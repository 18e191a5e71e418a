//! Card synchronization: single-card import and remote/local reconciliation.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use cardvault_catalogue::{CatalogueClient, CatalogueConfig, CatalogueError, CatalogueSource};
use cardvault_core::PersistedCard;
use cardvault_normalize::{normalize, NormalizeError};
use cardvault_store::{CardStore, SqliteCardStore, StoreError, DEFAULT_DATABASE_URL};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cardvault-sync";

pub const DEFAULT_SYNC_CRON: &str = "0 0 3 * * *";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub catalogue: CatalogueConfig,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            scheduler_enabled: std::env::var("CARDVAULT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("CARDVAULT_SYNC_CRON")
                .unwrap_or_else(|_| DEFAULT_SYNC_CRON.to_string()),
            catalogue: CatalogueConfig::from_env().context("loading catalogue configuration")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStage {
    Fetch,
    Normalize,
    Store,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("fetching card {id}: {source}")]
    Fetch {
        id: String,
        #[source]
        source: CatalogueError,
    },
    #[error("normalizing card {id}: {source}")]
    Normalize {
        id: String,
        #[source]
        source: NormalizeError,
    },
    #[error("catalogue returned card {found:?} when asked for {id:?}")]
    IdMismatch { id: String, found: String },
    #[error("storing card {id}: {source}")]
    Store {
        id: String,
        #[source]
        source: StoreError,
    },
}

impl ImportError {
    pub fn stage(&self) -> ImportStage {
        match self {
            ImportError::Fetch { .. } => ImportStage::Fetch,
            ImportError::Normalize { .. } | ImportError::IdMismatch { .. } => {
                ImportStage::Normalize
            }
            ImportError::Store { .. } => ImportStage::Store,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ImportError::Fetch { source, .. } if source.is_not_found())
    }
}

/// Failures that make reconciliation unsafe; the run aborts before any import.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("listing remote catalogue: {0}")]
    RemoteListing(#[source] CatalogueError),
    #[error("listing local cards: {0}")]
    LocalListing(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Imported,
    Failed { stage: ImportStage, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    pub id: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub remote_total: usize,
    pub local_total: usize,
    pub missing: usize,
    /// Records newly persisted in this run.
    pub imported: usize,
    pub failed: usize,
    pub items: Vec<ItemReport>,
}

impl SyncReport {
    pub fn failed_ids(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter(|item| matches!(item.outcome, ItemOutcome::Failed { .. }))
            .map(|item| item.id.as_str())
            .collect()
    }
}

pub struct SyncPipeline {
    catalogue: Arc<dyn CatalogueSource>,
    store: Arc<dyn CardStore>,
}

impl SyncPipeline {
    pub fn new(catalogue: Arc<dyn CatalogueSource>, store: Arc<dyn CardStore>) -> Self {
        Self { catalogue, store }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let catalogue = CatalogueClient::new(config.catalogue.clone())?;
        let store = SqliteCardStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening card store {}", config.database_url))?;
        Ok(Self::new(Arc::new(catalogue), Arc::new(store)))
    }

    /// Fetch, normalize and upsert one card.
    ///
    /// The stored key is always `id`; a record carrying any other id is rejected.
    pub async fn import_one(&self, id: &str) -> Result<PersistedCard, ImportError> {
        let raw = self
            .catalogue
            .fetch_one(id)
            .await
            .map_err(|source| ImportError::Fetch {
                id: id.to_string(),
                source,
            })?;
        let card = normalize(&raw).map_err(|source| ImportError::Normalize {
            id: id.to_string(),
            source,
        })?;
        if card.id != id {
            return Err(ImportError::IdMismatch {
                id: id.to_string(),
                found: card.id,
            });
        }
        self.store
            .upsert(&card)
            .await
            .map_err(|source| ImportError::Store {
                id: id.to_string(),
                source,
            })
    }

    /// Import every remote id that is not stored locally.
    ///
    /// Both listings must complete before anything is imported. Per-card failures
    /// are recorded in the report and do not stop the batch.
    pub async fn sync_missing(&self) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_missing", %run_id);
        self.sync_missing_inner(run_id).instrument(span).await
    }

    async fn sync_missing_inner(&self, run_id: Uuid) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();

        let remote_ids = self
            .catalogue
            .list_all_remote_ids()
            .await
            .map_err(SyncError::RemoteListing)?;
        let local_ids = self
            .store
            .list_all_local_ids()
            .await
            .map_err(SyncError::LocalListing)?;

        let missing: BTreeSet<&String> = remote_ids.difference(&local_ids).collect();
        info!(
            remote = remote_ids.len(),
            local = local_ids.len(),
            missing = missing.len(),
            "reconciled catalogue against local store"
        );

        let mut items = Vec::with_capacity(missing.len());
        let mut imported = 0usize;
        for id in &missing {
            let outcome = match self.import_one(id).await {
                Ok(card) => {
                    imported += 1;
                    info!(card_id = %id, name = %card.card.name, "card imported");
                    ItemOutcome::Imported
                }
                Err(err) => {
                    warn!(card_id = %id, stage = ?err.stage(), error = %err, "card import failed");
                    ItemOutcome::Failed {
                        stage: err.stage(),
                        error: err.to_string(),
                    }
                }
            };
            items.push(ItemReport {
                id: id.to_string(),
                outcome,
            });
        }

        let failed = items.len() - imported;
        info!(imported, failed, "sync run finished");

        Ok(SyncReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            remote_total: remote_ids.len(),
            local_total: local_ids.len(),
            missing: missing.len(),
            imported,
            failed,
            items,
        })
    }
}

/// Cron-driven background sync, only when enabled in config. Caller starts the scheduler.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.sync_missing().await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    imported = report.imported,
                    failed = report.failed,
                    "scheduled sync complete"
                ),
                Err(err) => error!(error = %err, "scheduled sync aborted"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env() -> Result<SyncReport> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(&config).await?;
    Ok(pipeline.sync_missing().await?)
}

pub async fn import_one_from_env(id: &str) -> Result<PersistedCard> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(&config).await?;
    Ok(pipeline.import_one(id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cardvault_core::{NormalizedCard, RemoteRecord};
    use serde_json::{json, Value as JsonValue};

    #[derive(Default)]
    struct FakeCatalogue {
        records: Mutex<HashMap<String, JsonValue>>,
        unavailable: HashSet<String>,
        listing_fails: bool,
        fetches: AtomicUsize,
    }

    impl FakeCatalogue {
        fn with_cards(cards: &[(&str, &str)]) -> Self {
            let records = cards
                .iter()
                .map(|(id, name)| {
                    (
                        id.to_string(),
                        json!({"id": id, "name": name, "set": {"id": "xy1", "series": "XY", "releaseDate": "2014/02/05"}}),
                    )
                })
                .collect();
            Self {
                records: Mutex::new(records),
                ..Default::default()
            }
        }

        fn put(&self, id: &str, value: JsonValue) {
            self.records.lock().unwrap().insert(id.to_string(), value);
        }
    }

    #[async_trait]
    impl CatalogueSource for FakeCatalogue {
        async fn list_all_remote_ids(&self) -> Result<HashSet<String>, CatalogueError> {
            if self.listing_fails {
                return Err(CatalogueError::ListingFailure {
                    page: 3,
                    source: Box::new(CatalogueError::RemoteUnavailable {
                        target: "listing page 3".into(),
                        reason: "http status 502".into(),
                    }),
                });
            }
            Ok(self.records.lock().unwrap().keys().cloned().collect())
        }

        async fn fetch_one(&self, id: &str) -> Result<RemoteRecord, CatalogueError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.contains(id) {
                return Err(CatalogueError::RemoteUnavailable {
                    target: id.to_string(),
                    reason: "connection reset".into(),
                });
            }
            self.records
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .map(RemoteRecord::new)
                .ok_or_else(|| CatalogueError::NotFound {
                    target: id.to_string(),
                })
        }
    }

    /// Delegates to SQLite but refuses to write one id.
    struct RejectingStore {
        inner: SqliteCardStore,
        reject: String,
    }

    #[async_trait]
    impl CardStore for RejectingStore {
        async fn list_all_local_ids(&self) -> Result<HashSet<String>, StoreError> {
            self.inner.list_all_local_ids().await
        }

        async fn upsert(&self, card: &NormalizedCard) -> Result<PersistedCard, StoreError> {
            if card.id == self.reject {
                return Err(StoreError::MissingAfterWrite(card.id.clone()));
            }
            self.inner.upsert(card).await
        }

        async fn get(&self, id: &str) -> Result<Option<PersistedCard>, StoreError> {
            self.inner.get(id).await
        }
    }

    async fn pipeline_with(catalogue: Arc<FakeCatalogue>) -> (SyncPipeline, SqliteCardStore) {
        let store = SqliteCardStore::in_memory().await.unwrap();
        let pipeline = SyncPipeline::new(catalogue, Arc::new(store.clone()));
        (pipeline, store)
    }

    fn ids(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn sync_imports_every_missing_card() {
        let catalogue = Arc::new(FakeCatalogue::with_cards(&[
            ("xy1-1", "Venusaur-EX"),
            ("xy1-2", "Venusaur-EX Full Art"),
        ]));
        let (pipeline, store) = pipeline_with(catalogue).await;

        let report = pipeline.sync_missing().await.unwrap();

        assert_eq!(report.imported, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.remote_total, 2);
        assert_eq!(store.list_all_local_ids().await.unwrap(), ids(&["xy1-1", "xy1-2"]));
        let first = store.get("xy1-1").await.unwrap().unwrap();
        assert_eq!(first.card.name, "Venusaur-EX");
        assert_eq!(first.card.set_id.as_deref(), Some("xy1"));
        let second = store.get("xy1-2").await.unwrap().unwrap();
        assert_eq!(second.card.name, "Venusaur-EX Full Art");
    }

    #[tokio::test]
    async fn second_run_imports_nothing_and_leaves_records_alone() {
        let catalogue = Arc::new(FakeCatalogue::with_cards(&[("a-1", "A"), ("a-2", "B"), ("a-3", "C")]));
        let (pipeline, store) = pipeline_with(catalogue.clone()).await;

        assert_eq!(pipeline.sync_missing().await.unwrap().imported, 3);
        let before = store.get("a-2").await.unwrap().unwrap();
        let fetches_after_first = catalogue.fetches.load(Ordering::SeqCst);

        let again = pipeline.sync_missing().await.unwrap();

        assert_eq!(again.imported, 0);
        assert_eq!(again.missing, 0);
        assert!(again.items.is_empty());
        assert_eq!(catalogue.fetches.load(Ordering::SeqCst), fetches_after_first);
        assert_eq!(store.get("a-2").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn stored_key_matches_listed_key_across_runs() {
        let catalogue = Arc::new(FakeCatalogue::default());
        catalogue.put("xy1-1 ", json!({"id": "xy1-1 ", "name": "Padded"}));
        catalogue.put("alias-1", json!({"id": "xy1-9", "name": "Aliased"}));
        let (pipeline, store) = pipeline_with(catalogue).await;

        let first = pipeline.sync_missing().await.unwrap();
        assert_eq!(first.imported, 1);
        assert_eq!(first.failed_ids(), vec!["alias-1"]);
        let alias = first.items.iter().find(|i| i.id == "alias-1").unwrap();
        assert!(matches!(alias.outcome, ItemOutcome::Failed { stage: ImportStage::Normalize, .. }));

        let second = pipeline.sync_missing().await.unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.missing, 1);
        assert_eq!(store.list_all_local_ids().await.unwrap(), ids(&["xy1-1 "]));
    }

    #[tokio::test]
    async fn import_one_rejects_a_record_with_another_id() {
        let catalogue = Arc::new(FakeCatalogue::with_cards(&[("xy1-9", "Existing")]));
        catalogue.put("alias-1", json!({"id": "xy1-9", "name": "Impostor"}));
        let (pipeline, store) = pipeline_with(catalogue).await;
        pipeline.import_one("xy1-9").await.unwrap();

        let err = pipeline.import_one("alias-1").await.unwrap_err();

        assert!(matches!(err, ImportError::IdMismatch { ref found, .. } if found == "xy1-9"));
        assert_eq!(store.get("xy1-9").await.unwrap().unwrap().card.name, "Existing");
        assert!(store.get("alias-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn only_ids_absent_locally_are_fetched() {
        let catalogue = Arc::new(FakeCatalogue::with_cards(&[("a-1", "A"), ("a-2", "B"), ("a-3", "C")]));
        let (pipeline, store) = pipeline_with(catalogue.clone()).await;
        store.upsert(&NormalizedCard::new("a-1", "Local A")).await.unwrap();
        store.upsert(&NormalizedCard::new("local-only", "Kept")).await.unwrap();

        let report = pipeline.sync_missing().await.unwrap();

        assert_eq!(report.missing, 2);
        assert_eq!(report.imported, 2);
        assert_eq!(catalogue.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(
            store.list_all_local_ids().await.unwrap(),
            ids(&["a-1", "a-2", "a-3", "local-only"])
        );
        assert_eq!(store.get("a-1").await.unwrap().unwrap().card.name, "Local A");
    }

    #[tokio::test]
    async fn failing_items_are_isolated_and_not_counted() {
        let mut catalogue = FakeCatalogue::with_cards(&[("x", "X"), ("y", "Y"), ("z", "Z")]);
        catalogue.unavailable.insert("y".to_string());
        let (pipeline, store) = pipeline_with(Arc::new(catalogue)).await;

        let report = pipeline.sync_missing().await.unwrap();

        assert_eq!(report.imported, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failed_ids(), vec!["y"]);
        let y = report.items.iter().find(|i| i.id == "y").unwrap();
        assert!(matches!(y.outcome, ItemOutcome::Failed { stage: ImportStage::Fetch, .. }));
        assert_eq!(store.list_all_local_ids().await.unwrap(), ids(&["x", "z"]));
    }

    #[tokio::test]
    async fn normalize_and_store_failures_are_isolated_too() {
        let catalogue = Arc::new(FakeCatalogue::with_cards(&[("ok-1", "Fine"), ("bad-store", "Rejected")]));
        catalogue.put("no-name", json!({"id": "no-name"}));
        let sqlite = SqliteCardStore::in_memory().await.unwrap();
        let store = RejectingStore {
            inner: sqlite.clone(),
            reject: "bad-store".to_string(),
        };
        let pipeline = SyncPipeline::new(catalogue, Arc::new(store));

        let report = pipeline.sync_missing().await.unwrap();

        assert_eq!(report.imported, 1);
        let stage_of = |id: &str| match &report.items.iter().find(|i| i.id == id).unwrap().outcome {
            ItemOutcome::Failed { stage, .. } => Some(*stage),
            ItemOutcome::Imported => None,
        };
        assert_eq!(stage_of("no-name"), Some(ImportStage::Normalize));
        assert_eq!(stage_of("bad-store"), Some(ImportStage::Store));
        assert_eq!(stage_of("ok-1"), None);
        assert_eq!(sqlite.list_all_local_ids().await.unwrap(), ids(&["ok-1"]));
    }

    #[tokio::test]
    async fn local_set_becomes_union_minus_failures() {
        let mut catalogue = FakeCatalogue::with_cards(&[("r-1", "R1"), ("r-2", "R2"), ("r-3", "R3")]);
        catalogue.unavailable.insert("r-3".to_string());
        let (pipeline, store) = pipeline_with(Arc::new(catalogue)).await;
        store.upsert(&NormalizedCard::new("l-1", "L1")).await.unwrap();
        store.upsert(&NormalizedCard::new("r-1", "R1 local")).await.unwrap();

        let report = pipeline.sync_missing().await.unwrap();

        let mut expected = ids(&["l-1", "r-1", "r-2", "r-3"]);
        for failed in report.failed_ids() {
            expected.remove(failed);
        }
        assert_eq!(store.list_all_local_ids().await.unwrap(), expected);
        assert_eq!(report.imported, 1);
    }

    #[tokio::test]
    async fn remote_listing_failure_aborts_before_importing() {
        let catalogue = Arc::new(FakeCatalogue {
            listing_fails: true,
            ..FakeCatalogue::with_cards(&[("a-1", "A")])
        });
        let (pipeline, store) = pipeline_with(catalogue.clone()).await;

        let err = pipeline.sync_missing().await.unwrap_err();

        assert!(matches!(err, SyncError::RemoteListing(CatalogueError::ListingFailure { page: 3, .. })));
        assert_eq!(catalogue.fetches.load(Ordering::SeqCst), 0);
        assert!(store.list_all_local_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_listing_failure_aborts_before_importing() {
        let catalogue = Arc::new(FakeCatalogue::with_cards(&[("a-1", "A")]));
        let (pipeline, store) = pipeline_with(catalogue.clone()).await;
        store.pool().close().await;

        let err = pipeline.sync_missing().await.unwrap_err();

        assert!(matches!(err, SyncError::LocalListing(_)));
        assert_eq!(catalogue.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reimporting_overwrites_the_stored_card() {
        let catalogue = Arc::new(FakeCatalogue::with_cards(&[("xy1-1", "A")]));
        let (pipeline, store) = pipeline_with(catalogue.clone()).await;

        pipeline.import_one("xy1-1").await.unwrap();
        catalogue.put("xy1-1", json!({"id": "xy1-1", "name": "B", "hp": "90"}));
        let updated = pipeline.import_one("xy1-1").await.unwrap();

        assert_eq!(updated.card.name, "B");
        assert_eq!(updated.card.hp.as_deref(), Some("90"));
        assert!(updated.card.set_id.is_none());
        assert_eq!(store.list_all_local_ids().await.unwrap(), ids(&["xy1-1"]));
        assert_eq!(store.get("xy1-1").await.unwrap().unwrap().card.name, "B");
    }

    #[tokio::test]
    async fn import_one_surfaces_not_found() {
        let catalogue = Arc::new(FakeCatalogue::default());
        let (pipeline, store) = pipeline_with(catalogue).await;

        let err = pipeline.import_one("ghost-1").await.unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(err.stage(), ImportStage::Fetch);
        assert!(store.get("ghost-1").await.unwrap().is_none());
    }

    #[test]
    fn report_serializes_outcomes_with_status_tags() {
        let item = ItemReport {
            id: "y".into(),
            outcome: ItemOutcome::Failed {
                stage: ImportStage::Fetch,
                error: "boom".into(),
            },
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value, json!({"id": "y", "status": "failed", "stage": "fetch", "error": "boom"}));
    }
}
