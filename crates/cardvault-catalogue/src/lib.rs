//! HTTP client for the remote card catalogue: paginated id listing and single-card fetch.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cardvault_core::RemoteRecord;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "cardvault-catalogue";

pub const DEFAULT_CATALOGUE_URL: &str = "https://api.pokemontcg.io/v2/cards";
pub const API_KEY_ENV: &str = "PokemonTCG_Key";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const DEFAULT_PAGE_SIZE: u32 = 250;
pub const DEFAULT_MAX_PAGES: u32 = 1000;

#[derive(Debug, Clone, Error)]
pub enum CatalogueError {
    #[error("catalogue api key missing; set PokemonTCG_Key")]
    MissingApiKey,
    #[error("invalid catalogue configuration: {0}")]
    InvalidConfig(String),
    #[error("{target} not found in remote catalogue")]
    NotFound { target: String },
    #[error("remote catalogue unavailable for {target}: {reason}")]
    RemoteUnavailable { target: String, reason: String },
    #[error("malformed catalogue payload for {target}: {reason}")]
    MalformedPayload { target: String, reason: String },
    #[error("catalogue listing failed on page {page}: {source}")]
    ListingFailure {
        page: u32,
        #[source]
        source: Box<CatalogueError>,
    },
    #[error("catalogue listing did not end within {max_pages} pages")]
    PageLimitExceeded { max_pages: u32 },
}

impl CatalogueError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogueError::NotFound { .. })
    }
}

/// Read side of the remote catalogue used by the sync pipeline.
#[async_trait]
pub trait CatalogueSource: Send + Sync {
    /// Every record id in the catalogue. Any failed page fails the whole listing.
    async fn list_all_remote_ids(&self) -> Result<HashSet<String>, CatalogueError>;

    async fn fetch_one(&self, id: &str) -> Result<RemoteRecord, CatalogueError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some("cardvault/0.1".to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct CatalogueConfig {
    pub base_url: String,
    pub api_key: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub http: HttpClientConfig,
}

impl fmt::Debug for CatalogueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogueConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .field("http", &self.http)
            .finish()
    }
}

impl CatalogueConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            http: HttpClientConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, CatalogueError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; fails fast when the api key is absent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CatalogueError> {
        let api_key = lookup(API_KEY_ENV)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(CatalogueError::MissingApiKey)?;
        let base_url =
            lookup("CARDVAULT_CATALOGUE_URL").unwrap_or_else(|| DEFAULT_CATALOGUE_URL.to_string());

        let defaults = HttpClientConfig::default();

        Ok(Self {
            base_url,
            api_key,
            page_size: parse_override::<u32>(&lookup, "CARDVAULT_PAGE_SIZE")?
                .unwrap_or(DEFAULT_PAGE_SIZE),
            max_pages: parse_override::<u32>(&lookup, "CARDVAULT_MAX_PAGES")?
                .unwrap_or(DEFAULT_MAX_PAGES),
            http: HttpClientConfig {
                timeout: parse_override::<u64>(&lookup, "CARDVAULT_HTTP_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.timeout),
                user_agent: lookup("CARDVAULT_USER_AGENT").or(defaults.user_agent),
                backoff: BackoffPolicy {
                    max_retries: parse_override::<usize>(&lookup, "CARDVAULT_HTTP_MAX_RETRIES")?
                        .unwrap_or(defaults.backoff.max_retries),
                    ..defaults.backoff
                },
            },
        })
    }
}

/// A set but unparseable or out-of-range numeric override is a configuration error.
fn parse_override<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, CatalogueError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            CatalogueError::InvalidConfig(format!("{key}={raw:?} is not a valid number"))
        }),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// reqwest-backed [`CatalogueSource`]. Requests run one at a time.
#[derive(Debug)]
pub struct CatalogueClient {
    client: reqwest::Client,
    base_url: Url,
    page_size: u32,
    max_pages: u32,
    backoff: BackoffPolicy,
}

impl CatalogueClient {
    pub fn new(config: CatalogueConfig) -> anyhow::Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(CatalogueError::MissingApiKey.into());
        }
        if config.page_size == 0 || config.max_pages == 0 {
            return Err(CatalogueError::InvalidConfig(
                "page_size and max_pages must be positive".to_string(),
            )
            .into());
        }

        let base_url = Url::from_str(&config.base_url)
            .with_context(|| format!("parsing catalogue url {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            return Err(CatalogueError::InvalidConfig(format!(
                "catalogue url {} cannot carry a path",
                config.base_url
            ))
            .into());
        }

        let mut api_key =
            HeaderValue::from_str(&config.api_key).context("encoding catalogue api key header")?;
        api_key.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, api_key);

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.http.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.http.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url,
            page_size: config.page_size,
            max_pages: config.max_pages,
            backoff: config.http.backoff,
        })
    }

    fn card_url(&self, id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(id);
        }
        url
    }

    async fn get_data<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
        target: &str,
    ) -> Result<T, CatalogueError> {
        let unavailable = |reason: String| CatalogueError::RemoteUnavailable {
            target: target.to_string(),
            reason,
        };

        let mut attempt = 0;
        loop {
            let retries_left = attempt < self.backoff.max_retries;

            match self.client.get(url.clone()).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        let body = resp.bytes().await.map_err(|err| unavailable(err.to_string()))?;
                        let envelope: Envelope<T> =
                            serde_json::from_slice(&body).map_err(|err| {
                                CatalogueError::MalformedPayload {
                                    target: target.to_string(),
                                    reason: err.to_string(),
                                }
                            })?;
                        return Ok(envelope.data);
                    }

                    if status == StatusCode::NOT_FOUND {
                        return Err(CatalogueError::NotFound {
                            target: target.to_string(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && retries_left {
                        warn!(request = target, attempt, status = status.as_u16(), "retrying catalogue request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(unavailable(format!("http status {}", status.as_u16())));
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && retries_left {
                        warn!(request = target, attempt, error = %err, "retrying catalogue request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(unavailable(err.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl CatalogueSource for CatalogueClient {
    async fn list_all_remote_ids(&self) -> Result<HashSet<String>, CatalogueError> {
        let mut ids = HashSet::new();

        for page in 1..=self.max_pages {
            let query = [
                ("page", page.to_string()),
                ("pageSize", self.page_size.to_string()),
            ];
            let target = format!("listing page {page}");
            let records: Vec<RemoteRecord> = self
                .get_data(self.base_url.clone(), &query, &target)
                .await
                .map_err(|source| CatalogueError::ListingFailure {
                    page,
                    source: Box::new(source),
                })?;

            if records.is_empty() {
                info!(pages = page - 1, remote_ids = ids.len(), "catalogue listing complete");
                return Ok(ids);
            }

            debug!(page, records = records.len(), "catalogue page fetched");
            for record in records {
                match record.id() {
                    Some(id) => {
                        ids.insert(id.to_string());
                    }
                    None => warn!(page, "catalogue listing entry without id skipped"),
                }
            }
        }

        Err(CatalogueError::PageLimitExceeded {
            max_pages: self.max_pages,
        })
    }

    async fn fetch_one(&self, id: &str) -> Result<RemoteRecord, CatalogueError> {
        let data: JsonValue = self.get_data(self.card_url(id), &[], id).await?;
        if !data.is_object() {
            return Err(CatalogueError::MalformedPayload {
                target: id.to_string(),
                reason: "`data` is not an object".to_string(),
            });
        }
        Ok(RemoteRecord::new(data))
    }
}
