//! Checkpoint persistence + HTTP fetch utilities for the harvester.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use sdh_core::{Checkpoint, Snapshot};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sdh-storage";

pub const DEFAULT_CHECKPOINT_FILE: &str = "data.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Missing,
    Blank,
    Loaded,
    DiscardedCorrupt,
}

#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub entries: Checkpoint,
    pub status: CheckpointStatus,
}

#[derive(Debug, Clone)]
pub struct PersistedSnapshot {
    pub path: PathBuf,
    pub entries: usize,
    pub byte_size: usize,
    pub content_hash: String,
}

/// Single JSON file holding every harvested ticket, keyed by id.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Load the previous snapshot.
    ///
    /// A missing or blank file yields an empty checkpoint. A file that is not
    /// JSON, or whose top level is not an object, is deleted and also yields an
    /// empty checkpoint, so a damaged file only costs a re-fetch and never
    /// aborts the run. Record values are taken as they are.
    pub async fn load(&self) -> anyhow::Result<LoadedCheckpoint> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint file, starting empty");
                return Ok(LoadedCheckpoint {
                    entries: Checkpoint::new(),
                    status: CheckpointStatus::Missing,
                });
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading checkpoint {}", self.path.display()))
            }
        };

        let parsed = std::str::from_utf8(&bytes)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                if text.trim().is_empty() {
                    Ok(None)
                } else {
                    serde_json::from_str::<Checkpoint>(text)
                        .map(Some)
                        .map_err(|e| e.to_string())
                }
            });

        match parsed {
            Ok(None) => Ok(LoadedCheckpoint {
                entries: Checkpoint::new(),
                status: CheckpointStatus::Blank,
            }),
            Ok(Some(entries)) => {
                info!(
                    path = %self.path.display(),
                    entries = entries.len(),
                    "loaded existing checkpoint"
                );
                Ok(LoadedCheckpoint {
                    entries,
                    status: CheckpointStatus::Loaded,
                })
            }
            Err(reason) => {
                warn!(
                    path = %self.path.display(),
                    %reason,
                    "checkpoint is corrupt, deleting it and starting fresh"
                );
                match fs::remove_file(&self.path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(path = %self.path.display(), error = %err, "could not delete corrupt checkpoint")
                    }
                }
                Ok(LoadedCheckpoint {
                    entries: Checkpoint::new(),
                    status: CheckpointStatus::DiscardedCorrupt,
                })
            }
        }
    }

    pub fn render(snapshot: &Snapshot) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        snapshot
            .serialize(&mut ser)
            .context("serializing checkpoint snapshot")?;
        Ok(out)
    }

    /// Replace the checkpoint with `snapshot` using a temp file + atomic rename.
    pub async fn persist(&self, snapshot: &Snapshot) -> anyhow::Result<PersistedSnapshot> {
        let bytes = Self::render(snapshot)?;
        let content_hash = Self::sha256_hex(&bytes);

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if let Some(parent) = &parent {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating checkpoint directory {}", parent.display()))?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_CHECKPOINT_FILE.to_string());
        let temp_name = format!(".{file_name}.{}.tmp", Uuid::new_v4());
        let temp_path = match &parent {
            Some(parent) => parent.join(temp_name),
            None => PathBuf::from(temp_name),
        };

        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp checkpoint {}", temp_path.display()))?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("writing temp checkpoint {}", temp_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing temp checkpoint {}", temp_path.display()))?;
            file.sync_all()
                .await
                .with_context(|| format!("syncing temp checkpoint {}", temp_path.display()))?;
            drop(file);
            fs::rename(&temp_path, &self.path).await.with_context(|| {
                format!(
                    "atomically renaming temp checkpoint {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            })
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        Ok(PersistedSnapshot {
            path: self.path.clone(),
            entries: snapshot.len(),
            byte_size: bytes.len(),
            content_hash,
        })
    }
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
    if err.is_timeout() || err.is_connect() {
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
    pub max_connections: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_connections: 100,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared, connection-pooled JSON fetcher. Every worker borrows the same
/// instance; the semaphore caps requests in flight across all of them.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub status: StatusCode,
    pub final_url: String,
    pub body: JsonValue,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http fetcher is shut down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_connections.max(1));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_connections.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET `url` and decode the body as JSON.
    ///
    /// Non-2xx responses that still carry a JSON body are returned as `Ok`,
    /// since the service reports conditions such as an expired session inside
    /// the envelope. Server errors, 429 and connect/timeout failures are
    /// retried per the backoff policy first.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &HeaderMap,
    ) -> Result<FetchedJson, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            let resp_result = self
                .client
                .get(url)
                .query(query)
                .headers(headers.clone())
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(%status, url = %final_url, attempt, "retrying http request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let bytes = resp.bytes().await?;
                    return match serde_json::from_slice::<JsonValue>(&bytes) {
                        Ok(body) => Ok(FetchedJson {
                            status,
                            final_url,
                            body,
                        }),
                        Err(_) if !status.is_success() => Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        }),
                        Err(source) => Err(FetchError::Decode {
                            url: final_url,
                            source,
                        }),
                    };
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, url, attempt, "retrying http request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
