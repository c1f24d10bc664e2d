//! Harvest pipeline: ticket id discovery, detail fetch pool, merge + persist.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sdh_adapters::{
    interpret_detail_response, interpret_list_response, response_status_code, ApiError,
    ListOutcome, PageRequest, ServiceDeskClient, TicketApi, DEFAULT_PAGE_SIZE, STATUS_SUCCESS,
};
use sdh_core::{merge_snapshot, Checkpoint, ResultSet, TicketId, TicketRecord};
use sdh_storage::{
    BackoffPolicy, CheckpointStatus, CheckpointStore, HttpClientConfig, DEFAULT_CHECKPOINT_FILE,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sdh-sync";

pub const DEFAULT_DISCOVERY_WORKERS: usize = 50;
pub const DEFAULT_FETCH_WORKERS: usize = 50;
pub const DEFAULT_QUEUE_POP_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_DETAIL_ATTEMPTS: u32 = 2;

#[derive(Debug)]
pub struct HarvestConfig {
    pub base_url: String,
    pub session_token: Option<SecretString>,
    pub checkpoint_path: PathBuf,
    pub discovery_workers: usize,
    pub fetch_workers: usize,
    pub page_size: u32,
    pub queue_pop_timeout: Duration,
    pub detail_attempts: u32,
    pub http_timeout_secs: u64,
    pub http_retries: usize,
    pub max_connections: usize,
    pub user_agent: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            session_token: None,
            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT_FILE),
            discovery_workers: DEFAULT_DISCOVERY_WORKERS,
            fetch_workers: DEFAULT_FETCH_WORKERS,
            page_size: DEFAULT_PAGE_SIZE,
            queue_pop_timeout: DEFAULT_QUEUE_POP_TIMEOUT,
            detail_attempts: DEFAULT_DETAIL_ATTEMPTS,
            http_timeout_secs: 30,
            http_retries: BackoffPolicy::default().max_retries,
            max_connections: 100,
            user_agent: format!("sdh/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("SDH_BASE_URL").unwrap_or_default(),
            session_token: std::env::var("SDH_SESSION_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            checkpoint_path: std::env::var("SDH_CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_path),
            discovery_workers: env_parse("SDH_DISCOVERY_WORKERS")
                .unwrap_or(defaults.discovery_workers),
            fetch_workers: env_parse("SDH_FETCH_WORKERS").unwrap_or(defaults.fetch_workers),
            page_size: env_parse("SDH_PAGE_SIZE").unwrap_or(defaults.page_size),
            queue_pop_timeout: env_parse("SDH_QUEUE_POP_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_pop_timeout),
            detail_attempts: env_parse("SDH_DETAIL_ATTEMPTS").unwrap_or(defaults.detail_attempts),
            http_timeout_secs: env_parse("SDH_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            http_retries: env_parse("SDH_HTTP_RETRIES").unwrap_or(defaults.http_retries),
            max_connections: env_parse("SDH_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            user_agent: std::env::var("SDH_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn apply_settings(&mut self, settings: HarvestSettings) {
        if let Some(v) = settings.base_url {
            self.base_url = v;
        }
        if let Some(v) = settings.checkpoint_path {
            self.checkpoint_path = v;
        }
        if let Some(v) = settings.discovery_workers {
            self.discovery_workers = v;
        }
        if let Some(v) = settings.fetch_workers {
            self.fetch_workers = v;
        }
        if let Some(v) = settings.page_size {
            self.page_size = v;
        }
        if let Some(v) = settings.queue_pop_timeout_ms {
            self.queue_pop_timeout = Duration::from_millis(v);
        }
        if let Some(v) = settings.detail_attempts {
            self.detail_attempts = v;
        }
        if let Some(v) = settings.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = settings.http_retries {
            self.http_retries = v;
        }
        if let Some(v) = settings.max_connections {
            self.max_connections = v;
        }
        if let Some(v) = settings.user_agent {
            self.user_agent = v;
        }
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        let base_url = self.base_url.trim();
        if base_url.is_empty() {
            return Err(HarvestError::Config("service desk base URL is not set".into()));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(HarvestError::Config(format!(
                "base URL must start with http:// or https://, got {base_url}"
            )));
        }
        match &self.session_token {
            Some(token) if !token.expose_secret().trim().is_empty() => {}
            _ => return Err(HarvestError::Config("session token is not set".into())),
        }
        if self.discovery_workers == 0 || self.fetch_workers == 0 {
            return Err(HarvestError::Config("worker counts must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(HarvestError::Config("page size must be at least 1".into()));
        }
        if self.detail_attempts == 0 {
            return Err(HarvestError::Config("detail attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_connections: self.max_connections,
            backoff: BackoffPolicy {
                max_retries: self.http_retries,
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            discovery_workers: self.discovery_workers,
            fetch_workers: self.fetch_workers,
            page_size: self.page_size,
            queue_pop_timeout: self.queue_pop_timeout,
            detail_attempts: self.detail_attempts,
        }
    }
}

/// Optional YAML overrides, layered over the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestSettings {
    pub base_url: Option<String>,
    pub checkpoint_path: Option<PathBuf>,
    pub discovery_workers: Option<usize>,
    pub fetch_workers: Option<usize>,
    pub page_size: Option<u32>,
    pub queue_pop_timeout_ms: Option<u64>,
    pub detail_attempts: Option<u32>,
    pub http_timeout_secs: Option<u64>,
    pub http_retries: Option<usize>,
    pub max_connections: Option<usize>,
    pub user_agent: Option<String>,
}

impl HarvestSettings {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing harvest settings")
    }

    pub async fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub discovery_workers: usize,
    pub fetch_workers: usize,
    pub page_size: u32,
    pub queue_pop_timeout: Duration,
    pub detail_attempts: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        HarvestConfig::default().pipeline_options()
    }
}

/// Conditions that end the whole run before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalCondition {
    #[error("the session token (SDPSESSIONID) is most likely invalid, please check it and try again")]
    InvalidSession,
    #[error("ticket list returned unexpected status code {0}")]
    UnexpectedStatus(i64),
    #[error("error occurred while processing the ticket list response: {0}")]
    MalformedEnvelope(String),
    #[error("error occurred while fetching the ticket list: {0}")]
    Transport(String),
    #[error("discovery worker failed: {0}")]
    WorkerPanicked(String),
}

impl FatalCondition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSession => "auth",
            Self::UnexpectedStatus(_) | Self::MalformedEnvelope(_) => "malformed-response",
            Self::Transport(_) => "transport",
            Self::WorkerPanicked(_) => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("{0}")]
    Fatal(FatalCondition),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl HarvestError {
    /// Process exit code: 1 for a fatal remote condition, 2 for local I/O or config.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Fatal(_) => 1,
            Self::Config(_) | Self::Storage(_) => 2,
        }
    }
}

/// Stop flag + first fatal condition, shared by every discovery worker.
/// Neither ever goes back once set.
#[derive(Debug, Default)]
pub struct RunState {
    stop_requested: AtomicBool,
    fatal: OnceLock<FatalCondition>,
}

impl RunState {
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Record a fatal condition and stop. The first condition recorded wins.
    pub fn fail(&self, condition: FatalCondition) {
        if let Err(later) = self.fatal.set(condition) {
            debug!(condition = %later, "fatal condition already recorded, keeping the first");
        }
        self.request_stop();
    }

    pub fn fatal(&self) -> Option<&FatalCondition> {
        self.fatal.get()
    }
}

/// Next list offset to hand out. Claiming reads the current value and
/// advances it by one page under the lock, so concurrent workers never
/// request the same window.
#[derive(Debug)]
pub struct SharedCursor {
    next: Mutex<u64>,
    stride: u64,
}

impl SharedCursor {
    pub fn new(stride: u32) -> Self {
        Self {
            next: Mutex::new(0),
            stride: u64::from(stride.max(1)),
        }
    }

    pub async fn claim(&self) -> u64 {
        let mut next = self.next.lock().await;
        let claimed = *next;
        *next = next.saturating_add(self.stride);
        claimed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTicket {
    pub id: TicketId,
    /// Detail fetches already attempted for this id.
    pub attempts: u32,
}

/// Unbounded FIFO between discovery and the fetch pool.
#[derive(Debug)]
pub struct WorkQueue {
    items: Mutex<VecDeque<QueuedTicket>>,
    notify: Notify,
    pop_timeout: Duration,
}

impl WorkQueue {
    pub fn new(pop_timeout: Duration) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            pop_timeout,
        }
    }

    pub async fn push(&self, id: TicketId) {
        self.requeue(QueuedTicket { id, attempts: 0 }).await;
    }

    pub async fn requeue(&self, item: QueuedTicket) {
        self.items.lock().await.push_back(item);
        self.notify.notify_one();
    }

    /// Pop the next ticket, waiting up to the pop timeout for one to show up.
    /// `None` means the queue stayed empty for the whole wait.
    pub async fn pop(&self) -> Option<QueuedTicket> {
        let deadline = tokio::time::Instant::now() + self.pop_timeout;
        loop {
            if let Some(item) = self.items.lock().await.pop_front() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub pages_fetched: usize,
    pub queued: usize,
    pub skipped_known: usize,
}

/// Pages through the ticket list with many workers sharing one cursor and
/// queues every id that is neither in the checkpoint nor already queued.
pub struct DiscoveryEngine {
    api: Arc<dyn TicketApi>,
    checkpoint: Arc<Checkpoint>,
    queue: Arc<WorkQueue>,
    state: Arc<RunState>,
    cursor: SharedCursor,
    page_size: u32,
    seen: Mutex<HashSet<TicketId>>,
    pages_fetched: AtomicUsize,
    queued: AtomicUsize,
    skipped_known: AtomicUsize,
}

impl DiscoveryEngine {
    pub fn new(
        api: Arc<dyn TicketApi>,
        checkpoint: Arc<Checkpoint>,
        queue: Arc<WorkQueue>,
        state: Arc<RunState>,
        page_size: u32,
    ) -> Self {
        Self {
            api,
            checkpoint,
            queue,
            state,
            cursor: SharedCursor::new(page_size),
            page_size: page_size.max(1),
            seen: Mutex::new(HashSet::new()),
            pages_fetched: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            skipped_known: AtomicUsize::new(0),
        }
    }

    pub async fn run(self: Arc<Self>, workers: usize) -> DiscoveryReport {
        let mut set = JoinSet::new();
        for worker in 0..workers.max(1) {
            let engine = Arc::clone(&self);
            set.spawn(async move { engine.worker_loop(worker).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(err) = joined {
                self.state.fail(FatalCondition::WorkerPanicked(err.to_string()));
            }
        }

        DiscoveryReport {
            pages_fetched: self.pages_fetched.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            skipped_known: self.skipped_known.load(Ordering::SeqCst),
        }
    }

    async fn worker_loop(&self, worker: usize) {
        while !self.state.should_stop() {
            let page = PageRequest::new(self.cursor.claim().await, self.page_size);
            match self.api.list_tickets(&page).await {
                Ok(body) => {
                    self.pages_fetched.fetch_add(1, Ordering::SeqCst);
                    self.handle_page(worker, &page, &body).await;
                }
                Err(err) => {
                    warn!(worker, start_index = page.start_index, error = %err, "ticket list request failed");
                    self.state.fail(FatalCondition::Transport(err.to_string()));
                }
            }
        }
        debug!(worker, "discovery worker finished");
    }

    async fn handle_page(&self, worker: usize, page: &PageRequest, body: &JsonValue) {
        let (ticket_ids, has_more_rows) = match interpret_list_response(body) {
            Ok(ListOutcome::Page {
                ticket_ids,
                has_more_rows,
            }) => (ticket_ids, has_more_rows),
            Ok(ListOutcome::InvalidSession) => {
                self.state.fail(FatalCondition::InvalidSession);
                return;
            }
            Ok(ListOutcome::UnexpectedStatus(code)) => {
                self.state.fail(FatalCondition::UnexpectedStatus(code));
                return;
            }
            Err(err) => {
                self.state.fail(FatalCondition::MalformedEnvelope(err.to_string()));
                return;
            }
        };

        let mut queued_here = 0usize;
        for id in &ticket_ids {
            if self.checkpoint.contains_key(id) {
                self.skipped_known.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            if self.seen.lock().await.insert(id.clone()) {
                self.queue.push(id.clone()).await;
                queued_here += 1;
            }
        }
        self.queued.fetch_add(queued_here, Ordering::SeqCst);
        debug!(
            worker,
            start_index = page.start_index,
            rows = ticket_ids.len(),
            queued = queued_here,
            has_more_rows,
            "processed ticket list page"
        );

        if !has_more_rows || ticket_ids.is_empty() {
            self.state.request_stop();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub fetched: usize,
    pub unresolved: usize,
    pub failed: Vec<TicketId>,
    pub results: ResultSet,
}

/// Workers draining the queue, fetching ticket details and keeping the
/// resolved ones.
pub struct FetchPool {
    api: Arc<dyn TicketApi>,
    queue: Arc<WorkQueue>,
    max_attempts: u32,
    results: Mutex<ResultSet>,
    failed: Mutex<Vec<TicketId>>,
    completed: AtomicUsize,
    unresolved: AtomicUsize,
}

impl FetchPool {
    pub fn new(api: Arc<dyn TicketApi>, queue: Arc<WorkQueue>, max_attempts: u32) -> Self {
        Self {
            api,
            queue,
            max_attempts: max_attempts.max(1),
            results: Mutex::new(ResultSet::new()),
            failed: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
            unresolved: AtomicUsize::new(0),
        }
    }

    pub async fn run(self: Arc<Self>, workers: usize) -> FetchReport {
        let mut set = JoinSet::new();
        for worker in 0..workers.max(1) {
            let pool = Arc::clone(&self);
            set.spawn(async move { pool.worker_loop(worker).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "fetch worker ended abnormally");
            }
        }

        let mut failed = std::mem::take(&mut *self.failed.lock().await);
        failed.sort();
        FetchReport {
            fetched: self.completed.load(Ordering::SeqCst),
            unresolved: self.unresolved.load(Ordering::SeqCst),
            failed,
            results: std::mem::take(&mut *self.results.lock().await),
        }
    }

    async fn worker_loop(&self, worker: usize) {
        while let Some(item) = self.queue.pop().await {
            match self.fetch_one(&item.id).await {
                Ok(Some(record)) => {
                    self.results.lock().await.insert(item.id.clone(), record);
                    let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
                    let remaining = self.queue.len().await;
                    debug!(worker, ticket = %item.id, done, remaining, "stored ticket");
                }
                Ok(None) => {
                    self.unresolved.fetch_add(1, Ordering::Relaxed);
                    debug!(worker, ticket = %item.id, "ticket has no resolution yet, skipping");
                }
                Err(err) => {
                    let attempts = item.attempts + 1;
                    if attempts < self.max_attempts {
                        warn!(worker, ticket = %item.id, attempts, error = %err, "error fetching ticket, will retry");
                        self.queue
                            .requeue(QueuedTicket {
                                id: item.id,
                                attempts,
                            })
                            .await;
                    } else {
                        warn!(worker, ticket = %item.id, attempts, error = %err, "error fetching ticket, giving up");
                        self.failed.lock().await.push(item.id);
                    }
                }
            }
        }
        debug!(worker, "fetch worker finished");
    }

    async fn fetch_one(&self, id: &TicketId) -> Result<Option<TicketRecord>, ApiError> {
        let body = self.api.ticket_detail(id).await?;
        let resolved = interpret_detail_response(&body).map_err(|err| {
            match response_status_code(&body) {
                Ok(code) if code != STATUS_SUCCESS => {
                    ApiError::Message(format!("detail request returned status code {code}"))
                }
                _ => ApiError::Message(err.to_string()),
            }
        })?;
        Ok(resolved
            .map(|ticket| ticket.to_record())
            .filter(|record| !record.resolution.is_empty()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checkpoint_entries: usize,
    pub pages_fetched: usize,
    pub discovered: usize,
    pub fetched: usize,
    pub unresolved: usize,
    pub failed_ids: Vec<TicketId>,
    pub persisted_entries: usize,
    pub snapshot_path: String,
    pub snapshot_sha256: String,
}

/// Two-phase run: discover ids, then fetch details, then merge and persist.
pub struct HarvestPipeline {
    options: PipelineOptions,
    store: CheckpointStore,
    api: Arc<dyn TicketApi>,
}

impl HarvestPipeline {
    pub fn new(options: PipelineOptions, store: CheckpointStore, api: Arc<dyn TicketApi>) -> Self {
        Self {
            options,
            store,
            api,
        }
    }

    pub async fn run_once(&self) -> Result<HarvestSummary, HarvestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("harvest", %run_id);
        self.run_phases(run_id).instrument(span).await
    }

    async fn run_phases(&self, run_id: Uuid) -> Result<HarvestSummary, HarvestError> {
        let started_at = Utc::now();
        let loaded = self.store.load().await?;
        let checkpoint = Arc::new(loaded.entries);

        let queue = Arc::new(WorkQueue::new(self.options.queue_pop_timeout));
        let state = Arc::new(RunState::default());

        info!(
            known = checkpoint.len(),
            workers = self.options.discovery_workers,
            "discovering ticket ids"
        );
        let discovery = Arc::new(DiscoveryEngine::new(
            Arc::clone(&self.api),
            Arc::clone(&checkpoint),
            Arc::clone(&queue),
            Arc::clone(&state),
            self.options.page_size,
        ));
        let discovered = discovery.run(self.options.discovery_workers).await;

        if let Some(fatal) = state.fatal() {
            error!(kind = fatal.kind(), "{fatal}, exiting");
            return Err(HarvestError::Fatal(fatal.clone()));
        }
        info!(
            pages = discovered.pages_fetched,
            queued = discovered.queued,
            skipped_known = discovered.skipped_known,
            "finished getting all ticket ids, now fetching details"
        );

        let pool = Arc::new(FetchPool::new(
            Arc::clone(&self.api),
            queue,
            self.options.detail_attempts,
        ));
        let fetched = pool.run(self.options.fetch_workers).await;
        info!(
            fetched = fetched.fetched,
            unresolved = fetched.unresolved,
            failed = fetched.failed.len(),
            path = %self.store.path().display(),
            "fetched all valid ticket details, saving snapshot"
        );

        let merged = merge_snapshot(&checkpoint, fetched.results);
        let persisted = self.store.persist(&merged).await?;

        Ok(HarvestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            checkpoint_entries: checkpoint.len(),
            pages_fetched: discovered.pages_fetched,
            discovered: discovered.queued,
            fetched: fetched.fetched,
            unresolved: fetched.unresolved,
            failed_ids: fetched.failed,
            persisted_entries: persisted.entries,
            snapshot_path: persisted.path.display().to_string(),
            snapshot_sha256: persisted.content_hash,
        })
    }
}

/// Validate `config`, build the ServiceDesk client and run one harvest.
pub async fn run_harvest(config: HarvestConfig) -> Result<HarvestSummary, HarvestError> {
    config.validate()?;
    let token = config
        .session_token
        .as_ref()
        .map(|t| SecretString::from(t.expose_secret().to_string()))
        .ok_or_else(|| HarvestError::Config("session token is not set".into()))?;
    let client = ServiceDeskClient::with_http_config(
        config.base_url.trim(),
        token,
        config.http_client_config(),
    )?;
    let pipeline = HarvestPipeline::new(
        config.pipeline_options(),
        CheckpointStore::new(config.checkpoint_path.clone()),
        Arc::new(client),
    );
    pipeline.run_once().await
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointOverview {
    pub path: String,
    pub status: String,
    pub entries: usize,
    pub first_id: Option<TicketId>,
    pub last_id: Option<TicketId>,
}

/// Load a checkpoint (same recovery rules as a harvest) and describe it.
pub async fn inspect_checkpoint(path: &Path) -> anyhow::Result<CheckpointOverview> {
    let loaded = CheckpointStore::new(path).load().await?;
    let status = match loaded.status {
        CheckpointStatus::Missing => "missing",
        CheckpointStatus::Blank => "blank",
        CheckpointStatus::Loaded => "loaded",
        CheckpointStatus::DiscardedCorrupt => "discarded-corrupt",
    };
    Ok(CheckpointOverview {
        path: path.display().to_string(),
        status: status.to_string(),
        entries: loaded.entries.len(),
        first_id: loaded.entries.keys().next().cloned(),
        last_id: loaded.entries.keys().next_back().cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> HarvestConfig {
        HarvestConfig {
            base_url: "https://desk.example.com".into(),
            session_token: Some(SecretString::from("token".to_string())),
            ..HarvestConfig::default()
        }
    }

    #[test]
    fn defaults_match_reference_fan_out() {
        let options = PipelineOptions::default();
        assert_eq!(options.discovery_workers, 50);
        assert_eq!(options.fetch_workers, 50);
        assert_eq!(options.page_size, 100);
        assert_eq!(options.queue_pop_timeout, Duration::from_secs(1));
    }

    #[test]
    fn validation_requires_url_and_token() {
        assert!(configured().validate().is_ok());

        let mut missing_token = configured();
        missing_token.session_token = None;
        assert!(matches!(missing_token.validate(), Err(HarvestError::Config(_))));

        let mut bad_url = configured();
        bad_url.base_url = "desk.example.com".into();
        assert!(matches!(bad_url.validate(), Err(HarvestError::Config(_))));

        let mut no_workers = configured();
        no_workers.fetch_workers = 0;
        assert_eq!(no_workers.validate().unwrap_err().exit_code(), 2);
    }

    #[test]
    fn yaml_settings_override_fields() {
        let settings = HarvestSettings::from_yaml_str(
            "base_url: https://other.example.com\ndiscovery_workers: 4\nqueue_pop_timeout_ms: 250\ncheckpoint_path: out/tickets.json\n",
        )
        .unwrap();
        let mut config = configured();
        config.apply_settings(settings);
        assert_eq!(config.base_url, "https://other.example.com");
        assert_eq!(config.discovery_workers, 4);
        assert_eq!(config.fetch_workers, DEFAULT_FETCH_WORKERS);
        assert_eq!(config.queue_pop_timeout, Duration::from_millis(250));
        assert_eq!(config.checkpoint_path, PathBuf::from("out/tickets.json"));
    }

    #[test]
    fn yaml_settings_reject_unknown_keys() {
        assert!(HarvestSettings::from_yaml_str("page_sise: 10\n").is_err());
    }

    #[test]
    fn run_state_keeps_first_fatal_and_stays_stopped() {
        let state = RunState::default();
        assert!(!state.should_stop());
        assert!(state.fatal().is_none());

        state.fail(FatalCondition::InvalidSession);
        state.fail(FatalCondition::Transport("reset".into()));
        assert!(state.should_stop());
        assert_eq!(state.fatal(), Some(&FatalCondition::InvalidSession));

        state.request_stop();
        assert!(state.should_stop());
    }

    #[test]
    fn fatal_conditions_name_their_cause() {
        assert_eq!(FatalCondition::InvalidSession.kind(), "auth");
        assert_eq!(FatalCondition::MalformedEnvelope("x".into()).kind(), "malformed-response");
        assert_eq!(FatalCondition::Transport("x".into()).kind(), "transport");
        assert!(FatalCondition::InvalidSession.to_string().contains("invalid"));
        assert_eq!(HarvestError::Fatal(FatalCondition::InvalidSession).exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cursor_claims_are_disjoint() {
        let cursor = Arc::new(SharedCursor::new(100));
        let mut set = JoinSet::new();
        for _ in 0..16 {
            let cursor = Arc::clone(&cursor);
            set.spawn(async move {
                let mut claimed = Vec::new();
                for _ in 0..25 {
                    claimed.push(cursor.claim().await);
                }
                claimed
            });
        }
        let mut all = Vec::new();
        while let Some(claimed) = set.join_next().await {
            all.extend(claimed.unwrap());
        }
        all.sort_unstable();
        let expected: Vec<u64> = (0..400).map(|i| i * 100).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn queue_pop_gives_up_after_timeout() {
        let queue = WorkQueue::new(Duration::from_millis(20));
        let started = tokio::time::Instant::now();
        assert!(queue.pop().await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn queue_pop_wakes_for_late_push() {
        let queue = Arc::new(WorkQueue::new(Duration::from_secs(5)));
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(TicketId::from(9u64)).await;
        });
        let item = queue.pop().await.unwrap();
        assert_eq!(item.id, TicketId::from(9u64));
        assert_eq!(item.attempts, 0);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let queue = WorkQueue::new(Duration::from_millis(10));
        for id in [3u64, 1, 2] {
            queue.push(id.into()).await;
        }
        assert_eq!(queue.len().await, 3);
        let order: Vec<TicketId> = [
            queue.pop().await.unwrap().id,
            queue.pop().await.unwrap().id,
            queue.pop().await.unwrap().id,
        ]
        .into();
        assert_eq!(order, vec![TicketId::from(3u64), 1u64.into(), 2u64.into()]);
    }

    #[tokio::test]
    async fn inspect_reports_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            r#"{"7": {"description": "a", "resolution": "b"}, "12": {"description": "c", "resolution": "d"}}"#,
        )
        .unwrap();
        let overview = inspect_checkpoint(&path).await.unwrap();
        assert_eq!(overview.status, "loaded");
        assert_eq!(overview.entries, 2);
        assert_eq!(overview.first_id, Some(TicketId::from("12")));
        assert_eq!(overview.last_id, Some(TicketId::from("7")));
    }
}
