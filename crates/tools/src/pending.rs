//! Correlation of outgoing extension queries with their asynchronously
//! posted results.
//!
//! The extension never receives pushes: it picks queries up on `/sync` and
//! answers later on `/query-result` or in the next sync's `command_results`.
//! Each query owns a oneshot waiter; whichever of the resolver and the
//! deadline takes the waiter out of the table first decides the outcome.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tabscope_core::config::QueryConfig;
use tabscope_core::{Error, Result};
use tabscope_storage::capture::EXTENSION_STALE_AFTER;
use tabscope_storage::{CaptureStore, MemoryPressure};

const MAX_FAILED_COMMANDS: usize = 100;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Execute,
    Screenshot,
    Waterfall,
    StateCapture,
    Dom,
    Accessibility,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::Execute => "execute",
            QueryType::Screenshot => "screenshot",
            QueryType::Waterfall => "waterfall",
            QueryType::StateCapture => "state_capture",
            QueryType::Dom => "dom",
            QueryType::Accessibility => "accessibility",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingQuery {
    pub id: String,
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip)]
    pub created_at: Instant,
    #[serde(skip)]
    pub deadline: Instant,
    #[serde(skip)]
    delivered: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResolution {
    Fulfilled(Value),
    /// The extension answered with an explicit error.
    Failed(String),
    TimedOut,
}

/// Handle returned by [`QueryDispatcher::create`]; pass it to [`QueryDispatcher::wait`].
#[derive(Debug)]
pub struct QueryTicket {
    pub id: String,
    rx: oneshot::Receiver<QueryResolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Complete,
    Error,
    Timeout,
    Expired,
    Cancelled,
}

impl CommandStatus {
    /// Maps the many spellings extensions report onto the closed status set.
    /// Unknown strings count as complete.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "running" | "still_processing" => CommandStatus::Pending,
            "error" | "failed" => CommandStatus::Error,
            "timeout" => CommandStatus::Timeout,
            "expired" => CommandStatus::Expired,
            "cancelled" | "canceled" => CommandStatus::Cancelled,
            _ => CommandStatus::Complete,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            CommandStatus::Error | CommandStatus::Timeout | CommandStatus::Expired | CommandStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Complete => "complete",
            CommandStatus::Error => "error",
            CommandStatus::Timeout => "timeout",
            CommandStatus::Expired => "expired",
            CommandStatus::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle record of an async `interact` command, keyed by correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub correlation_id: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    deadline: Instant,
    #[serde(skip)]
    finished: Option<Instant>,
}

#[derive(Default)]
struct DispatcherState {
    next_id: u64,
    queries: VecDeque<PendingQuery>,
    waiters: HashMap<String, oneshot::Sender<QueryResolution>>,
    commands: HashMap<String, CommandRecord>,
    failed: VecDeque<CommandRecord>,
}

pub struct QueryDispatcher {
    state: Mutex<DispatcherState>,
    command_changed: Notify,
    max_pending: usize,
    result_ttl: Duration,
}

impl QueryDispatcher {
    pub fn new(config: &QueryConfig) -> Self {
        Self {
            state: Mutex::new(DispatcherState::default()),
            command_changed: Notify::new(),
            max_pending: config.max_pending.max(1),
            result_ttl: config.result_ttl(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    /// Queues a query for the extension. When the table is full the oldest
    /// query is dropped and its waiter observes a timeout.
    pub fn create(
        &self,
        query_type: QueryType,
        params: Value,
        tab_id: Option<i64>,
        correlation_id: Option<String>,
        timeout: Duration,
    ) -> QueryTicket {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut st = self.lock();
        st.next_id += 1;
        let id = format!("q-{}", st.next_id);

        while st.queries.len() >= self.max_pending {
            if let Some(dropped) = st.queries.pop_front() {
                st.waiters.remove(&dropped.id);
                warn!(id = %dropped.id, kind = ?dropped.query_type, "Pending query table full, dropping oldest");
            }
        }

        if let Some(cid) = &correlation_id {
            st.commands.insert(
                cid.clone(),
                CommandRecord {
                    correlation_id: cid.clone(),
                    status: CommandStatus::Pending,
                    result: None,
                    error: None,
                    created_at: Utc::now(),
                    completed_at: None,
                    deadline: now + timeout,
                    finished: None,
                },
            );
        }
        st.queries.push_back(PendingQuery {
            id: id.clone(),
            query_type,
            params,
            tab_id,
            correlation_id,
            created_at: now,
            deadline: now + timeout,
            delivered: false,
        });
        st.waiters.insert(id.clone(), tx);
        debug!(id = %id, kind = ?query_type, "Query → extension");
        QueryTicket { id, rx }
    }

    /// Queries not yet handed to the extension. Each query is delivered once.
    pub fn take_undelivered(&self) -> Vec<PendingQuery> {
        let mut st = self.lock();
        let now = Instant::now();
        st.queries
            .iter_mut()
            .filter(|q| !q.delivered && q.deadline > now)
            .map(|q| {
                q.delivered = true;
                q.clone()
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().queries.len()
    }

    /// Delivers the extension's answer. Returns false when the query already
    /// timed out or never existed, in which case the result is discarded.
    pub fn resolve(&self, id: &str, outcome: std::result::Result<Value, String>) -> bool {
        let (waiter, correlation_id) = {
            let mut st = self.lock();
            let correlation_id = st
                .queries
                .iter()
                .position(|q| q.id == id)
                .and_then(|pos| st.queries.remove(pos))
                .and_then(|q| q.correlation_id);
            (st.waiters.remove(id), correlation_id)
        };

        if let Some(cid) = correlation_id {
            let (status, result, error) = match &outcome {
                Ok(v) => (CommandStatus::Complete, Some(v.clone()), None),
                Err(e) => (CommandStatus::Error, None, Some(e.clone())),
            };
            self.record_command(&cid, status, result, error);
        }

        match waiter {
            Some(tx) => {
                let resolution = match outcome {
                    Ok(v) => QueryResolution::Fulfilled(v),
                    Err(e) => QueryResolution::Failed(e),
                };
                // The waiter may have just given up; that is the same as a late result.
                let delivered = tx.send(resolution).is_ok();
                debug!(id, delivered, "Query ← extension");
                delivered
            }
            None => {
                debug!(id, "Discarding result for expired or unknown query");
                false
            }
        }
    }

    /// Waits for the ticket's query to resolve or `timeout` to elapse.
    pub async fn wait(&self, ticket: QueryTicket, timeout: Duration) -> QueryResolution {
        let QueryTicket { id, mut rx } = ticket;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            // Sender dropped: evicted by overflow or expired by the sweeper.
            Ok(Err(_)) => QueryResolution::TimedOut,
            Err(_) => {
                let removed = {
                    let mut st = self.lock();
                    st.queries.retain(|q| q.id != id);
                    st.waiters.remove(&id).is_some()
                };
                if removed {
                    debug!(id = %id, "Query timed out");
                    QueryResolution::TimedOut
                } else {
                    // The resolver took the waiter between the deadline and the lock.
                    rx.try_recv().unwrap_or(QueryResolution::TimedOut)
                }
            }
        }
    }

    /// Issues a query and waits for the answer. A payload carrying an `error`
    /// string counts as an extension-reported failure.
    pub async fn query(
        &self,
        query_type: QueryType,
        params: Value,
        tab_id: Option<i64>,
        timeout: Duration,
    ) -> Result<Value> {
        let ticket = self.create(query_type, params, tab_id, None, timeout);
        match self.wait(ticket, timeout).await {
            QueryResolution::Fulfilled(v) => match v.get("error").and_then(Value::as_str) {
                Some(e) => Err(Error::Extension(e.to_string())),
                None => Ok(v),
            },
            QueryResolution::Failed(e) => Err(Error::Extension(e)),
            QueryResolution::TimedOut => Err(Error::ExtensionTimeout(format!(
                "{} query got no answer within {}s",
                query_type.as_str(),
                timeout.as_secs()
            ))),
        }
    }

    // ─── Commands ───────────────────────────────────────────────────────────

    /// Records a command result reported by the extension. Terminal records are
    /// never overwritten.
    pub fn complete_command(&self, correlation_id: &str, raw_status: &str, result: Option<Value>, error: Option<String>) {
        let status = CommandStatus::normalize(raw_status);
        self.record_command(correlation_id, status, result, error);
    }

    fn record_command(&self, correlation_id: &str, status: CommandStatus, result: Option<Value>, error: Option<String>) {
        {
            let mut st = self.lock();
            let Some(cmd) = st.commands.get_mut(correlation_id) else {
                debug!(correlation_id, "Result for unknown command");
                return;
            };
            if cmd.status != CommandStatus::Pending {
                debug!(correlation_id, status = cmd.status.as_str(), "Ignoring update to finished command");
                return;
            }
            if status == CommandStatus::Pending {
                return;
            }
            cmd.status = status;
            cmd.result = result;
            cmd.error = error;
            cmd.completed_at = Some(Utc::now());
            cmd.finished = Some(Instant::now());
            if status.is_failure() {
                let failed = cmd.clone();
                st.failed.push_back(failed);
                while st.failed.len() > MAX_FAILED_COMMANDS {
                    st.failed.pop_front();
                }
            }
        }
        self.command_changed.notify_waiters();
    }

    pub fn expire_command(&self, correlation_id: &str) {
        self.record_command(
            correlation_id,
            CommandStatus::Expired,
            None,
            Some("Command expired before extension could execute it".to_string()),
        );
    }

    pub fn command(&self, correlation_id: &str) -> Option<CommandRecord> {
        self.lock().commands.get(correlation_id).cloned()
    }

    /// Blocks until the command leaves `pending` or `timeout` elapses, then
    /// returns its current record.
    pub async fn wait_for_command(&self, correlation_id: &str, timeout: Duration) -> Option<CommandRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.command_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let cmd = self.command(correlation_id)?;
            if cmd.status != CommandStatus::Pending {
                return Some(cmd);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.command(correlation_id);
            }
        }
    }

    pub fn pending_commands(&self) -> Vec<CommandRecord> {
        let mut out: Vec<_> = self
            .lock()
            .commands
            .values()
            .filter(|c| c.status == CommandStatus::Pending)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn completed_commands(&self) -> Vec<CommandRecord> {
        let mut out: Vec<_> = self
            .lock()
            .commands
            .values()
            .filter(|c| c.status == CommandStatus::Complete)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn failed_commands(&self) -> Vec<CommandRecord> {
        self.lock().failed.iter().cloned().collect()
    }

    // ─── Expiry ─────────────────────────────────────────────────────────────

    /// Drops overdue queries, expires overdue commands and forgets finished
    /// commands older than the result TTL.
    pub fn expire_overdue(&self) {
        let now = Instant::now();
        let overdue_commands: Vec<String> = {
            let mut st = self.lock();
            let overdue: Vec<String> = st
                .queries
                .iter()
                .filter(|q| q.deadline <= now)
                .map(|q| q.id.clone())
                .collect();
            for id in &overdue {
                st.waiters.remove(id);
            }
            st.queries.retain(|q| q.deadline > now);

            let ttl = self.result_ttl;
            st.commands
                .retain(|_, c| c.finished.map(|t| now.duration_since(t) < ttl).unwrap_or(true));
            st.commands
                .values()
                .filter(|c| c.status == CommandStatus::Pending && c.deadline <= now)
                .map(|c| c.correlation_id.clone())
                .collect()
        };
        for cid in overdue_commands {
            self.expire_command(&cid);
        }
    }

    /// Fails everything in flight, e.g. when the extension stops syncing.
    pub fn expire_all(&self, reason: &str) -> usize {
        let (dropped, pending): (usize, Vec<String>) = {
            let mut st = self.lock();
            let dropped = st.queries.len();
            st.queries.clear();
            st.waiters.clear();
            let pending = st
                .commands
                .values()
                .filter(|c| c.status == CommandStatus::Pending)
                .map(|c| c.correlation_id.clone())
                .collect();
            (dropped, pending)
        };
        for cid in &pending {
            self.record_command(cid, CommandStatus::Expired, None, Some(reason.to_string()));
        }
        if dropped > 0 || !pending.is_empty() {
            info!(reason, queries = dropped, commands = pending.len(), "Expired all pending work");
        }
        dropped + pending.len()
    }

    /// Background maintenance loop; also expires everything once the extension
    /// has gone quiet, and re-checks memory pressure while it is raised.
    pub fn spawn_sweeper(self: &Arc<Self>, capture: Arc<CaptureStore>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                this.expire_overdue();
                // Lets buffers recover from pressure even when ingestion stops.
                if capture.pressure() != MemoryPressure::Normal {
                    capture.check_memory();
                }
                let disconnected = capture
                    .last_sync_age()
                    .map(|age| age >= EXTENSION_STALE_AFTER)
                    .unwrap_or(false);
                if disconnected && (this.pending_count() > 0 || !this.pending_commands().is_empty()) {
                    this.expire_all("extension_disconnected");
                }
            }
        })
    }
}
