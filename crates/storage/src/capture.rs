//! Process-wide telemetry store. One instance is built at startup and shared by
//! the HTTP ingestion routes and every tool handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tabscope_core::config::{BufferConfig, MemoryConfig};
use tabscope_core::types::{
    EnhancedAction, ExtensionLog, LogEntry, NetworkBody, NetworkWaterfallEntry, PerformanceBaseline,
    PerformanceSnapshot, WebSocketEvent,
};
use tabscope_core::Config;

use crate::memory::{MemoryPressure, ACTION_ESTIMATED_BYTES};
use crate::performance::PerformanceStore;
use crate::ring_buffer::{BufferSnapshot, RingBuffer};

/// The extension counts as connected while its last `/sync` is younger than this.
pub const EXTENSION_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TelemetryKind {
    Logs,
    ExtensionLogs,
    Waterfall,
    NetworkBodies,
    WebSocketEvents,
    Actions,
    Performance,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 7] = [
        TelemetryKind::Logs,
        TelemetryKind::ExtensionLogs,
        TelemetryKind::Waterfall,
        TelemetryKind::NetworkBodies,
        TelemetryKind::WebSocketEvents,
        TelemetryKind::Actions,
        TelemetryKind::Performance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TelemetryKind::Logs => "logs",
            TelemetryKind::ExtensionLogs => "extension_logs",
            TelemetryKind::Waterfall => "network_waterfall",
            TelemetryKind::NetworkBodies => "network_bodies",
            TelemetryKind::WebSocketEvents => "websocket_events",
            TelemetryKind::Actions => "actions",
            TelemetryKind::Performance => "performance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "logs" | "console" => Some(TelemetryKind::Logs),
            "extension_logs" => Some(TelemetryKind::ExtensionLogs),
            "network_waterfall" | "waterfall" => Some(TelemetryKind::Waterfall),
            "network_bodies" | "network" => Some(TelemetryKind::NetworkBodies),
            "websocket_events" | "websocket" => Some(TelemetryKind::WebSocketEvents),
            "actions" => Some(TelemetryKind::Actions),
            "performance" => Some(TelemetryKind::Performance),
            _ => None,
        }
    }
}

/// Which tab the extension is currently recording, as reported on `/sync`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingStatus {
    pub enabled: bool,
    pub tab_id: Option<i64>,
    pub tab_url: String,
    pub tab_title: String,
}

#[derive(Debug, Clone, Default)]
struct ExtensionStatus {
    last_sync: Option<Instant>,
    last_sync_at: Option<DateTime<Utc>>,
    session_id: String,
    version: String,
}

/// `total_added` per diffable buffer at one moment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPositions {
    pub logs: u64,
    pub network: u64,
    pub websocket: u64,
    pub actions: u64,
}

/// Current pressure level plus what the relax rules need to know.
#[derive(Debug, Clone, Copy)]
struct PressureState {
    level: MemoryPressure,
    changed_at: Instant,
    /// Since when the estimate has been under the soft limit.
    calm_since: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStat {
    pub len: usize,
    pub capacity: usize,
    pub total_added: u64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn log_size(entry: &LogEntry) -> usize {
    entry.message.len() + entry.stack.len() + 200
}

pub struct CaptureStore {
    capacities: BufferConfig,
    memory_limits: MemoryConfig,
    logs: RwLock<RingBuffer<LogEntry>>,
    extension_logs: RwLock<RingBuffer<ExtensionLog>>,
    waterfall: RwLock<RingBuffer<NetworkWaterfallEntry>>,
    network_bodies: RwLock<RingBuffer<NetworkBody>>,
    websocket_events: RwLock<RingBuffer<WebSocketEvent>>,
    actions: RwLock<RingBuffer<EnhancedAction>>,
    performance: RwLock<PerformanceStore>,
    tracking: RwLock<TrackingStatus>,
    extension: RwLock<ExtensionStatus>,
    pressure: Mutex<PressureState>,
}

impl CaptureStore {
    pub fn new(config: &Config) -> Self {
        let c = &config.buffers;
        Self {
            capacities: c.clone(),
            memory_limits: config.memory.clone(),
            logs: RwLock::new(RingBuffer::new(c.logs)),
            extension_logs: RwLock::new(RingBuffer::new(c.extension_logs)),
            waterfall: RwLock::new(RingBuffer::new(c.waterfall)),
            network_bodies: RwLock::new(RingBuffer::new(c.network_bodies)),
            websocket_events: RwLock::new(RingBuffer::new(c.websocket_events)),
            actions: RwLock::new(RingBuffer::new(c.actions)),
            performance: RwLock::new(PerformanceStore::new()),
            tracking: RwLock::new(TrackingStatus::default()),
            extension: RwLock::new(ExtensionStatus::default()),
            pressure: Mutex::new(PressureState {
                level: MemoryPressure::Normal,
                changed_at: Instant::now(),
                calm_since: None,
            }),
        }
    }

    // ─── Ingestion ──────────────────────────────────────────────────────────

    pub fn add_logs(&self, entries: Vec<LogEntry>) -> usize {
        let n = entries.len();
        {
            let mut buf = write(&self.logs);
            for e in entries {
                buf.push(e);
            }
        }
        self.check_memory();
        n
    }

    pub fn add_extension_logs(&self, entries: Vec<ExtensionLog>) -> usize {
        let n = entries.len();
        let mut buf = write(&self.extension_logs);
        for e in entries {
            buf.push(e);
        }
        n
    }

    pub fn add_waterfall(&self, entries: Vec<NetworkWaterfallEntry>, page_url: &str) -> usize {
        let n = entries.len();
        let now = Utc::now();
        let mut buf = write(&self.waterfall);
        for mut e in entries {
            if e.page_url.is_empty() {
                e.page_url = page_url.to_string();
            }
            if e.timestamp == DateTime::<Utc>::default() {
                e.timestamp = now;
            }
            buf.push_at(e, now);
        }
        n
    }

    /// Returns how many bodies were kept; zero while body capture is disabled
    /// under hard memory pressure.
    pub fn add_network_bodies(&self, bodies: Vec<NetworkBody>) -> usize {
        if !self.pressure().network_bodies_enabled() {
            debug!(dropped = bodies.len(), "Network body capture disabled under memory pressure");
            return 0;
        }
        let n = bodies.len();
        {
            let mut buf = write(&self.network_bodies);
            for b in bodies {
                buf.push(b);
            }
        }
        self.check_memory();
        n
    }

    pub fn add_websocket_events(&self, events: Vec<WebSocketEvent>) -> usize {
        let n = events.len();
        {
            let mut buf = write(&self.websocket_events);
            for e in events {
                buf.push(e);
            }
        }
        self.check_memory();
        n
    }

    pub fn add_actions(&self, actions: Vec<EnhancedAction>) -> usize {
        let n = actions.len();
        {
            let mut buf = write(&self.actions);
            for a in actions {
                buf.push(a);
            }
        }
        self.check_memory();
        n
    }

    /// Stores the snapshot and returns the URL's baseline from before it.
    pub fn add_performance_snapshot(&self, snapshot: PerformanceSnapshot) -> Option<PerformanceBaseline> {
        write(&self.performance).add_snapshot(snapshot)
    }

    // ─── Reads ──────────────────────────────────────────────────────────────

    pub fn logs(&self) -> BufferSnapshot<LogEntry> {
        read(&self.logs).snapshot()
    }

    pub fn extension_logs(&self) -> BufferSnapshot<ExtensionLog> {
        read(&self.extension_logs).snapshot()
    }

    pub fn waterfall(&self) -> BufferSnapshot<NetworkWaterfallEntry> {
        read(&self.waterfall).snapshot()
    }

    pub fn network_bodies(&self) -> BufferSnapshot<NetworkBody> {
        read(&self.network_bodies).snapshot()
    }

    pub fn websocket_events(&self) -> BufferSnapshot<WebSocketEvent> {
        read(&self.websocket_events).snapshot()
    }

    pub fn actions(&self) -> BufferSnapshot<EnhancedAction> {
        read(&self.actions).snapshot()
    }

    pub fn with_performance<R>(&self, f: impl FnOnce(&PerformanceStore) -> R) -> R {
        f(&read(&self.performance))
    }

    pub fn logs_since(&self, position: u64) -> Vec<LogEntry> {
        read(&self.logs).since_position(position)
    }

    pub fn network_bodies_since(&self, position: u64) -> Vec<NetworkBody> {
        read(&self.network_bodies).since_position(position)
    }

    pub fn websocket_events_since(&self, position: u64) -> Vec<WebSocketEvent> {
        read(&self.websocket_events).since_position(position)
    }

    pub fn actions_since(&self, position: u64) -> Vec<EnhancedAction> {
        read(&self.actions).since_position(position)
    }

    pub fn positions(&self) -> BufferPositions {
        BufferPositions {
            logs: read(&self.logs).total_added(),
            network: read(&self.network_bodies).total_added(),
            websocket: read(&self.websocket_events).total_added(),
            actions: read(&self.actions).total_added(),
        }
    }

    /// Buffer positions as they stood at `t`, by floor search on insertion time.
    pub fn positions_at(&self, t: DateTime<Utc>) -> BufferPositions {
        BufferPositions {
            logs: read(&self.logs).position_at_time(t),
            network: read(&self.network_bodies).position_at_time(t),
            websocket: read(&self.websocket_events).position_at_time(t),
            actions: read(&self.actions).position_at_time(t),
        }
    }

    /// When the newest entry of `kind` arrived.
    pub fn newest_added_at(&self, kind: TelemetryKind) -> Option<DateTime<Utc>> {
        match kind {
            TelemetryKind::Logs => read(&self.logs).newest_added_at(),
            TelemetryKind::ExtensionLogs => read(&self.extension_logs).newest_added_at(),
            TelemetryKind::Waterfall => read(&self.waterfall).newest_added_at(),
            TelemetryKind::NetworkBodies => read(&self.network_bodies).newest_added_at(),
            TelemetryKind::WebSocketEvents => read(&self.websocket_events).newest_added_at(),
            TelemetryKind::Actions => read(&self.actions).newest_added_at(),
            TelemetryKind::Performance => None,
        }
    }

    // ─── Tracking & extension state ─────────────────────────────────────────

    pub fn tracking(&self) -> TrackingStatus {
        read(&self.tracking).clone()
    }

    pub fn set_tracking(&self, status: TrackingStatus) {
        let mut cur = write(&self.tracking);
        if *cur != status {
            info!(tab_id = ?status.tab_id, url = %status.tab_url, enabled = status.enabled, "Tracking changed");
            *cur = status;
        }
    }

    pub fn record_sync(&self, session_id: &str, version: &str) {
        let mut ext = write(&self.extension);
        if ext.session_id != session_id && !session_id.is_empty() {
            info!(session_id, version, "Extension session started");
        }
        ext.last_sync = Some(Instant::now());
        ext.last_sync_at = Some(Utc::now());
        ext.session_id = session_id.to_string();
        ext.version = version.to_string();
    }

    pub fn last_sync_age(&self) -> Option<Duration> {
        read(&self.extension).last_sync.map(|t| t.elapsed())
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        read(&self.extension).last_sync_at
    }

    pub fn extension_version(&self) -> String {
        read(&self.extension).version.clone()
    }

    pub fn extension_connected(&self) -> bool {
        self.last_sync_age()
            .map(|age| age < EXTENSION_STALE_AFTER)
            .unwrap_or(false)
    }

    // ─── Maintenance ────────────────────────────────────────────────────────

    pub fn clear(&self, kind: TelemetryKind) -> usize {
        let n = match kind {
            TelemetryKind::Logs => write(&self.logs).clear(),
            TelemetryKind::ExtensionLogs => write(&self.extension_logs).clear(),
            TelemetryKind::Waterfall => write(&self.waterfall).clear(),
            TelemetryKind::NetworkBodies => write(&self.network_bodies).clear(),
            TelemetryKind::WebSocketEvents => write(&self.websocket_events).clear(),
            TelemetryKind::Actions => write(&self.actions).clear(),
            TelemetryKind::Performance => write(&self.performance).clear(),
        };
        info!(kind = kind.as_str(), cleared = n, "Buffer cleared");
        self.settle_pressure(true);
        n
    }

    pub fn stats(&self) -> BTreeMap<&'static str, BufferStat> {
        fn stat<T: Clone>(buf: &RingBuffer<T>) -> BufferStat {
            BufferStat {
                len: buf.len(),
                capacity: buf.capacity(),
                total_added: buf.total_added(),
            }
        }
        let mut out = BTreeMap::new();
        out.insert(TelemetryKind::Logs.as_str(), stat(&read(&self.logs)));
        out.insert(TelemetryKind::ExtensionLogs.as_str(), stat(&read(&self.extension_logs)));
        out.insert(TelemetryKind::Waterfall.as_str(), stat(&read(&self.waterfall)));
        out.insert(TelemetryKind::NetworkBodies.as_str(), stat(&read(&self.network_bodies)));
        out.insert(TelemetryKind::WebSocketEvents.as_str(), stat(&read(&self.websocket_events)));
        out.insert(TelemetryKind::Actions.as_str(), stat(&read(&self.actions)));
        out
    }

    pub fn pressure(&self) -> MemoryPressure {
        self.pressure.lock().unwrap_or_else(|e| e.into_inner()).level
    }

    /// Rough byte footprint of the heavy buffers.
    pub fn estimated_bytes(&self) -> usize {
        let logs: usize = read(&self.logs).iter().map(log_size).sum();
        let bodies: usize = read(&self.network_bodies).iter().map(NetworkBody::estimated_size).sum();
        let ws: usize = read(&self.websocket_events).iter().map(WebSocketEvent::estimated_size).sum();
        let actions = read(&self.actions).len() * ACTION_ESTIMATED_BYTES;
        logs + bodies + ws + actions
    }

    /// Re-evaluates memory pressure and resizes buffers when the level changes.
    /// Hard mode outlives the clear it triggers; see [`MemoryPressure::next`].
    pub fn check_memory(&self) -> MemoryPressure {
        self.settle_pressure(false)
    }

    /// With `force`, the level follows the estimate directly (explicit clears).
    fn settle_pressure(&self, force: bool) -> MemoryPressure {
        let bytes = self.estimated_bytes();
        let classified = MemoryPressure::classify(bytes, &self.memory_limits);
        let now = Instant::now();
        let mut st = self.pressure.lock().unwrap_or_else(|e| e.into_inner());
        st.calm_since = match classified {
            MemoryPressure::Normal => st.calm_since.or(Some(now)),
            _ => None,
        };
        let level = if force {
            classified
        } else {
            st.level.next(
                classified,
                now.duration_since(st.changed_at),
                st.calm_since.map(|t| now.duration_since(t)),
            )
        };
        if level == st.level {
            return level;
        }
        if level < st.level {
            info!(bytes, from = st.level.as_str(), to = level.as_str(), "Memory pressure relieved, restoring buffer capacities");
        } else {
            warn!(bytes, level = level.as_str(), "Memory pressure, shrinking capture buffers");
        }
        st.level = level;
        st.changed_at = now;
        self.apply_capacities(level);
        if level == MemoryPressure::Hard {
            write(&self.network_bodies).clear();
        }
        level
    }

    fn apply_capacities(&self, level: MemoryPressure) {
        let c = &self.capacities;
        write(&self.logs).set_capacity(level.scale(c.logs));
        write(&self.extension_logs).set_capacity(level.scale(c.extension_logs));
        write(&self.waterfall).set_capacity(level.scale(c.waterfall));
        write(&self.network_bodies).set_capacity(level.scale(c.network_bodies));
        write(&self.websocket_events).set_capacity(level.scale(c.websocket_events));
        write(&self.actions).set_capacity(level.scale(c.actions));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CaptureStore {
        CaptureStore::new(&Config::default())
    }

    fn log(msg: &str) -> LogEntry {
        LogEntry {
            level: "error".into(),
            message: msg.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let s = store();
        s.add_logs(vec![log("a"), log("b")]);
        let snap = s.logs();
        s.add_logs(vec![log("c")]);
        assert_eq!(snap.len(), 2);
        assert_eq!(s.logs().len(), 3);
    }

    #[test]
    fn test_positions_and_since() {
        let s = store();
        s.add_logs(vec![log("a")]);
        let pos = s.positions();
        s.add_logs(vec![log("b"), log("c")]);
        let new: Vec<String> = s.logs_since(pos.logs).into_iter().map(|e| e.message).collect();
        assert_eq!(new, vec!["b", "c"]);
    }

    #[test]
    fn test_extension_connectivity() {
        let s = store();
        assert!(!s.extension_connected());
        s.record_sync("sess-1", "1.2.3");
        assert!(s.extension_connected());
        assert_eq!(s.extension_version(), "1.2.3");
    }

    #[test]
    fn test_hard_pressure_disables_bodies() {
        let mut cfg = Config::default();
        cfg.memory.soft_limit_bytes = 1_000;
        cfg.memory.hard_limit_bytes = 2_000;
        let s = CaptureStore::new(&cfg);
        let big = NetworkBody {
            url: "/api".into(),
            response_body: "x".repeat(3_000),
            ..Default::default()
        };
        assert_eq!(s.add_network_bodies(vec![big.clone()]), 1);
        assert_eq!(s.pressure(), MemoryPressure::Hard);
        assert_eq!(s.add_network_bodies(vec![big]), 0);
        assert_eq!(s.stats()["logs"].capacity, 250);
    }

    #[test]
    fn test_hard_pressure_survives_next_ingestion() {
        let mut cfg = Config::default();
        cfg.memory.soft_limit_bytes = 1_000;
        cfg.memory.hard_limit_bytes = 2_000;
        let s = CaptureStore::new(&cfg);
        let big = NetworkBody {
            url: "/api".into(),
            response_body: "x".repeat(3_000),
            ..Default::default()
        };
        s.add_network_bodies(vec![big.clone()]);
        assert_eq!(s.pressure(), MemoryPressure::Hard);

        // Entering hard mode dropped the bodies, so the estimate is now tiny.
        s.add_logs(vec![log("small")]);
        assert_eq!(s.pressure(), MemoryPressure::Hard);
        assert_eq!(s.stats()["logs"].capacity, 250);
        assert_eq!(s.add_network_bodies(vec![big]), 0);
        assert!(s.network_bodies().is_empty());
    }

    #[test]
    fn test_explicit_clear_ends_hard_pressure() {
        let mut cfg = Config::default();
        cfg.memory.soft_limit_bytes = 1_000;
        cfg.memory.hard_limit_bytes = 2_000;
        let s = CaptureStore::new(&cfg);
        s.add_network_bodies(vec![NetworkBody {
            response_body: "x".repeat(3_000),
            ..Default::default()
        }]);
        assert_eq!(s.pressure(), MemoryPressure::Hard);
        s.clear(TelemetryKind::NetworkBodies);
        assert_eq!(s.pressure(), MemoryPressure::Normal);
        assert_eq!(s.stats()["logs"].capacity, 1000);
        assert_eq!(s.add_network_bodies(vec![NetworkBody::default()]), 1);
    }

    #[test]
    fn test_soft_pressure_halves_capacity() {
        let mut cfg = Config::default();
        cfg.memory.soft_limit_bytes = 1_000;
        cfg.memory.hard_limit_bytes = 1_000_000;
        let s = CaptureStore::new(&cfg);
        let events: Vec<WebSocketEvent> = (0..5)
            .map(|i| WebSocketEvent {
                id: format!("ws-{}", i),
                event: "message".into(),
                data: "y".repeat(100),
                ..Default::default()
            })
            .collect();
        s.add_websocket_events(events);
        assert_eq!(s.pressure(), MemoryPressure::Soft);
        assert_eq!(s.stats()["websocket_events"].capacity, 250);
        assert_eq!(s.stats()["network_bodies"].capacity, 50);
    }

    #[test]
    fn test_waterfall_keeps_recorded_timestamp() {
        let s = store();
        let recorded = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let entries = vec![
            NetworkWaterfallEntry {
                url: "https://a.test/app.js".into(),
                timestamp: recorded,
                ..Default::default()
            },
            NetworkWaterfallEntry {
                url: "https://a.test/late.css".into(),
                ..Default::default()
            },
        ];
        s.add_waterfall(entries, "https://a.test/");
        let snap = s.waterfall();
        let stored: Vec<&NetworkWaterfallEntry> = snap.entries.iter().collect();
        assert_eq!(stored[0].timestamp, recorded);
        assert!(stored[1].timestamp > recorded);
        assert_eq!(stored[1].page_url, "https://a.test/");
    }

    #[test]
    fn test_clear_keeps_positions_monotonic() {
        let s = store();
        s.add_actions(vec![EnhancedAction::default(); 3]);
        assert_eq!(s.clear(TelemetryKind::Actions), 3);
        assert_eq!(s.positions().actions, 3);
        assert!(s.actions().is_empty());
    }
}
