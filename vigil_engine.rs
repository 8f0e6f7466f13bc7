//! # Vigil Engine - Storage Performance Monitoring & Alerting
//!
//! A performance monitoring and alerting engine that transparently instruments
//! storage-layer operations. Relational queries and cache commands are timed
//! and classified without any change to their call contracts, metric records
//! are buffered and batch-persisted to a pluggable durable sink, an
//! independent collector snapshots system/store/cache health, and a threshold
//! alert engine publishes breaches to typed subscribers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              VIGIL ENGINE                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  INTERCEPTORS → CLASSIFIER → METRICS BUFFER → BATCH PERSISTER → SINK     │
//! │  SNAPSHOT COLLECTOR ───────────┘        └──→ ALERT ENGINE → SUBSCRIBERS  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Zero behavior change**: wrapped clients forward results and errors
//!   untouched; instrumentation is a decorator built once at startup
//! - **One record per call**: every completed wrapped operation produces
//!   exactly one execution/command record, success or failure
//! - **Bounded state**: buffer, alert log, snapshot history and fingerprint
//!   aggregates are all capacity-capped with drop counters
//! - **Failure isolation**: a failing sub-gatherer, sink partition, or alert
//!   subscriber never takes down another task or the host process

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives - Crossbeam & Parking Lot
// ----------------------------------------------------------------------------
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Lock-Free Data Structures
// ----------------------------------------------------------------------------
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use once_cell::sync::Lazy;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing & Identity
// ----------------------------------------------------------------------------
use ahash::AHashMap;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use quanta::Clock;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::{Regex, RegexSet};

// ----------------------------------------------------------------------------
// System Information
// ----------------------------------------------------------------------------
use sysinfo::{Disks, Networks, Pid, System};

// ----------------------------------------------------------------------------
// Sorting & Math
// ----------------------------------------------------------------------------
use ordered_float::OrderedFloat;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & DEFAULTS
// ============================================================================
// Global constants and the default values behind every configuration knob.
// Everything here is overridable through `MonitorConfig`.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "vigil-engine";
pub const ENGINE_FULL_NAME: &str = "Vigil Performance Monitoring Engine";

// ----------------------------------------------------------------------------
// Classification Thresholds
// ----------------------------------------------------------------------------

/// Execution time above which an operation is flagged slow (milliseconds)
pub const DEFAULT_SLOW_THRESHOLD_MS: f64 = 1_000.0;

/// Execution time above which an operation becomes an optimization candidate
pub const DEFAULT_OPTIMIZATION_TIME_MS: f64 = 500.0;

/// Fraction of operations whose raw text is captured in the record
pub const DEFAULT_SAMPLING_RATE: f64 = 0.1;

// ----------------------------------------------------------------------------
// Buffer & Batch Sizes
// ----------------------------------------------------------------------------

/// Maximum records held in the metrics buffer before drop-oldest kicks in
pub const DEFAULT_BUFFER_CAPACITY: usize = 50_000;

/// Records drained per flush cycle
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Maximum tracked query fingerprints in the rolling aggregate map
pub const FINGERPRINT_MAP_MAX: usize = 4_096;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default interval between persister flush cycles
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;

/// Default interval between snapshot collection cycles
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 30;

/// Smallest flush/snapshot interval accepted by validation
pub const MIN_INTERVAL_SECS: u64 = 1;

/// Bounded grace period for the final shutdown flush
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

// ----------------------------------------------------------------------------
// Retention Windows
// ----------------------------------------------------------------------------

/// Snapshot history retention (7 days)
pub const DEFAULT_SNAPSHOT_RETENTION_SECS: u64 = 7 * 24 * 3_600;

/// Hard cap on in-memory snapshot history entries (7 days at 30s cadence)
pub const DEFAULT_SNAPSHOT_HISTORY_MAX: usize = 20_160;

/// Alert log retention (trailing 24 hours)
pub const DEFAULT_ALERT_RETENTION_SECS: u64 = 24 * 3_600;

/// Hard cap on alert log entries
pub const DEFAULT_ALERT_LOG_MAX: usize = 10_000;

/// TTL applied to keyed cache/custom metric writes
pub const DEFAULT_CACHE_METRIC_TTL_SECS: u64 = 3_600;

/// Trailing window for the slow-operation report
pub const DEFAULT_SLOW_OPS_WINDOW_SECS: u64 = 24 * 3_600;

// ----------------------------------------------------------------------------
// Alert Thresholds
// ----------------------------------------------------------------------------

/// CPU usage percentage above which an alert is raised
pub const DEFAULT_CPU_ALERT_PCT: f64 = 80.0;

/// System memory usage percentage above which an alert is raised
pub const DEFAULT_MEMORY_ALERT_PCT: f64 = 85.0;

/// Cache hit rate percentage below which an alert is raised
pub const DEFAULT_CACHE_HIT_FLOOR_PCT: f64 = 70.0;

/// Operation execution time above which a slow-operation alert is raised
pub const DEFAULT_OPERATION_TIME_ALERT_MS: f64 = 1_000.0;

/// Overage (percentage points) that upgrades a resource alert to critical
pub const CRITICAL_OVERAGE_MARGIN_PCT: f64 = 10.0;

/// Multiple of the slow threshold that upgrades a slow-op alert to critical
pub const CRITICAL_SLOW_MULTIPLIER: f64 = 2.0;

// ----------------------------------------------------------------------------
// Persistence Schema
// ----------------------------------------------------------------------------

/// Version of the flattened snapshot row mapping written to the sink
pub const SNAPSHOT_SCHEMA_VERSION: u16 = 1;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The record types that flow through the engine. Records are immutable once
// built: ownership moves from interceptor/collector to the buffer and on to
// the persister. Everything serializes so sinks can encode as they see fit.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Operation Classification Enums
// ----------------------------------------------------------------------------

/// Relational operation type, derived from the leading keyword of the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Select,
    Insert,
    Update,
    Delete,
    SchemaChange,
    Other,
}

impl OperationType {
    /// Stable string form used in messages and sink rows.
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationType::Select => "select",
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::SchemaChange => "schema_change",
            OperationType::Other => "other",
        }
    }
}

impl Display for OperationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity. Ordering matters: `Critical > Warning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Critical => f.write_str("critical"),
        }
    }
}

/// The metric dimension an alert was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CpuHigh,
    MemoryHigh,
    CacheHitLow,
    SlowOperation,
    Custom,
}

impl AlertKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AlertKind::CpuHigh => "cpu_high",
            AlertKind::MemoryHigh => "memory_high",
            AlertKind::CacheHitLow => "cache_hit_low",
            AlertKind::SlowOperation => "slow_operation",
            AlertKind::Custom => "custom",
        }
    }
}

impl Display for AlertKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Query Execution Record
// ----------------------------------------------------------------------------

/// One timed, classified relational operation. Exactly one of these is
/// produced per completed wrapped call, whether it succeeded or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryExecutionRecord {
    /// Unique id for this execution
    pub operation_id: Uuid,
    /// xxh3 hash of the raw text, for exact-duplicate detection
    pub content_hash: CompactString,
    /// Classified operation type
    pub operation_type: OperationType,
    /// Raw text, present only when this execution was sampled
    pub raw_text: Option<CompactString>,
    /// Placeholder-normalized, whitespace-collapsed shape of the text
    pub normalized_text: CompactString,
    /// Wall time of the underlying call in milliseconds
    pub execution_time_ms: f64,
    /// Rows touched (0 when the call failed)
    pub rows_affected: u64,
    /// Whether the underlying call returned an error
    pub has_error: bool,
    /// Error message of the underlying call, if any
    pub error_message: Option<String>,
    /// `execution_time_ms > slow_threshold_ms` (strictly greater)
    pub is_slow: bool,
    /// Flagged for optimization by timing or by pattern
    pub is_optimization_candidate: bool,
    /// When the record was built
    pub observed_at: DateTime<Utc>,
}

// ----------------------------------------------------------------------------
// 3.3 Cache Command Record
// ----------------------------------------------------------------------------

/// One timed cache command. Same one-record-per-call invariant as queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheCommandRecord {
    /// Command name ("get", "set", "del", ...)
    pub command: CompactString,
    /// Wall time of the underlying call in milliseconds
    pub execution_time_ms: f64,
    /// Whether the underlying call returned an error
    pub has_error: bool,
    /// Error message of the underlying call, if any
    pub error_message: Option<String>,
    /// When the record was built
    pub observed_at: DateTime<Utc>,
}

// ----------------------------------------------------------------------------
// 3.4 Custom Metric Record
// ----------------------------------------------------------------------------

/// An application-defined sample recorded through `record_custom_metric`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomMetricRecord {
    /// Metric name
    pub name: CompactString,
    /// Sample value
    pub value: f64,
    /// Dimensional tags
    pub tags: SmallVec<[(CompactString, CompactString); 4]>,
    /// When the sample was recorded
    pub observed_at: DateTime<Utc>,
}

// ----------------------------------------------------------------------------
// 3.5 System Snapshot Sections
// ----------------------------------------------------------------------------

/// CPU figures for one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSection {
    /// Aggregate CPU usage percentage
    pub usage_pct: f64,
    /// 1/5/15 minute load averages
    pub load_avg: [f64; 3],
    /// Logical core count
    pub cores: usize,
}

/// Memory figures for one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    /// Resident set size of this process in bytes
    pub process_rss_bytes: u64,
    /// Virtual memory size of this process in bytes
    pub process_virtual_bytes: u64,
    /// System-wide used memory percentage
    pub system_used_pct: f64,
}

/// Disk figures for one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSection {
    /// Aggregate usage percentage across real block devices
    pub usage_pct: f64,
    /// Total capacity in bytes
    pub total_bytes: u64,
}

/// Network figures for one snapshot (cumulative interface counters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Total bytes received across interfaces
    pub bytes_in: u64,
    /// Total bytes transmitted across interfaces
    pub bytes_out: u64,
}

/// Session-level counters read from the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSessionStats {
    /// Currently active sessions
    pub active_sessions: u32,
    /// Buffer-cache block hits
    pub blocks_hit: u64,
    /// Blocks read from storage
    pub blocks_read: u64,
}

impl StoreSessionStats {
    /// Buffer-cache hit ratio as a percentage. 0 when nothing was read.
    pub fn cache_hit_ratio_pct(&self) -> f64 {
        hit_rate_pct(self.blocks_hit, self.blocks_read)
    }
}

/// Typed status report parsed from the cache server's `info()` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheServerStats {
    /// Connected client count
    pub connected_clients: u64,
    /// Server memory usage in bytes
    pub used_memory_bytes: u64,
    /// Cumulative keyspace hits
    pub keyspace_hits: u64,
    /// Cumulative keyspace misses
    pub keyspace_misses: u64,
    /// Cumulative commands processed
    pub total_commands: u64,
    /// Server uptime in seconds
    pub uptime_secs: u64,
}

impl CacheServerStats {
    /// Hit rate as a percentage. 0 when there were no lookups at all.
    pub fn hit_rate_pct(&self) -> f64 {
        hit_rate_pct(self.keyspace_hits, self.keyspace_misses)
    }

    /// Whether the server has seen any lookups yet.
    pub fn has_lookups(&self) -> bool {
        self.keyspace_hits + self.keyspace_misses > 0
    }
}

/// Percentage of `hits` over `hits + others`. 0 when both are zero.
pub fn hit_rate_pct(hits: u64, others: u64) -> f64 {
    let total = hits + others;
    if total == 0 {
        return 0.0;
    }
    (hits as f64 / total as f64) * 100.0
}

/// Application-level rolling counters maintained by the engine itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppStats {
    /// Seconds since the engine was created
    pub uptime_secs: u64,
    /// Instrumented operations observed (queries + cache commands)
    pub total_ops: u64,
    /// Operations that exceeded the slow threshold
    pub slow_ops: u64,
    /// Operations whose underlying call failed
    pub error_ops: u64,
    /// Running mean operation time in milliseconds
    pub avg_op_time_ms: f64,
}

// ----------------------------------------------------------------------------
// 3.6 System Snapshot
// ----------------------------------------------------------------------------

/// One time-stamped capture of system, store, and cache health indicators.
///
/// Sections are `Option` because a failed sub-gatherer omits its section
/// without aborting the collection cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// When this snapshot was assembled
    pub captured_at: DateTime<Utc>,
    /// CPU usage, load, core count
    pub cpu: Option<CpuSection>,
    /// Process and system memory
    pub memory: Option<MemorySection>,
    /// Disk usage
    pub disk: Option<DiskSection>,
    /// Network counters
    pub network: Option<NetworkSection>,
    /// Relational store session counters
    pub store: Option<StoreSessionStats>,
    /// Cache server status
    pub cache: Option<CacheServerStats>,
    /// Engine-level rolling counters
    pub app: AppStats,
}

impl SystemSnapshot {
    /// Flatten into the versioned row shape written to the durable sink.
    ///
    /// This mapping is explicit and versioned (`SNAPSHOT_SCHEMA_VERSION`):
    /// adding a field means adding a column here and bumping the version.
    pub fn to_row(&self) -> SnapshotRow {
        SnapshotRow {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            captured_at: self.captured_at,
            cpu_usage_pct: self.cpu.as_ref().map(|c| c.usage_pct),
            load_avg_1m: self.cpu.as_ref().map(|c| c.load_avg[0]),
            load_avg_5m: self.cpu.as_ref().map(|c| c.load_avg[1]),
            load_avg_15m: self.cpu.as_ref().map(|c| c.load_avg[2]),
            cpu_cores: self.cpu.as_ref().map(|c| c.cores as u32),
            process_rss_bytes: self.memory.as_ref().map(|m| m.process_rss_bytes),
            process_virtual_bytes: self.memory.as_ref().map(|m| m.process_virtual_bytes),
            memory_used_pct: self.memory.as_ref().map(|m| m.system_used_pct),
            disk_usage_pct: self.disk.as_ref().map(|d| d.usage_pct),
            net_bytes_in: self.network.as_ref().map(|n| n.bytes_in),
            net_bytes_out: self.network.as_ref().map(|n| n.bytes_out),
            store_active_sessions: self.store.as_ref().map(|s| s.active_sessions),
            store_cache_hit_ratio_pct: self.store.as_ref().map(|s| s.cache_hit_ratio_pct()),
            cache_connected_clients: self.cache.as_ref().map(|c| c.connected_clients),
            cache_hit_rate_pct: self.cache.as_ref().map(|c| c.hit_rate_pct()),
            cache_used_memory_bytes: self.cache.as_ref().map(|c| c.used_memory_bytes),
            app_uptime_secs: self.app.uptime_secs,
            app_total_ops: self.app.total_ops,
            app_slow_ops: self.app.slow_ops,
            app_error_ops: self.app.error_ops,
            app_avg_op_time_ms: self.app.avg_op_time_ms,
        }
    }
}

/// Flattened, versioned snapshot row for batch insertion into the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub schema_version: u16,
    pub captured_at: DateTime<Utc>,
    pub cpu_usage_pct: Option<f64>,
    pub load_avg_1m: Option<f64>,
    pub load_avg_5m: Option<f64>,
    pub load_avg_15m: Option<f64>,
    pub cpu_cores: Option<u32>,
    pub process_rss_bytes: Option<u64>,
    pub process_virtual_bytes: Option<u64>,
    pub memory_used_pct: Option<f64>,
    pub disk_usage_pct: Option<f64>,
    pub net_bytes_in: Option<u64>,
    pub net_bytes_out: Option<u64>,
    pub store_active_sessions: Option<u32>,
    pub store_cache_hit_ratio_pct: Option<f64>,
    pub cache_connected_clients: Option<u64>,
    pub cache_hit_rate_pct: Option<f64>,
    pub cache_used_memory_bytes: Option<u64>,
    pub app_uptime_secs: u64,
    pub app_total_ops: u64,
    pub app_slow_ops: u64,
    pub app_error_ops: u64,
    pub app_avg_op_time_ms: f64,
}

// ----------------------------------------------------------------------------
// 3.7 Alert
// ----------------------------------------------------------------------------

/// A threshold breach, published to subscribers and appended to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert id
    pub id: Uuid,
    /// Breached dimension
    pub kind: AlertKind,
    /// Alert severity
    pub severity: Severity,
    /// Human-readable description
    pub message: CompactString,
    /// The configured threshold that was crossed
    pub threshold: f64,
    /// The observed value that crossed it
    pub observed_value: f64,
    /// When the alert was raised
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    /// Create a new alert.
    pub fn new(kind: AlertKind, severity: Severity, message: impl Into<CompactString>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            message: message.into(),
            threshold: 0.0,
            observed_value: 0.0,
            raised_at: Utc::now(),
        }
    }

    /// Set the breached threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the observed value.
    pub fn with_observed(mut self, observed: f64) -> Self {
        self.observed_value = observed;
        self
    }

    /// Check if this is a critical alert.
    pub fn is_critical(&self) -> bool {
        self.severity >= Severity::Critical
    }
}

// ----------------------------------------------------------------------------
// 3.8 Metric Record Envelope
// ----------------------------------------------------------------------------

/// Provenance kind of a buffered record, used to route persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Query,
    Cache,
    Snapshot,
    Custom,
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Query => f.write_str("query"),
            MetricKind::Cache => f.write_str("cache"),
            MetricKind::Snapshot => f.write_str("snapshot"),
            MetricKind::Custom => f.write_str("custom"),
        }
    }
}

/// The envelope that moves through the buffer. The variant is the provenance
/// kind; the payload is owned and immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricRecord {
    Query(QueryExecutionRecord),
    Cache(CacheCommandRecord),
    Snapshot(SystemSnapshot),
    Custom(CustomMetricRecord),
}

impl MetricRecord {
    /// Provenance kind for persistence routing.
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricRecord::Query(_) => MetricKind::Query,
            MetricRecord::Cache(_) => MetricKind::Cache,
            MetricRecord::Snapshot(_) => MetricKind::Snapshot,
            MetricRecord::Custom(_) => MetricKind::Custom,
        }
    }

    /// When the wrapped payload was captured.
    pub fn captured_at(&self) -> DateTime<Utc> {
        match self {
            MetricRecord::Query(r) => r.observed_at,
            MetricRecord::Cache(r) => r.observed_at,
            MetricRecord::Snapshot(s) => s.captured_at,
            MetricRecord::Custom(r) => r.observed_at,
        }
    }
}

// ----------------------------------------------------------------------------
// 3.9 Store Call Results
// ----------------------------------------------------------------------------

/// Result shape of a relational `execute` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOutcome {
    /// Result rows, as loosely-typed JSON objects
    pub rows: Vec<JsonValue>,
    /// Rows returned or affected
    pub row_count: u64,
}

impl QueryOutcome {
    /// Outcome with a row count and no row payloads.
    pub fn with_count(row_count: u64) -> Self {
        Self { rows: Vec::new(), row_count }
    }
}

// ----------------------------------------------------------------------------
// 3.10 Reporting Types
// ----------------------------------------------------------------------------

/// Aggregated group of slow operations sharing a normalized fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowOperationGroup {
    /// Normalized query shape
    pub normalized_text: CompactString,
    /// Occurrences in the window
    pub count: u64,
    /// Mean execution time in milliseconds
    pub mean_time_ms: f64,
    /// Worst execution time in milliseconds
    pub max_time_ms: f64,
    /// A sampled raw text, when any execution in the group captured one
    pub sample_text: Option<CompactString>,
}

/// One hourly bucket of the trend report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendBucket {
    /// Start of the hour this bucket covers
    pub bucket_start: DateTime<Utc>,
    /// Operations observed in the hour
    pub count: u64,
    /// Mean execution time in milliseconds
    pub mean_time_ms: f64,
    /// Slow operations in the hour
    pub slow_count: u64,
    /// Failed operations in the hour
    pub error_count: u64,
}

/// Overall engine health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Combined health view: latest snapshot, recent alerts, rolling counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    /// Overall classification derived from recent alerts
    pub status: HealthStatus,
    /// When this summary was generated
    pub generated_at: DateTime<Utc>,
    /// Most recent snapshot, if any cycle has completed
    pub snapshot: Option<SystemSnapshot>,
    /// Alerts raised in the last hour
    pub recent_alerts: Vec<Alert>,
    /// Engine-level rolling counters
    pub app: AppStats,
    /// Buffer occupancy and drop counters
    pub buffer: BufferStats,
}

/// Observability counters for the metrics buffer itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferStats {
    /// Records currently buffered
    pub len: usize,
    /// Total records accepted
    pub pushed: u64,
    /// Total records drained by the persister
    pub drained: u64,
    /// Records evicted by the overflow policy
    pub dropped: u64,
    /// Records re-inserted after persistence failures
    pub requeued: u64,
}

/// Result of one flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOutcome {
    /// Records taken from the buffer this cycle
    pub drained: usize,
    /// Records accepted by the sink
    pub persisted: usize,
    /// Records returned to the buffer after a partition failure
    pub requeued: usize,
}

impl FlushOutcome {
    /// Fold another cycle's outcome into this one.
    pub fn absorb(&mut self, other: &FlushOutcome) {
        self.drained += other.drained;
        self.persisted += other.persisted;
        self.requeued += other.requeued;
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem, rolled up into `VigilError`. Instrumented
// call failures (`StoreError`/`CacheError`) always propagate to the caller
// untouched; everything else stays inside the engine's own tasks.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Engine Error
// ----------------------------------------------------------------------------

/// The main error type for the Vigil engine.
#[derive(Error, Debug)]
pub enum VigilError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Instrumented Store Errors ----
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // ---- Instrumented Cache Errors ----
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    // ---- Persistence Errors ----
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    // ---- Collection Errors ----
    #[error("Collection error: {0}")]
    Collect(#[from] CollectError),

    // ---- Lifecycle Errors ----
    #[error("Client is already instrumented: {0}")]
    AlreadyInstrumented(String),

    #[error("Monitor already holds instrumented clients")]
    AlreadyInitialized,

    #[error("Shutdown in progress")]
    ShuttingDown,

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VigilError {
    /// Check if this error is recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            VigilError::Config(_) => false,
            VigilError::Store(e) => e.is_recoverable(),
            VigilError::Cache(e) => e.is_recoverable(),
            VigilError::Sink(e) => e.is_recoverable(),
            VigilError::Collect(_) => true,
            VigilError::AlreadyInstrumented(_) => false,
            VigilError::AlreadyInitialized => false,
            VigilError::ShuttingDown => false,
            VigilError::Internal(_) => false,
        }
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            VigilError::Config(_) => "config",
            VigilError::Store(_) => "store",
            VigilError::Cache(_) => "cache",
            VigilError::Sink(_) => "sink",
            VigilError::Collect(_) => "collect",
            VigilError::AlreadyInstrumented(_) => "lifecycle",
            VigilError::AlreadyInitialized => "lifecycle",
            VigilError::ShuttingDown => "shutdown",
            VigilError::Internal(_) => "internal",
        }
    }
}

/// Convenient result alias for engine operations.
pub type VigilResult<T> = Result<T, VigilError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid inefficiency pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Relational Store Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the relational store client. The interceptor forwards
/// these to the caller exactly as received and only annotates the record.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::Connection { .. } => true,
            StoreError::Query { .. } => false,
            StoreError::Timeout { .. } => true,
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        StoreError::Query { message: message.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Cache Store Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the cache client. Forwarded untouched, like store
/// errors.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl CacheError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CacheError::Command { .. })
    }

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Sink Errors
// ----------------------------------------------------------------------------

/// Errors from the durable metric sink. A failed batch is requeued; the
/// engine never loses records over a sink error (up to buffer capacity).
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink unavailable: {message}")]
    Unavailable { message: String },

    #[error("Write rejected: {message}")]
    Rejected { message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },
}

impl SinkError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SinkError::Serialization { .. })
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        SinkError::Unavailable { message: message.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Collection Errors
// ----------------------------------------------------------------------------

/// Errors from snapshot sub-gatherers. Always isolated: the failed section
/// is omitted from the snapshot and the cycle continues.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("System probe failed: {message}")]
    Probe { message: String },

    #[error("Store statistics unavailable: {message}")]
    StoreStats { message: String },

    #[error("Cache status unavailable: {message}")]
    CacheStatus { message: String },

    #[error("Malformed cache status report")]
    MalformedReport,
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (VIGIL_ prefix, __ as separator)
// - Validation
// - Sensible defaults for every knob
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the entire monitoring engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Classification thresholds and sampling
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Metrics buffer sizing
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Batch persister cadence and sizing
    #[serde(default)]
    pub persister: PersisterConfig,

    /// Snapshot collector cadence and retention
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Alert thresholds and log retention
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Reporting windows
    #[serde(default)]
    pub reporting: ReportingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            engine: GeneralConfig::default(),
            classifier: ClassifierConfig::default(),
            buffer: BufferConfig::default(),
            persister: PersisterConfig::default(),
            collector: CollectorConfig::default(),
            alerts: AlertConfig::default(),
            reporting: ReportingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from file with environment overrides.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VIGIL_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string (for testing).
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.classifier.slow_threshold_ms <= 0.0 {
            return Err(ConfigError::invalid_value(
                "classifier.slow_threshold_ms",
                "slow threshold must be positive",
            ));
        }

        if !(0.0..=1.0).contains(&self.classifier.sampling_rate) {
            return Err(ConfigError::invalid_value(
                "classifier.sampling_rate",
                "sampling rate must be within [0.0, 1.0]",
            ));
        }

        if self.buffer.capacity == 0 {
            return Err(ConfigError::invalid_value(
                "buffer.capacity",
                "buffer capacity must be at least 1",
            ));
        }

        if self.persister.batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "persister.batch_size",
                "batch size must be at least 1",
            ));
        }

        if self.persister.flush_interval < Duration::from_secs(MIN_INTERVAL_SECS) {
            return Err(ConfigError::invalid_value(
                "persister.flush_interval",
                format!("flush interval must be at least {}s", MIN_INTERVAL_SECS),
            ));
        }

        if self.collector.snapshot_interval < Duration::from_secs(MIN_INTERVAL_SECS) {
            return Err(ConfigError::invalid_value(
                "collector.snapshot_interval",
                format!("snapshot interval must be at least {}s", MIN_INTERVAL_SECS),
            ));
        }

        for pct_field in [
            ("alerts.thresholds.cpu_pct", self.alerts.thresholds.cpu_pct),
            ("alerts.thresholds.memory_pct", self.alerts.thresholds.memory_pct),
            ("alerts.thresholds.cache_hit_floor_pct", self.alerts.thresholds.cache_hit_floor_pct),
        ] {
            if !(0.0..=100.0).contains(&pct_field.1) {
                return Err(ConfigError::invalid_value(
                    pct_field.0,
                    "percentage threshold must be within [0, 100]",
                ));
            }
        }

        // Surface bad marker regexes at validation time, not on first use.
        if let Err(e) = RegexSet::new(&self.classifier.inefficiency_patterns) {
            return Err(ConfigError::InvalidPattern {
                pattern: "<inefficiency_patterns>".into(),
                message: e.to_string(),
            });
        }

        Ok(())
    }

    /// Render a default config file.
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// General engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Environment name (prod, staging, dev)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Bounded grace period for the final shutdown flush
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            environment: default_environment(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    ENGINE_NAME.into()
}

fn default_environment() -> String {
    "production".into()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Classifier Configuration
// ----------------------------------------------------------------------------

/// Thresholds, sampling rate, and the inefficiency marker set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Execution time above which an operation is flagged slow (ms)
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: f64,

    /// Execution time above which an operation becomes an optimization
    /// candidate regardless of its text (ms)
    #[serde(default = "default_optimization_time_ms")]
    pub optimization_time_ms: f64,

    /// Fraction of operations whose raw text is captured
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// Case-insensitive regex markers for inefficient query shapes
    #[serde(default = "default_inefficiency_patterns")]
    pub inefficiency_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: default_slow_threshold_ms(),
            optimization_time_ms: default_optimization_time_ms(),
            sampling_rate: default_sampling_rate(),
            inefficiency_patterns: default_inefficiency_patterns(),
        }
    }
}

fn default_slow_threshold_ms() -> f64 {
    DEFAULT_SLOW_THRESHOLD_MS
}

fn default_optimization_time_ms() -> f64 {
    DEFAULT_OPTIMIZATION_TIME_MS
}

fn default_sampling_rate() -> f64 {
    DEFAULT_SAMPLING_RATE
}

/// Default inefficiency markers: unbounded wildcard selects, negative
/// membership tests, leading-wildcard pattern matches, randomized ordering,
/// unindexed distinct scans.
fn default_inefficiency_patterns() -> Vec<String> {
    vec![
        r"(?i)^\s*select\s+\*\s+from\s+\S+\s*;?\s*$".into(),
        r"(?i)\bnot\s+in\s*\(".into(),
        r"(?i)\blike\s+'%".into(),
        r"(?i)\border\s+by\s+(random|rand)\s*\(".into(),
        r"(?i)\bselect\s+distinct\b".into(),
    ]
}

// ----------------------------------------------------------------------------
// 5.4 Buffer Configuration
// ----------------------------------------------------------------------------

/// Metrics buffer sizing and overflow policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum buffered records. Overflow evicts the oldest entry and
    /// increments the dropped counter.
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { capacity: default_buffer_capacity() }
    }
}

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

// ----------------------------------------------------------------------------
// 5.5 Persister Configuration
// ----------------------------------------------------------------------------

/// Batch persister cadence and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersisterConfig {
    /// Records drained per flush cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Interval between flush cycles
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,

    /// TTL for keyed cache/custom metric writes
    #[serde(with = "humantime_serde", default = "default_cache_metric_ttl")]
    pub cache_metric_ttl: Duration,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            cache_metric_ttl: default_cache_metric_ttl(),
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS)
}

fn default_cache_metric_ttl() -> Duration {
    Duration::from_secs(DEFAULT_CACHE_METRIC_TTL_SECS)
}

// ----------------------------------------------------------------------------
// 5.6 Collector Configuration
// ----------------------------------------------------------------------------

/// Snapshot collector cadence and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Interval between snapshot cycles
    #[serde(with = "humantime_serde", default = "default_snapshot_interval")]
    pub snapshot_interval: Duration,

    /// How long snapshots stay in the in-memory history
    #[serde(with = "humantime_serde", default = "default_snapshot_retention")]
    pub snapshot_retention: Duration,

    /// Hard cap on in-memory snapshot history entries
    #[serde(default = "default_snapshot_history_max")]
    pub snapshot_history_max: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: default_snapshot_interval(),
            snapshot_retention: default_snapshot_retention(),
            snapshot_history_max: default_snapshot_history_max(),
        }
    }
}

fn default_snapshot_interval() -> Duration {
    Duration::from_secs(DEFAULT_SNAPSHOT_INTERVAL_SECS)
}

fn default_snapshot_retention() -> Duration {
    Duration::from_secs(DEFAULT_SNAPSHOT_RETENTION_SECS)
}

fn default_snapshot_history_max() -> usize {
    DEFAULT_SNAPSHOT_HISTORY_MAX
}

// ----------------------------------------------------------------------------
// 5.7 Alert Configuration
// ----------------------------------------------------------------------------

/// Per-dimension thresholds. Crossings are strict: an observation exactly at
/// the threshold is safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// CPU usage percentage ceiling
    #[serde(default = "default_cpu_alert_pct")]
    pub cpu_pct: f64,

    /// System memory usage percentage ceiling
    #[serde(default = "default_memory_alert_pct")]
    pub memory_pct: f64,

    /// Cache hit rate percentage floor
    #[serde(default = "default_cache_hit_floor_pct")]
    pub cache_hit_floor_pct: f64,

    /// Operation execution time ceiling (ms)
    #[serde(default = "default_operation_time_alert_ms")]
    pub operation_time_ms: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_pct: default_cpu_alert_pct(),
            memory_pct: default_memory_alert_pct(),
            cache_hit_floor_pct: default_cache_hit_floor_pct(),
            operation_time_ms: default_operation_time_alert_ms(),
        }
    }
}

fn default_cpu_alert_pct() -> f64 {
    DEFAULT_CPU_ALERT_PCT
}

fn default_memory_alert_pct() -> f64 {
    DEFAULT_MEMORY_ALERT_PCT
}

fn default_cache_hit_floor_pct() -> f64 {
    DEFAULT_CACHE_HIT_FLOOR_PCT
}

fn default_operation_time_alert_ms() -> f64 {
    DEFAULT_OPERATION_TIME_ALERT_MS
}

/// Alert engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Per-dimension thresholds
    #[serde(default)]
    pub thresholds: AlertThresholds,

    /// Trailing window over which raised alerts are retained
    #[serde(with = "humantime_serde", default = "default_alert_retention")]
    pub alert_retention: Duration,

    /// Hard cap on alert log entries
    #[serde(default = "default_alert_log_max")]
    pub alert_log_max: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            thresholds: AlertThresholds::default(),
            alert_retention: default_alert_retention(),
            alert_log_max: default_alert_log_max(),
        }
    }
}

fn default_alert_retention() -> Duration {
    Duration::from_secs(DEFAULT_ALERT_RETENTION_SECS)
}

fn default_alert_log_max() -> usize {
    DEFAULT_ALERT_LOG_MAX
}

// ----------------------------------------------------------------------------
// 5.8 Reporting Configuration
// ----------------------------------------------------------------------------

/// Reporting windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Trailing window for the slow-operation report
    #[serde(with = "humantime_serde", default = "default_slow_ops_window")]
    pub slow_ops_window: Duration,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self { slow_ops_window: default_slow_ops_window() }
    }
}

fn default_slow_ops_window() -> Duration {
    Duration::from_secs(DEFAULT_SLOW_OPS_WINDOW_SECS)
}

// ----------------------------------------------------------------------------
// 5.9 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// ANSI colors for terminal output
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include file/line in log events
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`, initialized once from
// `LoggingConfig`. Format choices mirror what operators expect: pretty for
// terminals, compact for service logs, json for shippers.
// ============================================================================

/// Initialize the logging system based on configuration.
pub fn init_logging(config: &LoggingConfig) -> VigilResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| VigilError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| VigilError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| VigilError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    Ok(())
}

// ============================================================================
// SECTION 7: QUERY CLASSIFIER
// ============================================================================
// Pure, deterministic classification of relational operations: type from the
// leading keyword, a placeholder-normalized shape for grouping, an xxh3
// content hash for exact-duplicate detection, and the optimization-candidate
// decision from timing and the configured marker set.
// ============================================================================

/// Positional parameter placeholders (`$1`, `$23`) in query text.
static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\d+").expect("placeholder regex is valid"));

// ----------------------------------------------------------------------------
// 7.1 Pure Classification Functions
// ----------------------------------------------------------------------------

/// Map the leading keyword of `text` to an operation type.
/// Case-insensitive; unrecognized keywords map to `Other`.
pub fn classify_operation(text: &str) -> OperationType {
    let keyword = text.trim_start().split_whitespace().next().unwrap_or("");
    match keyword.to_ascii_uppercase().as_str() {
        "SELECT" => OperationType::Select,
        "INSERT" => OperationType::Insert,
        "UPDATE" => OperationType::Update,
        "DELETE" => OperationType::Delete,
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => OperationType::SchemaChange,
        _ => OperationType::Other,
    }
}

/// Produce a stable shape fingerprint: positional placeholders become a
/// single `?` wildcard and whitespace collapses to single spaces.
pub fn normalize_query(text: &str) -> CompactString {
    let replaced = PLACEHOLDER_RE.replace_all(text, "?");
    let mut out = CompactString::default();
    for (i, token) in replaced.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(token);
    }
    out
}

/// xxh3-64 content hash of the raw text, rendered as 16 hex digits.
pub fn content_hash(text: &str) -> CompactString {
    CompactString::from(format!("{:016x}", xxh3_64(text.as_bytes())))
}

/// Numeric fingerprint of a normalized shape, for aggregate map keys.
pub fn fingerprint_key(normalized: &str) -> u64 {
    xxh3_64(normalized.as_bytes())
}

// ----------------------------------------------------------------------------
// 7.2 Classifier
// ----------------------------------------------------------------------------

/// Compiled classifier: thresholds, sampling rate, and the marker set.
/// Built once from `ClassifierConfig`; all methods are pure.
#[derive(Debug)]
pub struct QueryClassifier {
    slow_threshold_ms: f64,
    optimization_time_ms: f64,
    sampling_rate: f64,
    markers: RegexSet,
}

impl QueryClassifier {
    /// Compile a classifier from configuration.
    pub fn new(config: &ClassifierConfig) -> Result<Self, ConfigError> {
        let markers = RegexSet::new(&config.inefficiency_patterns).map_err(|e| {
            ConfigError::InvalidPattern {
                pattern: "<inefficiency_patterns>".into(),
                message: e.to_string(),
            }
        })?;

        Ok(Self {
            slow_threshold_ms: config.slow_threshold_ms,
            optimization_time_ms: config.optimization_time_ms,
            sampling_rate: config.sampling_rate,
            markers,
        })
    }

    /// The configured slow threshold in milliseconds.
    pub fn slow_threshold_ms(&self) -> f64 {
        self.slow_threshold_ms
    }

    /// `true` when the execution time is strictly above the slow threshold.
    pub fn is_slow(&self, execution_time_ms: f64) -> bool {
        execution_time_ms > self.slow_threshold_ms
    }

    /// `true` when the operation is a target for optimization: strictly over
    /// the timing threshold, or its text matches any configured marker.
    pub fn is_optimization_candidate(&self, text: &str, execution_time_ms: f64) -> bool {
        execution_time_ms > self.optimization_time_ms || self.markers.is_match(text)
    }

    /// Deterministic hash-based sampling decision for raw-text capture.
    pub fn should_sample(&self, operation_id: Uuid) -> bool {
        if self.sampling_rate <= 0.0 {
            return false;
        }
        if self.sampling_rate >= 1.0 {
            return true;
        }
        let bucket = xxh3_64(operation_id.as_bytes()) & 0xFFFF;
        (bucket as f64 / 65_536.0) < self.sampling_rate
    }

    /// Build a complete execution record for one wrapped call.
    pub fn build_query_record(
        &self,
        operation_id: Uuid,
        text: &str,
        execution_time_ms: f64,
        rows_affected: u64,
        has_error: bool,
        error_message: Option<String>,
    ) -> QueryExecutionRecord {
        QueryExecutionRecord {
            operation_id,
            content_hash: content_hash(text),
            operation_type: classify_operation(text),
            raw_text: if self.should_sample(operation_id) {
                Some(CompactString::from(text))
            } else {
                None
            },
            normalized_text: normalize_query(text),
            execution_time_ms,
            rows_affected,
            has_error,
            error_message,
            is_slow: self.is_slow(execution_time_ms),
            is_optimization_candidate: self.is_optimization_candidate(text, execution_time_ms),
            observed_at: Utc::now(),
        }
    }
}

// ============================================================================
// SECTION 8: PHASE 1 TESTS
// ============================================================================

#[cfg(test)]
mod phase1_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn classifier() -> QueryClassifier {
        QueryClassifier::new(&ClassifierConfig::default()).unwrap()
    }

    #[rstest]
    #[case("SELECT id FROM users", OperationType::Select)]
    #[case("  select 1", OperationType::Select)]
    #[case("INSERT INTO t VALUES ($1)", OperationType::Insert)]
    #[case("update t set a = 1", OperationType::Update)]
    #[case("DELETE FROM t", OperationType::Delete)]
    #[case("CREATE TABLE t (id int)", OperationType::SchemaChange)]
    #[case("ALTER TABLE t ADD c int", OperationType::SchemaChange)]
    #[case("drop table t", OperationType::SchemaChange)]
    #[case("TRUNCATE t", OperationType::SchemaChange)]
    #[case("EXPLAIN SELECT 1", OperationType::Other)]
    #[case("", OperationType::Other)]
    fn classify_leading_keyword(#[case] text: &str, #[case] expected: OperationType) {
        assert_eq!(classify_operation(text), expected);
    }

    #[test]
    fn normalize_replaces_placeholders_and_collapses_whitespace() {
        let normalized = normalize_query("SELECT  *\n FROM users\tWHERE id = $1 AND age > $23");
        assert_eq!(normalized, "SELECT * FROM users WHERE id = ? AND age > ?");
    }

    #[test]
    fn normalize_is_stable_across_spacing_variants() {
        let a = normalize_query("SELECT * FROM t WHERE id = $1");
        let b = normalize_query("SELECT   *  FROM t\n  WHERE id = $2");
        assert_eq!(a, b);
    }

    #[test]
    fn content_hash_is_deterministic_and_distinguishes_text() {
        assert_eq!(content_hash("SELECT 1"), content_hash("SELECT 1"));
        assert_ne!(content_hash("SELECT 1"), content_hash("SELECT 2"));
        assert_eq!(content_hash("SELECT 1").len(), 16);
    }

    #[rstest]
    #[case(999.0, false)]
    #[case(1_000.0, false)] // boundary: exactly at threshold is not slow
    #[case(1_000.1, true)]
    #[case(2_500.0, true)]
    fn slow_flag_uses_strict_inequality(#[case] time_ms: f64, #[case] expected: bool) {
        assert_eq!(classifier().is_slow(time_ms), expected);
    }

    #[rstest]
    // Timing rule alone, regardless of text.
    #[case("SELECT id FROM t WHERE id = $1", 600.0, true)]
    #[case("SELECT id FROM t WHERE id = $1", 500.0, false)] // boundary
    // Pattern rules alone, regardless of timing.
    #[case("SELECT * FROM users", 1.0, true)]
    #[case("SELECT id FROM t WHERE x NOT IN (1, 2)", 1.0, true)]
    #[case("SELECT id FROM users WHERE name LIKE '%smith'", 1.0, true)]
    #[case("SELECT id FROM t ORDER BY RANDOM()", 1.0, true)]
    #[case("SELECT DISTINCT city FROM users", 1.0, true)]
    // Bounded select-star is not the unbounded marker.
    #[case("SELECT * FROM users WHERE id = $1", 1.0, false)]
    #[case("SELECT id FROM t WHERE id = $1", 1.0, false)]
    fn optimization_candidate_rules(
        #[case] text: &str,
        #[case] time_ms: f64,
        #[case] expected: bool,
    ) {
        assert_eq!(classifier().is_optimization_candidate(text, time_ms), expected);
    }

    #[test]
    fn scenario_e_candidate_via_both_rules() {
        let c = classifier();
        let text = "SELECT * FROM users WHERE name LIKE '%x%'";
        // Pattern rule fires even when fast...
        assert!(c.is_optimization_candidate(text, 1.0));
        // ...timing rule fires even for clean text...
        assert!(c.is_optimization_candidate("SELECT id FROM t WHERE id = $1", 600.0));
        // ...and together they are still one positive decision.
        assert!(c.is_optimization_candidate(text, 600.0));
    }

    #[test]
    fn sampling_rate_extremes() {
        let mut config = ClassifierConfig::default();
        config.sampling_rate = 0.0;
        let never = QueryClassifier::new(&config).unwrap();
        config.sampling_rate = 1.0;
        let always = QueryClassifier::new(&config).unwrap();

        for _ in 0..64 {
            let id = Uuid::new_v4();
            assert!(!never.should_sample(id));
            assert!(always.should_sample(id));
        }
    }

    #[test]
    fn record_carries_classification() {
        let c = classifier();
        let record = c.build_query_record(
            Uuid::new_v4(),
            "SELECT * FROM users WHERE name LIKE '%x%'",
            600.0,
            42,
            false,
            None,
        );
        assert_eq!(record.operation_type, OperationType::Select);
        assert!(!record.is_slow);
        assert!(record.is_optimization_candidate);
        assert_eq!(record.rows_affected, 42);
        assert!(!record.has_error);
        assert_eq!(
            record.normalized_text,
            "SELECT * FROM users WHERE name LIKE '%x%'"
        );
    }

    #[rstest]
    #[case(0, 0, 0.0)]
    #[case(100, 0, 100.0)]
    #[case(75, 25, 75.0)]
    fn hit_rate_reference_points(#[case] hits: u64, #[case] misses: u64, #[case] expected: f64) {
        assert!((hit_rate_pct(hits, misses) - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
    }

    #[test]
    fn config_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.classifier.slow_threshold_ms, DEFAULT_SLOW_THRESHOLD_MS);
        assert_eq!(config.persister.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.persister.flush_interval, Duration::from_secs(30));
        assert_eq!(config.collector.snapshot_interval, Duration::from_secs(30));
        assert_eq!(config.alerts.alert_retention, Duration::from_secs(24 * 3_600));
        assert_eq!(config.buffer.capacity, DEFAULT_BUFFER_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_bad_values() {
        let mut config = MonitorConfig::default();
        config.classifier.sampling_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.persister.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.buffer.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.classifier.inefficiency_patterns = vec!["(unclosed".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let rendered = MonitorConfig::generate_default_config();
        let parsed = MonitorConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.persister.flush_interval, Duration::from_secs(30));
        assert_eq!(parsed.collector.snapshot_retention, Duration::from_secs(7 * 24 * 3_600));
    }

    #[test]
    fn snapshot_row_mapping_is_versioned() {
        let snapshot = SystemSnapshot {
            captured_at: Utc::now(),
            cpu: Some(CpuSection { usage_pct: 42.0, load_avg: [1.0, 0.5, 0.2], cores: 8 }),
            memory: None,
            disk: None,
            network: None,
            store: None,
            cache: None,
            app: AppStats::default(),
        };
        let row = snapshot.to_row();
        assert_eq!(row.schema_version, SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(row.cpu_usage_pct, Some(42.0));
        assert_eq!(row.cpu_cores, Some(8));
        assert_eq!(row.memory_used_pct, None);
    }
}

// ============================================================================
// SECTION 9: METRICS BUFFER
// ============================================================================
// Bounded FIFO holding pending metric records. Producers (interceptors,
// collector) push to a lock-free staging queue and never block. The persister
// owns the retry lane: entries requeued after a failed flush sit at the head
// and drain before newer arrivals, which keeps per-kind persist order intact
// under retries. Overflow evicts the oldest entry and counts the drop.
// ============================================================================

/// Bounded, ordered queue of metric records awaiting persistence.
pub struct MetricsBuffer {
    /// Lock-free inbound lane for producers
    staging: SegQueue<MetricRecord>,
    /// Head lane for failed batches, drained before staging
    retry: Mutex<VecDeque<MetricRecord>>,
    /// Mirror of the retry lane length, so `len()` stays lock-free
    retry_len: AtomicUsize,
    /// Capacity across both lanes
    capacity: usize,
    pushed: AtomicU64,
    drained: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
}

impl fmt::Debug for MetricsBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

impl MetricsBuffer {
    /// Create a buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            staging: SegQueue::new(),
            retry: Mutex::new(VecDeque::new()),
            retry_len: AtomicUsize::new(0),
            capacity: capacity.max(1),
            pushed: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
        }
    }

    /// Accept a record. O(1) and non-blocking on the common path; when the
    /// buffer is full the oldest entry is evicted and counted as dropped.
    pub fn push(&self, record: MetricRecord) {
        while self.len() >= self.capacity {
            let evicted = {
                let mut retry = self.retry.lock();
                let e = retry.pop_front();
                self.retry_len.store(retry.len(), AtomicOrdering::Relaxed);
                e
            };
            // The retry lane holds the oldest records; fall back to staging.
            let evicted = evicted.or_else(|| self.staging.pop());
            if evicted.is_some() {
                self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
            } else {
                break;
            }
        }
        self.staging.push(record);
        self.pushed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Atomically remove and return up to `max` of the oldest entries.
    /// Retry-lane entries come first, then staged arrivals, FIFO within each.
    pub fn drain(&self, max: usize) -> Vec<MetricRecord> {
        let mut out = Vec::new();
        {
            let mut retry = self.retry.lock();
            while out.len() < max {
                match retry.pop_front() {
                    Some(record) => out.push(record),
                    None => break,
                }
            }
            self.retry_len.store(retry.len(), AtomicOrdering::Relaxed);
        }
        while out.len() < max {
            match self.staging.pop() {
                Some(record) => out.push(record),
                None => break,
            }
        }
        self.drained.fetch_add(out.len() as u64, AtomicOrdering::Relaxed);
        out
    }

    /// Reinsert entries at the head, preserving their relative order. Used
    /// exclusively when a persistence partition fails.
    pub fn requeue_front(&self, entries: Vec<MetricRecord>) {
        if entries.is_empty() {
            return;
        }
        let count = entries.len() as u64;
        let mut retry = self.retry.lock();
        for entry in entries.into_iter().rev() {
            retry.push_front(entry);
        }
        self.retry_len.store(retry.len(), AtomicOrdering::Relaxed);
        self.requeued.fetch_add(count, AtomicOrdering::Relaxed);
    }

    /// Records currently buffered across both lanes.
    pub fn len(&self) -> usize {
        self.staging.len() + self.retry_len.load(AtomicOrdering::Relaxed)
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records evicted by the overflow policy.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(AtomicOrdering::Relaxed)
    }

    /// Occupancy and counters for the health summary.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            len: self.len(),
            pushed: self.pushed.load(AtomicOrdering::Relaxed),
            drained: self.drained.load(AtomicOrdering::Relaxed),
            dropped: self.dropped.load(AtomicOrdering::Relaxed),
            requeued: self.requeued.load(AtomicOrdering::Relaxed),
        }
    }
}

// ============================================================================
// SECTION 10: CLIENT TRAITS & INTERCEPTOR WRAPPERS
// ============================================================================
// The seams to the storage layer. Callers hold an instrumented client whose
// contract is byte-for-byte the raw client's: same signatures, same results,
// same errors. The wrapper reads a clock before and after the call, forwards
// the outcome untouched, and emits exactly one record as a side effect.
// Wrapping is a decorator built once at initialization; the raw client is
// never mutated, and wrapping an already-wrapped client is rejected.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Relational Store Client
// ----------------------------------------------------------------------------

/// A relational store client. Synchronous clients satisfy this trait with an
/// immediately-ready body.
#[async_trait]
pub trait RelationalClient: Send + Sync {
    /// Execute a statement with positional parameters.
    async fn execute(&self, text: &str, params: &[JsonValue]) -> Result<QueryOutcome, StoreError>;

    /// Read-only session statistics (active sessions, block hit counters).
    async fn session_stats(&self) -> Result<StoreSessionStats, StoreError>;

    /// Marker overridden by instrumented wrappers.
    fn is_instrumented(&self) -> bool {
        false
    }
}

// ----------------------------------------------------------------------------
// 10.2 Cache Store Client
// ----------------------------------------------------------------------------

/// A cache store client with discrete named commands plus a flat-text status
/// report.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn del(&self, key: &str) -> Result<u64, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    async fn incr(&self, key: &str, by: i64) -> Result<i64, CacheError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Flat `key:value` status report, one entry per line.
    async fn info(&self) -> Result<String, CacheError>;

    /// Marker overridden by instrumented wrappers.
    fn is_instrumented(&self) -> bool {
        false
    }
}

// ----------------------------------------------------------------------------
// 10.3 Instrumented Store Wrapper
// ----------------------------------------------------------------------------

/// Decorator around a relational client. `execute` is timed and recorded;
/// the underlying result or error is forwarded exactly as produced.
pub struct InstrumentedStore<C: RelationalClient> {
    inner: Arc<C>,
    core: Arc<MonitorCore>,
}

impl<C: RelationalClient> Clone for InstrumentedStore<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), core: Arc::clone(&self.core) }
    }
}

impl<C: RelationalClient> fmt::Debug for InstrumentedStore<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedStore").finish_non_exhaustive()
    }
}

impl<C: RelationalClient + 'static> InstrumentedStore<C> {
    /// Wrap a raw client. Rejected when the client is already instrumented.
    pub(crate) fn wrap(inner: C, core: Arc<MonitorCore>) -> VigilResult<Self> {
        if inner.is_instrumented() {
            return Err(VigilError::AlreadyInstrumented("relational store".into()));
        }
        Ok(Self { inner: Arc::new(inner), core })
    }

    /// Trait-object handle for the snapshot collector's statistics reads.
    pub(crate) fn stat_handle(&self) -> Arc<dyn RelationalClient> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl<C: RelationalClient + 'static> RelationalClient for InstrumentedStore<C> {
    async fn execute(&self, text: &str, params: &[JsonValue]) -> Result<QueryOutcome, StoreError> {
        let clock = &self.core.clock;
        let start = clock.raw();
        let result = self.inner.execute(text, params).await;
        let elapsed_ms = clock.delta(start, clock.raw()).as_secs_f64() * 1_000.0;
        self.core.record_query(text, elapsed_ms, result.as_ref());
        result
    }

    async fn session_stats(&self) -> Result<StoreSessionStats, StoreError> {
        // Statistics reads feed the collector; they are not caller traffic
        // and are forwarded without a record.
        self.inner.session_stats().await
    }

    fn is_instrumented(&self) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// 10.4 Instrumented Cache Wrapper
// ----------------------------------------------------------------------------

/// Decorator around a cache client. Each named command is wrapped
/// individually, preserving arity and return contract.
pub struct InstrumentedCache<C: CacheClient> {
    inner: Arc<C>,
    core: Arc<MonitorCore>,
}

impl<C: CacheClient> Clone for InstrumentedCache<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), core: Arc::clone(&self.core) }
    }
}

impl<C: CacheClient> fmt::Debug for InstrumentedCache<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedCache").finish_non_exhaustive()
    }
}

impl<C: CacheClient + 'static> InstrumentedCache<C> {
    /// Wrap a raw client. Rejected when the client is already instrumented.
    pub(crate) fn wrap(inner: C, core: Arc<MonitorCore>) -> VigilResult<Self> {
        if inner.is_instrumented() {
            return Err(VigilError::AlreadyInstrumented("cache store".into()));
        }
        Ok(Self { inner: Arc::new(inner), core })
    }

    /// Trait-object handle for the snapshot collector's status reads.
    pub(crate) fn stat_handle(&self) -> Arc<dyn CacheClient> {
        Arc::new(self.clone())
    }

    /// Record one completed command.
    fn finish(&self, command: &str, start_raw: u64, error: Option<&CacheError>) {
        let clock = &self.core.clock;
        let elapsed_ms = clock.delta(start_raw, clock.raw()).as_secs_f64() * 1_000.0;
        self.core.record_cache_command(command, elapsed_ms, error);
    }
}

#[async_trait]
impl<C: CacheClient + 'static> CacheClient for InstrumentedCache<C> {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let start = self.core.clock.raw();
        let result = self.inner.get(key).await;
        self.finish("get", start, result.as_ref().err());
        result
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let start = self.core.clock.raw();
        let result = self.inner.set(key, value, ttl).await;
        self.finish("set", start, result.as_ref().err());
        result
    }

    async fn del(&self, key: &str) -> Result<u64, CacheError> {
        let start = self.core.clock.raw();
        let result = self.inner.del(key).await;
        self.finish("del", start, result.as_ref().err());
        result
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let start = self.core.clock.raw();
        let result = self.inner.exists(key).await;
        self.finish("exists", start, result.as_ref().err());
        result
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        let start = self.core.clock.raw();
        let result = self.inner.incr(key, by).await;
        self.finish("incr", start, result.as_ref().err());
        result
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let start = self.core.clock.raw();
        let result = self.inner.expire(key, ttl).await;
        self.finish("expire", start, result.as_ref().err());
        result
    }

    async fn info(&self) -> Result<String, CacheError> {
        // Status reads feed the collector; forwarded without a record.
        self.inner.info().await
    }

    fn is_instrumented(&self) -> bool {
        true
    }
}

// ============================================================================
// SECTION 11: CACHE STATUS REPORT PARSING
// ============================================================================
// The cache server's `info()` output is a flat text report: one `key:value`
// per line, section headers prefixed with '#'. The parser is tolerant:
// unknown keys are ignored, missing counters default to zero, and a report
// with no recognizable lines yields `None` (the section is simply omitted
// from the snapshot).
// ============================================================================

/// Keys extracted from the status report into `CacheServerStats`.
const CACHE_INFO_KEYS: [&str; 6] = [
    "connected_clients",
    "used_memory",
    "keyspace_hits",
    "keyspace_misses",
    "total_commands_processed",
    "uptime_in_seconds",
];

/// Parse a flat `key:value` status report into typed fields.
pub fn parse_cache_info(raw: &str) -> Option<CacheServerStats> {
    let mut fields: AHashMap<&str, &str> = AHashMap::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        fields.insert(key.trim(), value.trim());
    }

    // A report with none of the counters we consume is treated as malformed.
    if !CACHE_INFO_KEYS.iter().any(|k| fields.contains_key(k)) {
        return None;
    }

    let read_u64 = |key: &str| -> u64 {
        fields
            .get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };

    Some(CacheServerStats {
        connected_clients: read_u64("connected_clients"),
        used_memory_bytes: read_u64("used_memory"),
        keyspace_hits: read_u64("keyspace_hits"),
        keyspace_misses: read_u64("keyspace_misses"),
        total_commands: read_u64("total_commands_processed"),
        uptime_secs: read_u64("uptime_in_seconds"),
    })
}

// ============================================================================
// SECTION 12: PHASE 2 TESTS
// ============================================================================

#[cfg(test)]
mod phase2_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ---- fixtures ----------------------------------------------------------

    struct MockStore {
        fail: bool,
    }

    #[async_trait]
    impl RelationalClient for MockStore {
        async fn execute(
            &self,
            _text: &str,
            _params: &[JsonValue],
        ) -> Result<QueryOutcome, StoreError> {
            if self.fail {
                Err(StoreError::query("relation does not exist"))
            } else {
                Ok(QueryOutcome::with_count(3))
            }
        }

        async fn session_stats(&self) -> Result<StoreSessionStats, StoreError> {
            Ok(StoreSessionStats { active_sessions: 5, blocks_hit: 900, blocks_read: 100 })
        }
    }

    struct MockCache {
        fail: bool,
    }

    #[async_trait]
    impl CacheClient for MockCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            if self.fail {
                Err(CacheError::command("get", "connection reset"))
            } else {
                Ok(Some("value".into()))
            }
        }

        async fn set(&self, _k: &str, _v: &str, _ttl: Option<Duration>) -> Result<(), CacheError> {
            Ok(())
        }

        async fn del(&self, _key: &str) -> Result<u64, CacheError> {
            if self.fail {
                Err(CacheError::command("del", "connection reset"))
            } else {
                Ok(1)
            }
        }

        async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
            Ok(true)
        }

        async fn incr(&self, _key: &str, by: i64) -> Result<i64, CacheError> {
            Ok(by)
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, CacheError> {
            Ok(true)
        }

        async fn info(&self) -> Result<String, CacheError> {
            Ok(sample_info_report())
        }
    }

    fn sample_info_report() -> String {
        "# Server\r\n\
         uptime_in_seconds:86400\r\n\
         # Clients\r\n\
         connected_clients:12\r\n\
         # Memory\r\n\
         used_memory:1048576\r\n\
         # Stats\r\n\
         total_commands_processed:4200\r\n\
         keyspace_hits:75\r\n\
         keyspace_misses:25\r\n"
            .to_string()
    }

    fn test_core() -> Arc<MonitorCore> {
        Arc::new(MonitorCore::new(MonitorConfig::default()).unwrap())
    }

    fn custom_record(n: u64) -> MetricRecord {
        MetricRecord::Custom(CustomMetricRecord {
            name: CompactString::from(format!("m{}", n)),
            value: n as f64,
            tags: SmallVec::new(),
            observed_at: Utc::now(),
        })
    }

    fn custom_value(record: &MetricRecord) -> u64 {
        match record {
            MetricRecord::Custom(c) => c.value as u64,
            other => panic!("expected custom record, got {:?}", other.kind()),
        }
    }

    // ---- metrics buffer ----------------------------------------------------

    #[test]
    fn buffer_preserves_fifo_order() {
        let buffer = MetricsBuffer::new(100);
        for n in 0..5 {
            buffer.push(custom_record(n));
        }
        let drained = buffer.drain(10);
        assert_eq!(drained.len(), 5);
        let values: Vec<u64> = drained.iter().map(custom_value).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_respects_max_count() {
        let buffer = MetricsBuffer::new(100);
        for n in 0..10 {
            buffer.push(custom_record(n));
        }
        let first = buffer.drain(4);
        assert_eq!(first.len(), 4);
        assert_eq!(buffer.len(), 6);
        let second = buffer.drain(100);
        assert_eq!(second.len(), 6);
        assert_eq!(custom_value(&second[0]), 4);
    }

    #[test]
    fn requeued_entries_drain_before_new_arrivals() {
        let buffer = MetricsBuffer::new(100);
        buffer.push(custom_record(0));
        buffer.push(custom_record(1));

        let failed = buffer.drain(2);
        assert!(buffer.is_empty());

        // New traffic lands while the failed batch is in flight.
        buffer.push(custom_record(2));
        buffer.requeue_front(failed);

        let drained = buffer.drain(10);
        let values: Vec<u64> = drained.iter().map(custom_value).collect();
        assert_eq!(values, vec![0, 1, 2]);
    }

    #[test]
    fn requeue_preserves_relative_order() {
        let buffer = MetricsBuffer::new(100);
        let batch = vec![custom_record(7), custom_record(8), custom_record(9)];
        buffer.requeue_front(batch);
        let values: Vec<u64> = buffer.drain(10).iter().map(custom_value).collect();
        assert_eq!(values, vec![7, 8, 9]);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let buffer = MetricsBuffer::new(3);
        for n in 0..5 {
            buffer.push(custom_record(n));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped_count(), 2);
        let values: Vec<u64> = buffer.drain(10).iter().map(custom_value).collect();
        assert_eq!(values, vec![2, 3, 4]);
    }

    #[test]
    fn buffer_stats_track_lifecycle() {
        let buffer = MetricsBuffer::new(10);
        buffer.push(custom_record(0));
        buffer.push(custom_record(1));
        let drained = buffer.drain(1);
        buffer.requeue_front(drained);

        let stats = buffer.stats();
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.drained, 1);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.len, 2);
    }

    // ---- interceptors ------------------------------------------------------

    #[tokio::test]
    async fn successful_call_emits_exactly_one_record() {
        let core = test_core();
        let store = InstrumentedStore::wrap(MockStore { fail: false }, core.clone()).unwrap();

        let outcome = store.execute("SELECT id FROM users WHERE id = $1", &[]).await.unwrap();
        assert_eq!(outcome.row_count, 3);

        let drained = core.buffer.drain(10);
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            MetricRecord::Query(r) => {
                assert_eq!(r.operation_type, OperationType::Select);
                assert_eq!(r.rows_affected, 3);
                assert!(!r.has_error);
                assert!(r.error_message.is_none());
                assert!(r.execution_time_ms >= 0.0);
            }
            other => panic!("expected query record, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn failed_call_propagates_error_and_emits_one_record() {
        let core = test_core();
        let store = InstrumentedStore::wrap(MockStore { fail: true }, core.clone()).unwrap();

        let result = store.execute("DELETE FROM ghosts", &[]).await;
        match result {
            Err(StoreError::Query { message }) => {
                assert_eq!(message, "relation does not exist");
            }
            other => panic!("expected the original query error, got {:?}", other),
        }

        let drained = core.buffer.drain(10);
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            MetricRecord::Query(r) => {
                assert!(r.has_error);
                assert_eq!(r.rows_affected, 0);
                assert_eq!(r.operation_type, OperationType::Delete);
                assert!(r.error_message.as_deref().unwrap().contains("relation does not exist"));
            }
            other => panic!("expected query record, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn cache_commands_emit_records_and_preserve_contract() {
        let core = test_core();
        let cache = InstrumentedCache::wrap(MockCache { fail: false }, core.clone()).unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some("value".into()));
        cache.set("k", "v", Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(cache.del("k").await.unwrap(), 1);

        let drained = core.buffer.drain(10);
        let commands: Vec<&str> = drained
            .iter()
            .map(|r| match r {
                MetricRecord::Cache(c) => c.command.as_str(),
                other => panic!("expected cache record, got {:?}", other.kind()),
            })
            .collect();
        assert_eq!(commands, vec!["get", "set", "del"]);
    }

    #[tokio::test]
    async fn failed_cache_command_propagates_and_is_recorded() {
        let core = test_core();
        let cache = InstrumentedCache::wrap(MockCache { fail: true }, core.clone()).unwrap();

        let err = cache.get("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Command { .. }));

        let drained = core.buffer.drain(10);
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            MetricRecord::Cache(c) => {
                assert!(c.has_error);
                assert!(c.error_message.as_deref().unwrap().contains("connection reset"));
            }
            other => panic!("expected cache record, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn info_reads_do_not_emit_records() {
        let core = test_core();
        let cache = InstrumentedCache::wrap(MockCache { fail: false }, core.clone()).unwrap();
        cache.info().await.unwrap();
        assert!(core.buffer.is_empty());
    }

    #[test]
    fn double_wrapping_is_rejected() {
        let core = test_core();
        let wrapped = InstrumentedStore::wrap(MockStore { fail: false }, core.clone()).unwrap();
        let rewrapped = InstrumentedStore::wrap(wrapped, core.clone());
        assert!(matches!(rewrapped, Err(VigilError::AlreadyInstrumented(_))));

        let wrapped = InstrumentedCache::wrap(MockCache { fail: false }, core.clone()).unwrap();
        let rewrapped = InstrumentedCache::wrap(wrapped, core);
        assert!(matches!(rewrapped, Err(VigilError::AlreadyInstrumented(_))));
    }

    // ---- cache status report parsing --------------------------------------

    #[test]
    fn parses_full_report() {
        let stats = parse_cache_info(&sample_info_report()).unwrap();
        assert_eq!(stats.connected_clients, 12);
        assert_eq!(stats.used_memory_bytes, 1_048_576);
        assert_eq!(stats.keyspace_hits, 75);
        assert_eq!(stats.keyspace_misses, 25);
        assert_eq!(stats.total_commands, 4_200);
        assert_eq!(stats.uptime_secs, 86_400);
    }

    #[test]
    fn scenario_b_hit_rate_from_report() {
        let stats = parse_cache_info("keyspace_hits:75\nkeyspace_misses:25\n").unwrap();
        assert!((stats.hit_rate_pct() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn idle_server_has_zero_hit_rate() {
        let stats = parse_cache_info("keyspace_hits:0\nkeyspace_misses:0\n").unwrap();
        assert_eq!(stats.hit_rate_pct(), 0.0);
        assert!(!stats.has_lookups());
    }

    #[test]
    fn malformed_report_yields_none() {
        assert!(parse_cache_info("").is_none());
        assert!(parse_cache_info("complete garbage with no colons").is_none());
        assert!(parse_cache_info("# only\n# comments\n").is_none());
        // Unknown keys alone are not a usable report.
        assert!(parse_cache_info("some_unknown_key:5\n").is_none());
    }

    #[test]
    fn unparsable_counters_default_to_zero() {
        let stats = parse_cache_info("keyspace_hits:not-a-number\nkeyspace_misses:25\n").unwrap();
        assert_eq!(stats.keyspace_hits, 0);
        assert_eq!(stats.keyspace_misses, 25);
    }
}

// ============================================================================
// SECTION 13: DURABLE SINK & BATCH PERSISTER
// ============================================================================
// The sink is the pluggable durability boundary: batch inserts per record
// kind plus a keyed TTL write for cache-side metrics. The persister drains
// the buffer in fixed-size batches, partitions by kind, and writes each
// partition independently. A failed partition goes back to the head of the
// buffer; delivery is therefore at-least-once and writers must tolerate
// replays after a partial prior success.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Sink Contract
// ----------------------------------------------------------------------------

/// Durable sink for metric records.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Batch-insert query execution records.
    async fn insert_query_metrics(&self, records: &[QueryExecutionRecord]) -> Result<(), SinkError>;

    /// Batch-insert flattened snapshot rows.
    async fn insert_snapshot_metrics(&self, rows: &[SnapshotRow]) -> Result<(), SinkError>;

    /// Keyed write-with-TTL for cache command records.
    async fn write_cache_metrics(
        &self,
        key: &str,
        records: &[CacheCommandRecord],
        ttl: Duration,
    ) -> Result<(), SinkError>;

    /// Keyed write-with-TTL for custom metric samples.
    async fn write_custom_metrics(
        &self,
        key: &str,
        records: &[CustomMetricRecord],
        ttl: Duration,
    ) -> Result<(), SinkError>;

    /// Query records observed at or after `since`. An empty sink returns an
    /// empty vector, never an error.
    async fn query_metrics_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueryExecutionRecord>, SinkError>;
}

// ----------------------------------------------------------------------------
// 13.2 In-Memory Sink
// ----------------------------------------------------------------------------

/// In-process sink used by tests and the binary's selftest. Writes can be
/// toggled to fail per kind to exercise the requeue path.
#[derive(Debug, Default)]
pub struct MemorySink {
    queries: Mutex<Vec<QueryExecutionRecord>>,
    snapshots: Mutex<Vec<SnapshotRow>>,
    keyed: Mutex<AHashMap<String, (JsonValue, Duration)>>,
    fail_queries: AtomicBool,
    fail_snapshots: AtomicBool,
    fail_keyed: AtomicBool,
    write_calls: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle failure of query-partition writes.
    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, AtomicOrdering::SeqCst);
    }

    /// Toggle failure of snapshot-partition writes.
    pub fn set_fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, AtomicOrdering::SeqCst);
    }

    /// Toggle failure of keyed TTL writes.
    pub fn set_fail_keyed(&self, fail: bool) {
        self.fail_keyed.store(fail, AtomicOrdering::SeqCst);
    }

    /// Stored query records.
    pub fn query_records(&self) -> Vec<QueryExecutionRecord> {
        self.queries.lock().clone()
    }

    /// Stored snapshot rows.
    pub fn snapshot_rows(&self) -> Vec<SnapshotRow> {
        self.snapshots.lock().clone()
    }

    /// Stored keyed payload count.
    pub fn keyed_len(&self) -> usize {
        self.keyed.lock().len()
    }

    /// Keyed payloads, for assertions.
    pub fn keyed_entries(&self) -> Vec<(String, JsonValue, Duration)> {
        self.keyed
            .lock()
            .iter()
            .map(|(k, (v, ttl))| (k.clone(), v.clone(), *ttl))
            .collect()
    }

    /// Total write calls observed (successful or rejected).
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(AtomicOrdering::Relaxed)
    }
}

#[async_trait]
impl MetricSink for MemorySink {
    async fn insert_query_metrics(&self, records: &[QueryExecutionRecord]) -> Result<(), SinkError> {
        self.write_calls.fetch_add(1, AtomicOrdering::Relaxed);
        if self.fail_queries.load(AtomicOrdering::SeqCst) {
            return Err(SinkError::unavailable("query sink offline"));
        }
        self.queries.lock().extend_from_slice(records);
        Ok(())
    }

    async fn insert_snapshot_metrics(&self, rows: &[SnapshotRow]) -> Result<(), SinkError> {
        self.write_calls.fetch_add(1, AtomicOrdering::Relaxed);
        if self.fail_snapshots.load(AtomicOrdering::SeqCst) {
            return Err(SinkError::unavailable("snapshot sink offline"));
        }
        self.snapshots.lock().extend_from_slice(rows);
        Ok(())
    }

    async fn write_cache_metrics(
        &self,
        key: &str,
        records: &[CacheCommandRecord],
        ttl: Duration,
    ) -> Result<(), SinkError> {
        self.write_calls.fetch_add(1, AtomicOrdering::Relaxed);
        if self.fail_keyed.load(AtomicOrdering::SeqCst) {
            return Err(SinkError::unavailable("keyed sink offline"));
        }
        let payload = serde_json::to_value(records)
            .map_err(|e| SinkError::Serialization { message: e.to_string() })?;
        self.keyed.lock().insert(key.to_string(), (payload, ttl));
        Ok(())
    }

    async fn write_custom_metrics(
        &self,
        key: &str,
        records: &[CustomMetricRecord],
        ttl: Duration,
    ) -> Result<(), SinkError> {
        self.write_calls.fetch_add(1, AtomicOrdering::Relaxed);
        if self.fail_keyed.load(AtomicOrdering::SeqCst) {
            return Err(SinkError::unavailable("keyed sink offline"));
        }
        let payload = serde_json::to_value(records)
            .map_err(|e| SinkError::Serialization { message: e.to_string() })?;
        self.keyed.lock().insert(key.to_string(), (payload, ttl));
        Ok(())
    }

    async fn query_metrics_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueryExecutionRecord>, SinkError> {
        Ok(self
            .queries
            .lock()
            .iter()
            .filter(|r| r.observed_at >= since)
            .cloned()
            .collect())
    }
}

// ----------------------------------------------------------------------------
// 13.3 Flush Cycle
// ----------------------------------------------------------------------------

/// Sequence counter for keyed metric writes, so batches in the same
/// millisecond cannot collide.
static KEYED_WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// One drain-partition-write cycle. Failed partitions (and only those) are
/// returned to the head of the buffer in their original relative order.
pub async fn flush_once(core: &MonitorCore, sink: &dyn MetricSink) -> FlushOutcome {
    let batch = core.buffer.drain(core.config.persister.batch_size);
    if batch.is_empty() {
        return FlushOutcome::default();
    }

    let drained = batch.len();
    let ttl = core.config.persister.cache_metric_ttl;

    let mut queries: Vec<QueryExecutionRecord> = Vec::new();
    let mut snapshots: Vec<SystemSnapshot> = Vec::new();
    let mut caches: Vec<CacheCommandRecord> = Vec::new();
    let mut customs: Vec<CustomMetricRecord> = Vec::new();

    for record in batch {
        match record {
            MetricRecord::Query(r) => queries.push(r),
            MetricRecord::Snapshot(s) => snapshots.push(s),
            MetricRecord::Cache(c) => caches.push(c),
            MetricRecord::Custom(c) => customs.push(c),
        }
    }

    let mut persisted = 0usize;
    let mut requeued = 0usize;

    if !queries.is_empty() {
        let count = queries.len();
        match sink.insert_query_metrics(&queries).await {
            Ok(()) => persisted += count,
            Err(e) => {
                warn!(error = %e, count, "query metric batch rejected, requeueing");
                requeued += count;
                core.buffer.requeue_front(queries.into_iter().map(MetricRecord::Query).collect());
            }
        }
    }

    if !snapshots.is_empty() {
        let count = snapshots.len();
        let rows: Vec<SnapshotRow> = snapshots.iter().map(SystemSnapshot::to_row).collect();
        match sink.insert_snapshot_metrics(&rows).await {
            Ok(()) => persisted += count,
            Err(e) => {
                warn!(error = %e, count, "snapshot batch rejected, requeueing");
                requeued += count;
                core.buffer
                    .requeue_front(snapshots.into_iter().map(MetricRecord::Snapshot).collect());
            }
        }
    }

    if !caches.is_empty() {
        let count = caches.len();
        let seq = KEYED_WRITE_SEQ.fetch_add(1, AtomicOrdering::Relaxed);
        let key = format!("vigil:cache:{}:{}", Utc::now().timestamp_millis(), seq);
        match sink.write_cache_metrics(&key, &caches, ttl).await {
            Ok(()) => persisted += count,
            Err(e) => {
                warn!(error = %e, count, "cache metric batch rejected, requeueing");
                requeued += count;
                core.buffer.requeue_front(caches.into_iter().map(MetricRecord::Cache).collect());
            }
        }
    }

    if !customs.is_empty() {
        let count = customs.len();
        let seq = KEYED_WRITE_SEQ.fetch_add(1, AtomicOrdering::Relaxed);
        let key = format!("vigil:custom:{}:{}", Utc::now().timestamp_millis(), seq);
        match sink.write_custom_metrics(&key, &customs, ttl).await {
            Ok(()) => persisted += count,
            Err(e) => {
                warn!(error = %e, count, "custom metric batch rejected, requeueing");
                requeued += count;
                core.buffer.requeue_front(customs.into_iter().map(MetricRecord::Custom).collect());
            }
        }
    }

    let outcome = FlushOutcome { drained, persisted, requeued };
    trace!(?outcome, "flush cycle complete");
    outcome
}

// ============================================================================
// SECTION 14: SNAPSHOT COLLECTOR
// ============================================================================
// Gathers one SystemSnapshot per cycle: host figures from sysinfo, session
// counters from the relational store, the parsed cache status report, and
// the engine's own rolling counters. Every sub-gatherer is allowed to fail
// alone; its section is omitted and the cycle continues. The snapshot goes
// to the in-memory history (bounded, retention-pruned), the latest-snapshot
// cell, the alert engine, and the metrics buffer.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 System Probe
// ----------------------------------------------------------------------------

/// Wraps sysinfo state between cycles. CPU usage needs two samples, so the
/// probe keeps its `System` alive for the lifetime of the collector task.
#[derive(Debug)]
pub struct SystemProbe {
    sys: System,
    disks: Disks,
    networks: Networks,
    pid: Option<Pid>,
}

impl SystemProbe {
    /// Create a probe and take the first CPU/memory sample.
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// CPU usage, load averages, and core count.
    pub fn sample_cpu(&mut self) -> Option<CpuSection> {
        self.sys.refresh_cpu();
        let cores = self.sys.cpus().len();
        if cores == 0 {
            return None;
        }
        let load = System::load_average();
        Some(CpuSection {
            usage_pct: f64::from(self.sys.global_cpu_info().cpu_usage()),
            load_avg: [load.one, load.five, load.fifteen],
            cores,
        })
    }

    /// Process and system memory figures.
    pub fn sample_memory(&mut self) -> Option<MemorySection> {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        if total == 0 {
            return None;
        }
        let system_used_pct = (self.sys.used_memory() as f64 / total as f64) * 100.0;

        let (rss, virt) = match self.pid {
            Some(pid) => {
                self.sys.refresh_process(pid);
                match self.sys.process(pid) {
                    Some(p) => (p.memory(), p.virtual_memory()),
                    None => (0, 0),
                }
            }
            None => (0, 0),
        };

        Some(MemorySection {
            process_rss_bytes: rss,
            process_virtual_bytes: virt,
            system_used_pct,
        })
    }

    /// Aggregate disk usage across real block devices.
    pub fn sample_disk(&mut self) -> Option<DiskSection> {
        self.disks.refresh();
        let mut total: u64 = 0;
        let mut available: u64 = 0;
        for disk in self.disks.list() {
            total = total.saturating_add(disk.total_space());
            available = available.saturating_add(disk.available_space());
        }
        if total == 0 {
            return None;
        }
        let used = total.saturating_sub(available);
        Some(DiskSection {
            usage_pct: (used as f64 / total as f64) * 100.0,
            total_bytes: total,
        })
    }

    /// Cumulative network counters across interfaces.
    pub fn sample_network(&mut self) -> Option<NetworkSection> {
        self.networks.refresh();
        let mut bytes_in: u64 = 0;
        let mut bytes_out: u64 = 0;
        let mut seen = false;
        for (_name, data) in &self.networks {
            seen = true;
            bytes_in = bytes_in.saturating_add(data.total_received());
            bytes_out = bytes_out.saturating_add(data.total_transmitted());
        }
        if !seen {
            return None;
        }
        Some(NetworkSection { bytes_in, bytes_out })
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// 14.2 Collection Cycle
// ----------------------------------------------------------------------------

/// Assemble one snapshot. Store/cache gatherers run against whatever clients
/// are attached; a failing or missing collaborator only costs its section.
pub async fn collect_once(
    core: &MonitorCore,
    probe: &mut SystemProbe,
    store: Option<Arc<dyn RelationalClient>>,
    cache: Option<Arc<dyn CacheClient>>,
) -> SystemSnapshot {
    let cpu = probe.sample_cpu();
    let memory = probe.sample_memory();
    let disk = probe.sample_disk();
    let network = probe.sample_network();

    let store_stats = match store {
        Some(client) => match client.session_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "store statistics collection failed, omitting section");
                None
            }
        },
        None => None,
    };

    let cache_stats = match cache {
        Some(client) => match client.info().await {
            Ok(raw) => {
                let parsed = parse_cache_info(&raw);
                if parsed.is_none() {
                    warn!("cache status report was unparseable, omitting section");
                }
                parsed
            }
            Err(e) => {
                warn!(error = %e, "cache status collection failed, omitting section");
                None
            }
        },
        None => None,
    };

    let snapshot = SystemSnapshot {
        captured_at: Utc::now(),
        cpu,
        memory,
        disk,
        network,
        store: store_stats,
        cache: cache_stats,
        app: core.app_stats(),
    };

    core.store_snapshot(snapshot.clone());
    core.alerts.evaluate_snapshot(&snapshot);
    core.buffer.push(MetricRecord::Snapshot(snapshot.clone()));

    snapshot
}

// ============================================================================
// SECTION 15: ALERT ENGINE
// ============================================================================
// Threshold evaluation over snapshots and per-operation timings. Crossings
// are strict: a value exactly at its threshold is safe. A dimension that is
// still breached on the next evaluation raises again, one alert per
// breached dimension per cycle, and recovery is implied by the absence of
// further alerts. The log holds a trailing window (default 24h), pruned on
// every evaluation; emission notifies typed subscribers independently of log
// retention.
// ============================================================================

/// Signature of an alert subscriber.
pub type AlertHandler = Box<dyn Fn(&Alert) + Send + Sync>;

/// Evaluates observations against thresholds and publishes breaches.
pub struct AlertEngine {
    thresholds: AlertThresholds,
    retention: Duration,
    log_max: usize,
    log: Mutex<VecDeque<Alert>>,
    subscribers: RwLock<Vec<AlertHandler>>,
    raised_total: AtomicU64,
}

impl fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertEngine")
            .field("thresholds", &self.thresholds)
            .field("log_len", &self.log.lock().len())
            .field("subscribers", &self.subscribers.read().len())
            .field("raised_total", &self.raised_total.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

impl AlertEngine {
    /// Create an engine from configuration.
    pub fn new(config: &AlertConfig) -> Self {
        Self {
            thresholds: config.thresholds.clone(),
            retention: config.alert_retention,
            log_max: config.alert_log_max.max(1),
            log: Mutex::new(VecDeque::new()),
            subscribers: RwLock::new(Vec::new()),
            raised_total: AtomicU64::new(0),
        }
    }

    /// Register a subscriber. Handlers run synchronously on the emitting
    /// task; a panicking handler is isolated and logged.
    pub fn on_alert<F>(&self, handler: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Box::new(handler));
    }

    /// Evaluate one snapshot against the resource thresholds. Returns the
    /// alerts raised this cycle.
    pub fn evaluate_snapshot(&self, snapshot: &SystemSnapshot) -> Vec<Alert> {
        let t = &self.thresholds;
        let mut raised = Vec::new();

        if let Some(cpu) = &snapshot.cpu {
            if cpu.usage_pct > t.cpu_pct {
                raised.push(
                    Alert::new(
                        AlertKind::CpuHigh,
                        ceiling_severity(cpu.usage_pct, t.cpu_pct),
                        format!("CPU usage {:.1}% exceeds threshold {:.1}%", cpu.usage_pct, t.cpu_pct),
                    )
                    .with_threshold(t.cpu_pct)
                    .with_observed(cpu.usage_pct),
                );
            }
        }

        if let Some(memory) = &snapshot.memory {
            if memory.system_used_pct > t.memory_pct {
                raised.push(
                    Alert::new(
                        AlertKind::MemoryHigh,
                        ceiling_severity(memory.system_used_pct, t.memory_pct),
                        format!(
                            "Memory usage {:.1}% exceeds threshold {:.1}%",
                            memory.system_used_pct, t.memory_pct
                        ),
                    )
                    .with_threshold(t.memory_pct)
                    .with_observed(memory.system_used_pct),
                );
            }
        }

        if let Some(cache) = &snapshot.cache {
            // An idle cache has no meaningful hit rate; only a server that
            // has seen lookups can breach the floor.
            let hit_rate = cache.hit_rate_pct();
            if cache.has_lookups() && hit_rate < t.cache_hit_floor_pct {
                let severity = if hit_rate < t.cache_hit_floor_pct - 2.0 * CRITICAL_OVERAGE_MARGIN_PCT
                {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                raised.push(
                    Alert::new(
                        AlertKind::CacheHitLow,
                        severity,
                        format!(
                            "Cache hit rate {:.1}% is below floor {:.1}%",
                            hit_rate, t.cache_hit_floor_pct
                        ),
                    )
                    .with_threshold(t.cache_hit_floor_pct)
                    .with_observed(hit_rate),
                );
            }
        }

        for alert in &raised {
            self.emit(alert.clone());
        }
        raised
    }

    /// Evaluate one completed operation's execution time. Returns the alert,
    /// if one was raised.
    pub fn evaluate_operation(&self, label: &str, execution_time_ms: f64) -> Option<Alert> {
        let threshold = self.thresholds.operation_time_ms;
        if execution_time_ms <= threshold {
            return None;
        }
        let severity = if execution_time_ms > threshold * CRITICAL_SLOW_MULTIPLIER {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let alert = Alert::new(
            AlertKind::SlowOperation,
            severity,
            format!(
                "{} operation took {:.0}ms (threshold {:.0}ms)",
                label, execution_time_ms, threshold
            ),
        )
        .with_threshold(threshold)
        .with_observed(execution_time_ms);

        self.emit(alert.clone());
        Some(alert)
    }

    /// Append to the log (pruning first) and notify subscribers.
    fn emit(&self, alert: Alert) {
        debug!(
            kind = %alert.kind,
            severity = %alert.severity,
            observed = alert.observed_value,
            threshold = alert.threshold,
            "alert raised"
        );

        {
            let mut log = self.log.lock();
            Self::prune_locked(&mut log, self.retention);
            log.push_back(alert.clone());
            while log.len() > self.log_max {
                log.pop_front();
            }
        }
        self.raised_total.fetch_add(1, AtomicOrdering::Relaxed);

        let subscribers = self.subscribers.read();
        for handler in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| handler(&alert))).is_err() {
                warn!(kind = %alert.kind, "alert subscriber panicked, continuing");
            }
        }
    }

    fn prune_locked(log: &mut VecDeque<Alert>, retention: Duration) {
        let cutoff = Utc::now() - chrono_window(retention);
        while log.front().map_or(false, |a| a.raised_at < cutoff) {
            log.pop_front();
        }
    }

    /// Consistent-copy read of alerts raised within the trailing `window`.
    pub fn recent(&self, window: Duration) -> Vec<Alert> {
        let cutoff = Utc::now() - chrono_window(window);
        let mut log = self.log.lock();
        Self::prune_locked(&mut log, self.retention);
        log.iter().filter(|a| a.raised_at >= cutoff).cloned().collect()
    }

    /// Current log length (post-prune).
    pub fn log_len(&self) -> usize {
        let mut log = self.log.lock();
        Self::prune_locked(&mut log, self.retention);
        log.len()
    }

    /// Total alerts raised since startup.
    pub fn raised_total(&self) -> u64 {
        self.raised_total.load(AtomicOrdering::Relaxed)
    }

    #[cfg(test)]
    fn backdate_all(&self, age: Duration) {
        let delta = chrono_window(age);
        for alert in self.log.lock().iter_mut() {
            alert.raised_at = alert.raised_at - delta;
        }
    }
}

/// Severity for ceiling breaches: critical once the overage passes the
/// configured margin.
fn ceiling_severity(observed: f64, threshold: f64) -> Severity {
    if observed > threshold + CRITICAL_OVERAGE_MARGIN_PCT {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

/// Convert a std duration into a chrono offset, saturating instead of
/// erroring for absurdly large windows.
fn chrono_window(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(3_650))
}

// ============================================================================
// SECTION 16: ENGINE CORE & ROLLING AGGREGATES
// ============================================================================
// `MonitorCore` is the state shared by interceptors and the periodic tasks:
// classifier, buffer, alert engine, rolling counters, per-fingerprint
// aggregates, snapshot history, and the attached statistics handles. The
// recording path is the hot path: a clock delta, a few atomic bumps, and a
// lock-free buffer push.
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Rolling Counters
// ----------------------------------------------------------------------------

/// Cumulative operation counters, updated from the interceptor path.
#[derive(Debug, Default)]
struct OpCounters {
    total_ops: AtomicU64,
    slow_ops: AtomicU64,
    error_ops: AtomicU64,
    total_time_us: AtomicU64,
}

impl OpCounters {
    fn observe(&self, execution_time_ms: f64, is_slow: bool, has_error: bool) {
        self.total_ops.fetch_add(1, AtomicOrdering::Relaxed);
        if is_slow {
            self.slow_ops.fetch_add(1, AtomicOrdering::Relaxed);
        }
        if has_error {
            self.error_ops.fetch_add(1, AtomicOrdering::Relaxed);
        }
        let micros = (execution_time_ms * 1_000.0).max(0.0) as u64;
        self.total_time_us.fetch_add(micros, AtomicOrdering::Relaxed);
    }
}

/// Rolling aggregate for one normalized query shape.
#[derive(Debug, Clone)]
pub struct FingerprintAggregate {
    /// Normalized query shape
    pub normalized: CompactString,
    /// Total executions observed
    pub count: u64,
    /// Total execution time across all observations (ms)
    pub total_time_ms: f64,
    /// Slow executions observed
    pub slow_count: u64,
    /// Total execution time across slow observations (ms)
    pub slow_total_time_ms: f64,
    /// Worst slow execution (ms)
    pub slow_max_time_ms: f64,
    /// Failed executions observed
    pub error_count: u64,
    /// A sampled raw text, when one was captured
    pub sample_text: Option<CompactString>,
    /// Most recent observation
    pub last_seen: DateTime<Utc>,
}

// ----------------------------------------------------------------------------
// 16.2 Monitor Core
// ----------------------------------------------------------------------------

/// State shared between interceptors, periodic tasks, and the reporting API.
pub struct MonitorCore {
    pub(crate) config: MonitorConfig,
    pub(crate) classifier: QueryClassifier,
    pub(crate) buffer: MetricsBuffer,
    pub(crate) alerts: AlertEngine,
    pub(crate) clock: Clock,
    counters: OpCounters,
    fingerprints: DashMap<u64, FingerprintAggregate>,
    fingerprints_skipped: AtomicU64,
    latest_snapshot: ArcSwapOption<SystemSnapshot>,
    snapshot_history: RwLock<VecDeque<SystemSnapshot>>,
    stat_store: RwLock<Option<Arc<dyn RelationalClient>>>,
    stat_cache: RwLock<Option<Arc<dyn CacheClient>>>,
    started: Instant,
}

impl fmt::Debug for MonitorCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorCore")
            .field("buffer", &self.buffer)
            .field("alerts", &self.alerts)
            .field("fingerprints", &self.fingerprints.len())
            .finish_non_exhaustive()
    }
}

impl MonitorCore {
    /// Build the core from validated configuration.
    pub fn new(config: MonitorConfig) -> VigilResult<Self> {
        config.validate()?;
        let classifier = QueryClassifier::new(&config.classifier)?;
        let buffer = MetricsBuffer::new(config.buffer.capacity);
        let alerts = AlertEngine::new(&config.alerts);
        Ok(Self {
            config,
            classifier,
            buffer,
            alerts,
            clock: Clock::new(),
            counters: OpCounters::default(),
            fingerprints: DashMap::new(),
            fingerprints_skipped: AtomicU64::new(0),
            latest_snapshot: ArcSwapOption::from(None),
            snapshot_history: RwLock::new(VecDeque::new()),
            stat_store: RwLock::new(None),
            stat_cache: RwLock::new(None),
            started: Instant::now(),
        })
    }

    // ---- hot recording path ------------------------------------------------

    /// Record one completed relational call. Called by the store interceptor
    /// with the forwarded result; never fails and never blocks.
    pub fn record_query(
        &self,
        text: &str,
        execution_time_ms: f64,
        outcome: Result<&QueryOutcome, &StoreError>,
    ) {
        let operation_id = Uuid::new_v4();
        let (rows_affected, has_error, error_message) = match outcome {
            Ok(o) => (o.row_count, false, None),
            Err(e) => (0, true, Some(e.to_string())),
        };

        let record = self.classifier.build_query_record(
            operation_id,
            text,
            execution_time_ms,
            rows_affected,
            has_error,
            error_message,
        );

        self.counters.observe(execution_time_ms, record.is_slow, record.has_error);
        self.update_fingerprint(&record);
        self.alerts.evaluate_operation(record.operation_type.as_str(), execution_time_ms);
        self.buffer.push(MetricRecord::Query(record));
    }

    /// Record one completed cache command.
    pub fn record_cache_command(
        &self,
        command: &str,
        execution_time_ms: f64,
        error: Option<&CacheError>,
    ) {
        let record = CacheCommandRecord {
            command: CompactString::from(command),
            execution_time_ms,
            has_error: error.is_some(),
            error_message: error.map(|e| e.to_string()),
            observed_at: Utc::now(),
        };

        let is_slow = self.classifier.is_slow(execution_time_ms);
        self.counters.observe(execution_time_ms, is_slow, record.has_error);
        self.alerts.evaluate_operation(command, execution_time_ms);
        self.buffer.push(MetricRecord::Cache(record));
    }

    /// Record an application-defined sample.
    pub fn record_custom(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let record = CustomMetricRecord {
            name: CompactString::from(name),
            value,
            tags: tags
                .iter()
                .map(|(k, v)| (CompactString::from(*k), CompactString::from(*v)))
                .collect(),
            observed_at: Utc::now(),
        };
        self.buffer.push(MetricRecord::Custom(record));
    }

    fn update_fingerprint(&self, record: &QueryExecutionRecord) {
        let key = fingerprint_key(&record.normalized_text);

        if let Some(mut agg) = self.fingerprints.get_mut(&key) {
            agg.count += 1;
            agg.total_time_ms += record.execution_time_ms;
            if record.is_slow {
                agg.slow_count += 1;
                agg.slow_total_time_ms += record.execution_time_ms;
                agg.slow_max_time_ms = agg.slow_max_time_ms.max(record.execution_time_ms);
            }
            if record.has_error {
                agg.error_count += 1;
            }
            if agg.sample_text.is_none() {
                agg.sample_text = record.raw_text.clone();
            }
            agg.last_seen = record.observed_at;
            return;
        }

        // Bounded aggregate map: shapes beyond the cap are counted, not kept.
        if self.fingerprints.len() >= FINGERPRINT_MAP_MAX {
            self.fingerprints_skipped.fetch_add(1, AtomicOrdering::Relaxed);
            return;
        }

        self.fingerprints.insert(
            key,
            FingerprintAggregate {
                normalized: record.normalized_text.clone(),
                count: 1,
                total_time_ms: record.execution_time_ms,
                slow_count: u64::from(record.is_slow),
                slow_total_time_ms: if record.is_slow { record.execution_time_ms } else { 0.0 },
                slow_max_time_ms: if record.is_slow { record.execution_time_ms } else { 0.0 },
                error_count: u64::from(record.has_error),
                sample_text: record.raw_text.clone(),
                last_seen: record.observed_at,
            },
        );
    }

    // ---- snapshot state ----------------------------------------------------

    /// Append a snapshot to bounded history and publish it as latest.
    pub fn store_snapshot(&self, snapshot: SystemSnapshot) {
        self.latest_snapshot.store(Some(Arc::new(snapshot.clone())));

        let retention = self.config.collector.snapshot_retention;
        let max = self.config.collector.snapshot_history_max.max(1);
        let cutoff = Utc::now() - chrono_window(retention);

        let mut history = self.snapshot_history.write();
        history.push_back(snapshot);
        while history.front().map_or(false, |s| s.captured_at < cutoff) {
            history.pop_front();
        }
        while history.len() > max {
            history.pop_front();
        }
    }

    /// Most recent snapshot, if any cycle has completed.
    pub fn latest_snapshot(&self) -> Option<SystemSnapshot> {
        self.latest_snapshot.load_full().map(|arc| (*arc).clone())
    }

    /// Consistent copy of the snapshot history.
    pub fn snapshot_history(&self) -> Vec<SystemSnapshot> {
        self.snapshot_history.read().iter().cloned().collect()
    }

    // ---- statistics sources ------------------------------------------------

    pub(crate) fn attach_stat_sources(
        &self,
        store: Arc<dyn RelationalClient>,
        cache: Arc<dyn CacheClient>,
    ) {
        *self.stat_store.write() = Some(store);
        *self.stat_cache.write() = Some(cache);
    }

    pub(crate) fn stat_sources(
        &self,
    ) -> (Option<Arc<dyn RelationalClient>>, Option<Arc<dyn CacheClient>>) {
        (self.stat_store.read().clone(), self.stat_cache.read().clone())
    }

    // ---- derived views -----------------------------------------------------

    /// Engine-level rolling counters.
    pub fn app_stats(&self) -> AppStats {
        let total_ops = self.counters.total_ops.load(AtomicOrdering::Relaxed);
        let total_time_us = self.counters.total_time_us.load(AtomicOrdering::Relaxed);
        AppStats {
            uptime_secs: self.started.elapsed().as_secs(),
            total_ops,
            slow_ops: self.counters.slow_ops.load(AtomicOrdering::Relaxed),
            error_ops: self.counters.error_ops.load(AtomicOrdering::Relaxed),
            avg_op_time_ms: if total_ops > 0 {
                total_time_us as f64 / 1_000.0 / total_ops as f64
            } else {
                0.0
            },
        }
    }

    /// Slow-operation groups derived from the in-memory rolling aggregates.
    /// Reporting falls back to this view when the sink has no history.
    pub fn slow_groups_from_memory(&self, limit: usize) -> Vec<SlowOperationGroup> {
        let mut groups: Vec<SlowOperationGroup> = self
            .fingerprints
            .iter()
            .filter(|entry| entry.value().slow_count > 0)
            .map(|entry| {
                let agg = entry.value();
                SlowOperationGroup {
                    normalized_text: agg.normalized.clone(),
                    count: agg.slow_count,
                    mean_time_ms: agg.slow_total_time_ms / agg.slow_count as f64,
                    max_time_ms: agg.slow_max_time_ms,
                    sample_text: agg.sample_text.clone(),
                }
            })
            .collect();
        groups.sort_by_key(|g| std::cmp::Reverse(OrderedFloat(g.mean_time_ms)));
        groups.truncate(limit);
        groups
    }

    /// Query shapes dropped from aggregation after the map filled up.
    pub fn fingerprints_skipped(&self) -> u64 {
        self.fingerprints_skipped.load(AtomicOrdering::Relaxed)
    }
}

// ============================================================================
// SECTION 17: REPORTING AGGREGATION
// ============================================================================
// Pure aggregation over query records: slow-operation groups keyed by the
// normalized fingerprint, and hourly trend buckets. Used by the reporting
// API over whatever the sink returns; empty input yields empty output.
// ============================================================================

/// Group slow records by normalized fingerprint, ordered by mean execution
/// time descending, truncated to `limit`.
pub fn group_slow_operations(
    records: &[QueryExecutionRecord],
    limit: usize,
) -> Vec<SlowOperationGroup> {
    struct Accum {
        normalized: CompactString,
        count: u64,
        total_ms: f64,
        max_ms: f64,
        sample: Option<CompactString>,
    }

    let mut by_shape: AHashMap<u64, Accum> = AHashMap::new();

    for record in records.iter().filter(|r| r.is_slow) {
        let key = fingerprint_key(&record.normalized_text);
        let accum = by_shape.entry(key).or_insert_with(|| Accum {
            normalized: record.normalized_text.clone(),
            count: 0,
            total_ms: 0.0,
            max_ms: 0.0,
            sample: None,
        });
        accum.count += 1;
        accum.total_ms += record.execution_time_ms;
        accum.max_ms = accum.max_ms.max(record.execution_time_ms);
        if accum.sample.is_none() {
            accum.sample = record.raw_text.clone();
        }
    }

    let mut groups: Vec<SlowOperationGroup> = by_shape
        .into_values()
        .map(|a| SlowOperationGroup {
            normalized_text: a.normalized,
            count: a.count,
            mean_time_ms: a.total_ms / a.count as f64,
            max_time_ms: a.max_ms,
            sample_text: a.sample,
        })
        .collect();

    groups.sort_by_key(|g| std::cmp::Reverse(OrderedFloat(g.mean_time_ms)));
    groups.truncate(limit);
    groups
}

/// Bucket records into hours, ascending by bucket start.
pub fn bucket_trends(records: &[QueryExecutionRecord]) -> Vec<TrendBucket> {
    struct Accum {
        count: u64,
        total_ms: f64,
        slow: u64,
        errors: u64,
    }

    let mut by_hour: AHashMap<i64, Accum> = AHashMap::new();

    for record in records {
        let hour = record.observed_at.timestamp().div_euclid(3_600);
        let accum = by_hour
            .entry(hour)
            .or_insert_with(|| Accum { count: 0, total_ms: 0.0, slow: 0, errors: 0 });
        accum.count += 1;
        accum.total_ms += record.execution_time_ms;
        accum.slow += u64::from(record.is_slow);
        accum.errors += u64::from(record.has_error);
    }

    let mut buckets: Vec<TrendBucket> = by_hour
        .into_iter()
        .map(|(hour, a)| TrendBucket {
            bucket_start: DateTime::from_timestamp(hour * 3_600, 0).unwrap_or(DateTime::<Utc>::MIN_UTC),
            count: a.count,
            mean_time_ms: a.total_ms / a.count as f64,
            slow_count: a.slow,
            error_count: a.errors,
        })
        .collect();

    buckets.sort_by_key(|b| b.bucket_start);
    buckets
}

// ============================================================================
// SECTION 18: PHASE 3 TESTS
// ============================================================================


// ============================================================================
// SECTION 19: ENGINE ORCHESTRATION
// ============================================================================
// `PerformanceMonitor` is the exposed surface: it builds the core, wraps the
// storage clients exactly once, runs the two periodic tasks, answers the
// reporting queries, and performs the drain-then-stop shutdown. In-flight
// caller operations are never interrupted; instrumentation is decorator-only
// and keeps recording until the process exits.
// ============================================================================

// ----------------------------------------------------------------------------
// 19.1 Periodic Task Loops
// ----------------------------------------------------------------------------

/// Batch persister loop: one flush cycle per interval until cancelled.
async fn run_persister(core: Arc<MonitorCore>, sink: Arc<dyn MetricSink>, cancel: CancellationToken) {
    let mut ticker = interval(core.config.persister.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the first real flush
    // happens one interval after start.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let outcome = flush_once(&core, sink.as_ref()).await;
                if outcome.drained > 0 {
                    debug!(
                        drained = outcome.drained,
                        persisted = outcome.persisted,
                        requeued = outcome.requeued,
                        "flush cycle"
                    );
                }
            }
        }
    }
    trace!("persister task stopped");
}

/// Snapshot collector loop: one collection cycle per interval until
/// cancelled. Statistics handles are re-read every cycle so clients attached
/// after start are picked up.
async fn run_collector(core: Arc<MonitorCore>, cancel: CancellationToken) {
    let mut probe = SystemProbe::new();
    let mut ticker = interval(core.config.collector.snapshot_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let (store, cache) = core.stat_sources();
                let snapshot = collect_once(&core, &mut probe, store, cache).await;
                trace!(captured_at = %snapshot.captured_at, "snapshot cycle");
            }
        }
    }
    trace!("collector task stopped");
}

// ----------------------------------------------------------------------------
// 19.2 Performance Monitor
// ----------------------------------------------------------------------------

#[derive(Default)]
struct RuntimeState {
    cancel: Option<CancellationToken>,
    tasks: Vec<TokioJoinHandle<()>>,
}

/// The monitoring engine facade.
pub struct PerformanceMonitor {
    core: Arc<MonitorCore>,
    sink: Arc<dyn MetricSink>,
    runtime: Mutex<RuntimeState>,
    initialized: AtomicBool,
}

impl fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("core", &self.core)
            .field("initialized", &self.initialized.load(AtomicOrdering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PerformanceMonitor {
    /// Build a monitor from configuration and a durable sink.
    pub fn new(config: MonitorConfig, sink: Arc<dyn MetricSink>) -> VigilResult<Self> {
        let core = Arc::new(MonitorCore::new(config)?);
        Ok(Self {
            core,
            sink,
            runtime: Mutex::new(RuntimeState::default()),
            initialized: AtomicBool::new(false),
        })
    }

    /// Shared core state. Exposed for integration with custom tooling.
    pub fn core(&self) -> &Arc<MonitorCore> {
        &self.core
    }

    /// Wrap the storage clients. May be called once; a second call, or a
    /// client that is already instrumented, is rejected.
    pub fn initialize<S, C>(
        &self,
        store: S,
        cache: C,
    ) -> VigilResult<(InstrumentedStore<S>, InstrumentedCache<C>)>
    where
        S: RelationalClient + 'static,
        C: CacheClient + 'static,
    {
        if store.is_instrumented() {
            return Err(VigilError::AlreadyInstrumented("relational store".into()));
        }
        if cache.is_instrumented() {
            return Err(VigilError::AlreadyInstrumented("cache store".into()));
        }
        if self.initialized.swap(true, AtomicOrdering::SeqCst) {
            return Err(VigilError::AlreadyInitialized);
        }

        let store = InstrumentedStore::wrap(store, Arc::clone(&self.core))?;
        let cache = InstrumentedCache::wrap(cache, Arc::clone(&self.core))?;
        self.core.attach_stat_sources(store.stat_handle(), cache.stat_handle());

        info!("storage clients instrumented");
        Ok((store, cache))
    }

    /// Register an alert subscriber.
    pub fn on_alert<F>(&self, handler: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.core.alerts.on_alert(handler);
    }

    /// Spawn the periodic tasks. Idempotent while running.
    pub fn start(&self) {
        let mut runtime = self.runtime.lock();
        if runtime.cancel.is_some() {
            warn!("monitor already started");
            return;
        }

        let cancel = CancellationToken::new();
        let persister = tokio::spawn(run_persister(
            Arc::clone(&self.core),
            Arc::clone(&self.sink),
            cancel.child_token(),
        ));
        let collector = tokio::spawn(run_collector(Arc::clone(&self.core), cancel.child_token()));

        runtime.cancel = Some(cancel);
        runtime.tasks = vec![persister, collector];

        info!(
            flush_interval = ?self.core.config.persister.flush_interval,
            snapshot_interval = ?self.core.config.collector.snapshot_interval,
            "periodic tasks started"
        );
    }

    /// Cancel the periodic tasks and wait for them to finish their current
    /// cycle. Interceptors keep recording.
    pub async fn stop(&self) {
        let (cancel, tasks) = {
            let mut runtime = self.runtime.lock();
            (runtime.cancel.take(), std::mem::take(&mut runtime.tasks))
        };

        let Some(cancel) = cancel else {
            return;
        };
        cancel.cancel();
        for task in tasks {
            let _ = task.await;
        }
        info!("periodic tasks stopped");
    }

    /// Whether the periodic tasks are currently running.
    pub fn is_running(&self) -> bool {
        self.runtime.lock().cancel.is_some()
    }

    /// Record an application-defined sample.
    pub fn record_custom_metric(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.core.record_custom(name, value, tags);
    }

    /// Run one flush cycle immediately, outside the periodic cadence.
    pub async fn flush_now(&self) -> FlushOutcome {
        flush_once(&self.core, self.sink.as_ref()).await
    }

    /// Run one snapshot collection cycle immediately.
    pub async fn collect_now(&self, probe: &mut SystemProbe) -> SystemSnapshot {
        let (store, cache) = self.core.stat_sources();
        collect_once(&self.core, probe, store, cache).await
    }

    /// Drain-then-stop: stop periodic triggers, then flush the buffer
    /// best-effort within the configured shutdown timeout.
    pub async fn shutdown(&self) -> FlushOutcome {
        self.stop().await;

        let grace = self.core.config.engine.shutdown_timeout;
        let core = Arc::clone(&self.core);
        let sink = Arc::clone(&self.sink);

        let final_flush = async move {
            let mut total = FlushOutcome::default();
            loop {
                let outcome = flush_once(&core, sink.as_ref()).await;
                let exhausted = outcome.drained == 0;
                let sink_failing = outcome.requeued > 0;
                total.absorb(&outcome);
                if exhausted || sink_failing {
                    break;
                }
            }
            total
        };

        match timeout(grace, final_flush).await {
            Ok(total) => {
                info!(
                    persisted = total.persisted,
                    requeued = total.requeued,
                    remaining = self.core.buffer.len(),
                    "shutdown flush complete"
                );
                total
            }
            Err(_) => {
                warn!(
                    remaining = self.core.buffer.len(),
                    "shutdown flush timed out, records remain buffered"
                );
                FlushOutcome::default()
            }
        }
    }

    // ---- reporting API -----------------------------------------------------

    /// Top slow operation groups over the configured trailing window,
    /// ordered by mean execution time descending. Falls back to the
    /// in-memory rolling aggregates when the sink has no history.
    pub async fn get_slow_operations(&self, limit: usize) -> Vec<SlowOperationGroup> {
        let since = Utc::now() - chrono_window(self.core.config.reporting.slow_ops_window);
        let records = match self.sink.query_metrics_since(since).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "sink unavailable for slow-operation report, using in-memory view");
                return self.core.slow_groups_from_memory(limit);
            }
        };

        let groups = group_slow_operations(&records, limit);
        if groups.is_empty() {
            return self.core.slow_groups_from_memory(limit);
        }
        groups
    }

    /// Hourly trend buckets over the requested trailing window.
    pub async fn get_trends(&self, hours: u32) -> Vec<TrendBucket> {
        let since = Utc::now() - chrono::Duration::hours(i64::from(hours));
        let records = match self.sink.query_metrics_since(since).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "sink unavailable for trend report");
                return Vec::new();
            }
        };
        bucket_trends(&records)
    }

    /// Health summary: latest snapshot, alerts from the last hour, rolling
    /// counters, and buffer occupancy.
    pub fn get_health_summary(&self) -> HealthSummary {
        let recent_alerts = self.core.alerts.recent(Duration::from_secs(3_600));
        let status = if recent_alerts.iter().any(Alert::is_critical) {
            HealthStatus::Critical
        } else if !recent_alerts.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthSummary {
            status,
            generated_at: Utc::now(),
            snapshot: self.core.latest_snapshot(),
            recent_alerts,
            app: self.core.app_stats(),
            buffer: self.core.buffer.stats(),
        }
    }
}

// ============================================================================
// SECTION 20: PHASE 4 TESTS
// ============================================================================

#[cfg(test)]
mod phase4_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct NullStore;

    #[async_trait]
    impl RelationalClient for NullStore {
        async fn execute(
            &self,
            _text: &str,
            _params: &[JsonValue],
        ) -> Result<QueryOutcome, StoreError> {
            Ok(QueryOutcome::with_count(1))
        }

        async fn session_stats(&self) -> Result<StoreSessionStats, StoreError> {
            Ok(StoreSessionStats { active_sessions: 1, blocks_hit: 0, blocks_read: 0 })
        }
    }

    struct NullCache;

    #[async_trait]
    impl CacheClient for NullCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Ok(None)
        }
        async fn set(&self, _k: &str, _v: &str, _ttl: Option<Duration>) -> Result<(), CacheError> {
            Ok(())
        }
        async fn del(&self, _key: &str) -> Result<u64, CacheError> {
            Ok(0)
        }
        async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
            Ok(false)
        }
        async fn incr(&self, _key: &str, by: i64) -> Result<i64, CacheError> {
            Ok(by)
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, CacheError> {
            Ok(false)
        }
        async fn info(&self) -> Result<String, CacheError> {
            Ok("keyspace_hits:0\nkeyspace_misses:0\n".into())
        }
    }

    fn monitor() -> (PerformanceMonitor, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let monitor = PerformanceMonitor::new(MonitorConfig::default(), sink.clone()).unwrap();
        (monitor, sink)
    }

    fn sampled_record(text: &str, ms: f64, hours_ago: i64) -> QueryExecutionRecord {
        let mut config = ClassifierConfig::default();
        config.sampling_rate = 1.0;
        let classifier = QueryClassifier::new(&config).unwrap();
        let mut record =
            classifier.build_query_record(Uuid::new_v4(), text, ms, 1, false, None);
        record.observed_at = Utc::now() - chrono::Duration::hours(hours_ago);
        record
    }

    // ---- reporting aggregation --------------------------------------------

    #[test]
    fn slow_groups_order_by_mean_descending_and_truncate() {
        let records = vec![
            sampled_record("SELECT a FROM t1 WHERE id = $1", 1_200.0, 0),
            sampled_record("SELECT a FROM t1 WHERE id = $2", 1_400.0, 0),
            sampled_record("SELECT b FROM t2 WHERE id = $1", 4_000.0, 0),
            sampled_record("SELECT c FROM t3 WHERE id = $1", 2_000.0, 0),
            sampled_record("SELECT fast FROM t4", 10.0, 0),
        ];

        let groups = group_slow_operations(&records, 2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].normalized_text, "SELECT b FROM t2 WHERE id = ?");
        assert!((groups[0].mean_time_ms - 4_000.0).abs() < f64::EPSILON);
        assert_eq!(groups[1].normalized_text, "SELECT c FROM t3 WHERE id = ?");

        // The t1 shape aggregated both executions but lost the top-2 cut.
        let all = group_slow_operations(&records, 10);
        assert_eq!(all.len(), 3);
        let t1 = all.iter().find(|g| g.normalized_text.contains("t1")).unwrap();
        assert_eq!(t1.count, 2);
        assert!((t1.mean_time_ms - 1_300.0).abs() < f64::EPSILON);
        assert_eq!(t1.max_time_ms, 1_400.0);
        assert!(t1.sample_text.is_some());
    }

    #[test]
    fn trend_buckets_split_by_hour_ascending() {
        let records = vec![
            sampled_record("SELECT a FROM t", 100.0, 2),
            sampled_record("SELECT a FROM t", 300.0, 2),
            sampled_record("SELECT a FROM t", 2_000.0, 0),
        ];

        let buckets = bucket_trends(&records);
        assert_eq!(buckets.len(), 2);
        assert!(buckets[0].bucket_start < buckets[1].bucket_start);
        assert_eq!(buckets[0].count, 2);
        assert!((buckets[0].mean_time_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(buckets[0].slow_count, 0);
        assert_eq!(buckets[1].count, 1);
        assert_eq!(buckets[1].slow_count, 1);
    }

    #[test]
    fn empty_input_yields_empty_reports() {
        assert!(group_slow_operations(&[], 10).is_empty());
        assert!(bucket_trends(&[]).is_empty());
    }

    // ---- reporting through the monitor ------------------------------------

    #[tokio::test]
    async fn reports_tolerate_an_empty_sink() {
        let (monitor, _sink) = monitor();
        assert!(monitor.get_slow_operations(10).await.is_empty());
        assert!(monitor.get_trends(24).await.is_empty());

        let health = monitor.get_health_summary();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.snapshot.is_none());
        assert!(health.recent_alerts.is_empty());
        assert_eq!(health.app.total_ops, 0);
    }

    #[tokio::test]
    async fn slow_operations_read_from_the_sink_after_flush() {
        let (monitor, _sink) = monitor();
        let outcome = QueryOutcome::with_count(1);
        monitor.core().record_query("SELECT x FROM big WHERE y = $1", 1_800.0, Ok(&outcome));
        monitor.core().record_query("SELECT x FROM big WHERE y = $2", 2_200.0, Ok(&outcome));
        monitor.flush_now().await;

        let groups = monitor.get_slow_operations(5).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 2);
        assert!((groups[0].mean_time_ms - 2_000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn slow_operations_fall_back_to_memory_before_flush() {
        let (monitor, _sink) = monitor();
        let outcome = QueryOutcome::with_count(1);
        monitor.core().record_query("SELECT x FROM big WHERE y = $1", 1_800.0, Ok(&outcome));

        // Nothing flushed yet: the sink is empty but the rolling aggregates
        // already know the shape.
        let groups = monitor.get_slow_operations(5).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].normalized_text, "SELECT x FROM big WHERE y = ?");
    }

    #[tokio::test]
    async fn trends_read_from_the_sink() {
        let (monitor, _sink) = monitor();
        let outcome = QueryOutcome::with_count(1);
        monitor.core().record_query("SELECT 1", 50.0, Ok(&outcome));
        monitor.core().record_query("SELECT 1", 150.0, Ok(&outcome));
        monitor.flush_now().await;

        let buckets = monitor.get_trends(1).await;
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 2);
    }

    #[tokio::test]
    async fn health_reflects_recent_critical_alerts() {
        let (monitor, _sink) = monitor();
        let outcome = QueryOutcome::with_count(1);
        // 2.5s against the 1s threshold: critical severity.
        monitor.core().record_query("SELECT 1", 2_500.0, Ok(&outcome));

        let health = monitor.get_health_summary();
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.recent_alerts.len(), 1);
        assert_eq!(health.app.slow_ops, 1);
    }

    #[tokio::test]
    async fn custom_metrics_flow_to_keyed_storage() {
        let (monitor, sink) = monitor();
        monitor.record_custom_metric("scrape.duration_ms", 123.0, &[("source", "listings")]);
        let outcome = monitor.flush_now().await;
        assert_eq!(outcome.persisted, 1);

        let entries = sink.keyed_entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].0.starts_with("vigil:custom:"));
        assert_eq!(entries[0].2, Duration::from_secs(DEFAULT_CACHE_METRIC_TTL_SECS));
    }

    // ---- lifecycle ---------------------------------------------------------

    #[tokio::test]
    async fn initialize_rejects_a_second_call() {
        let (monitor, _sink) = monitor();
        monitor.initialize(NullStore, NullCache).unwrap();
        let second = monitor.initialize(NullStore, NullCache);
        assert!(matches!(second, Err(VigilError::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn initialize_rejects_pre_wrapped_clients() {
        let (monitor, _sink) = monitor();
        let (store, _cache) = monitor.initialize(NullStore, NullCache).unwrap();

        let (other, _sink2) = {
            let sink = Arc::new(MemorySink::new());
            (PerformanceMonitor::new(MonitorConfig::default(), sink.clone()).unwrap(), sink)
        };
        let result = other.initialize(store, NullCache);
        assert!(matches!(result, Err(VigilError::AlreadyInstrumented(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_flush_persists_buffered_records() {
        let (monitor, sink) = monitor();
        let outcome = QueryOutcome::with_count(1);
        monitor.core().record_query("SELECT 1", 5.0, Ok(&outcome));

        monitor.start();
        assert!(monitor.is_running());

        // One flush interval passes (auto-advanced virtual time).
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(sink.query_records().len(), 1);

        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn shutdown_drains_the_buffer() {
        let (monitor, sink) = monitor();
        let outcome = QueryOutcome::with_count(1);
        for _ in 0..250 {
            monitor.core().record_query("SELECT 1", 5.0, Ok(&outcome));
        }
        monitor.start();

        let total = monitor.shutdown().await;
        // 250 records at a batch size of 100: three final flush cycles.
        assert_eq!(total.persisted, 250);
        assert!(monitor.core().buffer.is_empty());
        assert_eq!(sink.query_records().len(), 250);
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn shutdown_with_failing_sink_keeps_records_buffered() {
        let (monitor, sink) = monitor();
        sink.set_fail_queries(true);
        let outcome = QueryOutcome::with_count(1);
        for _ in 0..10 {
            monitor.core().record_query("SELECT 1", 5.0, Ok(&outcome));
        }

        let total = monitor.shutdown().await;
        assert_eq!(total.persisted, 0);
        assert_eq!(total.requeued, 10);
        assert_eq!(monitor.core().buffer.len(), 10);
    }

    #[tokio::test]
    async fn wrapped_clients_feed_the_collector_sections() {
        let (monitor, _sink) = monitor();
        let (_store, _cache) = monitor.initialize(NullStore, NullCache).unwrap();

        let mut probe = SystemProbe::new();
        let snapshot = monitor.collect_now(&mut probe).await;
        assert!(snapshot.store.is_some());
        assert!(snapshot.cache.is_some());
        assert_eq!(snapshot.store.as_ref().unwrap().active_sessions, 1);
    }
}

// ============================================================================
// SECTION 21: CLI & MAIN ENTRY POINT
// ============================================================================
// The `vigil` binary: validate or generate configuration, print version
// information, or drive the engine against in-process demo clients: either
// a quick selftest or a continuous demo run. Production deployments embed
// the library and bring their own clients and sink.
// ============================================================================

use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// 21.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Vigil Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    author = "Vigil Team",
    version,
    about = "Storage-layer performance monitoring and alerting engine",
    long_about = "Vigil transparently instruments relational queries and cache \
                  commands, buffers and batch-persists the resulting metrics, \
                  snapshots system health on an independent cadence, and raises \
                  threshold alerts to typed subscribers."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "vigil.toml", env = "VIGIL_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "VIGIL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine against demo clients until interrupted
    Run {
        /// Stop after this many seconds (default: until ctrl-c)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,

    /// Exercise the full pipeline once and print the health summary
    Selftest,
}

// ----------------------------------------------------------------------------
// 21.2 Demo Clients
// ----------------------------------------------------------------------------

/// In-process relational client for the demo/selftest paths.
#[derive(Debug, Default)]
pub struct DemoStore;

#[async_trait]
impl RelationalClient for DemoStore {
    async fn execute(&self, _text: &str, _params: &[JsonValue]) -> Result<QueryOutcome, StoreError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(QueryOutcome::with_count(1))
    }

    async fn session_stats(&self) -> Result<StoreSessionStats, StoreError> {
        Ok(StoreSessionStats { active_sessions: 1, blocks_hit: 4_200, blocks_read: 800 })
    }
}

/// In-process cache client for the demo/selftest paths.
#[derive(Debug, Default)]
pub struct DemoCache {
    data: DashMap<String, String>,
    hits: AtomicU64,
    misses: AtomicU64,
    commands: AtomicU64,
}

#[async_trait]
impl CacheClient for DemoCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.commands.fetch_add(1, AtomicOrdering::Relaxed);
        match self.data.get(key) {
            Some(value) => {
                self.hits.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(Some(value.clone()))
            }
            None => {
                self.misses.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, _ttl: Option<Duration>) -> Result<(), CacheError> {
        self.commands.fetch_add(1, AtomicOrdering::Relaxed);
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64, CacheError> {
        self.commands.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(u64::from(self.data.remove(key).is_some()))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.commands.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(self.data.contains_key(key))
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        self.commands.fetch_add(1, AtomicOrdering::Relaxed);
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| "0".to_string());
        let current: i64 = entry.value().parse().unwrap_or(0);
        let next = current + by;
        *entry.value_mut() = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, _ttl: Duration) -> Result<bool, CacheError> {
        self.commands.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(self.data.contains_key(key))
    }

    async fn info(&self) -> Result<String, CacheError> {
        Ok(format!(
            "# Clients\nconnected_clients:1\n# Memory\nused_memory:{}\n# Stats\n\
             total_commands_processed:{}\nkeyspace_hits:{}\nkeyspace_misses:{}\n\
             uptime_in_seconds:1\n",
            self.data.len() * 64,
            self.commands.load(AtomicOrdering::Relaxed),
            self.hits.load(AtomicOrdering::Relaxed),
            self.misses.load(AtomicOrdering::Relaxed),
        ))
    }
}

// ----------------------------------------------------------------------------
// 21.3 Demo Workload
// ----------------------------------------------------------------------------

/// Drive a small mixed workload through the instrumented clients.
async fn demo_workload<S, C>(store: &InstrumentedStore<S>, cache: &InstrumentedCache<C>, round: u64)
where
    S: RelationalClient + 'static,
    C: CacheClient + 'static,
{
    let _ = store.execute("SELECT id, name FROM listings WHERE id = $1", &[json!(round)]).await;
    let _ = store
        .execute("SELECT * FROM listings WHERE title LIKE '%bmw%'", &[])
        .await;
    let _ = cache.set(&format!("listing:{}", round), "cached", Some(Duration::from_secs(60))).await;
    let _ = cache.get(&format!("listing:{}", round)).await;
    let _ = cache.get("listing:missing").await;
}

/// Build a monitor wired to demo clients and an in-memory sink.
fn demo_monitor(
    config: MonitorConfig,
) -> VigilResult<(PerformanceMonitor, InstrumentedStore<DemoStore>, InstrumentedCache<DemoCache>)> {
    let sink = Arc::new(MemorySink::new());
    let monitor = PerformanceMonitor::new(config, sink)?;
    let (store, cache) = monitor.initialize(DemoStore, DemoCache::default())?;
    monitor.on_alert(|alert| {
        warn!(
            kind = %alert.kind,
            severity = %alert.severity,
            observed = alert.observed_value,
            threshold = alert.threshold,
            "ALERT: {}",
            alert.message
        );
    });
    Ok((monitor, store, cache))
}

/// Run the engine with demo traffic until ctrl-c or the duration elapses.
async fn run_demo(config: MonitorConfig, duration: Option<u64>) -> AnyhowResult<()> {
    let (monitor, store, cache) = demo_monitor(config)?;
    monitor.start();
    info!("engine running with demo clients, ctrl-c to stop");

    let deadline = duration.map(Duration::from_secs);
    let started = Instant::now();
    let mut round: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                round += 1;
                demo_workload(&store, &cache, round).await;
                if deadline.map_or(false, |d| started.elapsed() >= d) {
                    break;
                }
            }
        }
    }

    let flushed = monitor.shutdown().await;
    info!(persisted = flushed.persisted, "engine stopped");

    let summary = monitor.get_health_summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Exercise the full pipeline once: traffic, snapshot, flush, reports.
async fn selftest(config: MonitorConfig) -> AnyhowResult<()> {
    let (monitor, store, cache) = demo_monitor(config)?;

    for round in 0..20 {
        demo_workload(&store, &cache, round).await;
    }
    // A synthetic slow observation exercises the alert path without a real
    // multi-second query.
    let outcome = QueryOutcome::with_count(1);
    monitor.core().record_query("SELECT * FROM listings ORDER BY RANDOM()", 2_500.0, Ok(&outcome));
    monitor.record_custom_metric("selftest.rounds", 20.0, &[("mode", "selftest")]);

    let mut probe = SystemProbe::new();
    let snapshot = monitor.collect_now(&mut probe).await;
    info!(
        cpu = snapshot.cpu.as_ref().map(|c| c.usage_pct),
        cache_hit_rate = snapshot.cache.as_ref().map(|c| c.hit_rate_pct()),
        "snapshot collected"
    );

    let mut flushed = FlushOutcome::default();
    loop {
        let outcome = monitor.flush_now().await;
        let done = outcome.drained == 0 || outcome.requeued > 0;
        flushed.absorb(&outcome);
        if done {
            break;
        }
    }
    anyhow::ensure!(flushed.requeued == 0, "selftest flush requeued records");

    let slow = monitor.get_slow_operations(5).await;
    anyhow::ensure!(!slow.is_empty(), "selftest expected at least one slow group");

    let summary = monitor.get_health_summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("{}", serde_json::to_string_pretty(&slow)?);

    info!("selftest passed");
    Ok(())
}

// ----------------------------------------------------------------------------
// 21.4 Main
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        MonitorConfig::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        MonitorConfig::default()
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    match cli.command.unwrap_or(Commands::Selftest) {
        Commands::Version => {
            println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
        }
        Commands::Validate { verbose } => {
            let loaded = MonitorConfig::load(&cli.config)
                .with_context(|| format!("validating {}", cli.config.display()))?;
            println!("configuration OK: {}", cli.config.display());
            if verbose {
                println!("{}", toml::to_string_pretty(&loaded)?);
            }
        }
        Commands::GenerateConfig { output } => {
            let rendered = MonitorConfig::generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("wrote {}", path.display());
                }
                None => print!("{}", rendered),
            }
        }
        Commands::Selftest => {
            init_logging(&config.logging)?;
            selftest(config).await?;
        }
        Commands::Run { duration } => {
            init_logging(&config.logging)?;
            run_demo(config, duration).await?;
        }
    }

    Ok(())
}
