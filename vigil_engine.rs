//! # Vigil Engine - Windowed Telemetry for the OPC UA Dashboard
//!
//! The telemetry core behind the acquisition dashboard: a fixed-size,
//! continuously-evicting bucketed time series with O(1) ingestion, bounded
//! memory, nearest-rank percentiles and periodic sampling that survives
//! failed ticks.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              VIGIL ENGINE                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SCHEDULER / INBOUND EVENTS → BUCKET STORE (+ RETENTION) → AGGREGATOR → API │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One generic engine ([`BucketStore`] behind a [`TimeWindow`]) is specialized
//! three ways:
//!
//! - [`HostMonitor`]: periodic host samples (CPU, memory, disks, network,
//!   process, system) plus latency to an upstream dependency
//! - [`HttpMetrics`]: completed HTTP requests with duration percentiles and
//!   status/method/route breakdowns
//! - [`InsertRateRegistry`]: per-client insert counters
//!
//! [`TelemetryEngine`] is the composition root that owns all three.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use futures::FutureExt;
use tokio::net::TcpStream as TokioTcpStream;
use tokio::process::Command as TokioCommand;
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::json;

// ----------------------------------------------------------------------------
// String, Memory & Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Async Traits, System Information
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sysinfo::{Disks, Networks, Pid, System};

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use once_cell::sync::Lazy;
use regex::Regex;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "vigil-engine";
pub const ENGINE_FULL_NAME: &str = "Vigil Telemetry Engine";

// ----------------------------------------------------------------------------
// Host Sampling
// ----------------------------------------------------------------------------

/// Default cadence of host samples (milliseconds)
pub const DEFAULT_HOST_SAMPLE_INTERVAL_MS: u64 = 5_000;

/// Default host history kept in memory (milliseconds) - one hour
pub const DEFAULT_HOST_RETENTION_MS: u64 = 3_600_000;

/// Window used for latency percentiles in the host snapshot (milliseconds)
pub const DEFAULT_HOST_SNAPSHOT_WINDOW_MS: u64 = 300_000;

/// Minimum allowed scheduler cadence (milliseconds)
pub const MIN_SAMPLE_INTERVAL_MS: u64 = 100;

// ----------------------------------------------------------------------------
// HTTP Request Metrics
// ----------------------------------------------------------------------------

/// Default bucket span for request metrics (milliseconds)
pub const DEFAULT_HTTP_BUCKET_SPAN_MS: u64 = 10_000;

/// Default request history kept in memory (milliseconds) - one hour
pub const DEFAULT_HTTP_RETENTION_MS: u64 = 3_600_000;

/// Default window for request snapshots (milliseconds) - five minutes
pub const DEFAULT_HTTP_WINDOW_MS: u64 = 300_000;

/// Status codes at or above this value count as errors
pub const HTTP_ERROR_STATUS_FLOOR: u16 = 500;

// ----------------------------------------------------------------------------
// Insert Rate Counters
// ----------------------------------------------------------------------------

/// Default window of a per-client insert counter (milliseconds)
pub const DEFAULT_INSERT_WINDOW_MS: u64 = 60_000;

/// Default number of points a per-client counter keeps across its window
pub const DEFAULT_INSERT_POINTS: u32 = 60;

// ----------------------------------------------------------------------------
// Buckets, Samples & Breakdowns
// ----------------------------------------------------------------------------

/// Raw samples kept per bucket before FIFO replacement starts
pub const DEFAULT_SAMPLE_CAP: usize = 2_000;

/// Upper bound for a configured per-bucket sample cap
pub const MAX_SAMPLE_CAP: usize = 100_000;

/// Samples concatenated across buckets before percentiles become approximate
pub const WINDOW_SAMPLE_BOUND: usize = 20_000;

/// Default number of categories per breakdown in a snapshot
pub const DEFAULT_TOP_N: usize = 10;

/// Upper bound for a configured top-N limit
pub const MAX_TOP_N: usize = 1_000;

/// Milliseconds per minute, used for rate derivation
pub const MS_PER_MINUTE: f64 = 60_000.0;

// ----------------------------------------------------------------------------
// Latency Probing
// ----------------------------------------------------------------------------

/// Default upstream host probed for latency-to-dependency
pub const DEFAULT_PROBE_TARGET: &str = "8.8.8.8";

/// Well-known port used by the TCP fallback probe
pub const DEFAULT_PROBE_PORT: u16 = 443;

/// Default per-stage probe timeout (milliseconds)
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;

// ----------------------------------------------------------------------------
// Read API
// ----------------------------------------------------------------------------

/// Default listen address of the telemetry read API
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:8787";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Millisecond Wall-Clock Time
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000))
    }

    /// Current wall-clock time.
    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    #[inline]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_to_millis(duration)))
    }

    #[inline]
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_to_millis(duration)))
    }

    /// Duration elapsed between `earlier` and `self`, zero if `earlier` is later.
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration_to_millis(duration))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

/// Saturating conversion of a duration to whole milliseconds.
#[inline]
pub fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// ----------------------------------------------------------------------------
// 3.2 Clock - Injectable Time Source
// ----------------------------------------------------------------------------

/// Source of "now" for every write and read path.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Timestamp;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.as_millis()),
        }
    }

    pub fn set(&self, ts: Timestamp) {
        self.millis.store(ts.as_millis(), AtomicOrdering::Release);
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration_to_millis(duration), AtomicOrdering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Timestamp::EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(AtomicOrdering::Acquire))
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Construction-time errors are fatal. Probe and tick failures are contained
// where they happen; nothing below the scheduler boundary escapes it.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Tick failure: {0}")]
    Tick(#[from] TickFailure),

    #[error("Rejected observation: {0}")]
    Ingest(#[from] IngestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl EngineError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Config(_) => false,
            EngineError::Probe(_) => true,
            EngineError::Tick(_) => true,
            EngineError::Ingest(_) => true,
            EngineError::Io(_) => true,
            EngineError::Internal(_) => false,
            EngineError::ShuttingDown => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Probe(_) => "probe",
            EngineError::Tick(_) => "tick",
            EngineError::Ingest(_) => "ingest",
            EngineError::Io(_) => "io",
            EngineError::Internal(_) => "internal",
            EngineError::ShuttingDown => "shutdown",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
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
// 4.3 Probe Errors
// ----------------------------------------------------------------------------

/// Latency measurement failures. A failed probe renders as "latency unknown".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Probe of '{host}' timed out after {timeout_ms}ms")]
    Timeout { host: String, timeout_ms: u64 },

    #[error("Host '{host}' unreachable: {message}")]
    Unreachable { host: String, message: String },

    #[error("Probe transport '{transport}' unavailable: {message}")]
    Unsupported {
        transport: &'static str,
        message: String,
    },

    #[error("Probe transport '{transport}' returned an invalid reading: {message}")]
    InvalidReading {
        transport: &'static str,
        message: String,
    },
}

impl ProbeError {
    pub fn timeout(host: impl Into<String>, timeout: Duration) -> Self {
        ProbeError::Timeout {
            host: host.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn unreachable(host: impl Into<String>, message: impl Into<String>) -> Self {
        ProbeError::Unreachable {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout { .. })
    }

    /// Collapse a stage failure into one of the two terminal kinds a caller sees.
    fn into_terminal(self, host: &str) -> Self {
        match self {
            ProbeError::Timeout { .. } | ProbeError::Unreachable { .. } => self,
            other => ProbeError::unreachable(host, other.to_string()),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Tick Failures
// ----------------------------------------------------------------------------

/// Failure of one scheduled sampling tick. Caught and discarded by the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TickFailure {
    #[error("Sampler '{sampler}' failed: {message}")]
    SampleFailed { sampler: String, message: String },

    #[error("Sampler '{sampler}' panicked: {message}")]
    Panicked { sampler: String, message: String },

    #[error("Sampling task for '{sampler}' was cancelled")]
    Cancelled { sampler: String },
}

impl TickFailure {
    pub fn sample_failed(sampler: impl Into<String>, message: impl Into<String>) -> Self {
        TickFailure::SampleFailed {
            sampler: sampler.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Ingest Errors
// ----------------------------------------------------------------------------

/// Inbound observations rejected before they reach a bucket store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("Negative timestamp: {timestamp_ms}")]
    NegativeTimestamp { timestamp_ms: i64 },

    #[error("Non-finite value for '{field}'")]
    NonFinite { field: &'static str },

    #[error("Negative value for '{field}': {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("Timestamp {timestamp_ms} is ahead of the current bucket (now {now_ms})")]
    FutureTimestamp { timestamp_ms: i64, now_ms: i64 },

    #[error("Empty client key")]
    EmptyClientKey,
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for latency probes
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Result type of one sampling tick
pub type TickResult = Result<(), TickFailure>;

/// Render a caught panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file + VIGIL_* environment overrides via figment, humantime durations,
// validation before anything is constructed.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Host sampling
    #[serde(default)]
    pub host: HostMonitorConfig,

    /// HTTP request metrics
    #[serde(default)]
    pub http: HttpMetricsConfig,

    /// Per-client insert counters
    #[serde(default)]
    pub inserts: InsertRateConfig,

    /// Read API
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VIGIL_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.sample_interval < Duration::from_millis(MIN_SAMPLE_INTERVAL_MS) {
            return Err(ConfigError::invalid_value(
                "host.sample_interval",
                format!("must be at least {}ms", MIN_SAMPLE_INTERVAL_MS),
            ));
        }
        self.host.window_spec()?;
        if self.host.snapshot_window.is_zero() {
            return Err(ConfigError::invalid_value(
                "host.snapshot_window",
                "must be greater than zero",
            ));
        }
        if self.host.probe.timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "host.probe.timeout",
                "must be greater than zero",
            ));
        }
        if self.host.probe.enabled && self.host.probe.target.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "host.probe.target",
                "must name a host when probing is enabled",
            ));
        }

        self.http.window_spec()?;
        if self.http.top_n == 0 || self.http.top_n > MAX_TOP_N {
            return Err(ConfigError::invalid_value(
                "http.top_n",
                format!("must be between 1 and {}", MAX_TOP_N),
            ));
        }
        if self.http.default_window.is_zero() || self.http.default_window > self.http.retention {
            return Err(ConfigError::invalid_value(
                "http.default_window",
                "must be greater than zero and no longer than http.retention",
            ));
        }

        self.inserts.window_spec()?;

        if self.api.enabled && self.api.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "api.listen_addr",
                format!("'{}' is not a socket address", self.api.listen_addr),
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
        }
    }
}

fn default_instance_name() -> String {
    System::host_name().unwrap_or_else(|| ENGINE_NAME.to_string())
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Host Monitor Configuration
// ----------------------------------------------------------------------------

/// Host sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMonitorConfig {
    /// Sampling cadence; also the bucket span of the host series
    #[serde(default = "default_host_interval", with = "humantime_serde")]
    pub sample_interval: Duration,

    /// How much host history is kept
    #[serde(default = "default_host_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// Window used for latency percentiles in the snapshot
    #[serde(default = "default_host_snapshot_window", with = "humantime_serde")]
    pub snapshot_window: Duration,

    /// Latency-to-dependency probe
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl Default for HostMonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: default_host_interval(),
            retention: default_host_retention(),
            snapshot_window: default_host_snapshot_window(),
            probe: ProbeConfig::default(),
        }
    }
}

impl HostMonitorConfig {
    pub fn window_spec(&self) -> Result<WindowSpec, ConfigError> {
        WindowSpec::new(self.sample_interval, self.retention, DEFAULT_SAMPLE_CAP)
            .map_err(|e| prefix_field(e, "host"))
    }
}

fn default_host_interval() -> Duration {
    Duration::from_millis(DEFAULT_HOST_SAMPLE_INTERVAL_MS)
}

fn default_host_retention() -> Duration {
    Duration::from_millis(DEFAULT_HOST_RETENTION_MS)
}

fn default_host_snapshot_window() -> Duration {
    Duration::from_millis(DEFAULT_HOST_SNAPSHOT_WINDOW_MS)
}

/// Latency probe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Host whose round-trip time is reported
    #[serde(default = "default_probe_target")]
    pub target: String,

    /// Port of the TCP fallback probe
    #[serde(default = "default_probe_port")]
    pub port: u16,

    /// Per-stage timeout
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: default_probe_target(),
            port: default_probe_port(),
            timeout: default_probe_timeout(),
        }
    }
}

fn default_probe_target() -> String {
    DEFAULT_PROBE_TARGET.into()
}

fn default_probe_port() -> u16 {
    DEFAULT_PROBE_PORT
}

fn default_probe_timeout() -> Duration {
    Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS)
}

// ----------------------------------------------------------------------------
// 5.4 HTTP Metrics Configuration
// ----------------------------------------------------------------------------

/// Request metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpMetricsConfig {
    #[serde(default = "default_http_bucket_span", with = "humantime_serde")]
    pub bucket_span: Duration,

    #[serde(default = "default_http_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// Window used when a read does not name one
    #[serde(default = "default_http_window", with = "humantime_serde")]
    pub default_window: Duration,

    /// Duration samples kept per bucket
    #[serde(default = "default_sample_cap")]
    pub sample_cap: usize,

    /// Categories reported per breakdown
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for HttpMetricsConfig {
    fn default() -> Self {
        Self {
            bucket_span: default_http_bucket_span(),
            retention: default_http_retention(),
            default_window: default_http_window(),
            sample_cap: default_sample_cap(),
            top_n: default_top_n(),
        }
    }
}

impl HttpMetricsConfig {
    pub fn window_spec(&self) -> Result<WindowSpec, ConfigError> {
        WindowSpec::new(self.bucket_span, self.retention, self.sample_cap)
            .map_err(|e| prefix_field(e, "http"))
    }
}

fn default_http_bucket_span() -> Duration {
    Duration::from_millis(DEFAULT_HTTP_BUCKET_SPAN_MS)
}

fn default_http_retention() -> Duration {
    Duration::from_millis(DEFAULT_HTTP_RETENTION_MS)
}

fn default_http_window() -> Duration {
    Duration::from_millis(DEFAULT_HTTP_WINDOW_MS)
}

fn default_sample_cap() -> usize {
    DEFAULT_SAMPLE_CAP
}

fn default_top_n() -> usize {
    DEFAULT_TOP_N
}

// ----------------------------------------------------------------------------
// 5.5 Insert Counter Configuration
// ----------------------------------------------------------------------------

/// Per-client insert counters: `points` buckets spread over `window`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertRateConfig {
    #[serde(default = "default_insert_window", with = "humantime_serde")]
    pub window: Duration,

    #[serde(default = "default_insert_points")]
    pub points: u32,
}

impl Default for InsertRateConfig {
    fn default() -> Self {
        Self {
            window: default_insert_window(),
            points: default_insert_points(),
        }
    }
}

impl InsertRateConfig {
    pub fn window_spec(&self) -> Result<WindowSpec, ConfigError> {
        if self.points == 0 {
            return Err(ConfigError::invalid_value("inserts.points", "must be at least 1"));
        }
        let span = self.window / self.points;
        WindowSpec::new(span, self.window, 1).map_err(|e| prefix_field(e, "inserts"))
    }
}

fn default_insert_window() -> Duration {
    Duration::from_millis(DEFAULT_INSERT_WINDOW_MS)
}

fn default_insert_points() -> u32 {
    DEFAULT_INSERT_POINTS
}

// ----------------------------------------------------------------------------
// 5.6 API Configuration
// ----------------------------------------------------------------------------

/// Telemetry read API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_api_addr")]
    pub listen_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_api_addr(),
        }
    }
}

fn default_api_addr() -> String {
    DEFAULT_API_ADDR.into()
}

// ----------------------------------------------------------------------------
// 5.7 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
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

fn prefix_field(error: ConfigError, section: &str) -> ConfigError {
    match error {
        ConfigError::InvalidValue { field, message } => ConfigError::InvalidValue {
            field: format!("{}.{}", section, field),
            message,
        },
        other => other,
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> EngineResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "vigil::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: BUCKET CLOCK & PERCENTILE ESTIMATION
// ============================================================================
// Pure leaf functions. Index math uses Euclidean division so floor() holds
// for every span >= 1ms.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Bucket Clock
// ----------------------------------------------------------------------------

/// Maps timestamps onto fixed-span bucket indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketClock {
    span_ms: i64,
}

impl BucketClock {
    /// Create a clock for the given span. Spans below one millisecond are rejected.
    pub fn new(span_ms: i64) -> Result<Self, ConfigError> {
        if span_ms < 1 {
            return Err(ConfigError::invalid_value(
                "bucket_span",
                format!("must be at least 1ms, got {}ms", span_ms),
            ));
        }
        Ok(Self { span_ms })
    }

    #[inline]
    pub const fn span_ms(&self) -> i64 {
        self.span_ms
    }

    #[inline]
    pub fn span(&self) -> Duration {
        Duration::from_millis(self.span_ms as u64)
    }

    /// `floor(ts / span)`
    #[inline]
    pub const fn index_for(timestamp_ms: i64, span_ms: i64) -> i64 {
        timestamp_ms.div_euclid(span_ms)
    }

    /// `index * span`
    #[inline]
    pub const fn start_for(index: i64, span_ms: i64) -> i64 {
        index.saturating_mul(span_ms)
    }

    #[inline]
    pub fn index_of(&self, ts: Timestamp) -> i64 {
        Self::index_for(ts.as_millis(), self.span_ms)
    }

    #[inline]
    pub fn start_of(&self, index: i64) -> Timestamp {
        Timestamp::from_millis(Self::start_for(index, self.span_ms))
    }

    /// Round a timestamp down to the start of its bucket.
    #[inline]
    pub fn align(&self, ts: Timestamp) -> Timestamp {
        self.start_of(self.index_of(ts))
    }
}

// ----------------------------------------------------------------------------
// 7.2 Percentile Estimation
// ----------------------------------------------------------------------------

/// Nearest-rank percentile of an unsorted sample set.
///
/// Sorts a copy (the input is never mutated), picks `floor(p/100 * (n-1))`
/// and returns that observed value. `p` is clamped to `[0, 100]`; an empty
/// input yields `0.0`.
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    nearest_rank(&sorted, p)
}

/// Nearest-rank lookup on an already sorted slice.
fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 100.0) };
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Summary of a sample set computed from a single sort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileSet {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl PercentileSet {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable_by(f64::total_cmp);
        let sum: f64 = sorted.iter().sum();

        Self {
            count: sorted.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: sum / sorted.len() as f64,
            p50: nearest_rank(&sorted, 50.0),
            p95: nearest_rank(&sorted, 95.0),
            p99: nearest_rank(&sorted, 99.0),
        }
    }
}

// ============================================================================
// SECTION 8: BUCKET STORE & RETENTION
// ============================================================================
// Ordered map index -> bucket. Buckets are created lazily by the first write
// in their span and evicted by the first write that finds them behind the
// retention horizon. The store itself is not synchronized; see TimeWindow.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Window Specification
// ----------------------------------------------------------------------------

/// Validated span/retention/cap triple shared by a store and its readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    clock: BucketClock,
    retention_ms: i64,
    sample_cap: usize,
}

impl WindowSpec {
    pub fn new(
        bucket_span: Duration,
        retention: Duration,
        sample_cap: usize,
    ) -> Result<Self, ConfigError> {
        Self::from_millis(
            duration_to_millis(bucket_span),
            duration_to_millis(retention),
            sample_cap,
        )
    }

    pub fn from_millis(
        span_ms: i64,
        retention_ms: i64,
        sample_cap: usize,
    ) -> Result<Self, ConfigError> {
        let clock = BucketClock::new(span_ms)?;
        if retention_ms < span_ms {
            return Err(ConfigError::invalid_value(
                "retention",
                format!(
                    "must cover at least one bucket span ({}ms), got {}ms",
                    span_ms, retention_ms
                ),
            ));
        }
        if sample_cap == 0 || sample_cap > MAX_SAMPLE_CAP {
            return Err(ConfigError::invalid_value(
                "sample_cap",
                format!("must be between 1 and {}, got {}", MAX_SAMPLE_CAP, sample_cap),
            ));
        }
        Ok(Self {
            clock,
            retention_ms,
            sample_cap,
        })
    }

    #[inline]
    pub fn clock(&self) -> BucketClock {
        self.clock
    }

    #[inline]
    pub fn span_ms(&self) -> i64 {
        self.clock.span_ms()
    }

    #[inline]
    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    #[inline]
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms as u64)
    }

    #[inline]
    pub fn sample_cap(&self) -> usize {
        self.sample_cap
    }

    /// `ceil(retention / span) + 1`
    pub fn max_live_buckets(&self) -> usize {
        let span = self.span_ms();
        ((self.retention_ms + span - 1) / span) as usize + 1
    }

    /// Oldest bucket start still inside the retention horizon at `now`.
    #[inline]
    fn horizon_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.retention_ms)
    }
}

// ----------------------------------------------------------------------------
// 8.2 Categories & Observations
// ----------------------------------------------------------------------------

/// Breakdown dimension of a category count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Status,
    Method,
    Route,
    Tag,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Status => "status",
            Dimension::Method => "method",
            Dimension::Route => "route",
            Dimension::Tag => "tag",
        }
    }
}

impl Display for Dimension {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One category key inside a dimension, e.g. `(Status, "503")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CategoryKey {
    pub dimension: Dimension,
    pub key: CompactString,
}

impl CategoryKey {
    pub fn new(dimension: Dimension, key: impl Into<CompactString>) -> Self {
        Self {
            dimension,
            key: key.into(),
        }
    }

    pub fn status(code: u16) -> Self {
        Self::new(Dimension::Status, compact_str::format_compact!("{}", code))
    }

    pub fn method(method: &str) -> Self {
        Self::new(Dimension::Method, CompactString::from(method.to_ascii_uppercase()))
    }

    pub fn route(route: &str) -> Self {
        Self::new(Dimension::Route, route)
    }
}

/// Everything one inbound event contributes to its bucket.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub count: u64,
    pub is_error: bool,
    pub sample: Option<f64>,
    pub categories: SmallVec<[CategoryKey; 4]>,
}

impl Observation {
    pub fn single() -> Self {
        Self {
            count: 1,
            ..Self::default()
        }
    }

    pub fn with_sample(mut self, value: f64) -> Self {
        self.sample = Some(value);
        self
    }

    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    pub fn with_category(mut self, category: CategoryKey) -> Self {
        self.categories.push(category);
        self
    }
}

// ----------------------------------------------------------------------------
// 8.3 Bucket - The Atomic Aggregation Unit
// ----------------------------------------------------------------------------

/// Aggregate of every observation whose timestamp falls in one span.
///
/// `payload` carries resource-specific state (the host monitor keeps its
/// latest sample there); counters and request metrics use `()`.
#[derive(Debug, Clone)]
pub struct Bucket<P = ()> {
    pub index: i64,
    pub start: Timestamp,
    pub count: u64,
    pub error_count: u64,
    pub samples: VecDeque<f64>,
    pub breakdowns: AHashMap<CategoryKey, u64>,
    pub payload: P,
}

impl<P: Default> Bucket<P> {
    fn new(index: i64, start: Timestamp) -> Self {
        Self {
            index,
            start,
            count: 0,
            error_count: 0,
            samples: VecDeque::new(),
            breakdowns: AHashMap::new(),
            payload: P::default(),
        }
    }
}

impl<P> Bucket<P> {
    /// Append a sample, dropping the oldest ones once `cap` is reached.
    #[inline]
    pub fn push_sample(&mut self, value: f64, cap: usize) {
        while self.samples.len() >= cap.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    #[inline]
    pub fn add(&mut self, n: u64, is_error: bool) {
        self.count = self.count.saturating_add(n);
        if is_error {
            self.error_count = self.error_count.saturating_add(n);
        }
    }

    #[inline]
    pub fn add_category(&mut self, category: CategoryKey, n: u64) {
        *self.breakdowns.entry(category).or_insert(0) += n;
    }

    pub fn category_count(&self, category: &CategoryKey) -> u64 {
        self.breakdowns.get(category).copied().unwrap_or(0)
    }

    /// Fold a complete observation into this bucket.
    pub fn apply(&mut self, observation: &Observation, cap: usize) {
        self.add(observation.count, observation.is_error);
        for category in &observation.categories {
            self.add_category(category.clone(), observation.count);
        }
        if let Some(value) = observation.sample {
            self.push_sample(value, cap);
        }
    }
}

// ----------------------------------------------------------------------------
// 8.4 Store Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub live_buckets: usize,
    pub buckets_created: u64,
    pub buckets_evicted: u64,
    /// Writes dropped because their bucket was already behind the horizon
    pub stale_writes: u64,
    /// Writes dropped because they were stamped past the current bucket
    pub future_writes: u64,
    /// Latest time the store has pruned against
    pub newest: Option<Timestamp>,
}

// ----------------------------------------------------------------------------
// 8.5 Bucket Store
// ----------------------------------------------------------------------------

/// Bounded, continuously evicting map from bucket index to [`Bucket`].
#[derive(Debug)]
pub struct BucketStore<P = ()> {
    spec: WindowSpec,
    buckets: BTreeMap<i64, Bucket<P>>,
    /// Latest "now" any write was resolved against
    high_water_ms: Option<i64>,
    created: u64,
    evicted: u64,
    stale_writes: u64,
    future_writes: u64,
}

impl<P: Default + Clone> BucketStore<P> {
    pub fn new(spec: WindowSpec) -> Self {
        Self {
            spec,
            buckets: BTreeMap::new(),
            high_water_ms: None,
            created: 0,
            evicted: 0,
            stale_writes: 0,
            future_writes: 0,
        }
    }

    #[inline]
    pub fn spec(&self) -> WindowSpec {
        self.spec
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Resolve the bucket for `ts`, creating it on first use.
    ///
    /// The write's own timestamp stands in for the current time, so a store
    /// used without a clock prunes against the newest timestamp seen.
    pub fn ensure(&mut self, ts: Timestamp) -> Option<&mut Bucket<P>> {
        self.ensure_at(ts, ts)
    }

    /// Resolve the bucket for `ts` as observed at `now`.
    ///
    /// Prunes against `now` (never moving backwards) before resolving. A
    /// write whose bucket lies behind the retention horizon, or ahead of the
    /// bucket holding `now`, is dropped (`None`), so the live-bucket bound
    /// holds after every write and a skewed timestamp cannot move the
    /// horizon.
    pub fn ensure_at(&mut self, ts: Timestamp, now: Timestamp) -> Option<&mut Bucket<P>> {
        let ts_ms = ts.as_millis();
        let now_ms = self
            .high_water_ms
            .map_or(now.as_millis(), |hw| hw.max(now.as_millis()));
        self.high_water_ms = Some(now_ms);
        self.prune(Timestamp::from_millis(now_ms));

        let clock = self.spec.clock();
        let index = clock.index_of(ts);
        if index > clock.index_of(Timestamp::from_millis(now_ms)) {
            self.future_writes += 1;
            trace!(
                target: "vigil::store",
                ts = ts_ms,
                now = now_ms,
                "Dropped write ahead of the current bucket"
            );
            return None;
        }

        let start = clock.start_of(index);
        if start.as_millis() < self.spec.horizon_ms(now_ms) {
            self.stale_writes += 1;
            trace!(
                target: "vigil::store",
                ts = ts_ms,
                now = now_ms,
                "Dropped write behind retention horizon"
            );
            return None;
        }

        let created = &mut self.created;
        Some(self.buckets.entry(index).or_insert_with(|| {
            *created += 1;
            Bucket::new(index, start)
        }))
    }

    /// Add `n` observations, optionally flagged as errors and categorized.
    pub fn increment(
        &mut self,
        ts: Timestamp,
        n: u64,
        category: Option<CategoryKey>,
        is_error: bool,
    ) -> bool {
        match self.ensure(ts) {
            Some(bucket) => {
                bucket.add(n, is_error);
                if let Some(category) = category {
                    bucket.add_category(category, n);
                }
                true
            }
            None => false,
        }
    }

    /// Append a raw value to the bucket's bounded sample buffer.
    pub fn append_sample(&mut self, ts: Timestamp, value: f64) -> bool {
        let cap = self.spec.sample_cap();
        match self.ensure(ts) {
            Some(bucket) => {
                bucket.push_sample(value, cap);
                true
            }
            None => false,
        }
    }

    /// Fold one complete observation into its bucket under a single lookup.
    pub fn record(&mut self, ts: Timestamp, observation: &Observation) -> bool {
        let cap = self.spec.sample_cap();
        match self.ensure(ts) {
            Some(bucket) => {
                bucket.apply(observation, cap);
                true
            }
            None => false,
        }
    }

    /// Mutate the payload of the bucket for `ts`.
    pub fn update_payload<F>(&mut self, ts: Timestamp, f: F) -> bool
    where
        F: FnOnce(&mut P),
    {
        match self.ensure(ts) {
            Some(bucket) => {
                f(&mut bucket.payload);
                true
            }
            None => false,
        }
    }

    /// Remove every bucket whose start lies before `now - retention`.
    ///
    /// Idempotent; in steady state at most one bucket leaves per call.
    pub fn prune(&mut self, now: Timestamp) -> usize {
        let horizon = self.spec.horizon_ms(now.as_millis());
        let mut removed = 0;
        while let Some(oldest) = self.buckets.first_entry() {
            if oldest.get().start.as_millis() >= horizon {
                break;
            }
            oldest.remove();
            removed += 1;
        }
        if removed > 0 {
            self.evicted += removed as u64;
            trace!(target: "vigil::store", removed, horizon, "Pruned buckets");
        }
        removed
    }

    pub fn get(&self, ts: Timestamp) -> Option<&Bucket<P>> {
        self.buckets.get(&self.spec.clock().index_of(ts))
    }

    /// Most recent bucket.
    pub fn latest(&self) -> Option<&Bucket<P>> {
        self.buckets.last_key_value().map(|(_, bucket)| bucket)
    }

    /// Copies of every bucket overlapping `[since, ..)`, oldest first.
    pub fn snapshot_window(&self, since: Timestamp) -> Vec<Bucket<P>> {
        let span = self.spec.span_ms();
        self.buckets
            .values()
            .skip_while(|bucket| bucket.start.as_millis().saturating_add(span) < since.as_millis())
            .cloned()
            .collect()
    }

    /// Live bucket indices, ascending.
    pub fn indices(&self) -> Vec<i64> {
        self.buckets.keys().copied().collect()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            live_buckets: self.buckets.len(),
            buckets_created: self.created,
            buckets_evicted: self.evicted,
            stale_writes: self.stale_writes,
            future_writes: self.future_writes,
            newest: self.high_water_ms.map(Timestamp::from_millis),
        }
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.high_water_ms = None;
    }
}

// ============================================================================
// SECTION 9: TIME WINDOW & SNAPSHOT AGGREGATION
// ============================================================================
// A TimeWindow is the shareable engine instance: one BucketStore behind a
// mutex plus the clock that stamps writes. Writes never sort; reads copy the
// buckets out of the lock and fold them.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Time Window
// ----------------------------------------------------------------------------

/// A named, clock-driven bucket store safe to share between threads.
#[derive(Debug)]
pub struct TimeWindow<P = ()> {
    name: CompactString,
    spec: WindowSpec,
    store: Mutex<BucketStore<P>>,
    clock: SharedClock,
}

impl<P: Default + Clone + Send> TimeWindow<P> {
    pub fn new(name: impl Into<CompactString>, spec: WindowSpec, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            spec,
            store: Mutex::new(BucketStore::new(spec)),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[inline]
    pub fn spec(&self) -> WindowSpec {
        self.spec
    }

    #[inline]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Count `n` observations at the current time.
    pub fn increment(&self, n: u64, category: Option<CategoryKey>, is_error: bool) -> bool {
        self.increment_at(self.now(), n, category, is_error)
    }

    pub fn increment_at(
        &self,
        ts: Timestamp,
        n: u64,
        category: Option<CategoryKey>,
        is_error: bool,
    ) -> bool {
        self.with_bucket_at(ts, |bucket, _| {
            bucket.add(n, is_error);
            if let Some(category) = category {
                bucket.add_category(category, n);
            }
        })
        .is_some()
    }

    pub fn append_sample(&self, value: f64) -> bool {
        self.append_sample_at(self.now(), value)
    }

    pub fn append_sample_at(&self, ts: Timestamp, value: f64) -> bool {
        self.with_bucket_at(ts, |bucket, cap| bucket.push_sample(value, cap))
            .is_some()
    }

    pub fn record_at(&self, ts: Timestamp, observation: &Observation) -> bool {
        self.with_bucket_at(ts, |bucket, cap| bucket.apply(observation, cap))
            .is_some()
    }

    /// Run `f` against the bucket for `ts` while holding the lock once.
    /// The closure receives the configured sample cap.
    ///
    /// Retention is judged against the clock, not against `ts`.
    pub fn with_bucket_at<R, F>(&self, ts: Timestamp, f: F) -> Option<R>
    where
        F: FnOnce(&mut Bucket<P>, usize) -> R,
    {
        let cap = self.spec.sample_cap();
        let now = self.now();
        let mut store = self.store.lock();
        store.ensure_at(ts, now).map(|bucket| f(bucket, cap))
    }

    /// True when `ts` falls in a bucket after the one holding the current time.
    pub fn is_ahead(&self, ts: Timestamp) -> bool {
        let clock = self.spec.clock();
        clock.index_of(ts) > clock.index_of(self.now())
    }

    /// Copy of the most recent stored bucket, however old.
    pub fn newest(&self) -> Option<Bucket<P>> {
        self.store.lock().latest().cloned()
    }

    /// Copy of the most recent live bucket.
    pub fn latest(&self) -> Option<Bucket<P>> {
        let horizon = self.spec.horizon_ms(self.now().as_millis());
        self.store
            .lock()
            .latest()
            .filter(|bucket| bucket.start.as_millis() >= horizon)
            .cloned()
    }

    /// Copies of the buckets covering the last `window` (clamped to retention).
    pub fn series(&self, window: Duration) -> Vec<Bucket<P>> {
        let now = self.now();
        let window = window.min(self.spec.retention());
        let horizon = self.spec.horizon_ms(now.as_millis());
        let mut buckets = self.store.lock().snapshot_window(now.saturating_sub(window));
        buckets.retain(|bucket| bucket.start.as_millis() >= horizon);
        buckets
    }

    /// Fold the last `window` into a summary.
    pub fn aggregate(&self, window: Duration, aggregator: &SnapshotAggregator) -> WindowAggregate {
        let window = window.min(self.spec.retention());
        aggregator.fold(&self.series(window), window)
    }

    pub fn prune(&self) -> usize {
        let now = self.now();
        self.store.lock().prune(now)
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.store.lock().len()
    }

    pub fn stats(&self) -> StoreStats {
        self.store.lock().stats()
    }
}

// ----------------------------------------------------------------------------
// 9.2 Window Aggregate
// ----------------------------------------------------------------------------

/// One category and its count inside a breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub key: String,
    pub count: u64,
}

/// Fold of every bucket in a window. Zero-valued when the window is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub window_ms: u64,
    pub bucket_count: usize,
    pub total_count: u64,
    pub error_count: u64,
    pub rate_per_minute: f64,
    pub error_ratio: f64,
    pub latency: PercentileSet,
    /// True when the sample bound cut the concatenation short
    pub samples_truncated: bool,
    pub breakdowns: BTreeMap<Dimension, Vec<CategoryCount>>,
}

impl WindowAggregate {
    pub fn breakdown(&self, dimension: Dimension) -> &[CategoryCount] {
        self.breakdowns
            .get(&dimension)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// ----------------------------------------------------------------------------
// 9.3 Snapshot Aggregator
// ----------------------------------------------------------------------------

/// Folds bucket copies into a [`WindowAggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotAggregator {
    top_n: usize,
    sample_bound: usize,
}

impl Default for SnapshotAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_N)
    }
}

impl SnapshotAggregator {
    pub fn new(top_n: usize) -> Self {
        Self {
            top_n,
            sample_bound: WINDOW_SAMPLE_BOUND,
        }
    }

    /// Cap on samples concatenated across buckets (newest samples win).
    pub fn with_sample_bound(mut self, bound: usize) -> Self {
        self.sample_bound = bound.max(1);
        self
    }

    pub fn top_n(&self) -> usize {
        self.top_n
    }

    pub fn fold<P>(&self, buckets: &[Bucket<P>], window: Duration) -> WindowAggregate {
        let window_ms = window.as_millis() as u64;
        let mut total_count = 0u64;
        let mut error_count = 0u64;
        let mut merged: AHashMap<&CategoryKey, u64> = AHashMap::new();

        for bucket in buckets {
            total_count = total_count.saturating_add(bucket.count);
            error_count = error_count.saturating_add(bucket.error_count);
            for (category, count) in &bucket.breakdowns {
                *merged.entry(category).or_insert(0) += *count;
            }
        }

        let available: usize = buckets.iter().map(|b| b.samples.len()).sum();
        let mut samples = Vec::with_capacity(available.min(self.sample_bound));
        let mut samples_truncated = false;
        'newest_first: for bucket in buckets.iter().rev() {
            for value in bucket.samples.iter().rev() {
                if samples.len() >= self.sample_bound {
                    samples_truncated = true;
                    break 'newest_first;
                }
                samples.push(*value);
            }
        }

        let mut grouped: BTreeMap<Dimension, Vec<(String, u64)>> = BTreeMap::new();
        for (category, count) in merged {
            grouped
                .entry(category.dimension)
                .or_default()
                .push((category.key.to_string(), count));
        }
        let breakdowns = grouped
            .into_iter()
            .map(|(dimension, entries)| (dimension, top_n(entries, self.top_n)))
            .collect();

        WindowAggregate {
            window_ms,
            bucket_count: buckets.len(),
            total_count,
            error_count,
            rate_per_minute: rate_per_minute(total_count, window),
            error_ratio: if total_count == 0 {
                0.0
            } else {
                error_count as f64 / total_count as f64
            },
            latency: PercentileSet::from_samples(&samples),
            samples_truncated,
            breakdowns,
        }
    }
}

/// `count / (window / 1 minute)`, zero for an empty window.
pub fn rate_per_minute(count: u64, window: Duration) -> f64 {
    let window_ms = window.as_millis() as f64;
    if window_ms <= 0.0 {
        return 0.0;
    }
    count as f64 / (window_ms / MS_PER_MINUTE)
}

/// Highest counts first, ties broken by key, truncated to `limit`.
pub fn top_n<I>(entries: I, limit: usize) -> Vec<CategoryCount>
where
    I: IntoIterator<Item = (String, u64)>,
{
    let mut entries: Vec<CategoryCount> = entries
        .into_iter()
        .map(|(key, count)| CategoryCount { key, count })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries.truncate(limit);
    entries
}

/// Public series shape: bucket span plus one point per bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry<T> {
    pub bucket_span_sec: f64,
    pub window_sec: u64,
    pub points: Vec<T>,
}

/// Resolve an optional `window_sec` read parameter against a default and the retention.
pub fn resolve_window(window_sec: Option<u64>, default: Duration, retention: Duration) -> Duration {
    match window_sec {
        Some(secs) if secs > 0 => Duration::from_secs(secs).min(retention),
        _ => default.min(retention),
    }
}

// ============================================================================
// SECTION 10: PHASE 1 TESTS - BUCKETS, RETENTION, PERCENTILES
// ============================================================================

#[cfg(test)]
mod phase1_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn spec(span_ms: i64, retention_ms: i64, cap: usize) -> WindowSpec {
        WindowSpec::from_millis(span_ms, retention_ms, cap).unwrap()
    }

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn test_bucket_clock_rejects_non_positive_span() {
        assert!(BucketClock::new(0).is_err());
        assert!(BucketClock::new(-5).is_err());
        assert!(BucketClock::new(1).is_ok());
    }

    #[rstest]
    #[case(0, 5_000, 0, 0)]
    #[case(4_999, 5_000, 0, 0)]
    #[case(5_000, 5_000, 1, 5_000)]
    #[case(60_001, 5_000, 12, 60_000)]
    #[case(-1, 5_000, -1, -5_000)]
    fn test_bucket_clock_index_and_start(
        #[case] ts_ms: i64,
        #[case] span_ms: i64,
        #[case] index: i64,
        #[case] start_ms: i64,
    ) {
        let clock = BucketClock::new(span_ms).unwrap();
        assert_eq!(clock.index_of(ts(ts_ms)), index);
        assert_eq!(clock.start_of(index), ts(start_ms));
        assert_eq!(clock.align(ts(ts_ms)), ts(start_ms));
    }

    #[test]
    fn test_window_spec_validation() {
        assert!(WindowSpec::from_millis(5_000, 4_999, 10).is_err());
        assert!(WindowSpec::from_millis(5_000, 60_000, 0).is_err());
        assert!(WindowSpec::from_millis(5_000, 60_000, MAX_SAMPLE_CAP + 1).is_err());
        assert_eq!(spec(5_000, 60_000, 10).max_live_buckets(), 13);
        assert_eq!(spec(5_000, 62_000, 10).max_live_buckets(), 14);
    }

    #[test]
    fn test_same_bucket_accumulates() {
        let mut store: BucketStore = BucketStore::new(spec(5_000, 60_000, 16));
        store.increment(ts(10_000), 1, None, false);
        store.increment(ts(12_345), 2, None, true);
        store.increment(ts(14_999), 3, Some(CategoryKey::status(200)), false);

        assert_eq!(store.len(), 1);
        let bucket = store.get(ts(10_000)).unwrap();
        assert_eq!(bucket.index, 2);
        assert_eq!(bucket.count, 6);
        assert_eq!(bucket.error_count, 2);
        assert_eq!(bucket.category_count(&CategoryKey::status(200)), 3);
        assert_eq!(bucket.category_count(&CategoryKey::status(500)), 0);
    }

    #[test]
    fn test_eviction_scenario_keeps_only_live_indices() {
        let mut store: BucketStore = BucketStore::new(spec(5_000, 60_000, 16));
        for t in [0, 4_000, 5_000, 9_999, 60_001] {
            assert!(store.increment(ts(t), 1, None, false));
        }

        assert_eq!(store.indices(), vec![1, 12]);
        assert_eq!(store.get(ts(5_000)).unwrap().count, 2);

        let stats = store.stats();
        assert_eq!(stats.buckets_created, 3);
        assert_eq!(stats.buckets_evicted, 1);
        assert_eq!(stats.newest, Some(ts(60_001)));
    }

    #[test]
    fn test_late_write_behind_horizon_is_dropped() {
        let mut store: BucketStore = BucketStore::new(spec(5_000, 60_000, 16));
        assert!(store.increment(ts(100_000), 1, None, false));
        assert!(!store.increment(ts(1_000), 1, None, false));
        assert!(store.increment(ts(45_000), 1, None, false));

        assert_eq!(store.indices(), vec![9, 20]);
        assert_eq!(store.stats().stale_writes, 1);
    }

    #[test]
    fn test_window_write_ahead_of_clock_keeps_horizon() {
        let clock = Arc::new(ManualClock::new(ts(20_000)));
        let window: TimeWindow = TimeWindow::new("skew", spec(1_000, 10_000, 4), clock);

        assert!(window.increment_at(ts(15_000), 1, None, false));
        assert!(!window.increment_at(ts(5_000_000), 1, None, false));
        assert!(window.increment_at(ts(19_500), 2, None, false));

        let stats = window.stats();
        assert_eq!(stats.live_buckets, 2);
        assert_eq!(stats.future_writes, 1);
        assert_eq!(stats.stale_writes, 0);
        assert_eq!(stats.newest, Some(ts(20_000)));
        assert!(window.is_ahead(ts(21_000)));
        assert!(!window.is_ahead(ts(20_999)));
        let aggregate = window.aggregate(Duration::from_secs(10), &SnapshotAggregator::default());
        assert_eq!(aggregate.total_count, 3);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let mut store: BucketStore = BucketStore::new(spec(1_000, 10_000, 4));
        for t in (0..30_000).step_by(700) {
            store.increment(ts(t), 1, None, false);
        }
        assert_eq!(store.indices(), (20..=29).collect::<Vec<_>>());

        let now = ts(32_000);
        assert_eq!(store.prune(now), 2);
        let after_first = store.indices();
        assert_eq!(after_first, (22..=29).collect::<Vec<_>>());

        assert_eq!(store.prune(now), 0);
        assert_eq!(store.indices(), after_first);
    }

    #[test]
    fn test_sample_cap_keeps_newest() {
        let mut store: BucketStore = BucketStore::new(spec(5_000, 60_000, 2_000));
        for i in 0..2_500 {
            store.append_sample(ts(1_000), i as f64);
        }

        let bucket = store.get(ts(1_000)).unwrap();
        assert_eq!(bucket.samples.len(), 2_000);
        assert_eq!(bucket.samples.front().copied(), Some(500.0));
        assert_eq!(bucket.samples.back().copied(), Some(2_499.0));
    }

    #[test]
    fn test_snapshot_window_overlap_and_order() {
        let mut store: BucketStore = BucketStore::new(spec(1_000, 60_000, 4));
        for t in [3_500, 500, 2_500, 1_500] {
            store.increment(ts(t), 1, None, false);
        }

        let indices: Vec<i64> = store.snapshot_window(ts(2_200)).iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![2, 3]);

        let indices: Vec<i64> = store.snapshot_window(ts(2_000)).iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn test_update_payload_in_place() {
        let mut store: BucketStore<Option<u32>> = BucketStore::new(spec(1_000, 5_000, 4));
        assert!(store.update_payload(ts(10), |slot| *slot = Some(7)));
        assert!(store.update_payload(ts(20), |slot| {
            if let Some(v) = slot.as_mut() {
                *v += 1;
            }
        }));
        assert_eq!(store.latest().unwrap().payload, Some(8));
    }

    #[test]
    fn test_percentile_does_not_mutate_input() {
        let samples = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        let copy = samples.clone();
        assert_eq!(percentile(&samples, 50.0), 3.0);
        assert_eq!(samples, copy);
    }

    #[rstest]
    #[case(0.0, 1.0)]
    #[case(50.0, 5.0)]
    #[case(95.0, 9.0)]
    #[case(99.0, 9.0)]
    #[case(100.0, 10.0)]
    #[case(150.0, 10.0)]
    #[case(-3.0, 1.0)]
    fn test_percentile_nearest_rank(#[case] p: f64, #[case] expected: f64) {
        let samples: Vec<f64> = (1..=10).rev().map(f64::from).collect();
        assert_eq!(percentile(&samples, p), expected);
    }

    #[test]
    fn test_percentile_empty_is_zero() {
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(PercentileSet::from_samples(&[]), PercentileSet::default());
    }

    #[test]
    fn test_percentile_set_single_sort() {
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        let set = PercentileSet::from_samples(&samples);
        assert_eq!(set.count, 100);
        assert_eq!(set.min, 1.0);
        assert_eq!(set.max, 100.0);
        assert_eq!(set.mean, 50.5);
        assert_eq!(set.p50, 50.0);
        assert_eq!(set.p95, 95.0);
        assert_eq!(set.p99, 99.0);
    }

    #[test]
    fn test_windowed_rate_is_count_over_minutes() {
        let clock = Arc::new(ManualClock::new(ts(599_999)));
        let window: TimeWindow = TimeWindow::new("rate", spec(60_000, 600_000, 16), clock);
        for i in 0..100 {
            assert!(window.increment_at(ts(300_000 + i * 2_999), 1, None, false));
        }

        let aggregate = window.aggregate(Duration::from_secs(300), &SnapshotAggregator::default());
        assert_eq!(aggregate.total_count, 100);
        assert!((aggregate.rate_per_minute - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window_yields_zero_aggregate() {
        let window: TimeWindow =
            TimeWindow::new("empty", spec(1_000, 10_000, 4), Arc::new(ManualClock::default()));

        let aggregate = window.aggregate(Duration::from_secs(5), &SnapshotAggregator::default());
        assert_eq!(aggregate.bucket_count, 0);
        assert_eq!(aggregate.total_count, 0);
        assert_eq!(aggregate.rate_per_minute, 0.0);
        assert_eq!(aggregate.error_ratio, 0.0);
        assert_eq!(aggregate.latency, PercentileSet::default());
        assert!(aggregate.breakdowns.is_empty());
        assert!(window.latest().is_none());
    }

    #[test]
    fn test_rate_of_zero_window_is_zero() {
        assert_eq!(rate_per_minute(10, Duration::ZERO), 0.0);
        assert_eq!(rate_per_minute(10, Duration::from_secs(30)), 20.0);
    }

    #[test]
    fn test_top_n_orders_by_count_then_key() {
        let ranked = top_n(
            vec![
                ("b".to_string(), 3),
                ("a".to_string(), 3),
                ("c".to_string(), 5),
                ("d".to_string(), 1),
            ],
            3,
        );
        let keys: Vec<&str> = ranked.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_aggregator_merges_breakdowns_and_bounds_samples() {
        let clock = Arc::new(ManualClock::new(ts(10_000)));
        let window: TimeWindow = TimeWindow::new("requests", spec(1_000, 60_000, 100), clock);
        for i in 0..10 {
            let route = if i < 6 { "/api/a" } else { "/api/b" };
            let observation = Observation::single()
                .with_sample(i as f64)
                .with_error(i % 5 == 0)
                .with_category(CategoryKey::route(route));
            assert!(window.record_at(ts(i * 1_000), &observation));
        }

        let aggregator = SnapshotAggregator::new(5).with_sample_bound(4);
        let aggregate = window.aggregate(Duration::from_secs(60), &aggregator);

        assert_eq!(aggregate.total_count, 10);
        assert_eq!(aggregate.error_count, 2);
        assert_eq!(aggregate.error_ratio, 0.2);
        assert!(aggregate.samples_truncated);
        assert_eq!(aggregate.latency.count, 4);
        assert_eq!(aggregate.latency.min, 6.0);
        assert_eq!(aggregate.latency.max, 9.0);
        assert_eq!(
            aggregate.breakdown(Dimension::Route),
            &[
                CategoryCount { key: "/api/a".into(), count: 6 },
                CategoryCount { key: "/api/b".into(), count: 4 },
            ]
        );
        assert!(aggregate.breakdown(Dimension::Status).is_empty());
    }

    #[test]
    fn test_resolve_window_clamps_to_retention() {
        let default = Duration::from_secs(300);
        let retention = Duration::from_secs(3_600);
        assert_eq!(resolve_window(None, default, retention), default);
        assert_eq!(resolve_window(Some(0), default, retention), default);
        assert_eq!(resolve_window(Some(60), default, retention), Duration::from_secs(60));
        assert_eq!(resolve_window(Some(86_400), default, retention), retention);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(ts(1_000));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), ts(1_250));
        clock.set(ts(5));
        assert_eq!(clock.now(), ts(5));
    }

    proptest! {
        #[test]
        fn prop_live_buckets_never_exceed_bound(
            span in 1i64..5_000,
            spans_retained in 1i64..40,
            extra in 0i64..5_000,
            writes in prop::collection::vec(0i64..2_000_000, 1..300),
        ) {
            let window = spec(span, span * spans_retained + extra % span, 4);
            let mut store: BucketStore = BucketStore::new(window);
            for t in writes {
                store.increment(ts(t), 1, None, false);
                prop_assert!(store.len() <= window.max_live_buckets());
            }
        }

        #[test]
        fn prop_same_index_shares_bucket(
            span in 1i64..100_000,
            index in 0i64..1_000_000,
            a in 0i64..100_000,
            b in 0i64..100_000,
        ) {
            let mut store: BucketStore = BucketStore::new(spec(span, span * 4, 4));
            let base = index * span;
            store.increment(ts(base + a % span), 1, None, false);
            store.increment(ts(base + b % span), 1, None, false);
            prop_assert_eq!(store.len(), 1);
            prop_assert_eq!(store.latest().map(|bucket| bucket.count), Some(2));
        }

        #[test]
        fn prop_percentile_ignores_input_order(
            mut values in prop::collection::vec(-1.0e6f64..1.0e6, 1..200),
            p in 0.0f64..=100.0,
        ) {
            let forward = percentile(&values, p);
            values.reverse();
            prop_assert_eq!(forward, percentile(&values, p));
        }
    }
}

// ============================================================================
// SECTION 11: LATENCY PROBE
// ============================================================================
// Two-stage round-trip measurement: an ICMP echo through the system `ping`
// binary, then a TCP connect to a well-known port. Each stage is bounded by
// the same timeout and guarded against panics.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Probe Transport Trait
// ----------------------------------------------------------------------------

/// One way of measuring round-trip time to a host, in milliseconds.
#[async_trait]
pub trait ProbeTransport: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn round_trip(&self, host: &str, timeout: Duration) -> ProbeResult<f64>;
}

// ----------------------------------------------------------------------------
// 11.2 ICMP Echo (system ping)
// ----------------------------------------------------------------------------

static PING_TIME_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"time[=<]\s*([0-9]+(?:\.[0-9]+)?)\s*ms").ok());

/// Extract the round-trip time from `ping` output.
pub fn parse_ping_time(output: &str) -> Option<f64> {
    let pattern = PING_TIME_PATTERN.as_ref()?;
    pattern.captures(output)?.get(1)?.as_str().parse().ok()
}

/// Arguments for a single echo with a reply deadline, in the local `ping`
/// dialect.
#[cfg(windows)]
pub fn ping_args(host: &str, limit: Duration) -> Vec<String> {
    let wait_ms = limit.as_millis().max(1);
    vec!["-n".into(), "1".into(), "-w".into(), wait_ms.to_string(), host.into()]
}

/// Arguments for a single echo with a reply deadline, in the local `ping`
/// dialect. BSD-derived pings take `-W` in milliseconds.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub fn ping_args(host: &str, limit: Duration) -> Vec<String> {
    let wait_ms = limit.as_millis().max(1);
    vec!["-c".into(), "1".into(), "-W".into(), wait_ms.to_string(), host.into()]
}

/// Arguments for a single echo with a reply deadline, in the local `ping`
/// dialect. iputils and busybox take `-W` in whole seconds.
#[cfg(not(any(windows, target_os = "macos", target_os = "ios", target_os = "freebsd")))]
pub fn ping_args(host: &str, limit: Duration) -> Vec<String> {
    let wait_secs = limit.as_secs().max(1);
    vec!["-c".into(), "1".into(), "-W".into(), wait_secs.to_string(), host.into()]
}

#[derive(Debug, Clone)]
pub struct IcmpEchoProbe {
    program: PathBuf,
}

impl Default for IcmpEchoProbe {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ping"),
        }
    }
}

impl IcmpEchoProbe {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ProbeTransport for IcmpEchoProbe {
    fn name(&self) -> &'static str {
        "icmp"
    }

    async fn round_trip(&self, host: &str, limit: Duration) -> ProbeResult<f64> {
        let mut command = TokioCommand::new(&self.program);
        command
            .args(ping_args(host, limit))
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match timeout(limit, command.output()).await {
            Err(_) => return Err(ProbeError::timeout(host, limit)),
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                return Err(ProbeError::Unsupported {
                    transport: self.name(),
                    message: e.to_string(),
                })
            }
            Ok(Err(e)) => return Err(ProbeError::unreachable(host, e.to_string())),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(ProbeError::unreachable(
                host,
                format!("ping exited with {}", output.status),
            ));
        }

        parse_ping_time(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            ProbeError::InvalidReading {
                transport: self.name(),
                message: "no round-trip time in ping output".into(),
            }
        })
    }
}

// ----------------------------------------------------------------------------
// 11.3 TCP Connect
// ----------------------------------------------------------------------------

/// Time to complete a TCP handshake. The stream is dropped as soon as it opens.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnectProbe {
    port: u16,
}

impl TcpConnectProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_PORT)
    }
}

#[async_trait]
impl ProbeTransport for TcpConnectProbe {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn round_trip(&self, host: &str, limit: Duration) -> ProbeResult<f64> {
        let started = Instant::now();
        match timeout(limit, TokioTcpStream::connect((host, self.port))).await {
            Err(_) => Err(ProbeError::timeout(host, limit)),
            Ok(Err(e)) => Err(ProbeError::unreachable(host, e.to_string())),
            Ok(Ok(stream)) => {
                let elapsed = started.elapsed();
                drop(stream);
                Ok(elapsed.as_secs_f64() * 1_000.0)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 11.4 Latency Probe
// ----------------------------------------------------------------------------

/// Primary/fallback round-trip measurement.
#[derive(Debug, Clone)]
pub struct LatencyProbe {
    primary: Arc<dyn ProbeTransport>,
    fallback: Arc<dyn ProbeTransport>,
    timeout: Duration,
}

impl LatencyProbe {
    pub fn new(timeout: Duration, port: u16) -> Self {
        Self::with_transports(
            Arc::new(IcmpEchoProbe::default()),
            Arc::new(TcpConnectProbe::new(port)),
            timeout,
        )
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(config.timeout, config.port)
    }

    pub fn with_transports(
        primary: Arc<dyn ProbeTransport>,
        fallback: Arc<dyn ProbeTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Round-trip time to `host` in milliseconds.
    ///
    /// Falls back when the primary errors, panics, times out or reports a
    /// negative or non-finite duration. A final failure is always either
    /// [`ProbeError::Timeout`] or [`ProbeError::Unreachable`].
    pub async fn measure(&self, host: &str) -> ProbeResult<f64> {
        match self.attempt(self.primary.as_ref(), host).await {
            Ok(ms) => return Ok(ms),
            Err(e) => debug!(
                target: "vigil::probe",
                host,
                transport = self.primary.name(),
                error = %e,
                "Primary probe failed, trying fallback"
            ),
        }

        self.attempt(self.fallback.as_ref(), host)
            .await
            .map_err(|e| {
                debug!(
                    target: "vigil::probe",
                    host,
                    transport = self.fallback.name(),
                    error = %e,
                    "Fallback probe failed"
                );
                e.into_terminal(host)
            })
    }

    async fn attempt(&self, transport: &dyn ProbeTransport, host: &str) -> ProbeResult<f64> {
        let limit = self.timeout;
        let guarded = AssertUnwindSafe(async move { transport.round_trip(host, limit).await })
            .catch_unwind();

        match timeout(limit, guarded).await {
            Err(_) => Err(ProbeError::timeout(host, limit)),
            Ok(Err(panic)) => Err(ProbeError::Unsupported {
                transport: transport.name(),
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
            Ok(Ok(Ok(ms))) if ms.is_finite() && ms >= 0.0 => Ok(ms),
            Ok(Ok(Ok(ms))) => Err(ProbeError::InvalidReading {
                transport: transport.name(),
                message: format!("{} ms", ms),
            }),
            Ok(Ok(Err(e))) => Err(e),
        }
    }
}

// ============================================================================
// SECTION 12: COLLECTION SCHEDULER
// ============================================================================
// Stopped -> Running -> Stopped. The first tick fires on start, later ticks
// follow the fixed cadence. A tick that fails or panics is logged, counted
// and discarded; the next tick is armed regardless.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Sampler Trait
// ----------------------------------------------------------------------------

/// Work performed on every scheduler tick.
#[async_trait]
pub trait Sampler: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn sample(&self) -> TickResult;
}

/// Sampler backed by a closure returning a future.
pub struct FnSampler<F> {
    name: CompactString,
    f: F,
}

impl<F> FnSampler<F> {
    pub fn new(name: impl Into<CompactString>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Debug for FnSampler<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSampler")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Sampler for FnSampler<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TickResult> + Send + 'static,
{
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn sample(&self) -> TickResult {
        (self.f)().await
    }
}

// ----------------------------------------------------------------------------
// 12.2 Scheduler State & Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    ticks: AtomicU64,
    failures: AtomicU64,
    panics: AtomicU64,
    consecutive_failures: AtomicU32,
    last_success: Mutex<Option<Timestamp>>,
    last_error: Mutex<Option<String>>,
}

impl SchedulerCounters {
    fn record_success(&self) {
        self.ticks.fetch_add(1, AtomicOrdering::Relaxed);
        self.consecutive_failures.store(0, AtomicOrdering::Relaxed);
        *self.last_success.lock() = Some(Timestamp::now());
    }

    fn record_failure(&self, failure: &TickFailure, panicked: bool) {
        self.ticks.fetch_add(1, AtomicOrdering::Relaxed);
        self.failures.fetch_add(1, AtomicOrdering::Relaxed);
        if panicked {
            self.panics.fetch_add(1, AtomicOrdering::Relaxed);
        }
        self.consecutive_failures
            .fetch_add(1, AtomicOrdering::Relaxed);
        *self.last_error.lock() = Some(failure.to_string());
    }
}

/// Point-in-time view of a scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub name: String,
    pub state: SchedulerState,
    pub interval_ms: u64,
    pub ticks: u64,
    pub failures: u64,
    pub panics: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<Timestamp>,
    pub last_error: Option<String>,
}

// ----------------------------------------------------------------------------
// 12.3 Collection Scheduler
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct ScheduledRun {
    cancel: CancellationToken,
    handle: TokioJoinHandle<()>,
}

/// Drives a [`Sampler`] at a fixed cadence on the tokio runtime.
#[derive(Debug)]
pub struct CollectionScheduler {
    name: CompactString,
    interval: Duration,
    run: Mutex<Option<ScheduledRun>>,
    counters: Arc<SchedulerCounters>,
}

impl CollectionScheduler {
    pub fn new(name: impl Into<CompactString>, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "interval",
                "scheduler interval must be greater than zero",
            ));
        }
        Ok(Self {
            name: name.into(),
            interval,
            run: Mutex::new(None),
            counters: Arc::new(SchedulerCounters::default()),
        })
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> SchedulerState {
        match &*self.run.lock() {
            Some(run) if !run.handle.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Start ticking. Returns `false` if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, sampler: Arc<dyn Sampler>) -> bool {
        let mut run = self.run.lock();
        if matches!(&*run, Some(active) if !active.handle.is_finished()) {
            debug!(target: "vigil::scheduler", scheduler = %self.name, "Scheduler already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_schedule(
            self.name.clone(),
            self.interval,
            sampler,
            cancel.clone(),
            Arc::clone(&self.counters),
        ));
        *run = Some(ScheduledRun { cancel, handle });

        info!(
            target: "vigil::scheduler",
            scheduler = %self.name,
            interval_ms = self.interval.as_millis() as u64,
            "Scheduler started"
        );
        true
    }

    /// Stop arming new ticks. An in-flight tick runs to completion.
    /// Returns `false` if the scheduler was not running.
    pub fn stop(&self) -> bool {
        match self.run.lock().take() {
            Some(run) => {
                run.cancel.cancel();
                info!(target: "vigil::scheduler", scheduler = %self.name, "Scheduler stopped");
                true
            }
            None => false,
        }
    }

    /// Stop and wait for an in-flight tick to finish.
    pub async fn shutdown(&self) {
        let run = self.run.lock().take();
        if let Some(run) = run {
            run.cancel.cancel();
            if let Err(e) = run.handle.await {
                warn!(
                    target: "vigil::scheduler",
                    scheduler = %self.name,
                    error = %e,
                    "Scheduler task ended abnormally"
                );
            }
            info!(target: "vigil::scheduler", scheduler = %self.name, "Scheduler shut down");
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            name: self.name.to_string(),
            state: self.state(),
            interval_ms: self.interval.as_millis() as u64,
            ticks: self.counters.ticks.load(AtomicOrdering::Relaxed),
            failures: self.counters.failures.load(AtomicOrdering::Relaxed),
            panics: self.counters.panics.load(AtomicOrdering::Relaxed),
            consecutive_failures: self
                .counters
                .consecutive_failures
                .load(AtomicOrdering::Relaxed),
            last_success: *self.counters.last_success.lock(),
            last_error: self.counters.last_error.lock().clone(),
        }
    }
}

impl Drop for CollectionScheduler {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.cancel.cancel();
        }
    }
}

async fn run_schedule(
    name: CompactString,
    period: Duration,
    sampler: Arc<dyn Sampler>,
    cancel: CancellationToken,
    counters: Arc<SchedulerCounters>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => execute_tick(&name, sampler.as_ref(), &counters).await,
        }
    }

    debug!(target: "vigil::scheduler", scheduler = %name, "Schedule loop exited");
}

async fn execute_tick(name: &str, sampler: &dyn Sampler, counters: &SchedulerCounters) {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(async { sampler.sample().await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {
            counters.record_success();
            trace!(
                target: "vigil::scheduler",
                scheduler = name,
                elapsed_us = started.elapsed().as_micros() as u64,
                "Tick completed"
            );
        }
        Ok(Err(failure)) => {
            warn!(
                target: "vigil::scheduler",
                scheduler = name,
                error = %failure,
                "Sampling tick failed"
            );
            counters.record_failure(&failure, false);
        }
        Err(panic) => {
            let failure = TickFailure::Panicked {
                sampler: sampler.name().to_string(),
                message: panic_message(panic.as_ref()),
            };
            error!(
                target: "vigil::scheduler",
                scheduler = name,
                error = %failure,
                "Sampling tick panicked"
            );
            counters.record_failure(&failure, true);
        }
    }
}

// ============================================================================
// SECTION 13: PHASE 2 TESTS - PROBE & SCHEDULER
// ============================================================================

#[cfg(test)]
mod phase2_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[derive(Debug, Clone)]
    enum StubOutcome {
        Reading(f64),
        Fail(ProbeError),
        Panic,
        Hang,
    }

    #[derive(Debug)]
    struct StubTransport {
        name: &'static str,
        outcome: StubOutcome,
    }

    impl StubTransport {
        fn shared(name: &'static str, outcome: StubOutcome) -> Arc<dyn ProbeTransport> {
            Arc::new(Self { name, outcome })
        }
    }

    #[async_trait]
    impl ProbeTransport for StubTransport {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn round_trip(&self, host: &str, _timeout: Duration) -> ProbeResult<f64> {
            match &self.outcome {
                StubOutcome::Reading(ms) => Ok(*ms),
                StubOutcome::Fail(e) => Err(e.clone()),
                StubOutcome::Panic => panic!("transport exploded probing {}", host),
                StubOutcome::Hang => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok(0.0)
                }
            }
        }
    }

    fn probe(primary: StubOutcome, fallback: StubOutcome) -> LatencyProbe {
        LatencyProbe::with_transports(
            StubTransport::shared("primary", primary),
            StubTransport::shared("fallback", fallback),
            Duration::from_secs(2),
        )
    }

    #[rstest]
    #[case("64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms", Some(12.3))]
    #[case("Reply from 10.0.0.1: bytes=32 time<1ms TTL=64", Some(1.0))]
    #[case("64 bytes from ::1: icmp_seq=1 ttl=64 time=0.045 ms", Some(0.045))]
    #[case("Request timeout for icmp_seq 0", None)]
    #[case("round-trip min/avg/max = 1.0/2.0/3.0 ms", None)]
    fn test_parse_ping_time(#[case] output: &str, #[case] expected: Option<f64>) {
        assert_eq!(parse_ping_time(output), expected);
    }

    #[cfg(not(any(windows, target_os = "macos", target_os = "ios", target_os = "freebsd")))]
    #[test]
    fn test_ping_args_wait_in_seconds() {
        assert_eq!(
            ping_args("8.8.8.8", Duration::from_millis(2_500)),
            vec!["-c", "1", "-W", "2", "8.8.8.8"]
        );
        assert_eq!(ping_args("h", Duration::from_millis(200))[3], "1");
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    #[test]
    fn test_ping_args_wait_in_millis() {
        assert_eq!(
            ping_args("8.8.8.8", Duration::from_millis(2_500)),
            vec!["-c", "1", "-W", "2500", "8.8.8.8"]
        );
    }

    #[cfg(windows)]
    #[test]
    fn test_ping_args_windows_dialect() {
        assert_eq!(
            ping_args("8.8.8.8", Duration::from_millis(2_500)),
            vec!["-n", "1", "-w", "2500", "8.8.8.8"]
        );
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let probe = probe(StubOutcome::Reading(3.5), StubOutcome::Panic);
        assert_eq!(probe.measure("db.local").await, Ok(3.5));
    }

    #[tokio::test]
    async fn test_failing_primary_uses_fallback() {
        let probe = probe(
            StubOutcome::Fail(ProbeError::Unsupported {
                transport: "primary",
                message: "raw sockets not permitted".into(),
            }),
            StubOutcome::Reading(12.5),
        );
        assert_eq!(probe.measure("db.local").await, Ok(12.5));
    }

    #[tokio::test]
    async fn test_panicking_primary_uses_fallback() {
        let probe = probe(StubOutcome::Panic, StubOutcome::Reading(7.0));
        assert_eq!(probe.measure("db.local").await, Ok(7.0));
    }

    #[tokio::test]
    async fn test_negative_primary_reading_uses_fallback() {
        let negative = probe(StubOutcome::Reading(-1.0), StubOutcome::Reading(4.0));
        assert_eq!(negative.measure("db.local").await, Ok(4.0));

        let not_a_number = probe(StubOutcome::Reading(f64::NAN), StubOutcome::Reading(4.0));
        assert_eq!(not_a_number.measure("db.local").await, Ok(4.0));
    }

    #[tokio::test]
    async fn test_both_stages_failing_reports_unreachable() {
        let probe = probe(
            StubOutcome::Panic,
            StubOutcome::Fail(ProbeError::InvalidReading {
                transport: "fallback",
                message: "garbage".into(),
            }),
        );
        match probe.measure("db.local").await {
            Err(ProbeError::Unreachable { host, .. }) => assert_eq!(host, "db.local"),
            other => panic!("expected unreachable, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_stages_report_timeout() {
        let probe = probe(StubOutcome::Hang, StubOutcome::Hang);
        let result = probe.measure("db.local").await;
        assert_eq!(
            result,
            Err(ProbeError::Timeout {
                host: "db.local".into(),
                timeout_ms: 2_000
            })
        );
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_tcp_fallback_measures_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = LatencyProbe::with_transports(
            StubTransport::shared(
                "primary",
                StubOutcome::Fail(ProbeError::unreachable("127.0.0.1", "no icmp")),
            ),
            Arc::new(TcpConnectProbe::new(port)),
            Duration::from_secs(2),
        );

        let ms = probe.measure("127.0.0.1").await.unwrap();
        assert!(ms >= 0.0 && ms.is_finite());
        drop(listener);
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port_is_unreachable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = TcpConnectProbe::new(port)
            .round_trip("127.0.0.1", Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(ProbeError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_missing_ping_binary_is_unsupported() {
        let icmp = IcmpEchoProbe::with_program("/nonexistent/vigil-ping");
        let result = icmp.round_trip("127.0.0.1", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProbeError::Unsupported { transport: "icmp", .. })));
    }

    type CallLog = Arc<Mutex<Vec<tokio::time::Instant>>>;

    fn recording_sampler(fail_on: Option<usize>, panic_on: Option<usize>) -> (CallLog, Arc<dyn Sampler>) {
        let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&calls);
        let sampler = FnSampler::new("recording", move || {
            let recorded = Arc::clone(&recorded);
            async move {
                let call = {
                    let mut calls = recorded.lock();
                    calls.push(tokio::time::Instant::now());
                    calls.len()
                };
                if Some(call) == fail_on {
                    return Err(TickFailure::sample_failed("recording", "synthetic failure"));
                }
                if Some(call) == panic_on {
                    panic!("synthetic panic on tick {}", call);
                }
                Ok(())
            }
        });
        (calls, Arc::new(sampler))
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        assert!(CollectionScheduler::new("bad", Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_does_not_stall_schedule() {
        let (calls, sampler) = recording_sampler(Some(3), None);
        let scheduler = CollectionScheduler::new("host", Duration::from_secs(5)).unwrap();
        let origin = tokio::time::Instant::now();

        assert!(scheduler.start(sampler));
        tokio::time::sleep(Duration::from_millis(15_500)).await;

        let offsets: Vec<Duration> = calls.lock().iter().map(|at| *at - origin).collect();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
            ]
        );

        let stats = scheduler.stats();
        assert_eq!(stats.state, SchedulerState::Running);
        assert_eq!(stats.ticks, 4);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.panics, 0);
        assert_eq!(stats.consecutive_failures, 0);
        assert!(stats.last_error.unwrap().contains("synthetic failure"));

        scheduler.shutdown().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tick_is_contained() {
        let (calls, sampler) = recording_sampler(None, Some(2));
        let scheduler = CollectionScheduler::new("host", Duration::from_secs(1)).unwrap();

        scheduler.start(sampler);
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(calls.lock().len(), 4);
        let stats = scheduler.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.panics, 1);
        assert!(stats.last_success.is_some());
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_arms_no_further_ticks() {
        let (calls, sampler) = recording_sampler(None, None);
        let scheduler = CollectionScheduler::new("host", Duration::from_secs(5)).unwrap();

        scheduler.start(sampler);
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert!(scheduler.stop());
        assert!(!scheduler.stop());
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(calls.lock().len(), 2);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let (_calls, sampler) = recording_sampler(None, None);
        let scheduler = CollectionScheduler::new("host", Duration::from_secs(5)).unwrap();

        assert!(scheduler.start(Arc::clone(&sampler)));
        assert!(!scheduler.start(sampler));
        scheduler.shutdown().await;
    }
}

// ============================================================================
// SECTION 14: HOST MONITOR
// ============================================================================
// One sample per tick: sysinfo readings gathered on the blocking pool, plus
// latency to the upstream dependency. The latest sample rides in the bucket
// payload; latency readings also feed the bucket sample buffer so the
// snapshot can report windowed latency percentiles.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Host Sample Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuReading {
    pub usage_percent: f64,
    pub per_core_percent: Vec<f64>,
    pub core_count: usize,
    pub brand: String,
    pub frequency_mhz: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryReading {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskReading {
    pub name: String,
    pub mount_point: String,
    pub file_system: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
}

/// Interface counters. `rx_bytes`/`tx_bytes` cover the time since the previous sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkReading {
    pub interface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
    pub rx_total_bytes: u64,
    pub tx_total_bytes: u64,
}

/// The engine's own process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessReading {
    pub pid: u32,
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    pub run_time_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemReading {
    pub hostname: String,
    pub os_name: String,
    pub os_version: String,
    pub kernel_version: String,
    pub uptime_secs: u64,
    pub load_average: [f64; 3],
}

/// Everything captured by one host tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSample {
    pub sampled_at: Timestamp,
    pub cpu: CpuReading,
    pub memory: MemoryReading,
    pub disks: Vec<DiskReading>,
    pub network: Vec<NetworkReading>,
    pub process: Option<ProcessReading>,
    pub system: SystemReading,
    /// Round-trip time to the probed dependency; `None` when unknown
    pub latency_ms: Option<f64>,
}

#[inline]
fn usage_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

// ----------------------------------------------------------------------------
// 14.2 Host Reader
// ----------------------------------------------------------------------------

/// Source of host readings.
#[async_trait]
pub trait HostReader: Send + Sync + Debug {
    async fn read(&self, at: Timestamp) -> Result<HostSample, TickFailure>;
}

struct SysinfoState {
    system: System,
    disks: Disks,
    networks: Networks,
    pid: Option<Pid>,
    last_refresh: Instant,
}

impl SysinfoState {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            pid: sysinfo::get_current_pid().ok(),
            last_refresh: Instant::now(),
        }
    }

    fn sample(&mut self, at: Timestamp) -> HostSample {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.disks.refresh();
        self.networks.refresh();
        if let Some(pid) = self.pid {
            self.system.refresh_process(pid);
        }
        let elapsed = self.last_refresh.elapsed().as_secs_f64();
        self.last_refresh = Instant::now();

        let cpus = self.system.cpus();
        let cpu = CpuReading {
            usage_percent: f64::from(self.system.global_cpu_info().cpu_usage()),
            per_core_percent: cpus.iter().map(|c| f64::from(c.cpu_usage())).collect(),
            core_count: cpus.len(),
            brand: cpus
                .first()
                .map(|c| c.brand().to_string())
                .unwrap_or_default(),
            frequency_mhz: cpus.first().map(|c| c.frequency()).unwrap_or(0),
        };

        let total_memory = self.system.total_memory();
        let used_memory = self.system.used_memory();
        let memory = MemoryReading {
            total_bytes: total_memory,
            used_bytes: used_memory,
            available_bytes: self.system.available_memory(),
            usage_percent: usage_percent(used_memory, total_memory),
            swap_total_bytes: self.system.total_swap(),
            swap_used_bytes: self.system.used_swap(),
        };

        let disks = self
            .disks
            .list()
            .iter()
            .map(|disk| {
                let total = disk.total_space();
                let available = disk.available_space();
                DiskReading {
                    name: disk.name().to_string_lossy().into_owned(),
                    mount_point: disk.mount_point().display().to_string(),
                    file_system: disk.file_system().to_string_lossy().into_owned(),
                    total_bytes: total,
                    available_bytes: available,
                    usage_percent: usage_percent(total.saturating_sub(available), total),
                }
            })
            .collect();

        let per_sec = |bytes: u64| {
            if elapsed > 0.0 {
                bytes as f64 / elapsed
            } else {
                0.0
            }
        };
        let mut network: Vec<NetworkReading> = self
            .networks
            .list()
            .iter()
            .map(|(interface, data)| NetworkReading {
                interface: interface.clone(),
                rx_bytes: data.received(),
                tx_bytes: data.transmitted(),
                rx_bytes_per_sec: per_sec(data.received()),
                tx_bytes_per_sec: per_sec(data.transmitted()),
                rx_total_bytes: data.total_received(),
                tx_total_bytes: data.total_transmitted(),
            })
            .collect();
        network.sort_by(|a, b| a.interface.cmp(&b.interface));

        let process = self
            .pid
            .and_then(|pid| self.system.process(pid))
            .map(|p| ProcessReading {
                pid: p.pid().as_u32(),
                memory_bytes: p.memory(),
                cpu_percent: f64::from(p.cpu_usage()),
                run_time_secs: p.run_time(),
            });

        let load = System::load_average();
        let system = SystemReading {
            hostname: System::host_name().unwrap_or_default(),
            os_name: System::name().unwrap_or_default(),
            os_version: System::os_version().unwrap_or_default(),
            kernel_version: System::kernel_version().unwrap_or_default(),
            uptime_secs: System::uptime(),
            load_average: [load.one, load.five, load.fifteen],
        };

        HostSample {
            sampled_at: at,
            cpu,
            memory,
            disks,
            network,
            process,
            system,
            latency_ms: None,
        }
    }
}

/// Reads the local host through `sysinfo` on the blocking pool.
#[derive(Clone)]
pub struct SysinfoHostReader {
    state: Arc<Mutex<SysinfoState>>,
}

impl SysinfoHostReader {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SysinfoState::new())),
        }
    }
}

impl Default for SysinfoHostReader {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SysinfoHostReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysinfoHostReader")
            .field("pid", &self.state.lock().pid)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl HostReader for SysinfoHostReader {
    async fn read(&self, at: Timestamp) -> Result<HostSample, TickFailure> {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || state.lock().sample(at))
            .await
            .map_err(|e| {
                if e.is_panic() {
                    TickFailure::Panicked {
                        sampler: "host".into(),
                        message: e.to_string(),
                    }
                } else {
                    TickFailure::Cancelled {
                        sampler: "host".into(),
                    }
                }
            })
    }
}

// ----------------------------------------------------------------------------
// 14.3 Host Snapshot & Series
// ----------------------------------------------------------------------------

/// Latest host sample plus windowed latency statistics.
///
/// Before the first sample `warming_up` is set and every other field is zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub warming_up: bool,
    pub sample: HostSample,
    pub probe_target: Option<String>,
    pub latency_window_ms: u64,
    pub latency: PercentileSet,
    pub samples_in_window: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostPoint {
    pub t: i64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub latency_ms: Option<f64>,
}

// ----------------------------------------------------------------------------
// 14.4 Host Monitor
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct HostMonitor {
    config: HostMonitorConfig,
    window: TimeWindow<Option<HostSample>>,
    reader: Arc<dyn HostReader>,
    probe: Option<LatencyProbe>,
    scheduler: CollectionScheduler,
    aggregator: SnapshotAggregator,
}

impl HostMonitor {
    pub fn new(
        config: HostMonitorConfig,
        clock: SharedClock,
        reader: Arc<dyn HostReader>,
        probe: Option<LatencyProbe>,
    ) -> Result<Self, ConfigError> {
        let spec = config.window_spec()?;
        let scheduler = CollectionScheduler::new("host", config.sample_interval)?;

        Ok(Self {
            window: TimeWindow::new("host", spec, clock),
            reader,
            probe,
            scheduler,
            aggregator: SnapshotAggregator::default(),
            config,
        })
    }

    /// Begin periodic sampling. The first sample is taken immediately.
    pub fn start(self: &Arc<Self>) -> bool {
        let sampler: Arc<dyn Sampler> = self.clone();
        self.scheduler.start(sampler)
    }

    pub fn stop(&self) -> bool {
        self.scheduler.stop()
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    /// Take one sample and store it in the bucket for "now".
    pub async fn sample_once(&self) -> TickResult {
        let at = self.window.now();
        let mut sample = self.reader.read(at).await?;
        sample.latency_ms = self.measure_latency().await;

        let latency = sample.latency_ms;
        let cpu_percent = sample.cpu.usage_percent;
        let memory_percent = sample.memory.usage_percent;

        let stored = self.window.with_bucket_at(at, move |bucket, cap| {
            bucket.add(1, false);
            if let Some(ms) = latency {
                bucket.push_sample(ms, cap);
            }
            bucket.payload = Some(sample);
        });
        if stored.is_none() {
            return Err(TickFailure::sample_failed(
                "host",
                "sample timestamp fell outside the retention window",
            ));
        }

        debug!(
            target: "vigil::host",
            cpu_percent,
            memory_percent,
            latency_ms = ?latency,
            "Host sample recorded"
        );
        Ok(())
    }

    async fn measure_latency(&self) -> Option<f64> {
        let probe = self.probe.as_ref()?;
        let host = self.config.probe.target.as_str();
        match probe.measure(host).await {
            Ok(ms) => Some(ms),
            Err(e) => {
                debug!(target: "vigil::host", probe_target = host, error = %e, "Latency unknown");
                None
            }
        }
    }

    /// True until the first sample lands. Failed ticks afterwards, however
    /// long they last, do not bring it back.
    pub fn is_warming_up(&self) -> bool {
        self.window.is_empty()
    }

    pub fn get_snapshot(&self) -> HostSnapshot {
        let window = self.config.snapshot_window.min(self.window.spec().retention());
        let probe_target = self
            .probe
            .as_ref()
            .map(|_| self.config.probe.target.clone());

        // The last stored sample is served even when it has aged out.
        match self.window.newest().and_then(|bucket| bucket.payload) {
            Some(sample) => {
                let aggregate = self.window.aggregate(window, &self.aggregator);
                HostSnapshot {
                    warming_up: false,
                    sample,
                    probe_target,
                    latency_window_ms: aggregate.window_ms,
                    latency: aggregate.latency,
                    samples_in_window: aggregate.total_count,
                }
            }
            None => HostSnapshot {
                warming_up: true,
                probe_target,
                latency_window_ms: window.as_millis() as u64,
                ..HostSnapshot::default()
            },
        }
    }

    /// One point per sampled bucket over the window (defaults to the full retention).
    pub fn get_telemetry(&self, window_sec: Option<u64>) -> Telemetry<HostPoint> {
        let retention = self.window.spec().retention();
        let window = resolve_window(window_sec, retention, retention);
        let points = self
            .window
            .series(window)
            .into_iter()
            .filter_map(|bucket| {
                let sample = bucket.payload?;
                Some(HostPoint {
                    t: bucket.start.as_millis(),
                    cpu_percent: sample.cpu.usage_percent,
                    memory_percent: sample.memory.usage_percent,
                    latency_ms: sample.latency_ms,
                })
            })
            .collect();

        Telemetry {
            bucket_span_sec: self.window.spec().span_ms() as f64 / 1_000.0,
            window_sec: window.as_secs(),
            points,
        }
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn store_stats(&self) -> StoreStats {
        self.window.stats()
    }
}

#[async_trait]
impl Sampler for HostMonitor {
    fn name(&self) -> &str {
        "host"
    }

    async fn sample(&self) -> TickResult {
        self.sample_once().await
    }
}

// ============================================================================
// SECTION 15: HTTP REQUEST METRICS
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Request Completion Events
// ----------------------------------------------------------------------------

/// A completed HTTP request as reported by the serving layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestCompletion<'a> {
    pub timestamp: Timestamp,
    pub duration_ms: f64,
    pub status_code: u16,
    pub method: &'a str,
    pub route_key: &'a str,
}

/// Group a request path by its first two segments: `/api/setups/42?x=1` -> `/api/setups`.
pub fn route_key(path: &str) -> CompactString {
    let path = path
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or_default();

    let mut key = CompactString::default();
    for segment in path.split('/').filter(|s| !s.is_empty()).take(2) {
        key.push('/');
        key.push_str(segment);
    }
    if key.is_empty() {
        key.push('/');
    }
    key
}

/// `2xx`, `4xx`, ...
fn status_class(code: u16) -> CompactString {
    compact_str::format_compact!("{}xx", code / 100)
}

// ----------------------------------------------------------------------------
// 15.2 HTTP Snapshot & Series
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSnapshot {
    pub window_sec: u64,
    pub total_requests: u64,
    pub error_count: u64,
    pub rate_per_minute: f64,
    pub error_ratio: f64,
    pub latency_ms: PercentileSet,
    pub samples_truncated: bool,
    pub top_routes: Vec<CategoryCount>,
    pub status_codes: Vec<CategoryCount>,
    pub status_classes: Vec<CategoryCount>,
    pub methods: Vec<CategoryCount>,
}

impl HttpSnapshot {
    fn from_aggregate(aggregate: WindowAggregate) -> Self {
        Self {
            window_sec: aggregate.window_ms / 1_000,
            total_requests: aggregate.total_count,
            error_count: aggregate.error_count,
            rate_per_minute: aggregate.rate_per_minute,
            error_ratio: aggregate.error_ratio,
            latency_ms: aggregate.latency,
            samples_truncated: aggregate.samples_truncated,
            top_routes: aggregate.breakdown(Dimension::Route).to_vec(),
            status_codes: aggregate.breakdown(Dimension::Status).to_vec(),
            status_classes: aggregate.breakdown(Dimension::Tag).to_vec(),
            methods: aggregate.breakdown(Dimension::Method).to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpPoint {
    pub t: i64,
    pub count: u64,
    pub errors: u64,
    pub p95_ms: f64,
}

// ----------------------------------------------------------------------------
// 15.3 HTTP Metrics
// ----------------------------------------------------------------------------

/// Request counts, error ratio and duration percentiles per route/status/method.
#[derive(Debug)]
pub struct HttpMetrics {
    config: HttpMetricsConfig,
    window: TimeWindow,
    aggregator: SnapshotAggregator,
    rejected: AtomicU64,
}

impl HttpMetrics {
    pub fn new(config: HttpMetricsConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        let spec = config.window_spec()?;
        Ok(Self {
            window: TimeWindow::new("http", spec, clock),
            aggregator: SnapshotAggregator::new(config.top_n),
            rejected: AtomicU64::new(0),
            config,
        })
    }

    /// Fold one completed request into the bucket for its timestamp.
    pub fn on_request_completed(&self, completion: &RequestCompletion<'_>) -> Result<(), IngestError> {
        if let Err(e) = validate_completion(completion) {
            self.rejected.fetch_add(1, AtomicOrdering::Relaxed);
            return Err(e);
        }
        if self.window.is_ahead(completion.timestamp) {
            self.rejected.fetch_add(1, AtomicOrdering::Relaxed);
            return Err(IngestError::FutureTimestamp {
                timestamp_ms: completion.timestamp.as_millis(),
                now_ms: self.window.now().as_millis(),
            });
        }

        let observation = Observation::single()
            .with_sample(completion.duration_ms)
            .with_error(completion.status_code >= HTTP_ERROR_STATUS_FLOOR)
            .with_category(CategoryKey::status(completion.status_code))
            .with_category(CategoryKey::new(
                Dimension::Tag,
                status_class(completion.status_code),
            ))
            .with_category(CategoryKey::method(completion.method))
            .with_category(CategoryKey::route(completion.route_key));

        if !self.window.record_at(completion.timestamp, &observation) {
            trace!(
                target: "vigil::http",
                ts = completion.timestamp.as_millis(),
                "Late request completion dropped"
            );
        }
        Ok(())
    }

    /// Record a request that completed just now.
    pub fn record(
        &self,
        method: &str,
        path: &str,
        status_code: u16,
        duration: Duration,
    ) -> Result<(), IngestError> {
        let route = route_key(path);
        self.on_request_completed(&RequestCompletion {
            timestamp: self.window.now(),
            duration_ms: duration.as_secs_f64() * 1_000.0,
            status_code,
            method,
            route_key: &route,
        })
    }

    pub fn get_snapshot(&self, window_sec: Option<u64>) -> HttpSnapshot {
        let window = resolve_window(window_sec, self.config.default_window, self.config.retention);
        HttpSnapshot::from_aggregate(self.window.aggregate(window, &self.aggregator))
    }

    pub fn get_telemetry(&self, window_sec: Option<u64>) -> Telemetry<HttpPoint> {
        let window = resolve_window(window_sec, self.config.default_window, self.config.retention);
        let points = self
            .window
            .series(window)
            .into_iter()
            .map(|mut bucket| HttpPoint {
                t: bucket.start.as_millis(),
                count: bucket.count,
                errors: bucket.error_count,
                p95_ms: percentile(bucket.samples.make_contiguous(), 95.0),
            })
            .collect();

        Telemetry {
            bucket_span_sec: self.window.spec().span_ms() as f64 / 1_000.0,
            window_sec: window.as_secs(),
            points,
        }
    }

    /// Completions rejected by validation since start.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(AtomicOrdering::Relaxed)
    }

    pub fn store_stats(&self) -> StoreStats {
        self.window.stats()
    }
}

fn validate_completion(completion: &RequestCompletion<'_>) -> Result<(), IngestError> {
    let timestamp_ms = completion.timestamp.as_millis();
    if timestamp_ms < 0 {
        return Err(IngestError::NegativeTimestamp { timestamp_ms });
    }
    if !completion.duration_ms.is_finite() {
        return Err(IngestError::NonFinite {
            field: "duration_ms",
        });
    }
    if completion.duration_ms < 0.0 {
        return Err(IngestError::Negative {
            field: "duration_ms",
            value: completion.duration_ms,
        });
    }
    Ok(())
}

// ============================================================================
// SECTION 16: INSERT RATE REGISTRY
// ============================================================================
// One count-only window per client. The registry owns the map; nothing is
// global. Unknown clients read as zero.
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub client: String,
    pub window_sec: u64,
    pub total: u64,
    pub per_minute: f64,
    pub per_second: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePoint {
    pub t: i64,
    pub count: u64,
}

#[derive(Debug)]
pub struct InsertRateRegistry {
    spec: WindowSpec,
    clock: SharedClock,
    counters: DashMap<CompactString, Arc<TimeWindow>>,
}

impl InsertRateRegistry {
    pub fn new(config: InsertRateConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        Ok(Self {
            spec: config.window_spec()?,
            clock,
            counters: DashMap::new(),
        })
    }

    /// Count `n` inserts for `client` now.
    pub fn on_insert(&self, client: &str, n: u64) -> Result<(), IngestError> {
        self.on_insert_at(client, n, self.clock.now())
    }

    pub fn on_insert_at(&self, client: &str, n: u64, ts: Timestamp) -> Result<(), IngestError> {
        let client = client.trim();
        if client.is_empty() {
            return Err(IngestError::EmptyClientKey);
        }
        if ts.as_millis() < 0 {
            return Err(IngestError::NegativeTimestamp {
                timestamp_ms: ts.as_millis(),
            });
        }
        let now = self.clock.now();
        let clock = self.spec.clock();
        if clock.index_of(ts) > clock.index_of(now) {
            return Err(IngestError::FutureTimestamp {
                timestamp_ms: ts.as_millis(),
                now_ms: now.as_millis(),
            });
        }
        if n == 0 {
            return Ok(());
        }

        self.counter(client).increment_at(ts, n, None, false);
        Ok(())
    }

    fn counter(&self, client: &str) -> Arc<TimeWindow> {
        if let Some(existing) = self.counters.get(client) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .counters
            .entry(CompactString::from(client))
            .or_insert_with(|| {
                debug!(target: "vigil::inserts", client, "Tracking new insert client");
                Arc::new(TimeWindow::new(client, self.spec, Arc::clone(&self.clock)))
            });
        Arc::clone(entry.value())
    }

    fn lookup(&self, client: &str) -> Option<Arc<TimeWindow>> {
        self.counters
            .get(client)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Inserts over the full window, with per-minute and per-second rates.
    pub fn get_rate(&self, client: &str) -> RateSnapshot {
        let window = self.spec.retention();
        let total = self
            .lookup(client)
            .map(|counter| counter.aggregate(window, &SnapshotAggregator::default()).total_count)
            .unwrap_or(0);
        let secs = window.as_secs_f64();

        RateSnapshot {
            client: client.to_string(),
            window_sec: window.as_secs(),
            total,
            per_minute: rate_per_minute(total, window),
            per_second: if secs > 0.0 { total as f64 / secs } else { 0.0 },
        }
    }

    /// Dense series: one point per bucket span across the window, zero-filled.
    pub fn get_telemetry(&self, client: &str, window_sec: Option<u64>) -> Telemetry<RatePoint> {
        let retention = self.spec.retention();
        let window = resolve_window(window_sec, retention, retention);
        let clock = self.spec.clock();
        let now = self.clock.now();

        let counts: BTreeMap<i64, u64> = self
            .lookup(client)
            .map(|counter| {
                counter
                    .series(window)
                    .into_iter()
                    .map(|bucket| (bucket.index, bucket.count))
                    .collect()
            })
            .unwrap_or_default();

        let slots = (duration_to_millis(window) / clock.span_ms()).max(1);
        let last = clock.index_of(now);
        let points = (last - slots + 1..=last)
            .map(|index| RatePoint {
                t: clock.start_of(index).as_millis(),
                count: counts.get(&index).copied().unwrap_or(0),
            })
            .collect();

        Telemetry {
            bucket_span_sec: clock.span_ms() as f64 / 1_000.0,
            window_sec: window.as_secs(),
            points,
        }
    }

    /// Known clients, sorted.
    pub fn clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self
            .counters
            .iter()
            .map(|entry| entry.key().to_string())
            .collect();
        clients.sort();
        clients
    }

    /// Rates for every client with inserts inside the window. Clients whose
    /// window has emptied are dropped first.
    pub fn snapshot_all(&self) -> Vec<RateSnapshot> {
        self.prune_idle();
        self.clients()
            .iter()
            .map(|client| self.get_rate(client))
            .collect()
    }

    /// Drop every client whose window holds no live bucket. Returns how many
    /// were removed.
    pub fn prune_idle(&self) -> usize {
        let mut removed = 0;
        self.counters.retain(|client, counter| {
            counter.prune();
            if counter.is_empty() {
                debug!(target: "vigil::inserts", client = client.as_str(), "Dropped idle insert client");
                removed += 1;
                return false;
            }
            true
        });
        removed
    }

    /// Forget a client. Returns `false` if it was unknown.
    pub fn remove(&self, client: &str) -> bool {
        let removed = self.counters.remove(client).is_some();
        if removed {
            debug!(target: "vigil::inserts", client, "Removed insert client");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

// ============================================================================
// SECTION 17: TELEMETRY ENGINE
// ============================================================================
// Composition root: owns the three monitors, starts and stops the host
// scheduler, serves the read API and waits for a shutdown signal.
// ============================================================================

/// Engine-wide statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub instance: String,
    pub version: String,
    pub uptime_secs: u64,
    pub running: bool,
    pub host_scheduler: SchedulerStats,
    pub host_store: StoreStats,
    pub http_store: StoreStats,
    pub http_rejected: u64,
    pub insert_clients: usize,
}

#[derive(Debug)]
pub struct TelemetryEngine {
    config: EngineConfig,
    clock: SharedClock,
    host: Arc<HostMonitor>,
    http: Arc<HttpMetrics>,
    inserts: Arc<InsertRateRegistry>,
    shutdown: CancellationToken,
    running: AtomicBool,
    started_at: Instant,
}

impl TelemetryEngine {
    /// Build an engine reading the local host on the wall clock.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let probe = config
            .host
            .probe
            .enabled
            .then(|| LatencyProbe::from_config(&config.host.probe));
        Self::with_components(
            config,
            Arc::new(SystemClock),
            Arc::new(SysinfoHostReader::new()),
            probe,
        )
    }

    pub fn with_components(
        config: EngineConfig,
        clock: SharedClock,
        reader: Arc<dyn HostReader>,
        probe: Option<LatencyProbe>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let host = Arc::new(HostMonitor::new(
            config.host.clone(),
            Arc::clone(&clock),
            reader,
            probe,
        )?);
        let http = Arc::new(HttpMetrics::new(config.http.clone(), Arc::clone(&clock))?);
        let inserts = Arc::new(InsertRateRegistry::new(
            config.inserts.clone(),
            Arc::clone(&clock),
        )?);

        info!(
            target: "vigil::engine",
            instance = %config.engine.instance_name,
            host_interval_ms = config.host.sample_interval.as_millis() as u64,
            http_bucket_ms = config.http.bucket_span.as_millis() as u64,
            "Telemetry engine initialized"
        );

        Ok(Self {
            config,
            clock,
            host,
            http,
            inserts,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn host(&self) -> &Arc<HostMonitor> {
        &self.host
    }

    pub fn http(&self) -> &Arc<HttpMetrics> {
        &self.http
    }

    pub fn inserts(&self) -> &Arc<InsertRateRegistry> {
        &self.inserts
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    /// Start host sampling. Returns `false` if already started.
    pub fn start(&self) -> bool {
        if self.running.swap(true, AtomicOrdering::AcqRel) {
            return false;
        }
        self.host.start();
        info!(target: "vigil::engine", "Telemetry engine started");
        true
    }

    /// Stop host sampling and wait for an in-flight tick.
    pub async fn stop(&self) {
        if !self.running.swap(false, AtomicOrdering::AcqRel) {
            return;
        }
        self.host.shutdown().await;
        info!(target: "vigil::engine", "Telemetry engine stopped");
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until SIGINT/SIGTERM or [`request_shutdown`](Self::request_shutdown).
    pub async fn run(self: &Arc<Self>) -> EngineResult<()> {
        info!(
            target: "vigil::engine",
            version = ENGINE_VERSION,
            instance = %self.config.engine.instance_name,
            "Starting {}",
            ENGINE_FULL_NAME
        );

        #[cfg(feature = "http-api")]
        let api_task = if self.config.api.enabled {
            let listener = api::bind(&self.config.api.listen_addr).await?;
            Some(tokio::spawn(api::serve(
                listener,
                Arc::clone(self),
                self.shutdown.clone(),
            )))
        } else {
            None
        };

        self.start();

        let signals = {
            let token = self.shutdown.clone();
            tokio::spawn(async move {
                wait_for_signal().await;
                token.cancel();
            })
        };

        self.shutdown.cancelled().await;
        info!(target: "vigil::engine", "Shutdown requested");
        signals.abort();
        self.stop().await;

        #[cfg(feature = "http-api")]
        {
            if let Some(task) = api_task {
                match task.await {
                    Ok(result) => result?,
                    Err(e) => warn!(target: "vigil::engine", error = %e, "API task ended abnormally"),
                }
            }
        }

        info!(target: "vigil::engine", "Engine shutdown complete");
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            instance: self.config.engine.instance_name.clone(),
            version: ENGINE_VERSION.to_string(),
            uptime_secs: self.uptime().as_secs(),
            running: self.is_running(),
            host_scheduler: self.host.scheduler_stats(),
            host_store: self.host.store_stats(),
            http_store: self.http.store_stats(),
            http_rejected: self.http.rejected(),
            insert_clients: self.inserts.len(),
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!(target: "vigil::engine", "Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!(target: "vigil::engine", "Received SIGINT"),
                }
            }
            Err(e) => {
                warn!(target: "vigil::engine", error = %e, "SIGTERM handler unavailable");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!(target: "vigil::engine", "Received SIGINT");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "vigil::engine", "Received Ctrl+C");
        }
    }
}

// ============================================================================
// SECTION 18: PHASE 3 TESTS - MONITORS & ENGINE
// ============================================================================


// ============================================================================
// SECTION 19: TELEMETRY READ API
// ============================================================================
// JSON read endpoints over the engine. Host endpoints answer 503 until the
// first host sample lands. Every request served here is itself fed into the
// HTTP metrics.
// ============================================================================

#[cfg(feature = "http-api")]
pub mod api {
    use super::*;

    use axum::{
        extract::{Path as AxumPath, Query, Request, State},
        http::StatusCode,
        middleware::{self, Next},
        response::{IntoResponse, Response},
        routing::get,
        Json, Router,
    };
    use tokio::net::TcpListener;
    use tower_http::trace::TraceLayer;

    pub type SharedEngine = Arc<TelemetryEngine>;

    /// `?window_sec=N`
    #[derive(Debug, Clone, Copy, Default, Deserialize)]
    pub struct WindowQuery {
        pub window_sec: Option<u64>,
    }

    pub fn router(engine: SharedEngine) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/api/stats", get(engine_stats))
            .route("/api/telemetry/host", get(host_snapshot))
            .route("/api/telemetry/host/series", get(host_series))
            .route("/api/telemetry/http", get(http_snapshot))
            .route("/api/telemetry/http/series", get(http_series))
            .route("/api/telemetry/inserts", get(insert_rates))
            .route(
                "/api/telemetry/inserts/:client",
                get(insert_rate).delete(remove_client),
            )
            .route("/api/telemetry/inserts/:client/series", get(insert_series))
            .fallback(not_found)
            .layer(middleware::from_fn_with_state(
                Arc::clone(&engine),
                track_requests,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(engine)
    }

    pub async fn bind(listen_addr: &str) -> EngineResult<TcpListener> {
        let addr: SocketAddr = listen_addr.parse().map_err(|_| {
            ConfigError::invalid_value(
                "api.listen_addr",
                format!("'{}' is not a socket address", listen_addr),
            )
        })?;
        let listener = TcpListener::bind(addr).await?;
        info!(target: "vigil::api", addr = %addr, "Telemetry API listening");
        Ok(listener)
    }

    /// Serve until `shutdown` is cancelled. A serving error cancels it too.
    pub async fn serve(
        listener: TcpListener,
        engine: SharedEngine,
        shutdown: CancellationToken,
    ) -> EngineResult<()> {
        let graceful = shutdown.clone();
        let served = axum::serve(listener, router(engine))
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await;

        if let Err(e) = served {
            error!(target: "vigil::api", error = %e, "Telemetry API failed");
            shutdown.cancel();
            return Err(e.into());
        }
        info!(target: "vigil::api", "Telemetry API stopped");
        Ok(())
    }

    async fn track_requests(
        State(engine): State<SharedEngine>,
        request: Request,
        next: Next,
    ) -> Response {
        let method = request.method().clone();
        let route = route_key(request.uri().path());
        let started = Instant::now();

        let response = next.run(request).await;

        let completion = RequestCompletion {
            timestamp: engine.clock().now(),
            duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
            status_code: response.status().as_u16(),
            method: method.as_str(),
            route_key: &route,
        };
        if let Err(e) = engine.http().on_request_completed(&completion) {
            debug!(target: "vigil::api", error = %e, "Request metrics rejected");
        }
        response
    }

    fn warming_up(engine: &TelemetryEngine) -> Response {
        let body = json!({
            "status": "warming_up",
            "message": "No host sample has been collected yet",
            "sample_interval_ms": engine.config().host.sample_interval.as_millis() as u64,
        });
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }

    async fn not_found() -> Response {
        (StatusCode::NOT_FOUND, Json(json!({ "status": "not_found" }))).into_response()
    }

    async fn health(State(engine): State<SharedEngine>) -> Json<serde_json::Value> {
        Json(json!({
            "status": "ok",
            "name": ENGINE_NAME,
            "version": ENGINE_VERSION,
            "running": engine.is_running(),
            "uptime_secs": engine.uptime().as_secs(),
        }))
    }

    async fn engine_stats(State(engine): State<SharedEngine>) -> Json<EngineStats> {
        Json(engine.stats())
    }

    async fn host_snapshot(State(engine): State<SharedEngine>) -> Response {
        let snapshot = engine.host().get_snapshot();
        if snapshot.warming_up {
            return warming_up(&engine);
        }
        Json(snapshot).into_response()
    }

    async fn host_series(
        State(engine): State<SharedEngine>,
        Query(query): Query<WindowQuery>,
    ) -> Response {
        if engine.host().is_warming_up() {
            return warming_up(&engine);
        }
        Json(engine.host().get_telemetry(query.window_sec)).into_response()
    }

    async fn http_snapshot(
        State(engine): State<SharedEngine>,
        Query(query): Query<WindowQuery>,
    ) -> Json<HttpSnapshot> {
        Json(engine.http().get_snapshot(query.window_sec))
    }

    async fn http_series(
        State(engine): State<SharedEngine>,
        Query(query): Query<WindowQuery>,
    ) -> Json<Telemetry<HttpPoint>> {
        Json(engine.http().get_telemetry(query.window_sec))
    }

    async fn insert_rates(State(engine): State<SharedEngine>) -> Json<Vec<RateSnapshot>> {
        Json(engine.inserts().snapshot_all())
    }

    async fn insert_rate(
        State(engine): State<SharedEngine>,
        AxumPath(client): AxumPath<String>,
    ) -> Json<RateSnapshot> {
        Json(engine.inserts().get_rate(&client))
    }

    async fn insert_series(
        State(engine): State<SharedEngine>,
        AxumPath(client): AxumPath<String>,
        Query(query): Query<WindowQuery>,
    ) -> Json<Telemetry<RatePoint>> {
        Json(engine.inserts().get_telemetry(&client, query.window_sec))
    }

    async fn remove_client(
        State(engine): State<SharedEngine>,
        AxumPath(client): AxumPath<String>,
    ) -> StatusCode {
        if engine.inserts().remove(&client) {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::NOT_FOUND
        }
    }
}

// ============================================================================
// SECTION 20: CLI INTERFACE
// ============================================================================

/// Vigil - windowed telemetry engine for the OPC UA dashboard
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "vigil.toml", env = "VIGIL_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "VIGIL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Run the engine (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show the parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Measure round-trip latency to a host once
    Probe {
        /// Host to probe (defaults to the configured target)
        host: Option<String>,

        /// TCP fallback port
        #[arg(long)]
        port: Option<u16>,

        /// Per-stage timeout, e.g. "2s"
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },

    /// Collect one host sample and print it as JSON
    Sample {
        /// Single-line JSON
        #[arg(long)]
        compact: bool,
    },

    /// Show version information
    Version,
}

/// Entry point shared by the `vigil` binary.
pub async fn run_cli(cli: Cli) -> AnyhowResult<()> {
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            return handle_generate_config(output.as_deref());
        }
        Some(Commands::Validate { verbose }) => {
            return handle_validate(&cli.config, *verbose);
        }
        _ => {}
    }

    let config_exists = cli.config.exists();
    let mut config = if config_exists {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }
    init_logging(&config.logging).context("Failed to initialize logging")?;

    if !config_exists {
        warn!(
            target: "vigil::cli",
            path = %cli.config.display(),
            "Configuration file not found, using defaults"
        );
    }

    match cli.command {
        Some(Commands::Probe {
            host,
            port,
            timeout,
        }) => handle_probe(&config, host, port, timeout).await,
        Some(Commands::Sample { compact }) => handle_sample(&config, compact).await,
        _ => {
            let engine = Arc::new(TelemetryEngine::new(config).context("Failed to build engine")?);
            engine.run().await.context("Engine terminated with an error")?;
            Ok(())
        }
    }
}

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = EngineConfig::load(config_path)
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;
    println!("✅ Configuration is valid!");

    if verbose {
        println!("\n📋 Parsed configuration:");
        println!("{}", "=".repeat(60));
        println!("{}", toml::to_string_pretty(&config)?);
    }

    println!("\n📊 Configuration Summary:");
    println!("  • Instance name: {}", config.engine.instance_name);
    println!(
        "  • Host sampling: every {}, kept for {}",
        humantime::format_duration(config.host.sample_interval),
        humantime::format_duration(config.host.retention)
    );
    if config.host.probe.enabled {
        println!(
            "  • Latency probe: {} (tcp fallback port {})",
            config.host.probe.target, config.host.probe.port
        );
    }
    println!(
        "  • HTTP buckets: {} spans, {} samples each",
        humantime::format_duration(config.http.bucket_span),
        config.http.sample_cap
    );
    println!(
        "  • Insert counters: {} points over {}",
        config.inserts.points,
        humantime::format_duration(config.inserts.window)
    );
    if config.api.enabled {
        println!("  • Read API: {}", config.api.listen_addr);
    }

    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Bucketed windows with continuous eviction");
    println!("  • Nearest-rank latency percentiles");
    println!("  • Host, HTTP and per-client insert telemetry");
    if cfg!(feature = "http-api") {
        println!("  • JSON read API");
    }
}

async fn handle_probe(
    config: &EngineConfig,
    host: Option<String>,
    port: Option<u16>,
    timeout: Option<Duration>,
) -> AnyhowResult<()> {
    let host = host.unwrap_or_else(|| config.host.probe.target.clone());
    let probe = LatencyProbe::new(
        timeout.unwrap_or(config.host.probe.timeout),
        port.unwrap_or(config.host.probe.port),
    );

    match probe.measure(&host).await {
        Ok(ms) => println!("{}: {:.3} ms", host, ms),
        Err(e) => println!("{}: latency unknown ({})", host, e),
    }
    Ok(())
}

async fn handle_sample(config: &EngineConfig, compact: bool) -> AnyhowResult<()> {
    let reader = SysinfoHostReader::new();
    // CPU usage needs two refreshes spaced by the sysinfo minimum
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    let mut sample = reader.read(Timestamp::now()).await?;

    if config.host.probe.enabled {
        sample.latency_ms = LatencyProbe::from_config(&config.host.probe)
            .measure(&config.host.probe.target)
            .await
            .ok();
    }

    let rendered = if compact {
        serde_json::to_string(&sample)?
    } else {
        serde_json::to_string_pretty(&sample)?
    };
    println!("{}", rendered);
    Ok(())
}

// ============================================================================
// SECTION 21: PHASE 4 TESTS - CONFIGURATION, CLI & API
// ============================================================================

#[cfg(test)]
mod phase4_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.host.sample_interval, Duration::from_secs(5));
        assert_eq!(config.http.sample_cap, DEFAULT_SAMPLE_CAP);
        assert_eq!(config.inserts.window_spec().unwrap().span_ms(), 1_000);
    }

    #[test]
    fn test_config_from_toml_with_humantime() {
        let config = EngineConfig::from_toml_str(
            r#"
            [host]
            sample_interval = "2s"
            retention = "30m"

            [host.probe]
            target = "historian.local"
            timeout = "500ms"

            [http]
            bucket_span = "15s"
            top_n = 5

            [inserts]
            window = "2m"
            points = 24
            "#,
        )
        .unwrap();

        assert_eq!(config.host.sample_interval, Duration::from_secs(2));
        assert_eq!(config.host.retention, Duration::from_secs(1_800));
        assert_eq!(config.host.probe.target, "historian.local");
        assert_eq!(config.host.probe.timeout, Duration::from_millis(500));
        assert_eq!(config.host.probe.port, DEFAULT_PROBE_PORT);
        assert_eq!(config.http.bucket_span, Duration::from_secs(15));
        assert_eq!(config.http.top_n, 5);
        assert_eq!(config.inserts.window_spec().unwrap().span_ms(), 5_000);
    }

    #[test]
    fn test_config_validation_names_the_field() {
        let err = EngineConfig::from_toml_str("[host]\nsample_interval = \"10ms\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "host.sample_interval"));

        let err = EngineConfig::from_toml_str("[http]\nbucket_span = \"1m\"\nretention = \"30s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "http.retention"));

        let err = EngineConfig::from_toml_str("[inserts]\npoints = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "inserts.points"));

        let err = EngineConfig::from_toml_str("[api]\nlisten_addr = \"nowhere\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "api.listen_addr"));

        let err = EngineConfig::from_toml_str("[http]\nsample_cap = \"lots\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_generated_config_parses_back() {
        let rendered = EngineConfig::generate_default_config();
        assert!(rendered.contains("sample_interval = \"5s\""));
        assert_eq!(EngineConfig::from_toml_str(&rendered).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_config_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\ninstance_name = \"line-3\"\n\n[http]\nsample_cap = 500").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.engine.instance_name, "line-3");
        assert_eq!(config.http.sample_cap, 500);
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert_eq!(
            EngineConfig::load(&path),
            Err(ConfigError::FileNotFound { path: path.clone() })
        );
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["vigil", "--config", "/etc/vigil.toml", "probe", "db.local", "--timeout", "750ms"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/vigil.toml"));
        assert_eq!(
            cli.command,
            Some(Commands::Probe {
                host: Some("db.local".into()),
                port: None,
                timeout: Some(Duration::from_millis(750)),
            })
        );

        let cli = Cli::try_parse_from(["vigil", "generate-config", "-o", "out.toml"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::GenerateConfig { output: Some(PathBuf::from("out.toml")) })
        );

        let cli = Cli::try_parse_from(["vigil"]).unwrap();
        assert_eq!(cli.command, None);
    }

    #[test]
    fn test_timestamp_display_is_rfc3339() {
        assert_eq!(Timestamp::from_millis(1_500).to_string(), "1970-01-01T00:00:01.500Z");
        assert_eq!(Timestamp::from_secs(2).as_millis(), 2_000);
    }

    #[cfg(feature = "http-api")]
    mod api_routes {
        use super::*;
        use crate::phase3_tests::test_engine;
        use axum::body::{to_bytes, Body};
        use axum::http::{Method, Request, StatusCode};
        use pretty_assertions::assert_eq;
        use tower::ServiceExt;

        async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, body)
        }

        #[tokio::test]
        async fn test_host_endpoints_warm_up() {
            let engine = test_engine(Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000))));
            let app = api::router(Arc::clone(&engine));

            let (status, body) = get_json(&app, "/api/telemetry/host").await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(body["status"], "warming_up");
            let (status, _) = get_json(&app, "/api/telemetry/host/series").await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

            engine.host().sample_once().await.unwrap();

            let (status, body) = get_json(&app, "/api/telemetry/host").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["warming_up"], false);
            let (status, body) = get_json(&app, "/api/telemetry/host/series?window_sec=60").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["window_sec"], 60);
            assert_eq!(body["points"].as_array().map(Vec::len), Some(1));
        }

        #[tokio::test]
        async fn test_requests_feed_http_metrics() {
            let engine = test_engine(Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000))));
            let app = api::router(Arc::clone(&engine));

            for _ in 0..3 {
                let (status, _) = get_json(&app, "/health").await;
                assert_eq!(status, StatusCode::OK);
            }
            let (status, _) = get_json(&app, "/api/missing/route").await;
            assert_eq!(status, StatusCode::NOT_FOUND);

            let (_, body) = get_json(&app, "/api/telemetry/http?window_sec=60").await;
            assert_eq!(body["total_requests"], 4);
            assert_eq!(body["error_count"], 0);
            assert_eq!(body["top_routes"][0]["key"], "/health");
            assert_eq!(body["top_routes"][0]["count"], 3);
        }

        #[tokio::test]
        async fn test_insert_endpoints() {
            let engine = test_engine(Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000))));
            engine.inserts().on_insert("plc-7", 12).unwrap();
            let app = api::router(Arc::clone(&engine));

            let (_, body) = get_json(&app, "/api/telemetry/inserts").await;
            assert_eq!(body[0]["client"], "plc-7");
            let (_, body) = get_json(&app, "/api/telemetry/inserts/plc-7").await;
            assert_eq!(body["total"], 12);
            let (_, body) = get_json(&app, "/api/telemetry/inserts/plc-7/series?window_sec=10").await;
            assert_eq!(body["points"].as_array().map(Vec::len), Some(10));

            let delete = |uri: &'static str| {
                app.clone().oneshot(
                    Request::builder()
                        .method(Method::DELETE)
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
            };
            assert_eq!(delete("/api/telemetry/inserts/plc-7").await.unwrap().status(), StatusCode::NO_CONTENT);
            assert_eq!(delete("/api/telemetry/inserts/plc-7").await.unwrap().status(), StatusCode::NOT_FOUND);
        }
    }
}
