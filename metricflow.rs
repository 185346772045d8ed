//! # Metricflow - Push-Based Metrics Pipeline
//!
//! A single crate that ships two roles: an **agent** that samples process and
//! host metrics and pushes them upstream, and a **server** that ingests those
//! updates, answers queries and persists them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── AGENT ─────────────────────────────┐
//! │ COLLECTORS → METRIC STORE → BATCH QUEUE → REPORT WORKERS (N)    │
//! │                                   │  json → encrypt → sign → gzip │
//! └───────────────────────────────────┼─────────────────────────────┘
//!                                     ▼  POST /updates/ (retried)
//! ┌──────────────────────────── SERVER ────────────────────────────┐
//! │ gunzip → verify → decrypt → validate → METRIC STORE → STORAGE   │
//! │                                          (memory | file | sql)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Metric Kinds
//!
//! - **Counter**: signed 64-bit accumulator, updates are additive deltas
//! - **Gauge**: 64-bit float, last write wins

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::future::Future;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use flume::{Receiver as FlumeReceiver, Sender as FlumeSender};
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

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
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::Utc;

// ----------------------------------------------------------------------------
// Networking - HTTP Client & Server
// ----------------------------------------------------------------------------
use axum::{
    body::Body,
    extract::{Path as UrlPath, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self as axum_middleware, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reqwest::Client as HttpClient;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// Compression
// ----------------------------------------------------------------------------
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

// ----------------------------------------------------------------------------
// Cryptography & Encoding
// ----------------------------------------------------------------------------
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

// ----------------------------------------------------------------------------
// Persistence
// ----------------------------------------------------------------------------
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// System Information
// ----------------------------------------------------------------------------
use sysinfo::{Pid, System as SysInfoSystem};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Json as JsonProvider, Serialized, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Args, Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

pub const METRICFLOW_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const METRICFLOW_NAME: &str = "metricflow";
pub const METRICFLOW_FULL_NAME: &str = "Metricflow Metrics Pipeline";

// ----------------------------------------------------------------------------
// Wire Protocol
// ----------------------------------------------------------------------------

/// Header carrying the hex HMAC-SHA256 of the body.
pub const SIGNATURE_HEADER: &str = "HashSHA256";

pub const UPDATE_PATH: &str = "/update/";
pub const BATCH_UPDATE_PATH: &str = "/updates/";

// ----------------------------------------------------------------------------
// Agent Defaults
// ----------------------------------------------------------------------------

pub const DEFAULT_ADDRESS: &str = "localhost:8080";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT: usize = 3;
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

/// Additional attempts after the first failed send.
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_STEP_MS: u64 = 2_000;

// ----------------------------------------------------------------------------
// Server Defaults
// ----------------------------------------------------------------------------

pub const DEFAULT_STORE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_FILE_STORAGE_PATH: &str = "./metrics.json";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_DB_CONNECT_RETRIES: u32 = 3;
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

// ----------------------------------------------------------------------------
// Crypto
// ----------------------------------------------------------------------------

pub const DEFAULT_RSA_BITS: usize = 4096;
pub const AES_KEY_LEN: usize = 32;

/// Environment variables read by the agent, matched case-insensitively.
pub const AGENT_ENV_KEYS: &[&str] = &[
    "address",
    "poll_interval",
    "report_interval",
    "rate_limit",
    "key",
    "crypto_key",
];

/// Environment variables read by the server, matched case-insensitively.
pub const SERVER_ENV_KEYS: &[&str] = &[
    "address",
    "store_interval",
    "file_storage_path",
    "restore",
    "database_dsn",
    "key",
    "crypto_key",
];

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Metric Kind
// ----------------------------------------------------------------------------

/// The two metric kinds understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            other => Err(IngestError::UnknownKind(other.to_string())),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.2 Metric Values
// ----------------------------------------------------------------------------

/// A kind-tagged metric value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Counter(i64),
    Gauge(f64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Gauge(_) => MetricKind::Gauge,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Counter(v) => *v as f64,
            MetricValue::Gauge(v) => *v,
        }
    }

    /// Parse a path-encoded value according to `kind`.
    pub fn parse(kind: MetricKind, raw: &str) -> IngestResult<Self> {
        let invalid = || IngestError::InvalidValue { raw: raw.to_string() };
        match kind {
            MetricKind::Counter => raw.parse::<i64>().map(MetricValue::Counter).map_err(|_| invalid()),
            MetricKind::Gauge => raw.parse::<f64>().map(MetricValue::Gauge).map_err(|_| invalid()),
        }
    }
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Counter(v) => write!(f, "{}", v),
            MetricValue::Gauge(v) => write!(f, "{}", v),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Metric
// ----------------------------------------------------------------------------

/// A named observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub id: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Counter(delta),
        }
    }

    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Gauge(value),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Shape checks that do not depend on stored state.
    pub fn validate(&self) -> IngestResult<()> {
        if self.id.is_empty() {
            return Err(IngestError::EmptyName);
        }
        if let MetricValue::Gauge(v) = self.value {
            if !v.is_finite() {
                return Err(IngestError::NonFiniteGauge { id: self.id.clone() });
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Wire Record
// ----------------------------------------------------------------------------

/// JSON shape exchanged between agent and server.
///
/// Exactly one of `delta` / `value` is populated, selected by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl From<&Metric> for MetricPayload {
    fn from(metric: &Metric) -> Self {
        let (delta, value) = match metric.value {
            MetricValue::Counter(d) => (Some(d), None),
            MetricValue::Gauge(v) => (None, Some(v)),
        };
        Self {
            id: metric.id.clone(),
            kind: metric.kind().as_str().to_string(),
            delta,
            value,
        }
    }
}

impl TryFrom<MetricPayload> for Metric {
    type Error = IngestError;

    fn try_from(payload: MetricPayload) -> Result<Self, Self::Error> {
        let kind: MetricKind = payload.kind.parse()?;
        let value = match kind {
            MetricKind::Counter => payload.delta.map(MetricValue::Counter),
            MetricKind::Gauge => payload.value.map(MetricValue::Gauge),
        }
        .ok_or_else(|| IngestError::MissingValue {
            id: payload.id.clone(),
            kind,
        })?;

        let metric = Metric { id: payload.id, value };
        metric.validate()?;
        Ok(metric)
    }
}

// ----------------------------------------------------------------------------
// 3.5 Metric Batch
// ----------------------------------------------------------------------------

/// Ordered collection of metrics shipped in one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricBatch {
    metrics: Vec<Metric>,
}

impl MetricBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metric: Metric) {
        self.metrics.push(metric);
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.iter()
    }

    pub fn first(&self) -> Option<&Metric> {
        self.metrics.first()
    }

    pub fn pop_front(&mut self) -> Option<Metric> {
        if self.metrics.is_empty() {
            None
        } else {
            Some(self.metrics.remove(0))
        }
    }

    pub fn clear(&mut self) {
        self.metrics.clear();
    }

    pub fn counter_total(&self, id: &str) -> Option<i64> {
        self.metrics.iter().find(|m| m.id == id).and_then(|m| match m.value {
            MetricValue::Counter(d) => Some(d),
            MetricValue::Gauge(_) => None,
        })
    }

    /// Fold `other` into this batch: counter deltas add up, gauges take the later value.
    pub fn merge(&mut self, other: MetricBatch) {
        let mut index: HashMap<(MetricKind, String), usize> = self
            .metrics
            .iter()
            .enumerate()
            .map(|(i, m)| ((m.kind(), m.id.clone()), i))
            .collect();

        for metric in other.metrics {
            match index.get(&(metric.kind(), metric.id.clone())) {
                Some(&i) => {
                    let slot = &mut self.metrics[i].value;
                    *slot = match (*slot, metric.value) {
                        (MetricValue::Counter(a), MetricValue::Counter(b)) => MetricValue::Counter(a.saturating_add(b)),
                        (_, newer) => newer,
                    };
                }
                None => {
                    index.insert((metric.kind(), metric.id.clone()), self.metrics.len());
                    self.metrics.push(metric);
                }
            }
        }
    }

    pub fn to_payloads(&self) -> Vec<MetricPayload> {
        self.metrics.iter().map(MetricPayload::from).collect()
    }
}

impl FromIterator<Metric> for MetricBatch {
    fn from_iter<I: IntoIterator<Item = Metric>>(iter: I) -> Self {
        Self {
            metrics: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for MetricBatch {
    type Item = Metric;
    type IntoIter = std::vec::IntoIter<Metric>;

    fn into_iter(self) -> Self::IntoIter {
        self.metrics.into_iter()
    }
}

// ----------------------------------------------------------------------------
// 3.6 Snapshot
// ----------------------------------------------------------------------------

/// Point-in-time copy of a store. Also the on-disk file format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    #[serde(rename = "CounterData", default)]
    pub counters: BTreeMap<String, i64>,
    #[serde(rename = "GaugeData", default)]
    pub gauges: BTreeMap<String, f64>,
}

impl MetricSnapshot {
    pub fn len(&self) -> usize {
        self.counters.len() + self.gauges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.gauges.is_empty()
    }

    pub fn to_batch(&self) -> MetricBatch {
        self.counters
            .iter()
            .map(|(id, v)| Metric::counter(id.clone(), *v))
            .chain(self.gauges.iter().map(|(id, v)| Metric::gauge(id.clone(), *v)))
            .collect()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Crate Errors
// ----------------------------------------------------------------------------

/// Top-level error; every subsystem error converts into it.
#[derive(Error, Debug)]
pub enum MetricflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl MetricflowError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            MetricflowError::Config(_) => false,
            MetricflowError::Collector(e) => e.is_recoverable(),
            MetricflowError::Storage(e) => e.is_recoverable(),
            MetricflowError::Transport(e) => e.is_recoverable(),
            MetricflowError::Ingest(_) => true,
            MetricflowError::Crypto(_) => false,
            MetricflowError::Io(_) => true,
            MetricflowError::Internal(_) => false,
            MetricflowError::ShuttingDown => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            MetricflowError::Config(_) => "config",
            MetricflowError::Collector(_) => "collector",
            MetricflowError::Storage(_) => "storage",
            MetricflowError::Transport(_) => "transport",
            MetricflowError::Ingest(_) => "ingest",
            MetricflowError::Crypto(_) => "crypto",
            MetricflowError::Io(_) => "io",
            MetricflowError::Internal(_) => "internal",
            MetricflowError::ShuttingDown => "shutdown",
        }
    }
}

/// Returned by [`retry`] when the cancellation token fires during a backoff wait.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
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

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::ParseError { message: e.to_string() }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Collector Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Collection failed for '{collector}': {message}")]
    CollectionFailed { collector: String, message: String },

    #[error("Collector '{name}' is unavailable on this platform")]
    Unavailable { name: String },
}

impl CollectorError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CollectorError::Unavailable { .. })
    }

    pub fn collection_failed(collector: impl Into<String>, message: impl Into<String>) -> Self {
        CollectorError::CollectionFailed {
            collector: collector.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Storage Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Background task failed: {message}")]
    Task { message: String },

    #[error("Operation cancelled")]
    Cancelled(#[from] Cancelled),
}

impl StorageError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StorageError::Serialization { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization { message: e.to_string() }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Crypto Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Failed to load key from {path}: {message}")]
    KeyLoad { path: PathBuf, message: String },

    #[error("Key generation failed: {message}")]
    KeyGeneration { message: String },

    #[error("Encryption failed: {message}")]
    Encrypt { message: String },

    #[error("Decryption failed: {message}")]
    Decrypt { message: String },

    #[error("Malformed envelope: {message}")]
    MalformedEnvelope { message: String },
}

impl CryptoError {
    fn key_load(path: &Path, message: impl Display) -> Self {
        CryptoError::KeyLoad {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Transport Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server answered {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Encoding failed: {message}")]
    Encode { message: String },

    #[error("Payload crypto failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Delivery cancelled")]
    Cancelled(#[from] Cancelled),
}

impl TransportError {
    /// Worth another attempt: network failures, timeouts, 5xx and throttling.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Request(_) => true,
            TransportError::UnexpectedStatus { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            _ => false,
        }
    }

    /// The server refused the payload itself; resending it unchanged cannot succeed.
    pub fn is_rejection(&self) -> bool {
        match self {
            TransportError::UnexpectedStatus { status, .. } => (400..500).contains(status) && !matches!(status, 408 | 429),
            _ => false,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.7 Ingest Errors
// ----------------------------------------------------------------------------

/// Rejections produced while decoding and validating an inbound update.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unknown metric type '{0}'")]
    UnknownKind(String),

    #[error("metric '{id}' of type {kind} carries no value")]
    MissingValue { id: String, kind: MetricKind },

    #[error("invalid metric value '{raw}'")]
    InvalidValue { raw: String },

    #[error("gauge '{id}' must be finite")]
    NonFiniteGauge { id: String },

    #[error("metric name must not be empty")]
    EmptyName,

    #[error("metric '{id}' is already registered as a {existing}")]
    KindConflict { id: String, existing: MetricKind },

    #[error("malformed request body: {message}")]
    Malformed { message: String },

    #[error("Corrupted sign on request")]
    BadSignature,

    #[error("failed to decrypt payload")]
    Decrypt(#[from] CryptoError),

    #[error("failed to decompress body: {message}")]
    Decompress { message: String },

    #[error("request body too large")]
    BodyTooLarge,

    #[error("{kind} '{id}' not found")]
    NotFound { kind: MetricKind, id: String },
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::NotFound { .. } => StatusCode::NOT_FOUND,
            IngestError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        IngestError::Malformed { message: e.to_string() }
    }
}

// ----------------------------------------------------------------------------
// 4.8 Result Type Aliases
// ----------------------------------------------------------------------------

pub type MetricflowResult<T> = Result<T, MetricflowError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type CollectorResult<T> = Result<T, CollectorError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type CryptoResult<T> = Result<T, CryptoError>;
pub type TransportResult<T> = Result<T, TransportError>;
pub type IngestResult<T> = Result<T, IngestError>;


// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Both roles are configured in layers, lowest precedence first:
// built-in defaults, an optional JSON/TOML file, CLI flags, environment.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Shared Configuration Blocks
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

/// Backoff settings for agent deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Added to the delay after every failed attempt
    #[serde(default = "default_retry_step_ms")]
    pub step_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            initial_delay_ms: default_retry_initial_delay_ms(),
            step_ms: default_retry_step_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            step: Duration::from_millis(self.step_ms),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 Agent Configuration
// ----------------------------------------------------------------------------

/// Agent configuration. Intervals are whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Server address, `host:port` or a full base URL
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    #[serde(default = "default_report_interval")]
    pub report_interval: u64,

    /// Number of concurrent report workers
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,

    /// Shared HMAC secret
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub key: Option<String>,

    /// Path to the server's RSA public key (PEM)
    #[serde(default)]
    pub crypto_key: Option<PathBuf>,

    /// Ship one `/updates/` request per report instead of one request per metric
    #[serde(default = "default_true")]
    pub batch: bool,

    #[serde(default = "default_true")]
    pub compress: bool,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_http_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            poll_interval: default_poll_interval(),
            report_interval: default_report_interval(),
            rate_limit: default_rate_limit(),
            key: None,
            crypto_key: None,
            batch: true,
            compress: true,
            queue_capacity: default_queue_capacity(),
            request_timeout_secs: default_http_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Defaults, then the optional file, then CLI flags. Environment is layered on by [`load`](Self::load).
    pub fn figment(file: Option<&Path>, overrides: &AgentArgs) -> ConfigResult<Figment> {
        let figment = Figment::from(Serialized::defaults(AgentConfig::default()));
        let figment = merge_config_file(figment, file)?;
        Ok(figment.merge(Serialized::defaults(overrides)))
    }

    /// Load configuration from every layer, environment included.
    pub fn load(overrides: &AgentArgs) -> ConfigResult<Self> {
        let figment = Self::figment(overrides.config.as_deref(), overrides)?
            .merge(Env::raw().only(AGENT_ENV_KEYS))
            .merge(Env::prefixed("METRICFLOW_").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> ConfigResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::invalid_value("address", "must not be empty"));
        }
        if self.poll_interval == 0 {
            return Err(ConfigError::invalid_value("poll_interval", "must be at least 1 second"));
        }
        if self.report_interval == 0 {
            return Err(ConfigError::invalid_value("report_interval", "must be at least 1 second"));
        }
        if self.rate_limit == 0 {
            return Err(ConfigError::invalid_value("rate_limit", "at least one report worker is required"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid_value("queue_capacity", "must be positive"));
        }
        Ok(())
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn report_period(&self) -> Duration {
        Duration::from_secs(self.report_interval)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Base URL of the server, with a scheme.
    pub fn base_url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        }
    }
}

// ----------------------------------------------------------------------------
// 5.3 Server Configuration
// ----------------------------------------------------------------------------

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_address")]
    pub address: String,

    /// Seconds between snapshots; 0 writes synchronously after each update
    #[serde(default = "default_store_interval")]
    pub store_interval: u64,

    /// Snapshot file; empty disables the file backend
    #[serde(default = "default_file_storage_path")]
    pub file_storage_path: String,

    /// Load persisted metrics at startup
    #[serde(default = "default_true")]
    pub restore: bool,

    /// Relational DSN; takes precedence over the file backend
    #[serde(default)]
    pub database_dsn: Option<String>,

    #[serde(default, deserialize_with = "deserialize_secret")]
    pub key: Option<String>,

    /// Path to the RSA private key (PEM)
    #[serde(default)]
    pub crypto_key: Option<PathBuf>,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            store_interval: default_store_interval(),
            file_storage_path: default_file_storage_path(),
            restore: true,
            database_dsn: None,
            key: None,
            crypto_key: None,
            db_max_connections: default_db_max_connections(),
            max_body_bytes: default_max_body_bytes(),
            shutdown_grace_secs: default_shutdown_grace(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn figment(file: Option<&Path>, overrides: &ServerArgs) -> ConfigResult<Figment> {
        let figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        let figment = merge_config_file(figment, file)?;
        Ok(figment.merge(Serialized::defaults(overrides)))
    }

    pub fn load(overrides: &ServerArgs) -> ConfigResult<Self> {
        let figment = Self::figment(overrides.config.as_deref(), overrides)?
            .merge(Env::raw().only(SERVER_ENV_KEYS))
            .merge(Env::prefixed("METRICFLOW_").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> ConfigResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::invalid_value("address", "must not be empty"));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::invalid_value("max_body_bytes", "must be positive"));
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::invalid_value("db_max_connections", "must be positive"));
        }
        Ok(())
    }

    pub fn store_period(&self) -> Duration {
        Duration::from_secs(self.store_interval)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// A DSN given as an empty string counts as unset.
    pub fn dsn(&self) -> Option<&str> {
        self.database_dsn.as_deref().map(str::trim).filter(|d| !d.is_empty())
    }
}

// ----------------------------------------------------------------------------
// 5.4 Loader Helpers
// ----------------------------------------------------------------------------

fn merge_config_file(figment: Figment, file: Option<&Path>) -> ConfigResult<Figment> {
    let Some(path) = file else {
        return Ok(figment);
    };
    if !path.exists() {
        return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
    }
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    Ok(if is_json {
        figment.merge(JsonProvider::file(path))
    } else {
        figment.merge(Toml::file(path))
    })
}

/// Environment values are parsed eagerly, so a numeric secret arrives as a number.
fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSecret {
        Text(String),
        Signed(i64),
        Unsigned(u64),
        Float(f64),
        Flag(bool),
    }

    Ok(Option::<RawSecret>::deserialize(deserializer)?
        .map(|raw| match raw {
            RawSecret::Text(s) => s,
            RawSecret::Signed(n) => n.to_string(),
            RawSecret::Unsigned(n) => n.to_string(),
            RawSecret::Float(n) => n.to_string(),
            RawSecret::Flag(b) => b.to_string(),
        })
        .filter(|s| !s.is_empty()))
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}

fn default_address() -> String {
    DEFAULT_ADDRESS.into()
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_report_interval() -> u64 {
    DEFAULT_REPORT_INTERVAL_SECS
}

fn default_rate_limit() -> usize {
    DEFAULT_RATE_LIMIT
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_shutdown_grace() -> u64 {
    SHUTDOWN_GRACE_PERIOD_SECS
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_retry_initial_delay_ms() -> u64 {
    DEFAULT_RETRY_INITIAL_DELAY_MS
}

fn default_retry_step_ms() -> u64 {
    DEFAULT_RETRY_STEP_MS
}

fn default_store_interval() -> u64 {
    DEFAULT_STORE_INTERVAL_SECS
}

fn default_file_storage_path() -> String {
    DEFAULT_FILE_STORAGE_PATH.into()
}

fn default_db_max_connections() -> u32 {
    DEFAULT_DB_MAX_CONNECTIONS
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_agent_defaults() {
        let config = AgentConfig::from_figment(AgentConfig::figment(None, &AgentArgs::default()).unwrap()).unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.poll_period(), Duration::from_secs(2));
        assert_eq!(config.report_period(), Duration::from_secs(10));
        assert_eq!(config.rate_limit, 3);
        assert_eq!(config.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::from_figment(ServerConfig::figment(None, &ServerArgs::default()).unwrap()).unwrap();
        assert_eq!(config.store_interval, 300);
        assert_eq!(config.file_storage_path, "./metrics.json");
        assert!(config.restore);
        assert_eq!(config.dsn(), None);
    }

    #[test]
    fn test_json_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        fs::write(
            &path,
            r#"{"address": "collector:9090", "report_interval": 20, "poll_interval": 5, "key": "s3cret"}"#,
        )
        .unwrap();

        let flags = AgentArgs {
            poll_interval: Some(1),
            ..AgentArgs::default()
        };
        let config = AgentConfig::from_figment(AgentConfig::figment(Some(&path), &flags).unwrap()).unwrap();

        assert_eq!(config.address, "collector:9090");
        assert_eq!(config.report_interval, 20);
        assert_eq!(config.poll_interval, 1);
        assert_eq!(config.key.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_toml_server_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        fs::write(
            &path,
            "store_interval = 0\nrestore = false\ndatabase_dsn = \"sqlite::memory:\"\n[logging]\nformat = \"json\"\n",
        )
        .unwrap();

        let config = ServerConfig::from_figment(ServerConfig::figment(Some(&path), &ServerArgs::default()).unwrap()).unwrap();
        assert_eq!(config.store_interval, 0);
        assert!(!config.restore);
        assert_eq!(config.dsn(), Some("sqlite::memory:"));
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_missing_config_file() {
        let result = AgentConfig::figment(Some(Path::new("/definitely/not/here.json")), &AgentArgs::default());
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_validation_rejects_zero_rate_limit() {
        let config = AgentConfig {
            rate_limit: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "rate_limit"
        ));
    }

    #[test]
    fn test_numeric_secret_is_accepted() {
        let figment = AgentConfig::figment(None, &AgentArgs::default())
            .unwrap()
            .merge(Serialized::default("key", 12345));
        let config = AgentConfig::from_figment(figment).unwrap();
        assert_eq!(config.key.as_deref(), Some("12345"));
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> MetricflowResult<()> {
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
                .map_err(|e| MetricflowError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| MetricflowError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| MetricflowError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "metricflow::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: METRIC STORE
// ============================================================================
// Latest value per metric name, shared by `Arc` between collectors, report
// workers, HTTP handlers and the persistence loop. Every read and mutation
// happens under one read/write lock that is never held across an await.
// ============================================================================

#[derive(Debug, Default)]
pub struct MetricStore {
    inner: RwLock<MetricSnapshot>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_counter(&self, name: &str, delta: i64) -> i64 {
        let mut inner = self.inner.write();
        add_counter(&mut inner, name, delta)
    }

    pub fn update_gauge(&self, name: &str, value: f64) -> f64 {
        let mut inner = self.inner.write();
        inner.gauges.insert(name.to_string(), value);
        value
    }

    /// Apply one metric and return the resulting stored value.
    pub fn apply(&self, metric: &Metric) -> IngestResult<MetricValue> {
        let mut applied = self.apply_all(std::slice::from_ref(metric))?;
        applied
            .pop()
            .ok_or_else(|| IngestError::Malformed { message: "empty update".into() })
    }

    /// All-or-nothing: nothing is written unless every metric passes validation.
    pub fn apply_all(&self, metrics: &[Metric]) -> IngestResult<Vec<MetricValue>> {
        let mut inner = self.inner.write();

        let mut seen: HashMap<&str, MetricKind> = HashMap::new();
        for metric in metrics {
            metric.validate()?;
            let kind = metric.kind();
            let existing = seen.get(metric.id.as_str()).copied().or_else(|| stored_kind(&inner, &metric.id));
            if let Some(existing) = existing {
                if existing != kind {
                    return Err(IngestError::KindConflict {
                        id: metric.id.clone(),
                        existing,
                    });
                }
            }
            seen.insert(metric.id.as_str(), kind);
        }

        Ok(metrics
            .iter()
            .map(|metric| match metric.value {
                MetricValue::Counter(delta) => MetricValue::Counter(add_counter(&mut inner, &metric.id, delta)),
                MetricValue::Gauge(value) => {
                    inner.gauges.insert(metric.id.clone(), value);
                    MetricValue::Gauge(value)
                }
            })
            .collect())
    }

    pub fn counter(&self, name: &str) -> Option<i64> {
        self.inner.read().counters.get(name).copied()
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.inner.read().gauges.get(name).copied()
    }

    pub fn get(&self, kind: MetricKind, name: &str) -> Option<MetricValue> {
        match kind {
            MetricKind::Counter => self.counter(name).map(MetricValue::Counter),
            MetricKind::Gauge => self.gauge(name).map(MetricValue::Gauge),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Consistent point-in-time copy.
    pub fn snapshot(&self) -> MetricSnapshot {
        self.inner.read().clone()
    }

    /// Replay a persisted snapshot: counters add, gauges overwrite.
    pub fn restore(&self, snapshot: MetricSnapshot) {
        let mut inner = self.inner.write();
        for (name, value) in snapshot.counters {
            add_counter(&mut inner, &name, value);
        }
        inner.gauges.extend(snapshot.gauges);
    }

    /// Copy gauges and drain counters in one step.
    ///
    /// Counters in the returned batch are the deltas accumulated since the previous take.
    pub fn take_batch(&self) -> MetricBatch {
        let mut inner = self.inner.write();
        let counters = std::mem::take(&mut inner.counters);
        counters
            .into_iter()
            .map(|(id, delta)| Metric::counter(id, delta))
            .chain(inner.gauges.iter().map(|(id, v)| Metric::gauge(id.clone(), *v)))
            .collect()
    }

    /// Put the counter deltas of an undelivered batch back so the next batch carries them.
    pub fn requeue(&self, batch: &MetricBatch) {
        let mut inner = self.inner.write();
        for metric in batch.iter() {
            if let MetricValue::Counter(delta) = metric.value {
                add_counter(&mut inner, &metric.id, delta);
            }
        }
    }
}

fn add_counter(snapshot: &mut MetricSnapshot, name: &str, delta: i64) -> i64 {
    let total = snapshot.counters.entry(name.to_string()).or_insert(0);
    *total = total.saturating_add(delta);
    *total
}

fn stored_kind(snapshot: &MetricSnapshot, name: &str) -> Option<MetricKind> {
    if snapshot.counters.contains_key(name) {
        Some(MetricKind::Counter)
    } else if snapshot.gauges.contains_key(name) {
        Some(MetricKind::Gauge)
    } else {
        None
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_gauge_update_is_idempotent() {
        let store = MetricStore::new();
        store.update_gauge("Alloc", 3.5);
        let once = store.snapshot();
        store.update_gauge("Alloc", 3.5);
        assert_eq!(store.snapshot(), once);
    }

    #[test]
    fn test_counter_is_additive_in_any_order() {
        let forward = MetricStore::new();
        let backward = MetricStore::new();
        let deltas = [5, 7, -2, 40];

        for d in deltas {
            forward.update_counter("PollCount", d);
        }
        for d in deltas.iter().rev() {
            backward.update_counter("PollCount", *d);
        }

        assert_eq!(forward.counter("PollCount"), Some(50));
        assert_eq!(backward.counter("PollCount"), Some(50));
    }

    #[test]
    fn test_counter_saturates() {
        let store = MetricStore::new();
        store.update_counter("big", i64::MAX);
        assert_eq!(store.update_counter("big", 1), i64::MAX);
    }

    #[test]
    fn test_apply_all_rejects_whole_batch() {
        let store = MetricStore::new();
        let batch = vec![
            Metric::counter("a", 1),
            Metric::gauge("b", 2.0),
            Metric::gauge("c", f64::INFINITY),
        ];

        assert!(store.apply_all(&batch).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_kind_conflict_is_rejected() {
        let store = MetricStore::new();
        store.update_counter("requests", 1);

        let err = store.apply(&Metric::gauge("requests", 1.0)).unwrap_err();
        assert!(matches!(err, IngestError::KindConflict { existing: MetricKind::Counter, .. }));

        let err = store
            .apply_all(&[Metric::gauge("x", 1.0), Metric::counter("x", 1)])
            .unwrap_err();
        assert!(matches!(err, IngestError::KindConflict { .. }));
        assert_eq!(store.gauge("x"), None);
    }

    #[test]
    fn test_apply_returns_running_total() {
        let store = MetricStore::new();
        assert_eq!(store.apply(&Metric::counter("hits", 5)).unwrap(), MetricValue::Counter(5));
        assert_eq!(store.apply(&Metric::counter("hits", 7)).unwrap(), MetricValue::Counter(12));
    }

    #[test]
    fn test_take_batch_drains_counters_only() {
        let store = MetricStore::new();
        store.update_counter("PollCount", 3);
        store.update_gauge("RandomValue", 0.25);

        let batch = store.take_batch();
        assert_eq!(batch.counter_total("PollCount"), Some(3));
        assert_eq!(batch.len(), 2);

        assert_eq!(store.counter("PollCount"), None);
        assert_eq!(store.gauge("RandomValue"), Some(0.25));

        store.update_counter("PollCount", 1);
        store.requeue(&batch);
        assert_eq!(store.counter("PollCount"), Some(4));
    }

    #[test]
    fn test_restore_replays_counters() {
        let store = MetricStore::new();
        store.update_counter("hits", 2);
        store.update_gauge("temp", 1.0);

        let mut snapshot = MetricSnapshot::default();
        snapshot.counters.insert("hits".into(), 10);
        snapshot.gauges.insert("temp".into(), 36.6);
        store.restore(snapshot);

        assert_eq!(store.counter("hits"), Some(12));
        assert_eq!(store.gauge("temp"), Some(36.6));
    }

    #[test]
    fn test_concurrent_updates() {
        let store = Arc::new(MetricStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.update_counter("PollCount", 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.counter("PollCount"), Some(8000));
    }
}

// ============================================================================
// SECTION 8: PAYLOAD CODEC (SIGNING, ENCRYPTION, COMPRESSION)
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 HMAC Signing
// ----------------------------------------------------------------------------

/// HMAC-SHA256 signer shared by agent and server.
#[derive(Debug, Clone)]
pub struct Signer {
    key: hmac::Key,
}

impl Signer {
    pub fn new(secret: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    /// Hex-encoded signature of `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        hex::encode(hmac::sign(&self.key, body).as_ref())
    }

    /// Constant-time check of a hex signature.
    pub fn verify(&self, body: &[u8], signature_hex: &str) -> bool {
        match hex::decode(signature_hex.trim()) {
            Ok(tag) => hmac::verify(&self.key, body, &tag).is_ok(),
            Err(_) => false,
        }
    }
}

// ----------------------------------------------------------------------------
// 8.2 Hybrid Encryption
// ----------------------------------------------------------------------------

/// Wire envelope for encrypted bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// AES key wrapped with RSA-OAEP(SHA-256), base64
    pub aes_key: String,
    /// nonce ‖ AES-256-GCM ciphertext, base64
    pub data: String,
}

/// Agent side: encrypts with the server's public key.
#[derive(Debug, Clone)]
pub struct Encryptor {
    public_key: RsaPublicKey,
}

impl Encryptor {
    pub fn new(public_key: RsaPublicKey) -> Self {
        Self { public_key }
    }

    /// Accepts SPKI ("PUBLIC KEY") or PKCS#1 ("RSA PUBLIC KEY") PEM.
    pub fn from_pem_file(path: &Path) -> CryptoResult<Self> {
        let pem = fs::read_to_string(path).map_err(|e| CryptoError::key_load(path, e))?;
        let public_key = RsaPublicKey::from_public_key_pem(&pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
            .map_err(|e| CryptoError::key_load(path, e))?;
        Ok(Self::new(public_key))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let rng = SystemRandom::new();
        let mut key_bytes = [0u8; AES_KEY_LEN];
        rng.fill(&mut key_bytes).map_err(|_| CryptoError::Encrypt {
            message: "system randomness unavailable".into(),
        })?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Encrypt {
            message: "system randomness unavailable".into(),
        })?;

        let key = aes_key(&key_bytes).map_err(|message| CryptoError::Encrypt { message })?;
        let mut sealed = plaintext.to_vec();
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut sealed)
            .map_err(|_| CryptoError::Encrypt {
                message: "AES-GCM seal failed".into(),
            })?;

        let mut data = Vec::with_capacity(NONCE_LEN + sealed.len());
        data.extend_from_slice(&nonce_bytes);
        data.extend_from_slice(&sealed);

        let wrapped_key = self
            .public_key
            .encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), &key_bytes)
            .map_err(|e| CryptoError::Encrypt { message: e.to_string() })?;

        let envelope = EncryptedEnvelope {
            aes_key: BASE64.encode(wrapped_key),
            data: BASE64.encode(data),
        };
        serde_json::to_vec(&envelope).map_err(|e| CryptoError::Encrypt { message: e.to_string() })
    }
}

/// Server side: opens envelopes with the private key.
#[derive(Debug, Clone)]
pub struct Decryptor {
    private_key: RsaPrivateKey,
}

impl Decryptor {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self { private_key }
    }

    /// Accepts PKCS#1 ("RSA PRIVATE KEY") or PKCS#8 ("PRIVATE KEY") PEM.
    pub fn from_pem_file(path: &Path) -> CryptoResult<Self> {
        let pem = fs::read_to_string(path).map_err(|e| CryptoError::key_load(path, e))?;
        let private_key = RsaPrivateKey::from_pkcs1_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
            .map_err(|e| CryptoError::key_load(path, e))?;
        Ok(Self::new(private_key))
    }

    pub fn decrypt(&self, body: &[u8]) -> CryptoResult<Vec<u8>> {
        let envelope: EncryptedEnvelope = serde_json::from_slice(body).map_err(|e| CryptoError::MalformedEnvelope {
            message: e.to_string(),
        })?;
        let wrapped_key = BASE64.decode(&envelope.aes_key).map_err(|e| CryptoError::MalformedEnvelope {
            message: format!("aes_key: {}", e),
        })?;
        let data = BASE64.decode(&envelope.data).map_err(|e| CryptoError::MalformedEnvelope {
            message: format!("data: {}", e),
        })?;
        if data.len() < NONCE_LEN {
            return Err(CryptoError::MalformedEnvelope {
                message: "ciphertext shorter than nonce".into(),
            });
        }

        let key_bytes = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &wrapped_key)
            .map_err(|e| CryptoError::Decrypt { message: e.to_string() })?;
        let key = aes_key(&key_bytes).map_err(|message| CryptoError::Decrypt { message })?;

        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| CryptoError::Decrypt {
            message: "invalid nonce".into(),
        })?;
        let mut buffer = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Decrypt {
                message: "authentication failed".into(),
            })?;
        Ok(plaintext.to_vec())
    }
}

fn aes_key(bytes: &[u8]) -> Result<LessSafeKey, String> {
    UnboundKey::new(&AES_256_GCM, bytes)
        .map(LessSafeKey::new)
        .map_err(|_| format!("expected a {}-byte AES key, got {}", AES_KEY_LEN, bytes.len()))
}

// ----------------------------------------------------------------------------
// 8.3 Key Generation
// ----------------------------------------------------------------------------

/// Write `private.pem` (PKCS#1) and `public.pem` (SPKI) into `dir`.
pub fn generate_key_pair(dir: &Path, bits: usize) -> CryptoResult<(PathBuf, PathBuf)> {
    let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
        .map_err(|e| CryptoError::KeyGeneration { message: e.to_string() })?;
    let private_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| CryptoError::KeyGeneration { message: e.to_string() })?;
    let public_pem = RsaPublicKey::from(&private_key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::KeyGeneration { message: e.to_string() })?;

    let private_path = dir.join("private.pem");
    let public_path = dir.join("public.pem");
    fs::write(&private_path, private_pem.as_bytes()).map_err(|e| CryptoError::key_load(&private_path, e))?;
    fs::write(&public_path, public_pem.as_bytes()).map_err(|e| CryptoError::key_load(&public_path, e))?;
    Ok((private_path, public_path))
}

// ----------------------------------------------------------------------------
// 8.4 Gzip
// ----------------------------------------------------------------------------

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflate at most `limit` bytes; anything beyond is an error.
pub fn gunzip(data: &[u8], limit: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "decompressed body exceeds limit",
        ));
    }
    Ok(out)
}


// ============================================================================
// SECTION 9: RETRY WITH LINEAR BACKOFF
// ============================================================================

/// `1 + retries` attempts in total; the wait grows by `step` after each failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_delay: Duration,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().policy()
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// Returns the last error once retries run out, or [`Cancelled`] (converted into `E`)
/// as soon as `cancel` fires during a backoff wait.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, cancel: &CancellationToken, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<Cancelled> + Display,
{
    retry_if(policy, cancel, |_| true, op).await
}

/// Like [`retry`], but an error for which `should_retry` is false is returned at once.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<Cancelled> + Display,
    P: Fn(&E) -> bool,
{
    let mut delay = policy.initial_delay;
    let mut attempt: u32 = 0;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= policy.retries || !should_retry(&err) {
            return Err(err);
        }
        attempt += 1;

        warn!(
            target: "metricflow::retry",
            attempt,
            retries = policy.retries,
            delay = %humantime::format_duration(delay),
            error = %err,
            "Attempt failed, backing off"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            _ = sleep(delay) => {}
        }
        delay += policy.step;
    }
}


// ============================================================================
// SECTION 10: COLLECTORS
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Collector Trait
// ----------------------------------------------------------------------------

/// A sample source run on every poll tick.
pub trait Collector: Send + Debug {
    fn name(&self) -> &'static str;

    /// Write the current sample into `store`; returns how many metrics were written.
    fn collect(&mut self, store: &MetricStore) -> CollectorResult<usize>;
}

// ----------------------------------------------------------------------------
// 10.2 Runtime Collector
// ----------------------------------------------------------------------------

/// Process gauges for the agent itself, plus `PollCount` and `RandomValue`.
#[derive(Debug)]
pub struct RuntimeCollector {
    system: SysInfoSystem,
    pid: Option<Pid>,
}

impl RuntimeCollector {
    pub fn new() -> Self {
        Self {
            system: SysInfoSystem::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for RuntimeCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for RuntimeCollector {
    fn name(&self) -> &'static str {
        "runtime"
    }

    fn collect(&mut self, store: &MetricStore) -> CollectorResult<usize> {
        store.update_counter("PollCount", 1);
        store.update_gauge("RandomValue", rand::thread_rng().gen::<f64>());

        let pid = self.pid.ok_or_else(|| CollectorError::Unavailable {
            name: self.name().to_string(),
        })?;
        if !self.system.refresh_process(pid) {
            return Err(CollectorError::collection_failed(self.name(), format!("process {} not found", pid)));
        }
        let process = self
            .system
            .process(pid)
            .ok_or_else(|| CollectorError::collection_failed(self.name(), "process vanished after refresh"))?;

        let disk = process.disk_usage();
        let gauges = [
            ("ResidentMemory", process.memory() as f64),
            ("VirtualMemory", process.virtual_memory() as f64),
            ("ProcessCPU", process.cpu_usage() as f64),
            ("DiskReadBytes", disk.total_read_bytes as f64),
            ("DiskWrittenBytes", disk.total_written_bytes as f64),
            ("Uptime", process.run_time() as f64),
        ];
        for (name, value) in gauges {
            store.update_gauge(name, value);
        }
        Ok(gauges.len() + 2)
    }
}

// ----------------------------------------------------------------------------
// 10.3 Host Collector
// ----------------------------------------------------------------------------

/// Host memory and per-CPU utilization.
#[derive(Debug)]
pub struct HostCollector {
    system: SysInfoSystem,
}

impl HostCollector {
    pub fn new() -> Self {
        Self {
            system: SysInfoSystem::new(),
        }
    }
}

impl Default for HostCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for HostCollector {
    fn name(&self) -> &'static str {
        "host"
    }

    fn collect(&mut self, store: &MetricStore) -> CollectorResult<usize> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(CollectorError::Unavailable {
                name: self.name().to_string(),
            });
        }

        self.system.refresh_memory();
        self.system.refresh_cpu();

        store.update_gauge("TotalMemory", self.system.total_memory() as f64);
        store.update_gauge("FreeMemory", self.system.free_memory() as f64);
        store.update_gauge("AvailableMemory", self.system.available_memory() as f64);
        store.update_gauge("UsedMemory", self.system.used_memory() as f64);

        let cpus = self.system.cpus();
        for (i, cpu) in cpus.iter().enumerate() {
            store.update_gauge(&format!("CPUutilization{}", i + 1), cpu.cpu_usage() as f64);
        }
        Ok(4 + cpus.len())
    }
}

// ----------------------------------------------------------------------------
// 10.4 Collector Set
// ----------------------------------------------------------------------------

/// Runs every registered collector; a failing collector is skipped for that tick.
#[derive(Debug, Default)]
pub struct CollectorSet {
    collectors: Vec<Box<dyn Collector>>,
}

impl CollectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime and host collectors.
    pub fn standard() -> Self {
        Self::new()
            .with(RuntimeCollector::new())
            .with(HostCollector::new())
    }

    pub fn with(mut self, collector: impl Collector + 'static) -> Self {
        self.collectors.push(Box::new(collector));
        self
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    pub fn collect_all(&mut self, store: &MetricStore) -> usize {
        let mut written = 0;
        for collector in self.collectors.iter_mut() {
            match collector.collect(store) {
                Ok(n) => written += n,
                Err(e) => warn!(
                    target: "metricflow::collector",
                    collector = collector.name(),
                    error = %e,
                    "Collector failed, skipping this tick"
                ),
            }
        }
        trace!(target: "metricflow::collector", written, "Poll complete");
        written
    }
}


// ============================================================================
// SECTION 11: TRANSPORT
// ============================================================================
// JSON → optional envelope encryption → optional HMAC → optional gzip → POST.
// Only HTTP 200 counts as delivered.
// ============================================================================

/// A request body after every enabled transform.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRequest {
    pub body: Vec<u8>,
    pub signature: Option<String>,
    pub gzipped: bool,
}

#[derive(Debug, Clone)]
pub struct Transport {
    client: HttpClient,
    base_url: String,
    signer: Option<Signer>,
    encryptor: Option<Encryptor>,
    compress: bool,
}

impl Transport {
    pub fn new(config: &AgentConfig) -> MetricflowResult<Self> {
        let encryptor = config
            .crypto_key
            .as_deref()
            .map(Encryptor::from_pem_file)
            .transpose()?;
        let signer = config.key.as_deref().map(Signer::new);
        Ok(Self::builder(config.base_url())
            .signer(signer)
            .encryptor(encryptor)
            .compress(config.compress)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?)
    }

    pub fn builder(base_url: impl Into<String>) -> TransportBuilder {
        TransportBuilder {
            base_url: base_url.into(),
            signer: None,
            encryptor: None,
            compress: true,
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Apply the enabled transforms to a JSON body.
    pub fn encode(&self, json: Vec<u8>) -> TransportResult<EncodedRequest> {
        let body = match &self.encryptor {
            Some(encryptor) => encryptor.encrypt(&json)?,
            None => json,
        };
        let signature = self.signer.as_ref().map(|signer| signer.sign(&body));
        let (body, gzipped) = if self.compress {
            let packed = gzip(&body).map_err(|e| TransportError::Encode { message: e.to_string() })?;
            (packed, true)
        } else {
            (body, false)
        };
        Ok(EncodedRequest {
            body,
            signature,
            gzipped,
        })
    }

    /// One request to `/updates/` carrying the whole batch.
    pub async fn send_batch(&self, batch: &MetricBatch) -> TransportResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let json = serde_json::to_vec(&batch.to_payloads()).map_err(|e| TransportError::Encode { message: e.to_string() })?;
        self.post(BATCH_UPDATE_PATH, json).await
    }

    /// One request to `/update/` for a single metric.
    pub async fn send_metric(&self, metric: &Metric) -> TransportResult<()> {
        let json = serde_json::to_vec(&MetricPayload::from(metric)).map_err(|e| TransportError::Encode { message: e.to_string() })?;
        self.post(UPDATE_PATH, json).await
    }

    /// Ship `pending` either as one request or metric by metric.
    ///
    /// Metrics leave `pending` as the server accepts them, so after an error it
    /// holds exactly what was not delivered.
    pub async fn deliver(&self, pending: &Mutex<MetricBatch>, batched: bool) -> TransportResult<()> {
        if batched {
            let batch = pending.lock().clone();
            self.send_batch(&batch).await?;
            pending.lock().clear();
            return Ok(());
        }
        loop {
            let next = pending.lock().first().cloned();
            let Some(metric) = next else {
                return Ok(());
            };
            self.send_metric(&metric).await?;
            pending.lock().pop_front();
        }
    }

    async fn post(&self, path: &str, json: Vec<u8>) -> TransportResult<()> {
        let encoded = self.encode(json)?;

        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if encoded.gzipped {
            request = request.header(reqwest::header::CONTENT_ENCODING, "gzip");
        }
        if let Some(signature) = &encoded.signature {
            request = request.header(SIGNATURE_HEADER, signature.as_str());
        }

        let response = request.body(encoded.body).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::UnexpectedStatus {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        debug!(target: "metricflow::transport", path, status = status.as_u16(), "Delivered");
        Ok(())
    }
}

#[derive(Debug)]
pub struct TransportBuilder {
    base_url: String,
    signer: Option<Signer>,
    encryptor: Option<Encryptor>,
    compress: bool,
    timeout: Duration,
}

impl TransportBuilder {
    pub fn signer(mut self, signer: Option<Signer>) -> Self {
        self.signer = signer;
        self
    }

    pub fn encryptor(mut self, encryptor: Option<Encryptor>) -> Self {
        self.encryptor = encryptor;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> TransportResult<Transport> {
        let client = HttpClient::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(2)
            .build()?;
        Ok(Transport {
            client,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            signer: self.signer,
            encryptor: self.encryptor,
            compress: self.compress,
        })
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;

    #[test]
    fn test_encode_plain_body_passes_through() {
        let transport = Transport::builder("http://localhost:8080").compress(false).build().unwrap();
        let encoded = transport.encode(b"[]".to_vec()).unwrap();
        assert_eq!(
            encoded,
            EncodedRequest {
                body: b"[]".to_vec(),
                signature: None,
                gzipped: false,
            }
        );
    }

    #[test]
    fn test_signature_covers_uncompressed_body() {
        let transport = Transport::builder("http://localhost:8080")
            .signer(Some(Signer::new("k")))
            .build()
            .unwrap();
        let json = br#"[{"id":"a","type":"counter","delta":1}]"#.to_vec();

        let encoded = transport.encode(json.clone()).unwrap();

        assert!(encoded.gzipped);
        let inflated = gunzip(&encoded.body, 1 << 20).unwrap();
        assert_eq!(inflated, json);
        assert!(Signer::new("k").verify(&inflated, encoded.signature.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let transport = Transport::builder("http://127.0.0.1:1")
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let batch: MetricBatch = vec![Metric::counter("PollCount", 1)].into_iter().collect();
        let err = transport.send_batch(&batch).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_sent() {
        let transport = Transport::builder("http://127.0.0.1:1").build().unwrap();
        assert!(transport.send_batch(&MetricBatch::new()).await.is_ok());
    }

    #[rstest::rstest]
    #[case(400, false, true)]
    #[case(404, false, true)]
    #[case(408, true, false)]
    #[case(429, true, false)]
    #[case(500, true, false)]
    #[case(503, true, false)]
    fn test_status_classification(#[case] status: u16, #[case] recoverable: bool, #[case] rejection: bool) {
        let err = TransportError::UnexpectedStatus {
            status,
            body: String::new(),
        };
        assert_eq!(err.is_recoverable(), recoverable);
        assert_eq!(err.is_rejection(), rejection);
    }
}

// ============================================================================
// SECTION 12: REPORT SCHEDULER (AGENT)
// ============================================================================
// One poll task feeds a bounded queue; `rate_limit` report workers each own a
// report ticker, merge whatever is queued and deliver it with retry.
// ============================================================================

/// Timing and fan-out for the agent loops.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub poll_period: Duration,
    pub report_period: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub batched: bool,
    pub shutdown_grace: Duration,
}

impl From<&AgentConfig> for SchedulerSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            poll_period: config.poll_period(),
            report_period: config.report_period(),
            workers: config.rate_limit.max(1),
            queue_capacity: config.queue_capacity.max(1),
            retry: config.retry.policy(),
            batched: config.batch,
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

#[derive(Debug, Default)]
struct AgentCounters {
    polls: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Totals reported when the agent stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentReport {
    pub polls: u64,
    pub delivered_batches: u64,
    pub failed_batches: u64,
    pub final_flush_delivered: bool,
}

#[derive(Debug)]
pub struct Agent {
    settings: SchedulerSettings,
    store: Arc<MetricStore>,
    transport: Arc<Transport>,
    collectors: CollectorSet,
}

impl Agent {
    pub fn new(config: &AgentConfig) -> MetricflowResult<Self> {
        Ok(Self::with_parts(
            SchedulerSettings::from(config),
            Transport::new(config)?,
            CollectorSet::standard(),
        ))
    }

    pub fn with_parts(settings: SchedulerSettings, transport: Transport, collectors: CollectorSet) -> Self {
        Self {
            settings,
            store: Arc::new(MetricStore::new()),
            transport: Arc::new(transport),
            collectors,
        }
    }

    pub fn store(&self) -> Arc<MetricStore> {
        Arc::clone(&self.store)
    }

    /// Run until `cancel` fires, then flush once within the grace period.
    pub async fn run(self, cancel: CancellationToken) -> AgentReport {
        let Agent {
            settings,
            store,
            transport,
            collectors,
        } = self;
        let counters = Arc::new(AgentCounters::default());
        let (tx, rx) = flume::bounded::<MetricBatch>(settings.queue_capacity);

        info!(
            target: "metricflow::agent",
            server = transport.base_url(),
            poll = %humantime::format_duration(settings.poll_period),
            report = %humantime::format_duration(settings.report_period),
            workers = settings.workers,
            "Agent started"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(poll_loop(
            collectors,
            Arc::clone(&store),
            tx,
            settings.poll_period,
            Arc::clone(&counters),
            cancel.clone(),
        ));
        for worker_id in 0..settings.workers {
            tasks.spawn(report_worker(
                worker_id,
                rx.clone(),
                Arc::clone(&transport),
                Arc::clone(&store),
                settings.clone(),
                Arc::clone(&counters),
                cancel.clone(),
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(target: "metricflow::agent", error = %e, "Agent task panicked");
            }
        }

        let final_flush_delivered = final_flush(&rx, &store, &transport, &settings).await;

        let report = AgentReport {
            polls: counters.polls.load(AtomicOrdering::Relaxed),
            delivered_batches: counters.delivered.load(AtomicOrdering::Relaxed),
            failed_batches: counters.failed.load(AtomicOrdering::Relaxed),
            final_flush_delivered,
        };
        info!(
            target: "metricflow::agent",
            polls = report.polls,
            delivered = report.delivered_batches,
            failed = report.failed_batches,
            "Agent stopped"
        );
        report
    }
}

async fn poll_loop(
    mut collectors: CollectorSet,
    store: Arc<MetricStore>,
    tx: FlumeSender<MetricBatch>,
    period: Duration,
    counters: Arc<AgentCounters>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        collectors.collect_all(&store);
        counters.polls.fetch_add(1, AtomicOrdering::Relaxed);

        let batch = store.take_batch();
        if batch.is_empty() {
            continue;
        }

        tokio::select! {
            sent = tx.send_async(batch.clone()) => {
                if sent.is_err() {
                    store.requeue(&batch);
                    break;
                }
            }
            _ = cancel.cancelled() => {
                store.requeue(&batch);
                break;
            }
        }
    }
    debug!(target: "metricflow::agent", "Poll loop stopped");
}

async fn report_worker(
    worker_id: usize,
    rx: FlumeReceiver<MetricBatch>,
    transport: Arc<Transport>,
    store: Arc<MetricStore>,
    settings: SchedulerSettings,
    counters: Arc<AgentCounters>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(settings.report_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let pending = drain_queue(&rx);
        if pending.is_empty() {
            continue;
        }

        let metrics = pending.len();
        match deliver_report(&transport, pending, &settings, &cancel).await {
            Ok(dropped) => {
                counters.delivered.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(target: "metricflow::agent", worker_id, metrics, dropped, "Report delivered");
            }
            Err(failure) => {
                store.requeue(&failure.undelivered);
                if matches!(failure.error, TransportError::Cancelled(_)) {
                    break;
                }
                counters.failed.fetch_add(1, AtomicOrdering::Relaxed);
                error!(
                    target: "metricflow::agent",
                    worker_id,
                    metrics,
                    undelivered = failure.undelivered.len(),
                    error = %failure.error,
                    "Report failed after retries, undelivered deltas requeued"
                );
            }
        }
    }
    debug!(target: "metricflow::agent", worker_id, "Report worker stopped");
}

/// What remained of a report when delivery gave up.
#[derive(Debug)]
pub struct ReportFailure {
    pub error: TransportError,
    pub undelivered: MetricBatch,
}

/// Deliver one report, retrying recoverable failures.
///
/// A rejected batch is resent metric by metric; a metric the server rejects on its own
/// is dropped so it cannot hold back later reports. Returns how many were dropped.
pub async fn deliver_report(
    transport: &Transport,
    report: MetricBatch,
    settings: &SchedulerSettings,
    cancel: &CancellationToken,
) -> Result<usize, ReportFailure> {
    let pending = Mutex::new(report);
    let mut batched = settings.batched;
    let mut dropped = 0;

    loop {
        let result = retry_if(settings.retry, cancel, TransportError::is_recoverable, || {
            transport.deliver(&pending, batched)
        })
        .await;
        let error = match result {
            Ok(()) => return Ok(dropped),
            Err(e) if e.is_rejection() => e,
            Err(error) => {
                return Err(ReportFailure {
                    error,
                    undelivered: pending.into_inner(),
                })
            }
        };

        if batched {
            warn!(target: "metricflow::agent", error = %error, "Batch rejected, resending metric by metric");
            batched = false;
            continue;
        }
        let rejected = pending.lock().pop_front();
        if let Some(metric) = rejected {
            dropped += 1;
            error!(target: "metricflow::agent", metric = %metric.id, error = %error, "Metric rejected by server, dropped");
        }
    }
}

fn drain_queue(rx: &FlumeReceiver<MetricBatch>) -> MetricBatch {
    let mut pending = MetricBatch::new();
    for batch in rx.drain() {
        pending.merge(batch);
    }
    pending
}

/// Single attempt to ship whatever is left; undelivered deltas go back into the store.
async fn final_flush(
    rx: &FlumeReceiver<MetricBatch>,
    store: &MetricStore,
    transport: &Transport,
    settings: &SchedulerSettings,
) -> bool {
    let mut pending = drain_queue(rx);
    pending.merge(store.take_batch());
    if pending.is_empty() {
        return true;
    }

    let metrics = pending.len();
    let pending = Mutex::new(pending);
    let outcome = timeout(settings.shutdown_grace, transport.deliver(&pending, settings.batched)).await;
    let undelivered = pending.into_inner();
    match outcome {
        Ok(Ok(())) => {
            info!(target: "metricflow::agent", metrics, "Final flush delivered");
            true
        }
        Ok(Err(e)) => {
            store.requeue(&undelivered);
            warn!(target: "metricflow::agent", error = %e, "Final flush failed");
            false
        }
        Err(_) => {
            store.requeue(&undelivered);
            warn!(
                target: "metricflow::agent",
                grace = %humantime::format_duration(settings.shutdown_grace),
                "Final flush exceeded grace period, abandoned"
            );
            false
        }
    }
}

// ============================================================================
// SECTION 13: PERSISTENCE BACKENDS
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Storage Trait
// ----------------------------------------------------------------------------

/// Durable home for a [`MetricStore`]. Selected once at startup by [`open_storage`].
#[async_trait]
pub trait Storage: Send + Sync + Debug {
    fn backend(&self) -> &'static str;

    /// Persist a consistent snapshot of `store`.
    async fn write(&self, store: &MetricStore) -> StorageResult<()>;

    /// Replay persisted state into `store`; returns how many metrics were loaded.
    async fn restore_into(&self, store: &MetricStore) -> StorageResult<usize>;

    async fn ping(&self) -> StorageResult<()>;

    async fn close(&self) {}

    /// Snapshot every `period` until cancelled. A failed write is logged and retried next tick.
    async fn save(&self, period: Duration, store: Arc<MetricStore>, cancel: CancellationToken) {
        if period.is_zero() {
            return;
        }
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.write(&store).await {
                Ok(()) => debug!(target: "metricflow::storage", backend = self.backend(), "Snapshot written"),
                Err(e) => warn!(
                    target: "metricflow::storage",
                    backend = self.backend(),
                    error = %e,
                    "Snapshot failed, will retry next tick"
                ),
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 13.2 Memory Backend
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStorage;

#[async_trait]
impl Storage for MemoryStorage {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, _store: &MetricStore) -> StorageResult<()> {
        Ok(())
    }

    async fn restore_into(&self, _store: &MetricStore) -> StorageResult<usize> {
        Ok(0)
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 13.3 File Backend
// ----------------------------------------------------------------------------

/// Whole-snapshot JSON file, replaced atomically on every write.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    write_lock: TokioMutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: TokioMutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn directory(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// temp file in the target directory → fsync → rename over the target
fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> StorageResult<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn write(&self, store: &MetricStore) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let json = serde_json::to_vec_pretty(&store.snapshot())?;

        let dir = self.directory();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &json))
            .await
            .map_err(|e| StorageError::Task { message: e.to_string() })?
    }

    async fn restore_into(&self, store: &MetricStore) -> StorageResult<usize> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(target: "metricflow::storage", path = %self.path.display(), "No snapshot file yet");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(0);
        }

        let snapshot: MetricSnapshot = serde_json::from_slice(&bytes)?;
        let loaded = snapshot.len();
        store.restore(snapshot);
        Ok(loaded)
    }

    async fn ping(&self) -> StorageResult<()> {
        let dir = self.directory();
        if tokio::fs::metadata(&dir).await?.is_dir() {
            Ok(())
        } else {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", dir.display()),
            )))
        }
    }
}

// ----------------------------------------------------------------------------
// 13.4 Relational Backend
// ----------------------------------------------------------------------------

const RELATIONAL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS gauge_metrics (\
        name TEXT PRIMARY KEY, \
        value DOUBLE PRECISION NOT NULL, \
        updated_at BIGINT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS counter_metrics (\
        name TEXT PRIMARY KEY, \
        value BIGINT NOT NULL, \
        updated_at BIGINT NOT NULL)",
];

const UPSERT_GAUGE: &str = "INSERT INTO gauge_metrics (name, value, updated_at) VALUES ($1, $2, $3) \
    ON CONFLICT (name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

const UPSERT_COUNTER: &str = "INSERT INTO counter_metrics (name, value, updated_at) VALUES ($1, $2, $3) \
    ON CONFLICT (name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

/// One row per metric name in `gauge_metrics` / `counter_metrics`, upserted on write.
#[derive(Debug)]
pub struct RelationalStorage {
    pool: AnyPool,
}

impl RelationalStorage {
    /// Connect with retry, then create the tables if they are missing.
    pub async fn connect(
        dsn: &str,
        max_connections: u32,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> StorageResult<Self> {
        sqlx::any::install_default_drivers();

        let pool = retry(policy, cancel, || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(5))
                .connect(dsn)
                .await
                .map_err(StorageError::from)
        })
        .await?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> StorageResult<()> {
        for statement in RELATIONAL_SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for RelationalStorage {
    fn backend(&self) -> &'static str {
        "relational"
    }

    async fn write(&self, store: &MetricStore) -> StorageResult<()> {
        let snapshot = store.snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();

        let mut tx = self.pool.begin().await?;
        for (name, value) in &snapshot.gauges {
            sqlx::query(UPSERT_GAUGE)
                .bind(name.as_str())
                .bind(*value)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        for (name, value) in &snapshot.counters {
            sqlx::query(UPSERT_COUNTER)
                .bind(name.as_str())
                .bind(*value)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn restore_into(&self, store: &MetricStore) -> StorageResult<usize> {
        let mut snapshot = MetricSnapshot::default();

        let rows = sqlx::query("SELECT name, value FROM gauge_metrics").fetch_all(&self.pool).await?;
        for row in rows {
            snapshot.gauges.insert(row.try_get("name")?, row.try_get::<f64, _>("value")?);
        }
        let rows = sqlx::query("SELECT name, value FROM counter_metrics").fetch_all(&self.pool).await?;
        for row in rows {
            snapshot.counters.insert(row.try_get("name")?, row.try_get::<i64, _>("value")?);
        }

        let loaded = snapshot.len();
        store.restore(snapshot);
        Ok(loaded)
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

// ----------------------------------------------------------------------------
// 13.5 Backend Selection
// ----------------------------------------------------------------------------

/// DSN → relational, otherwise a non-empty file path → file, otherwise memory.
pub async fn open_storage(config: &ServerConfig, cancel: &CancellationToken) -> StorageResult<Arc<dyn Storage>> {
    if let Some(dsn) = config.dsn() {
        let policy = RetryPolicy {
            retries: DEFAULT_DB_CONNECT_RETRIES,
            initial_delay: Duration::from_secs(1),
            step: Duration::from_secs(2),
        };
        let storage = RelationalStorage::connect(dsn, config.db_max_connections, policy, cancel).await?;
        return Ok(Arc::new(storage));
    }
    let path = config.file_storage_path.trim();
    if !path.is_empty() {
        return Ok(Arc::new(FileStorage::new(path)));
    }
    Ok(Arc::new(MemoryStorage))
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn populated_store() -> MetricStore {
        let store = MetricStore::new();
        store.update_counter("PollCount", 42);
        store.update_counter("Negative", -7);
        store.update_gauge("Alloc", 1234.5);
        store.update_gauge("RandomValue", 0.125);
        store
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("metrics.json"));
        let source = populated_store();

        storage.write(&source).await.unwrap();

        let restored = MetricStore::new();
        assert_eq!(storage.restore_into(&restored).await.unwrap(), 4);
        assert_eq!(restored.snapshot(), source.snapshot());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_file_writes_keep_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path().join("metrics.json")));
        let store = Arc::new(MetricStore::new());

        let mut tasks = JoinSet::new();
        for _ in 0..20 {
            let storage = Arc::clone(&storage);
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                store.update_counter("hits", 1);
                storage.write(&store).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let restored = MetricStore::new();
        storage.restore_into(&restored).await.unwrap();
        assert_eq!(restored.counter("hits"), Some(20));
    }

    #[tokio::test]
    async fn test_file_format_is_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        FileStorage::new(&path).write(&populated_store()).await.unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"CounterData\""));
        assert!(text.contains("\"GaugeData\""));
        assert!(text.contains('\n'));
    }

    #[tokio::test]
    async fn test_empty_and_missing_files_restore_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::new();

        let missing = FileStorage::new(dir.path().join("absent.json"));
        assert_eq!(missing.restore_into(&store).await.unwrap(), 0);

        let empty_path = dir.path().join("empty.json");
        fs::write(&empty_path, "").unwrap();
        assert_eq!(FileStorage::new(&empty_path).restore_into(&store).await.unwrap(), 0);

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        fs::write(&path, "{\"CounterData\": [").unwrap();

        let store = MetricStore::new();
        let err = FileStorage::new(&path).restore_into(&store).await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_write_replaces_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("metrics.json"));
        let store = populated_store();

        storage.write(&store).await.unwrap();
        store.update_gauge("Alloc", 1.0);
        storage.write(&store).await.unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);

        let restored = MetricStore::new();
        storage.restore_into(&restored).await.unwrap();
        assert_eq!(restored.gauge("Alloc"), Some(1.0));
    }

    #[tokio::test]
    async fn test_save_loop_snapshots_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path().join("metrics.json")));
        let store = Arc::new(populated_store());
        let cancel = CancellationToken::new();

        let handle = {
            let storage = Arc::clone(&storage);
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move { storage.save(Duration::from_millis(20), store, cancel).await })
        };

        sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert!(storage.path().exists());
    }

    #[tokio::test]
    async fn test_zero_interval_disables_save_loop() {
        let storage = MemoryStorage;
        let cancel = CancellationToken::new();
        timeout(
            Duration::from_millis(200),
            storage.save(Duration::ZERO, Arc::new(MetricStore::new()), cancel),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_relational_round_trip_and_upsert() {
        let cancel = CancellationToken::new();
        let storage = RelationalStorage::connect("sqlite::memory:", 1, RetryPolicy::default(), &cancel)
            .await
            .unwrap();
        storage.ping().await.unwrap();

        let source = populated_store();
        storage.write(&source).await.unwrap();
        source.update_counter("PollCount", 8);
        storage.write(&source).await.unwrap();

        let restored = MetricStore::new();
        assert_eq!(storage.restore_into(&restored).await.unwrap(), 4);
        assert_eq!(restored.counter("PollCount"), Some(50));
        assert_eq!(restored.counter("Negative"), Some(-7));
        assert_eq!(restored.gauge("Alloc"), Some(1234.5));

        storage.close().await;
    }

    #[tokio::test]
    async fn test_backend_selection() {
        let cancel = CancellationToken::new();

        let memory = ServerConfig {
            file_storage_path: String::new(),
            ..ServerConfig::default()
        };
        assert_eq!(open_storage(&memory, &cancel).await.unwrap().backend(), "memory");

        let file = ServerConfig::default();
        assert_eq!(open_storage(&file, &cancel).await.unwrap().backend(), "file");

        let relational = ServerConfig {
            database_dsn: Some("sqlite::memory:".into()),
            db_max_connections: 1,
            ..ServerConfig::default()
        };
        assert_eq!(open_storage(&relational, &cancel).await.unwrap().backend(), "relational");
    }
}

// ============================================================================
// SECTION 14: INGESTION ENDPOINT (SERVER)
// ============================================================================
// Request path: TraceLayer → CompressionLayer → transform middleware
// (gunzip, HMAC check, response signing) → handler (decrypt, decode,
// validate, apply).
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Shared State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppState {
    store: Arc<MetricStore>,
    storage: Arc<dyn Storage>,
    decryptor: Option<Arc<Decryptor>>,
    sync_writes: bool,
}

impl AppState {
    pub fn new(store: Arc<MetricStore>, storage: Arc<dyn Storage>) -> Self {
        Self {
            store,
            storage,
            decryptor: None,
            sync_writes: false,
        }
    }

    pub fn with_decryptor(mut self, decryptor: Option<Decryptor>) -> Self {
        self.decryptor = decryptor.map(Arc::new);
        self
    }

    /// Persist after every accepted update instead of on a timer.
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    fn open_body(&self, body: Bytes) -> IngestResult<Bytes> {
        match &self.decryptor {
            Some(decryptor) => Ok(Bytes::from(decryptor.decrypt(&body)?)),
            None => Ok(body),
        }
    }

    /// Apply `metrics`, then persist when writes are synchronous.
    ///
    /// Once applied the update is acknowledged; a failed write is logged and left to the next one.
    async fn ingest(&self, metrics: &[Metric]) -> IngestResult<()> {
        self.store.apply_all(metrics)?;
        if self.sync_writes {
            if let Err(e) = self.storage.write(&self.store).await {
                error!(
                    target: "metricflow::server",
                    backend = self.storage.backend(),
                    error = %e,
                    "Synchronous write failed, update kept in memory"
                );
            }
        }
        Ok(())
    }
}

/// Settings for the transform middleware.
#[derive(Debug, Clone)]
pub struct CodecState {
    signer: Option<Signer>,
    max_body_bytes: usize,
}

impl CodecState {
    pub fn new(signer: Option<Signer>, max_body_bytes: usize) -> Self {
        Self { signer, max_body_bytes }
    }
}

fn signature_header() -> header::HeaderName {
    header::HeaderName::from_static("hashsha256")
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(target: "metricflow::server", error = ?self, "Request failed");
        } else {
            debug!(target: "metricflow::server", status = status.as_u16(), error = %self, "Request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

// ----------------------------------------------------------------------------
// 14.2 Router
// ----------------------------------------------------------------------------

pub fn build_router(state: AppState, codec: CodecState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ping", get(ping_handler))
        .route("/update/:kind/:name/:value", post(update_path_handler))
        .route("/update/", post(update_json_handler))
        .route("/update", post(update_json_handler))
        .route("/updates/", post(updates_handler))
        .route("/updates", post(updates_handler))
        .route("/value/:kind/:name", get(value_handler))
        .route("/value/", post(value_json_handler))
        .route("/value", post(value_json_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(axum_middleware::from_fn_with_state(codec, transform_middleware)),
        )
}

// ----------------------------------------------------------------------------
// 14.3 Transform Middleware
// ----------------------------------------------------------------------------

/// Gunzip the body, verify `HashSHA256` when present, sign the response.
async fn transform_middleware(State(codec): State<CodecState>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, codec.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => return IngestError::BodyTooLarge.into_response(),
    };

    let gzipped = parts
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    let bytes = if gzipped {
        match gunzip(&bytes, codec.max_body_bytes) {
            Ok(inflated) => {
                parts.headers.remove(header::CONTENT_ENCODING);
                parts.headers.remove(header::CONTENT_LENGTH);
                Bytes::from(inflated)
            }
            Err(e) => return IngestError::Decompress { message: e.to_string() }.into_response(),
        }
    } else {
        bytes
    };

    if let Some(signer) = &codec.signer {
        if let Some(signature) = parts.headers.get(signature_header()) {
            let valid = signature
                .to_str()
                .map(|hex| signer.verify(&bytes, hex))
                .unwrap_or(false);
            if !valid {
                warn!(target: "metricflow::server", uri = %parts.uri, "Signature mismatch");
                return IngestError::BadSignature.into_response();
            }
        }
    }

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    match &codec.signer {
        Some(signer) => sign_response(signer, response).await,
        None => response,
    }
}

async fn sign_response(signer: &Signer, response: Response) -> Response {
    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(target: "metricflow::server", error = %e, "Failed to buffer response for signing");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if let Ok(value) = HeaderValue::from_str(&signer.sign(&bytes)) {
        parts.headers.insert(signature_header(), value);
    }
    Response::from_parts(parts, Body::from(bytes))
}

// ----------------------------------------------------------------------------
// 14.4 Handlers
// ----------------------------------------------------------------------------

async fn update_path_handler(
    State(state): State<AppState>,
    UrlPath((kind, name, value)): UrlPath<(String, String, String)>,
) -> Result<StatusCode, IngestError> {
    let kind: MetricKind = kind.parse()?;
    let metric = Metric {
        id: name,
        value: MetricValue::parse(kind, &value)?,
    };
    state.ingest(std::slice::from_ref(&metric)).await?;
    Ok(StatusCode::OK)
}

async fn update_json_handler(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, IngestError> {
    let body = state.open_body(body)?;
    let metric = Metric::try_from(serde_json::from_slice::<MetricPayload>(&body)?)?;

    state.ingest(std::slice::from_ref(&metric)).await?;
    Ok(StatusCode::OK)
}

/// Validated as a whole before anything is applied.
async fn updates_handler(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, IngestError> {
    let body = state.open_body(body)?;
    let payloads: Vec<MetricPayload> = serde_json::from_slice(&body)?;
    let metrics = payloads
        .into_iter()
        .map(Metric::try_from)
        .collect::<IngestResult<Vec<_>>>()?;

    state.ingest(&metrics).await?;
    debug!(target: "metricflow::server", metrics = metrics.len(), "Batch applied");
    Ok(StatusCode::OK)
}

async fn value_handler(
    State(state): State<AppState>,
    UrlPath((kind, name)): UrlPath<(String, String)>,
) -> Result<String, IngestError> {
    let kind: MetricKind = kind.parse()?;
    state
        .store
        .get(kind, &name)
        .map(|value| value.to_string())
        .ok_or(IngestError::NotFound { kind, id: name })
}

async fn value_json_handler(State(state): State<AppState>, body: Bytes) -> Result<Json<MetricPayload>, IngestError> {
    let query: MetricPayload = serde_json::from_slice(&body)?;
    let kind: MetricKind = query.kind.parse()?;
    let value = state.store.get(kind, &query.id).ok_or_else(|| IngestError::NotFound {
        kind,
        id: query.id.clone(),
    })?;
    Ok(Json(MetricPayload::from(&Metric { id: query.id, value })))
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    let snapshot = state.store.snapshot();
    let mut rows = String::new();
    for (name, value) in &snapshot.counters {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>counter</td><td>{}</td></tr>\n",
            escape_html(name),
            value
        ));
    }
    for (name, value) in &snapshot.gauges {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>gauge</td><td>{}</td></tr>\n",
            escape_html(name),
            value
        ));
    }
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Metrics</title></head>\n<body>\n\
         <table>\n<tr><th>Name</th><th>Type</th><th>Value</th></tr>\n{}</table>\n</body>\n</html>\n",
        rows
    ))
}

async fn ping_handler(State(state): State<AppState>) -> StatusCode {
    match state.storage.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(target: "metricflow::server", backend = state.storage.backend(), error = %e, "Storage ping failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ----------------------------------------------------------------------------
// 14.5 Server Lifecycle
// ----------------------------------------------------------------------------

/// Restore, serve until cancelled, then write one final snapshot within the grace period.
pub async fn run_server(config: ServerConfig, cancel: CancellationToken) -> MetricflowResult<()> {
    let storage = open_storage(&config, &cancel).await?;
    let store = Arc::new(MetricStore::new());

    if config.restore {
        match storage.restore_into(&store).await {
            Ok(loaded) => info!(target: "metricflow::server", backend = storage.backend(), loaded, "Metrics restored"),
            Err(e) => warn!(
                target: "metricflow::server",
                backend = storage.backend(),
                error = %e,
                "Restore failed, starting empty"
            ),
        }
    }

    let decryptor = config.crypto_key.as_deref().map(Decryptor::from_pem_file).transpose()?;
    let state = AppState::new(Arc::clone(&store), Arc::clone(&storage))
        .with_decryptor(decryptor)
        .with_sync_writes(config.store_interval == 0);
    let codec = CodecState::new(config.key.as_deref().map(Signer::new), config.max_body_bytes);
    let router = build_router(state, codec);

    let listener = tokio::net::TcpListener::bind(&config.address).await?;
    info!(
        target: "metricflow::server",
        address = %listener.local_addr()?,
        backend = storage.backend(),
        store_interval = %humantime::format_duration(config.store_period()),
        "Server listening"
    );

    let saver = {
        let storage = Arc::clone(&storage);
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        let period = config.store_period();
        tokio::spawn(async move { storage.save(period, store, cancel).await })
    };

    let shutdown = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    cancel.cancel();
    if let Err(e) = saver.await {
        error!(target: "metricflow::server", error = %e, "Snapshot task panicked");
    }

    let grace = config.shutdown_grace();
    match timeout(grace, storage.write(&store)).await {
        Ok(Ok(())) => info!(target: "metricflow::server", metrics = store.len(), "Final snapshot written"),
        Ok(Err(e)) => error!(target: "metricflow::server", error = %e, "Final snapshot failed"),
        Err(_) => warn!(
            target: "metricflow::server",
            grace = %humantime::format_duration(grace),
            "Final snapshot exceeded grace period, abandoned"
        ),
    }
    storage.close().await;

    info!(target: "metricflow::server", "Server stopped");
    Ok(())
}


// ============================================================================
// SECTION 15: PIPELINE TESTS
// ============================================================================
// Agent and transport against a real server bound to a loopback port.
// ============================================================================

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default)]
    struct TickCollector {
        ticks: u64,
    }

    impl Collector for TickCollector {
        fn name(&self) -> &'static str {
            "ticks"
        }

        fn collect(&mut self, store: &MetricStore) -> CollectorResult<usize> {
            self.ticks += 1;
            store.update_counter("Ticks", 1);
            store.update_gauge("LastTick", self.ticks as f64);
            Ok(2)
        }
    }

    async fn spawn_router(router: Router) -> (String, CancellationToken) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });
        (base_url, cancel)
    }

    async fn spawn_server(state: AppState, codec: CodecState) -> (String, CancellationToken) {
        spawn_router(build_router(state, codec)).await
    }

    /// Accepts single updates but fails the request numbered `fail_on` with a 500.
    #[derive(Debug, Default)]
    struct FlakyServer {
        fail_on: usize,
        requests: AtomicU64,
        accepted: Mutex<Vec<String>>,
    }

    async fn flaky_update(State(server): State<Arc<FlakyServer>>, Json(payload): Json<MetricPayload>) -> StatusCode {
        let n = server.requests.fetch_add(1, AtomicOrdering::SeqCst) as usize + 1;
        if n == server.fail_on {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        server.accepted.lock().push(payload.id);
        StatusCode::OK
    }

    fn batch_of(metrics: Vec<Metric>) -> MetricBatch {
        metrics.into_iter().collect()
    }

    fn fast_settings(retries: u32) -> SchedulerSettings {
        SchedulerSettings {
            poll_period: Duration::from_millis(20),
            report_period: Duration::from_millis(60),
            workers: 2,
            queue_capacity: 8,
            retry: RetryPolicy {
                retries,
                initial_delay: Duration::from_millis(10),
                step: Duration::from_millis(10),
            },
            batched: true,
            shutdown_grace: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_encrypted_signed_gzipped_batch_is_accepted() {
        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);

        let server_store = Arc::new(MetricStore::new());
        let state = AppState::new(Arc::clone(&server_store), Arc::new(MemoryStorage))
            .with_decryptor(Some(Decryptor::new(private_key)));
        let codec = CodecState::new(Some(Signer::new("shared")), DEFAULT_MAX_BODY_BYTES);
        let (base_url, cancel) = spawn_server(state, codec).await;

        let transport = Transport::builder(base_url)
            .signer(Some(Signer::new("shared")))
            .encryptor(Some(Encryptor::new(public_key)))
            .compress(true)
            .build()
            .unwrap();
        let batch: MetricBatch = vec![Metric::counter("PollCount", 3), Metric::gauge("Alloc", 42.5)]
            .into_iter()
            .collect();

        transport.send_batch(&batch).await.unwrap();
        transport.send_metric(&Metric::counter("PollCount", 2)).await.unwrap();

        assert_eq!(server_store.counter("PollCount"), Some(5));
        assert_eq!(server_store.gauge("Alloc"), Some(42.5));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_wrong_key_is_reported_as_unexpected_status() {
        let state = AppState::new(Arc::new(MetricStore::new()), Arc::new(MemoryStorage));
        let (base_url, cancel) = spawn_server(state, CodecState::new(Some(Signer::new("server")), DEFAULT_MAX_BODY_BYTES)).await;

        let transport = Transport::builder(base_url)
            .signer(Some(Signer::new("agent")))
            .build()
            .unwrap();
        let err = transport.send_metric(&Metric::gauge("Alloc", 1.0)).await.unwrap_err();

        assert!(matches!(err, TransportError::UnexpectedStatus { status: 400, .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_agent_delivers_every_poll_exactly_once() {
        let server_store = Arc::new(MetricStore::new());
        let state = AppState::new(Arc::clone(&server_store), Arc::new(MemoryStorage));
        let (base_url, server_cancel) = spawn_server(state, CodecState::new(None, DEFAULT_MAX_BODY_BYTES)).await;

        let transport = Transport::builder(base_url).build().unwrap();
        let agent = Agent::with_parts(
            fast_settings(2),
            transport,
            CollectorSet::new().with(TickCollector::default()),
        );

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(400)).await;
            stopper.cancel();
        });
        let report = agent.run(cancel).await;

        assert!(report.polls > 0);
        assert!(report.final_flush_delivered);
        assert_eq!(server_store.counter("Ticks"), Some(report.polls as i64));
        assert_eq!(server_store.gauge("LastTick"), Some(report.polls as f64));
        server_cancel.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_deltas() {
        let transport = Transport::builder("http://127.0.0.1:1")
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let agent = Agent::with_parts(
            fast_settings(0),
            transport,
            CollectorSet::new().with(TickCollector::default()),
        );
        let store = agent.store();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            stopper.cancel();
        });
        let report = agent.run(cancel).await;

        assert!(!report.final_flush_delivered);
        assert_eq!(store.counter("Ticks"), Some(report.polls as i64));
    }

    #[tokio::test]
    async fn test_unbatched_failure_leaves_only_unsent_metrics() {
        let server_store = Arc::new(MetricStore::new());
        server_store.update_counter("b", 1);
        let state = AppState::new(Arc::clone(&server_store), Arc::new(MemoryStorage));
        let (base_url, cancel) = spawn_server(state, CodecState::new(None, DEFAULT_MAX_BODY_BYTES)).await;
        let transport = Transport::builder(base_url).build().unwrap();

        let pending = Mutex::new(batch_of(vec![Metric::counter("a", 1), Metric::gauge("b", 1.0), Metric::counter("c", 2)]));
        let err = transport.deliver(&pending, false).await.unwrap_err();

        assert!(err.is_rejection());
        assert_eq!(
            pending.into_inner(),
            batch_of(vec![Metric::gauge("b", 1.0), Metric::counter("c", 2)])
        );
        assert_eq!(server_store.counter("a"), Some(1));
        assert_eq!(server_store.counter("c"), None);
        cancel.cancel();
    }

    #[rstest::rstest]
    #[case::batched(true)]
    #[case::unbatched(false)]
    #[tokio::test]
    async fn test_rejected_metric_is_dropped_and_rest_counted_once(#[case] batched: bool) {
        let server_store = Arc::new(MetricStore::new());
        server_store.update_counter("b", 1);
        let state = AppState::new(Arc::clone(&server_store), Arc::new(MemoryStorage));
        let (base_url, cancel) = spawn_server(state, CodecState::new(None, DEFAULT_MAX_BODY_BYTES)).await;
        let transport = Transport::builder(base_url).build().unwrap();
        let settings = SchedulerSettings {
            batched,
            ..fast_settings(2)
        };

        let report = batch_of(vec![Metric::counter("a", 1), Metric::gauge("b", 1.0), Metric::counter("c", 2)]);
        let dropped = deliver_report(&transport, report, &settings, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(dropped, 1);
        assert_eq!(server_store.counter("a"), Some(1));
        assert_eq!(server_store.counter("b"), Some(1));
        assert_eq!(server_store.counter("c"), Some(2));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_transient_failure_resends_only_the_failed_metric() {
        let server = Arc::new(FlakyServer {
            fail_on: 2,
            ..FlakyServer::default()
        });
        let router = Router::new()
            .route(UPDATE_PATH, post(flaky_update))
            .with_state(Arc::clone(&server));
        let (base_url, cancel) = spawn_router(router).await;
        let transport = Transport::builder(base_url).compress(false).build().unwrap();
        let settings = SchedulerSettings {
            batched: false,
            ..fast_settings(2)
        };

        let report = batch_of(vec![Metric::counter("a", 1), Metric::counter("b", 1), Metric::counter("c", 1)]);
        let dropped = deliver_report(&transport, report, &settings, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(dropped, 0);
        assert_eq!(*server.accepted.lock(), vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(server.requests.load(AtomicOrdering::SeqCst), 4);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_only_undelivered_deltas() {
        let server = Arc::new(FlakyServer {
            fail_on: 2,
            ..FlakyServer::default()
        });
        let router = Router::new()
            .route(UPDATE_PATH, post(flaky_update))
            .with_state(Arc::clone(&server));
        let (base_url, cancel) = spawn_router(router).await;
        let transport = Transport::builder(base_url).compress(false).build().unwrap();
        let settings = SchedulerSettings {
            batched: false,
            ..fast_settings(0)
        };

        let report = batch_of(vec![Metric::counter("a", 1), Metric::counter("b", 1), Metric::counter("c", 1)]);
        let failure = deliver_report(&transport, report, &settings, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, TransportError::UnexpectedStatus { status: 500, .. }));
        assert_eq!(
            failure.undelivered,
            batch_of(vec![Metric::counter("b", 1), Metric::counter("c", 1)])
        );
        assert_eq!(*server.accepted.lock(), vec!["a".to_string()]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failed_server_write_is_not_resent_by_agent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let server_store = Arc::new(MetricStore::new());
        let state = AppState::new(Arc::clone(&server_store), Arc::new(FileStorage::new(blocker.join("metrics.json"))))
            .with_sync_writes(true);
        let (base_url, cancel) = spawn_server(state, CodecState::new(None, DEFAULT_MAX_BODY_BYTES)).await;
        let transport = Transport::builder(base_url).build().unwrap();

        let report = batch_of(vec![Metric::counter("hits", 5)]);
        deliver_report(&transport, report, &fast_settings(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(server_store.counter("hits"), Some(5));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_server_restores_and_persists_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        fs::write(&path, r#"{"CounterData":{"hits":4},"GaugeData":{"temp":1.5}}"#).unwrap();

        let config = ServerConfig {
            address: "127.0.0.1:0".into(),
            file_storage_path: path.to_string_lossy().into_owned(),
            store_interval: 3600,
            ..ServerConfig::default()
        };
        let cancel = CancellationToken::new();
        let server = tokio::spawn(run_server(config, cancel.clone()));

        sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        server.await.unwrap().unwrap();

        let restored = MetricStore::new();
        FileStorage::new(&path).restore_into(&restored).await.unwrap();
        assert_eq!(restored.counter("hits"), Some(4));
        assert_eq!(restored.gauge("temp"), Some(1.5));
    }
}

// ============================================================================
// SECTION 16: CLI & COMMAND LINE INTERFACE
// ============================================================================
// Flags mirror the configuration fields; anything left unset falls through to
// the file and defaults, and environment variables override all of them.
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Metricflow CLI
#[derive(Parser, Debug)]
#[command(
    name = "metricflow",
    author = "AIOps Team",
    version,
    about = "Push-based metrics pipeline: collecting agent and ingesting server",
    long_about = "Metricflow samples process and host metrics in an agent, ships them \
                  in signed, optionally encrypted and compressed batches, and stores \
                  them in a server backed by memory, a snapshot file or a relational database."
)]
pub struct Cli {
    /// Log level override
    #[arg(long, global = true, env = "METRICFLOW_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true, env = "METRICFLOW_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Collect metrics and report them to a server
    Agent(AgentArgs),

    /// Accept metric updates and serve queries
    Server(ServerArgs),

    /// Generate an RSA key pair for payload encryption
    Keygen {
        /// Key size in bits
        #[arg(short, long, default_value_t = DEFAULT_RSA_BITS)]
        bits: usize,

        /// Directory receiving private.pem and public.pem
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Print a default configuration file
    GenerateConfig {
        /// Server configuration instead of agent configuration
        #[arg(long)]
        server: bool,

        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

/// Agent flags. Unset flags do not override lower layers.
#[derive(Args, Debug, Default, Clone, Serialize)]
pub struct AgentArgs {
    /// Configuration file (TOML, or JSON by extension)
    #[arg(short, long, env = "CONFIG")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Server address
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Poll interval in seconds
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,

    /// Report interval in seconds
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_interval: Option<u64>,

    /// Concurrent report workers
    #[arg(short = 'l', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<usize>,

    /// HMAC signing secret
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Server public key (PEM)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<PathBuf>,
}

/// Server flags. Unset flags do not override lower layers.
#[derive(Args, Debug, Default, Clone, Serialize)]
pub struct ServerArgs {
    /// Configuration file (TOML, or JSON by extension)
    #[arg(short, long, env = "CONFIG")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Seconds between snapshots, 0 for synchronous writes
    #[arg(short = 'i', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_interval: Option<u64>,

    /// Snapshot file path
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_storage_path: Option<String>,

    /// Load persisted metrics at startup
    #[arg(short, long, num_args = 0..=1, default_missing_value = "true")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore: Option<bool>,

    /// Relational database DSN
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_dsn: Option<String>,

    /// HMAC signing secret
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// RSA private key (PEM)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<PathBuf>,
}

impl Cli {
    fn logging(&self, base: &LoggingConfig) -> LoggingConfig {
        let mut logging = base.clone();
        if let Some(level) = &self.log_level {
            logging.level = level.clone();
        }
        if self.debug {
            logging.level = "debug".into();
        }
        logging
    }
}

// ----------------------------------------------------------------------------
// 16.2 CLI Handler Functions
// ----------------------------------------------------------------------------

async fn handle_agent(cli: &Cli, args: &AgentArgs) -> AnyhowResult<()> {
    let config = AgentConfig::load(args).context("Failed to load agent configuration")?;
    init_logging(&cli.logging(&config.logging))?;
    info!("{} v{} (agent)", METRICFLOW_FULL_NAME, METRICFLOW_VERSION);

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone())?;

    let agent = Agent::new(&config).context("Failed to build agent")?;
    let started = Instant::now();
    let report = agent.run(cancel).await;
    info!(
        target: "metricflow::agent",
        uptime = %humantime::format_duration(Duration::from_secs(started.elapsed().as_secs())),
        polls = report.polls,
        flushed = report.final_flush_delivered,
        "Shutdown complete"
    );
    Ok(())
}

async fn handle_server(cli: &Cli, args: &ServerArgs) -> AnyhowResult<()> {
    let config = ServerConfig::load(args).context("Failed to load server configuration")?;
    init_logging(&cli.logging(&config.logging))?;
    info!("{} v{} (server)", METRICFLOW_FULL_NAME, METRICFLOW_VERSION);

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone())?;

    run_server(config, cancel).await?;
    Ok(())
}

async fn handle_keygen(bits: usize, out_dir: PathBuf) -> AnyhowResult<()> {
    println!("Generating {}-bit RSA key pair...", bits);
    let (private_path, public_path) = tokio::task::spawn_blocking(move || generate_key_pair(&out_dir, bits))
        .await
        .context("Key generation task failed")??;
    println!("Private key: {}", private_path.display());
    println!("Public key:  {}", public_path.display());
    Ok(())
}

fn handle_generate_config(server: bool, output: Option<&Path>) -> AnyhowResult<()> {
    let rendered = if server {
        toml::to_string_pretty(&ServerConfig::default())
    } else {
        toml::to_string_pretty(&AgentConfig::default())
    }
    .context("Failed to render default configuration")?;

    match output {
        Some(path) => {
            fs::write(path, &rendered).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", METRICFLOW_FULL_NAME, METRICFLOW_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Storage backends:");
    println!("  • memory");
    println!("  • file");
    if cfg!(feature = "postgres") {
        println!("  • postgres");
    }
    if cfg!(feature = "sqlite") {
        println!("  • sqlite");
    }
}

/// Cancel `cancel` on SIGTERM or SIGINT.
#[cfg(unix)]
fn spawn_shutdown_listener(cancel: CancellationToken) -> MetricflowResult<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_shutdown_listener(cancel: CancellationToken) -> MetricflowResult<()> {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
        }
        cancel.cancel();
    });
    Ok(())
}


// ============================================================================
// SECTION 17: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Agent(args) => handle_agent(&cli, args).await?,
        Commands::Server(args) => handle_server(&cli, args).await?,
        Commands::Keygen { bits, out_dir } => handle_keygen(*bits, out_dir.clone()).await?,
        Commands::GenerateConfig { server, output } => handle_generate_config(*server, output.as_deref())?,
        Commands::Version => handle_version(),
    }

    Ok(())
}
