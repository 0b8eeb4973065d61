use std::error::Error as StdError;
use std::fmt;
use std::io::ErrorKind;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::truncate_with_marker;

const MAX_MESSAGE_LEN: usize = 2000;

/// A 4xx/5xx number only counts as a status code when it leads the message
/// or follows an HTTP/status/code/returned marker.
static STATUS_CODE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^\s*|\bhttp(?:/[0-9.]+)?\s+|\bstatus(?:\s+code)?[\s:=]*|\bcode[\s:=]+|\breturned\s+|\bresponded\s+with\s+)([45][0-9]{2})\b",
    )
    .ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network blips, timeouts, 5xx gateway errors.
    Transient,
    RateLimit,
    Authentication,
    /// Client-side mistakes: bad request, malformed input, missing resource.
    Validation,
    ResourceExhausted,
    Unknown,
}

impl ErrorCategory {
    /// Unknown failures are retryable, but the executor caps their attempts.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Authentication | Self::Validation)
    }

    fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimit,
            401 | 403 | 407 => Self::Authentication,
            408 | 425 => Self::Transient,
            507 => Self::ResourceExhausted,
            400..=499 => Self::Validation,
            _ => Self::Transient,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Authentication => write!(f, "authentication"),
            Self::Validation => write!(f, "validation"),
            Self::ResourceExhausted => write!(f, "resource_exhausted"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Structured failure signal for collaborators that know what went wrong.
///
/// Returning this (or wrapping it as an error source) skips message heuristics.
#[derive(Error, Debug, Clone)]
pub enum OperationError {
    #[error("Timeout after {}ms: {operation}", elapsed.as_millis())]
    Timeout { operation: String, elapsed: Duration },

    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    Other(String),
}

impl OperationError {
    fn signal(&self) -> Signal {
        match self {
            Self::Timeout { .. } | Self::Network(_) => Signal::of(ErrorCategory::Transient),
            Self::RateLimited { retry_after } => Signal {
                category: ErrorCategory::RateLimit,
                retry_after: *retry_after,
                status: Some(429),
            },
            Self::Http {
                status,
                retry_after,
                message,
            } => Signal {
                category: ErrorCategory::from_status(*status),
                retry_after: retry_after.or_else(|| extract_retry_after(message)),
                status: Some(*status),
            },
            Self::Auth(_) => Signal::of(ErrorCategory::Authentication),
            Self::Validation(_) => Signal::of(ErrorCategory::Validation),
            Self::ResourceExhausted(_) => Signal::of(ErrorCategory::ResourceExhausted),
            Self::Other(msg) => classify_text(msg),
        }
    }
}

/// A failure annotated with the category that drives retry and circuit logic.
///
/// Fields are private so a classification cannot change after the fact.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    category: ErrorCategory,
    retryable: bool,
    retry_after: Option<Duration>,
    status: Option<u16>,
    message: String,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl ClassifiedError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            retryable: category.is_retryable(),
            retry_after: None,
            status: None,
            message: truncate_with_marker(&message.into(), MAX_MESSAGE_LEN),
            source: None,
        }
    }

    fn from_signal(signal: Signal, message: String) -> Self {
        Self {
            retry_after: signal.retry_after,
            status: signal.status,
            ..Self::new(signal.category, message)
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Server-directed backoff, when the failure carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

impl StdError for ClassifiedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[derive(Debug, Clone, Copy)]
struct Signal {
    category: ErrorCategory,
    retry_after: Option<Duration>,
    status: Option<u16>,
}

impl Signal {
    fn of(category: ErrorCategory) -> Self {
        Self {
            category,
            retry_after: None,
            status: None,
        }
    }
}

/// Deterministic, side-effect-free failure classification.
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify an owned failure, keeping it as the cause.
    pub fn classify<E>(err: E) -> ClassifiedError
    where
        E: StdError + Send + Sync + 'static,
    {
        let mut classified = Self::classify_ref(&err);
        classified.source = Some(Arc::new(err));
        classified
    }

    /// Classify a borrowed failure. Structured signals anywhere in the source
    /// chain win over message text.
    pub fn classify_ref(err: &(dyn StdError + 'static)) -> ClassifiedError {
        let message = chain_message(err);
        let signal = structured_signal(err).unwrap_or_else(|| classify_text(&message));
        ClassifiedError::from_signal(signal, message)
    }

    pub fn classify_message(msg: &str) -> ClassifiedError {
        ClassifiedError::from_signal(classify_text(msg), msg.to_string())
    }
}

fn chain_message(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        let text = e.to_string();
        if !parts.iter().any(|p| p.contains(&text)) {
            parts.push(text);
        }
        current = e.source();
    }
    parts.join(": ")
}

fn structured_signal(err: &(dyn StdError + 'static)) -> Option<Signal> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(op) = e.downcast_ref::<OperationError>() {
            return Some(op.signal());
        }
        if let Some(classified) = e.downcast_ref::<ClassifiedError>() {
            return Some(Signal {
                category: classified.category,
                retry_after: classified.retry_after,
                status: classified.status,
            });
        }
        if e.is::<tokio::time::error::Elapsed>() {
            return Some(Signal::of(ErrorCategory::Transient));
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && let Some(category) = io_category(io.kind())
        {
            return Some(Signal::of(category));
        }
        current = e.source();
    }
    None
}

fn io_category(kind: ErrorKind) -> Option<ErrorCategory> {
    match kind {
        ErrorKind::TimedOut
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::UnexpectedEof
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::NetworkDown => Some(ErrorCategory::Transient),
        ErrorKind::PermissionDenied => Some(ErrorCategory::Authentication),
        ErrorKind::InvalidInput | ErrorKind::InvalidData => Some(ErrorCategory::Validation),
        ErrorKind::OutOfMemory | ErrorKind::StorageFull => Some(ErrorCategory::ResourceExhausted),
        _ => None,
    }
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "overloaded",
];
const AUTH_MARKERS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "authentication",
    "invalid api key",
    "invalid_api_key",
    "permission denied",
    "forbidden",
    "access denied",
];
const RESOURCE_MARKERS: &[&str] = &[
    "out of memory",
    "no space left",
    "disk full",
    "resource exhausted",
    "resource_exhausted",
    "insufficient_quota",
    "quota exceeded",
];
const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection closed",
    "temporarily unavailable",
    "service unavailable",
    "bad gateway",
    "network",
    "broken pipe",
];
const VALIDATION_MARKERS: &[&str] = &[
    "invalid",
    "validation",
    "bad request",
    "malformed",
    "unprocessable",
];

fn classify_text(msg: &str) -> Signal {
    let lower = msg.to_lowercase();
    let retry_after = extract_retry_after(&lower);

    if let Some(status) = extract_status(msg) {
        return Signal {
            category: ErrorCategory::from_status(status),
            retry_after,
            status: Some(status),
        };
    }

    let table = [
        (RATE_LIMIT_MARKERS, ErrorCategory::RateLimit),
        (AUTH_MARKERS, ErrorCategory::Authentication),
        (RESOURCE_MARKERS, ErrorCategory::ResourceExhausted),
        (TRANSIENT_MARKERS, ErrorCategory::Transient),
        (VALIDATION_MARKERS, ErrorCategory::Validation),
    ];
    let category = table
        .iter()
        .find(|(markers, _)| markers.iter().any(|m| lower.contains(m)))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::Unknown);

    Signal {
        category,
        retry_after,
        status: None,
    }
}

fn extract_status(msg: &str) -> Option<u16> {
    STATUS_CODE
        .as_ref()?
        .captures_iter(msg)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .next()
}

/// Looks for "retry after N", "Retry-After: N" or "retry_after=N" (seconds).
fn extract_retry_after(msg: &str) -> Option<Duration> {
    let lower = msg.to_lowercase();
    for pattern in ["retry after ", "retry-after: ", "retry-after:", "retry_after="] {
        if let Some(idx) = lower.find(pattern) {
            let digits: String = lower[idx + pattern.len()..]
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(secs) = digits.parse() {
                return Some(Duration::from_secs(secs));
            }
        }
    }
    None
}
