// error.rs — error taxonomy (spec.md §7).
//
// Kinds, not type names: per-symbol tasks catch everything and never
// re-throw. The only fatal path is startup config validation.

use std::fmt;

#[derive(Debug, Clone)]
pub enum ExchangeError {
    /// Network timeout, 5xx, rate-limit. Logged, cycle continues.
    Transient(String),
    /// 4xx with an exchange error code (lot-size mismatch, insufficient margin).
    Business(String),
    /// No cached instrument metadata and the exchange call failed.
    InstrumentUnavailable(String),
    /// CloseByContracts rounded below lotSize.
    TooSmallToClose { symbol: String, rounded: f64, lot_size: f64 },
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Transient(s) => write!(f, "transient exchange error: {}", s),
            ExchangeError::Business(s) => write!(f, "exchange rejected order: {}", s),
            ExchangeError::InstrumentUnavailable(s) => {
                write!(f, "instrument metadata unavailable: {}", s)
            }
            ExchangeError::TooSmallToClose { symbol, rounded, lot_size } => write!(
                f,
                "close size for {} rounded to {} below lot size {} — manual intervention needed",
                symbol, rounded, lot_size
            ),
        }
    }
}

impl std::error::Error for ExchangeError {}

#[derive(Debug, Clone)]
pub enum LlmError {
    Http { status: u16, body: String },
    Network(String),
    Timeout,
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Http { status, body } => write!(f, "LLM oracle HTTP {}: {}", status, body),
            LlmError::Network(s) => write!(f, "LLM oracle network error: {}", s),
            LlmError::Timeout => write!(f, "LLM oracle call timed out"),
        }
    }
}

impl std::error::Error for LlmError {}

#[derive(Debug, Clone)]
pub enum StoreError {
    Open(String),
    Write(String),
    Read(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Open(s) => write!(f, "store open failed: {}", s),
            StoreError::Write(s) => write!(f, "store write failed: {}", s),
            StoreError::Read(s) => write!(f, "store read failed: {}", s),
        }
    }
}

impl std::error::Error for StoreError {}

/// Fatal at startup only: missing credentials, unparseable configuration,
/// store cannot open.
#[derive(Debug, Clone)]
pub enum CoreError {
    Config(String),
    Store(StoreError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Config(s) => write!(f, "configuration error: {}", s),
            CoreError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::Store(e)
    }
}
