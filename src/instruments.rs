// instruments.rs — Instrument Registry (spec.md §4.1).
//
// Caches exchange contract metadata per symbol, refreshed hourly. Single
// writer (refresh), many concurrent readers; a stale-but-nonempty read is
// preferable to blocking (spec.md §5).

use crate::error::ExchangeError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentMeta {
    pub contract_value: f64,
    pub min_size: f64,
    pub lot_size: f64,
}

/// Source of the raw instrument table. Implemented by the exchange
/// collaborator; the registry only depends on this narrow trait.
#[async_trait]
pub trait InstrumentSource: Send + Sync {
    async fn fetch_instruments(&self) -> Result<HashMap<String, InstrumentMeta>, ExchangeError>;
}

struct Cache {
    entries: HashMap<String, InstrumentMeta>,
    last_refresh: Option<Instant>,
}

pub struct InstrumentRegistry<S: InstrumentSource> {
    source: S,
    cache: Mutex<Cache>,
}

impl<S: InstrumentSource> InstrumentRegistry<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: Mutex::new(Cache { entries: HashMap::new(), last_refresh: None }),
        }
    }

    fn is_stale(&self) -> bool {
        let cache = self.cache.lock().unwrap();
        match cache.last_refresh {
            None => true,
            Some(t) => t.elapsed() > REFRESH_INTERVAL,
        }
    }

    async fn refresh(&self) -> Result<(), ExchangeError> {
        let fresh = self.source.fetch_instruments().await?;
        let mut cache = self.cache.lock().unwrap();
        cache.entries = fresh;
        cache.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Returns cached metadata for `instrument`, refreshing the whole table
    /// first if the cache is empty or older than an hour. Falls back to a
    /// stale cached entry if the refresh call itself fails.
    pub async fn get(&self, instrument: &str) -> Result<InstrumentMeta, ExchangeError> {
        if self.is_stale() {
            if let Err(e) = self.refresh().await {
                let cache = self.cache.lock().unwrap();
                return cache
                    .entries
                    .get(instrument)
                    .copied()
                    .ok_or(ExchangeError::InstrumentUnavailable(format!(
                        "{} (refresh failed: {})",
                        instrument, e
                    )));
            }
        }
        let cache = self.cache.lock().unwrap();
        cache
            .entries
            .get(instrument)
            .copied()
            .ok_or_else(|| ExchangeError::InstrumentUnavailable(instrument.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl InstrumentSource for FakeSource {
        async fn fetch_instruments(&self) -> Result<HashMap<String, InstrumentMeta>, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ExchangeError::Transient("down".to_string()));
            }
            let mut m = HashMap::new();
            m.insert(
                "BTC-USDT-SWAP".to_string(),
                InstrumentMeta { contract_value: 0.01, min_size: 0.01, lot_size: 0.01 },
            );
            Ok(m)
        }
    }

    #[tokio::test]
    async fn refreshes_once_then_caches() {
        let source = FakeSource { calls: AtomicUsize::new(0), fail: false };
        let registry = InstrumentRegistry::new(source);
        let m1 = registry.get("BTC-USDT-SWAP").await.unwrap();
        let m2 = registry.get("BTC-USDT-SWAP").await.unwrap();
        assert_eq!(m1, m2);
        assert_eq!(registry.source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_without_cache_on_failure() {
        let source = FakeSource { calls: AtomicUsize::new(0), fail: true };
        let registry = InstrumentRegistry::new(source);
        let err = registry.get("BTC-USDT-SWAP").await.unwrap_err();
        assert!(matches!(err, ExchangeError::InstrumentUnavailable(_)));
    }
}
