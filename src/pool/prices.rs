use crate::errors::{PoolError, PoolResult};
use crate::math::Fixed64;
use portable_atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct PriceObservation {
    pub timestamp: u64,
    pub price: Fixed64,
}

/// First observation of each UTC day plus the most recent one. Daily
/// entries settle expired options.
#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    daily: BTreeMap<u64, PriceObservation>,
    latest: Option<PriceObservation>,
}

impl PriceHistory {
    pub fn record(&mut self, observation: PriceObservation) {
        self.daily
            .entry(observation.timestamp / SECONDS_PER_DAY)
            .or_insert(observation);
        self.latest = Some(observation);
    }

    #[inline]
    pub fn latest(&self) -> Option<PriceObservation> {
        self.latest
    }

    /// Earliest retained daily observation taken at or after `timestamp`.
    pub fn price_at_or_after(&self, timestamp: u64) -> Option<PriceObservation> {
        self.daily
            .range(timestamp / SECONDS_PER_DAY..)
            .map(|(_, obs)| *obs)
            .find(|obs| obs.timestamp >= timestamp)
    }
}

/// Synchronous spot source. A failed or non-finite read aborts the
/// operation that asked for it.
pub trait PriceFeed: Send + Sync {
    fn latest_price(&self, now: u64) -> PoolResult<Fixed64>;
}

/// Operator-set spot price, shared between the HTTP layer and the pool.
/// Stored as raw f64 bits so reads never take a lock.
#[derive(Debug, Clone, Default)]
pub struct ManualPriceFeed {
    bits: Arc<AtomicU64>,
}

impl ManualPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the price it replaced (zero when none was set).
    pub fn set_price(&self, price: f64) -> PoolResult<f64> {
        if !price.is_finite() || price <= 0.0 {
            return Err(PoolError::Validation(format!("invalid spot price {price}")));
        }
        Ok(f64::from_bits(self.bits.swap(price.to_bits(), Ordering::AcqRel)))
    }

    /// Puts back a value returned by [`set_price`](Self::set_price).
    pub fn restore(&self, previous: f64) {
        self.bits.store(previous.to_bits(), Ordering::Release);
    }

    pub fn current(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

impl PriceFeed for ManualPriceFeed {
    fn latest_price(&self, _now: u64) -> PoolResult<Fixed64> {
        let price = self.current();
        if !price.is_finite() || price <= 0.0 {
            return Err(PoolError::ExternalDependency("no spot price available".into()));
        }
        Fixed64::from_f64(price).map_err(|e| PoolError::ExternalDependency(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY0: u64 = 1_617_235_200;

    fn obs(timestamp: u64, price: i64) -> PriceObservation {
        PriceObservation {
            timestamp,
            price: Fixed64::from_int(price),
        }
    }

    #[test]
    fn test_keeps_first_of_day() {
        let mut h = PriceHistory::default();
        h.record(obs(DAY0 + 10, 100));
        h.record(obs(DAY0 + 500, 105));
        h.record(obs(DAY0 + SECONDS_PER_DAY + 1, 110));
        assert_eq!(h.latest().unwrap().price, Fixed64::from_int(110));
        assert_eq!(h.price_at_or_after(DAY0).unwrap().price, Fixed64::from_int(100));
        assert_eq!(h.price_at_or_after(DAY0 + 11).unwrap().price, Fixed64::from_int(110));
    }

    #[test]
    fn test_lookup_skips_earlier_same_day() {
        let mut h = PriceHistory::default();
        h.record(obs(DAY0 + 10, 100));
        h.record(obs(DAY0 + 3 * SECONDS_PER_DAY, 120));
        assert_eq!(h.price_at_or_after(DAY0 + 20).unwrap().price, Fixed64::from_int(120));
        assert!(h.price_at_or_after(DAY0 + 4 * SECONDS_PER_DAY).is_none());
    }

    #[test]
    fn test_manual_feed() {
        let feed = ManualPriceFeed::new();
        assert_eq!(feed.latest_price(0).unwrap_err().kind(), "external_dependency");
        assert!(feed.set_price(f64::NAN).is_err());
        assert_eq!(feed.set_price(2_000.5).unwrap(), 0.0);
        let shared = feed.clone();
        assert_eq!(shared.latest_price(0).unwrap().to_f64(), 2_000.5);
        assert_eq!(shared.set_price(2_100.0).unwrap(), 2_000.5);
        feed.restore(0.0);
        assert!(shared.latest_price(0).is_err());
    }
}
