//! Packed 64-bit identifiers.
//!
//! Layout, most significant first:
//!
//! ```text
//! | 1 bit sign (0) | 40 bits ms since epoch | 13 bits shard | 10 bits sequence |
//! ```
//!
//! The sequence component is the partition counter reduced modulo 1024, so
//! more than 1024 inserts on one shard within one millisecond reuse values.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ShardError, ShardResult};

pub const SEQUENCE_BITS: u32 = 10;
pub const SHARD_BITS: u32 = 13;
pub const TIMESTAMP_BITS: u32 = 40;
pub const SHARD_SHIFT: u32 = SEQUENCE_BITS;
pub const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + SHARD_BITS;

pub const SEQUENCE_MODULUS: i64 = 1 << SEQUENCE_BITS;
pub const MAX_SHARD: u32 = (1 << SHARD_BITS) - 1;
pub const MAX_ELAPSED_MS: i64 = (1 << TIMESTAMP_BITS) - 1;

/// 2012-11-01T00:00:00Z.
pub const DEFAULT_EPOCH_MS: i64 = 1_351_728_000_000;

const _: () = assert!(TIMESTAMP_BITS + SHARD_BITS + SEQUENCE_BITS == 63);

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 { Utc::now().timestamp_millis() }
}

/// Clock driven by hand; for tests and replay.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(ms: i64) -> Self { Self(AtomicI64::new(ms)) }
    pub fn set(&self, ms: i64) { self.0.store(ms, Ordering::SeqCst) }
    pub fn advance(&self, ms: i64) { self.0.fetch_add(ms, Ordering::SeqCst); }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 { self.0.load(Ordering::SeqCst) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeneratedId(i64);

impl GeneratedId {
    pub fn pack(elapsed_ms: i64, shard: u32, sequence: i64) -> ShardResult<Self> {
        if !(0..=MAX_ELAPSED_MS).contains(&elapsed_ms) {
            return Err(ShardError::IdSpaceExhausted(format!("{}ms since epoch does not fit {} bits", elapsed_ms, TIMESTAMP_BITS)));
        }
        if shard > MAX_SHARD {
            return Err(ShardError::IdSpaceExhausted(format!("shard {} does not fit {} bits", shard, SHARD_BITS)));
        }
        if !(0..SEQUENCE_MODULUS).contains(&sequence) {
            return Err(ShardError::IdSpaceExhausted(format!("sequence {} does not fit {} bits", sequence, SEQUENCE_BITS)));
        }
        Ok(Self((elapsed_ms << TIMESTAMP_SHIFT) | (i64::from(shard) << SHARD_SHIFT) | sequence))
    }

    pub fn from_raw(v: i64) -> Self { Self(v) }
    pub fn value(self) -> i64 { self.0 }

    pub fn elapsed_ms(self) -> i64 { self.0 >> TIMESTAMP_SHIFT }
    pub fn shard(self) -> u32 { ((self.0 >> SHARD_SHIFT) & i64::from(MAX_SHARD)) as u32 }
    pub fn sequence(self) -> i64 { self.0 & (SEQUENCE_MODULUS - 1) }

    pub fn unix_millis(self, epoch_ms: i64) -> i64 { epoch_ms + self.elapsed_ms() }

    pub fn timestamp(self, epoch_ms: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.unix_millis(epoch_ms)).single()
    }
}

impl From<GeneratedId> for i64 {
    fn from(v: GeneratedId) -> Self { v.0 }
}

/// Assembles IDs from the clock, a shard number and a counter value.
///
/// The last elapsed reading is cached so a clock that steps backwards is
/// reported instead of silently reissuing older timestamps.
pub struct IdGenerator {
    epoch_ms: i64,
    clock: Arc<dyn Clock>,
    last_elapsed: Mutex<i64>,
}

impl IdGenerator {
    pub fn new(epoch_ms: i64) -> Self { Self::with_clock(epoch_ms, Arc::new(SystemClock)) }

    pub fn with_clock(epoch_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self { epoch_ms, clock, last_elapsed: Mutex::new(0) }
    }

    pub fn epoch_ms(&self) -> i64 { self.epoch_ms }

    /// Milliseconds since the epoch; never smaller than the previous reading.
    pub fn elapsed_ms(&self) -> ShardResult<i64> {
        let mut last = self.last_elapsed.lock().unwrap_or_else(|p| p.into_inner());
        let now = self.clock.now_millis();
        let elapsed = now - self.epoch_ms;
        if elapsed < 0 {
            return Err(ShardError::ClockSkew { now_ms: now, floor_ms: self.epoch_ms });
        }
        if elapsed < *last {
            return Err(ShardError::ClockSkew { now_ms: now, floor_ms: self.epoch_ms + *last });
        }
        *last = elapsed;
        Ok(elapsed)
    }

    /// Pack `counter mod 1024` with the current time and `shard`.
    pub fn generate(&self, counter: i64, shard: u32) -> ShardResult<GeneratedId> {
        let seq = counter.rem_euclid(SEQUENCE_MODULUS);
        let elapsed = self.elapsed_ms()?;
        GeneratedId::pack(elapsed, shard, seq)
    }
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").field("epoch_ms", &self.epoch_ms).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn gen_at(ms: i64) -> (Arc<ManualClock>, IdGenerator) {
        let clock = Arc::new(ManualClock::new(DEFAULT_EPOCH_MS + ms));
        let g = IdGenerator::with_clock(DEFAULT_EPOCH_MS, clock.clone());
        (clock, g)
    }

    #[test]
    fn packs_components() {
        let id = GeneratedId::pack(5, 3, 7).unwrap();
        assert_eq!(id.value(), (5 << 23) | (3 << 10) | 7);
        assert_eq!(id.elapsed_ms(), 5);
        assert_eq!(id.shard(), 3);
        assert_eq!(id.sequence(), 7);
        assert_eq!(id.unix_millis(DEFAULT_EPOCH_MS), DEFAULT_EPOCH_MS + 5);
    }

    #[test]
    fn pack_rejects_out_of_range() {
        assert!(GeneratedId::pack(-1, 0, 0).is_err());
        assert!(GeneratedId::pack(MAX_ELAPSED_MS + 1, 0, 0).is_err());
        assert!(GeneratedId::pack(0, MAX_SHARD + 1, 0).is_err());
        assert!(GeneratedId::pack(0, 0, 1024).is_err());
        let max = GeneratedId::pack(MAX_ELAPSED_MS, MAX_SHARD, 1023).unwrap();
        assert_eq!(max.value(), i64::MAX);
    }

    #[test]
    fn same_millisecond_wraps_after_1024() {
        let (_clock, g) = gen_at(1_000);
        let ids: Vec<_> = (0..1024).map(|c| g.generate(c, 1).unwrap()).collect();
        let distinct: HashSet<_> = ids[..1023].iter().collect();
        assert_eq!(distinct.len(), 1023);
        assert_eq!(g.generate(1024, 1).unwrap(), ids[0]);
    }

    #[test]
    fn later_millisecond_orders_higher() {
        let (clock, g) = gen_at(10);
        let a = g.generate(1023, 5).unwrap();
        clock.advance(1);
        let b = g.generate(0, 0).unwrap();
        assert!(b > a);
    }

    #[test]
    fn clock_behind_epoch_or_backwards_is_skew() {
        let (clock, g) = gen_at(-1);
        assert!(matches!(g.generate(0, 0), Err(ShardError::ClockSkew { .. })));
        clock.set(DEFAULT_EPOCH_MS + 50);
        g.generate(0, 0).unwrap();
        clock.set(DEFAULT_EPOCH_MS + 49);
        assert!(matches!(g.generate(1, 0), Err(ShardError::ClockSkew { .. })));
        clock.set(DEFAULT_EPOCH_MS + 50);
        g.generate(2, 0).unwrap();
    }

    #[test]
    fn negative_counter_reduces_euclidean() {
        let (_clock, g) = gen_at(0);
        assert_eq!(g.generate(-1, 0).unwrap().sequence(), 1023);
    }
}
