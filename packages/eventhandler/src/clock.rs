//! Time source for claims and expiry checks.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};

/// Source of "now" for claim timestamps and expiry checks.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
///
/// Timestamps are truncated to microseconds, the precision of the backing
/// stores. Claim tokens written by us must compare equal when read back.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }
}

/// `instant + duration`, saturating at the representable maximum.
pub(crate) fn plus(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| instant.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `instant - duration`, saturating at the representable minimum.
pub(crate) fn minus(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| instant.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
