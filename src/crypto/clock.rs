//! The engine clock, one replaceable indirection shared by the signing
//! module and the chain engine

use std::sync::RwLock;

use time::OffsetDateTime;

/// A source of the current time.
pub type TimeSource = fn() -> OffsetDateTime;

static SOURCE: RwLock<TimeSource> = RwLock::new(system_time);

fn system_time() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Current engine time. Certificate validity, deadline arithmetic and
/// verification all read through this single indirection so that a replaced
/// source stays consistent across the whole chain.
pub fn now() -> OffsetDateTime {
    let source = self::source();
    source()
}

/// Replaces the time source, returning the previous one. Tests install a
/// frozen source here and restore the returned one when done.
pub fn replace(source: TimeSource) -> TimeSource {
    let mut slot = SOURCE.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::replace(&mut *slot, source)
}

/// Restores the wall-clock source.
pub fn reset() {
    replace(system_time);
}

fn source() -> TimeSource {
    *SOURCE.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}
