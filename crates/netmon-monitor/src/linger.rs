//! Linger delay resolution and its privilege-gated test override.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use netmon_core::Caller;

use crate::MonitorError;

/// Linger delay used when nothing overrides it.
pub const DEFAULT_LINGER_DELAY: Duration = Duration::from_secs(30);

static DEFAULT_LINGER_DELAY_MS: AtomicU64 = AtomicU64::new(30_000);

/// Returns the process-wide default linger delay.
pub fn default_linger_delay() -> Duration {
    Duration::from_millis(DEFAULT_LINGER_DELAY_MS.load(Ordering::Relaxed))
}

/// Overrides the process-wide default linger delay. Testing only.
///
/// Monitors read the default at construction, so the override affects
/// monitors created afterwards.
///
/// # Errors
/// Returns [`MonitorError::PermissionDenied`] for unprivileged callers.
pub fn set_default_linger_delay(caller: Caller, delay: Duration) -> Result<(), MonitorError> {
    if caller != Caller::Privileged {
        tracing::warn!("rejected unprivileged linger delay override");
        return Err(MonitorError::PermissionDenied(
            "linger delay override is for internal testing only".to_string(),
        ));
    }

    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    DEFAULT_LINGER_DELAY_MS.store(millis, Ordering::Relaxed);
    tracing::info!(linger_ms = millis, "default linger delay overridden");
    Ok(())
}
