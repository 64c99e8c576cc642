pub mod logging;

pub use tracing;

/// Lifecycle signal broadcast to every long-running component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

/// Current wall-clock time as unix seconds, the resolution the store keeps
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
