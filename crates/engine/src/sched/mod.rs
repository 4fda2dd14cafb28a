//! The two clocks that drive region chunks.
//!
//! - [`clock::SyncClock`]: the host's fixed cadence. The host calls
//!   [`SyncClock::tick`](clock::SyncClock::tick) once per game tick and every
//!   scheduled task runs on that single logical thread.
//! - [`ticker`]: self-paced per-entity loops on the tokio worker pool,
//!   grouped per chunk under a [`cancel::CancelToken`].

pub mod cancel;
pub mod clock;
pub mod ticker;

/// Host ticks per second at normal speed.
pub const DEFAULT_TICK_RATE: f64 = 20.0;
