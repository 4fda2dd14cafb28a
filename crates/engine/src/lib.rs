//! Region-chunk device engine.
//!
//! Overlays stateful devices ("native" tile entities) on a host voxel world.
//! The [`world`] module holds the per-region state containers and their
//! persistence, [`sched`] the two clocks that drive them, and [`network`] the
//! graph-based resource distribution between devices.

pub mod error;
pub mod host;
pub mod network;
pub mod sched;
pub mod world;
