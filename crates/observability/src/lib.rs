//! Log output for the queue binaries: JSON lines filtered by `RUST_LOG`.
//!
//! Library crates only emit `tracing` events; installing a subscriber is
//! left to whatever process embeds them.

/// Install the JSON subscriber with the default filter. Repeat calls keep
/// the first subscriber.
pub fn init() {
    tracing::init();
}

pub mod tracing;
