//! # corral-testing
//!
//! Shared helpers for allocator integration tests:
//!
//! - [`fixtures`]: agents, frameworks and quota requests from short strings
//! - [`RecordingOfferSink`] / [`OfferRecorder`]: capture offers and
//!   rescissions on a channel so tests can await them
//! - [`TestAllocator`]: a running allocator wired to a recorder

pub mod fixtures;
mod harness;
mod sink;

pub use harness::TestAllocator;
pub use sink::{OfferRecorder, RecordedOffer, RecordingOfferSink, Rescission};

use std::sync::Once;

static INIT_TRACING: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per process. Honors
/// `RUST_LOG`.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}
