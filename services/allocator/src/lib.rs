//! corral allocator library.
//!
//! The crate ships a `corral-allocator` binary, but the allocator itself is
//! exposed as a library so a master can embed it and tests can drive it.

pub mod actors;
pub mod allocator;
pub mod authorizer;
pub mod config;
pub mod metrics;
pub mod quota;
pub mod registrar;
pub mod sorter;
pub mod watcher;

pub use allocator::{
    Allocator, AllocatorError, Capability, DispatchAllocator, Filters, FrameworkInfo, OfferSink,
    Offers, Request, SlaveInfo,
};
pub use config::AllocatorConfig;
