//! # corral-id
//!
//! Identifiers for the entities the allocator tracks.
//!
//! Frameworks and agents are named by opaque, system-generated ids with a
//! prefixed textual form `{prefix}_{ulid}`:
//!
//! - `fw_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `slave_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! The prefix keeps a framework id from being passed where an agent id is
//! expected, and the ULID keeps ids ordered by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
