//! # offsync Testkit
//!
//! Test utilities for offsync.
//!
//! This crate provides:
//! - Payload builders and temporary client stores
//! - A repository wrapper that fails chosen writes
//! - An in-process harness wiring sync clients to one server
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use offsync_testkit::prelude::*;
//!
//! #[test]
//! fn two_devices_converge() {
//!     let harness = SyncHarness::new();
//!     let (alice, bob) = (harness.device(), harness.device());
//!     alice.store().write(EntityType::Post, None, post_payload("hi")).unwrap();
//!     alice.sync_now().unwrap();
//!     bob.pull().unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use offsync_protocol::{EntityType, Payload, SyncStatus};
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
