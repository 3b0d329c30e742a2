//! # offsync Sync Server
//!
//! Server side of the offsync offline-first subsystem.
//!
//! This crate provides:
//! - The reconciler, classifying pushed mutations as created, updated,
//!   conflict or error
//! - The change feed for incremental pulls
//! - The conflict resolver (`client`, `server`, `merge`)
//! - An entity repository trait with an in-memory implementation
//! - Authentication (HMAC-SHA256 tokens)
//! - `SyncServer`, an HTTP-shaped dispatcher for the sync endpoints
//!
//! # Key Invariants
//!
//! - An entity's version increases by exactly one per accepted mutation
//! - A mutation based on a version behind the server's is a conflict and
//!   writes nothing
//! - Items of a batch succeed or fail independently
//! - Every write is stamped above any change feed cursor issued before it
//!
//! # Endpoints
//!
//! | Method | Path | Body |
//! |--------|------|------|
//! | POST | `sync/batch` | `BatchRequest` → `BatchResponse` |
//! | POST | `sync/bulk` | `BulkRequest` → `BulkResponse` |
//! | GET | `sync/changes?since=&types=&limit=` | → `ChangesResponse` |
//! | POST | `sync/resolve-conflict` | `ResolveRequest` → `ResolveResponse` |
//! | GET | `sync/status` | → `StatusResponse` |

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod change_feed;
mod clock;
mod config;
mod error;
mod handler;
mod reconciler;
mod repository;
mod resolver;
mod server;

pub use auth::{
    AuthConfig, DenyAll, Principal, PrincipalProvider, StaticPrincipal, TokenValidator,
};
pub use change_feed::ChangeFeed;
pub use clock::{Clock, ManualClock, ServerClock, SystemClock};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use reconciler::Reconciler;
pub use repository::{ChangeSet, EntityRepository, MemoryRepository, StoredEntity, TypeChanges};
pub use resolver::ConflictResolver;
pub use server::{SyncServer, ANONYMOUS_USER};
