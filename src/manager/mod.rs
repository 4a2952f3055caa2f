//! Storage for requests.
//!
//! This module defines the `Storage` trait: the transactional record store
//! the workflow runs against. The only primitive the workflow relies on for
//! correctness is [`Storage::update_request`], an atomic read-modify-write
//! scoped to a single request record. Every writer (creator edits,
//! moderator transitions, the dispatcher's simulation, the result callback)
//! goes through it, which is what serializes racing transitions.

use async_trait::async_trait;

use crate::domain::actor::ActorId;
use crate::domain::request::{Request, RequestId};
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStorage;

/// Storage trait for persisting and querying requests.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Return the creator's current draft, creating it if none exists.
    ///
    /// Idempotent: concurrent calls for the same creator observe the same
    /// draft, so at most one draft exists per creator.
    async fn ensure_draft(&self, creator: &ActorId) -> Result<Request>;

    /// Get a request by ID, including deleted ones.
    async fn get_request(&self, id: RequestId) -> Result<Request>;

    /// Atomically apply `f` to a single request.
    ///
    /// `f` runs against the current record. If it returns `Ok`, the mutated
    /// record is committed with its `version` bumped and returned alongside
    /// `f`'s output; if it returns `Err`, nothing is written. Two concurrent
    /// updates of the same record never both observe the same version.
    async fn update_request<F, T>(&self, id: RequestId, f: F) -> Result<(Request, T)>
    where
        F: FnOnce(&mut Request) -> Result<T> + Send,
        T: Send;
}
