//! Beam deflection requests with an asynchronous computation step.
//!
//! Users collect catalog beams into a draft request, give each a span and a
//! load, and submit it. A moderator completes or rejects the submission.
//! Completion hands the request to a dispatcher that computes the mid-span
//! deflection either through an external service (which reports back via a
//! callback) or through a local delayed simulation. Clients poll a completed
//! request until its result converges.
//!
//! Requests live behind a [`Storage`] implementation whose per-record atomic
//! update serializes every transition and every result write.

pub mod api;
pub mod callback;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod error;
pub mod http;
pub mod manager;
pub mod poller;
pub mod request;
pub mod service;

// Re-export commonly used types
pub use callback::{ResultCallback, ResultPayload};
pub use config::Config;
pub use dispatch::{DispatchJob, DispatchMode, Dispatcher, DispatchStatsSnapshot};
pub use domain::beam::{BeamId, BeamSpec, Catalog, InMemoryCatalog};
pub use error::{BeamcheckError, Result};
pub use http::{HttpClient, HttpResponse, MockHttpClient, ReqwestHttpClient};
pub use manager::{InMemoryStorage, Storage};
pub use poller::{PollState, Poller, RequestSource};
pub use request::*;
pub use service::{RequestService, RequestView};

#[cfg(feature = "postgres")]
pub use manager::postgres::PostgresStorage;

/// Get the beamcheck database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
