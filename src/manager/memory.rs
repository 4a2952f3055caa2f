//! In-process implementation of [`Storage`].
//!
//! Records live in a `DashMap`; a record's shard lock is held for the whole
//! read-modify-write of [`Storage::update_request`], which makes each update
//! atomic with respect to every other writer of the same record.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::Storage;
use crate::domain::actor::ActorId;
use crate::domain::request::{Request, RequestId, RequestStatus};
use crate::error::{BeamcheckError, Result};

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    requests: DashMap<RequestId, Request>,
    /// creator -> id of their most recent draft
    drafts: DashMap<ActorId, RequestId>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored requests, deleted ones included.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Snapshot of every request owned by `creator`.
    pub fn requests_for(&self, creator: &ActorId) -> Vec<Request> {
        self.requests
            .iter()
            .filter(|entry| &entry.value().creator_id == creator)
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn current_draft(&self, id: &RequestId) -> Option<Request> {
        self.requests
            .get(id)
            .filter(|r| r.status == RequestStatus::Draft)
            .map(|r| r.value().clone())
    }

    fn insert_draft(&self, creator: &ActorId) -> Request {
        let draft = Request::new_draft(creator.clone());
        self.requests.insert(draft.id, draft.clone());
        tracing::debug!(request_id = %draft.id, creator = %creator, "Created draft");
        draft
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    #[tracing::instrument(skip(self), fields(creator = %creator))]
    async fn ensure_draft(&self, creator: &ActorId) -> Result<Request> {
        // The drafts entry lock serializes concurrent calls for one creator
        match self.drafts.entry(creator.clone()) {
            Entry::Occupied(mut slot) => {
                if let Some(existing) = self.current_draft(slot.get()) {
                    return Ok(existing);
                }
                let draft = self.insert_draft(creator);
                slot.insert(draft.id);
                Ok(draft)
            }
            Entry::Vacant(slot) => {
                let draft = self.insert_draft(creator);
                slot.insert(draft.id);
                Ok(draft)
            }
        }
    }

    async fn get_request(&self, id: RequestId) -> Result<Request> {
        self.requests
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(BeamcheckError::RequestNotFound(id))
    }

    async fn update_request<F, T>(&self, id: RequestId, f: F) -> Result<(Request, T)>
    where
        F: FnOnce(&mut Request) -> Result<T> + Send,
        T: Send,
    {
        let mut record = self
            .requests
            .get_mut(&id)
            .ok_or(BeamcheckError::RequestNotFound(id))?;

        // Mutate a copy so a failed guard leaves the stored record untouched
        let mut candidate = record.value().clone();
        let output = f(&mut candidate)?;
        candidate.version = record.version + 1;
        *record = candidate.clone();
        drop(record);

        tracing::trace!(request_id = %id, version = candidate.version, "Request updated");
        Ok((candidate, output))
    }
}
