//! Request service: the transition layer.
//!
//! Every mutating operation runs its transition inside the store's
//! per-record atomic update, so guards and writes are serialized per
//! request. `complete` commits first and only then hands a job to the
//! [`Dispatcher`]; a dispatch failure is logged and never reaches the
//! caller.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::dispatch::{DispatchJob, Dispatcher};
use crate::domain::actor::{Actor, ActorId};
use crate::domain::beam::{BeamId, BeamSpec, Catalog};
use crate::domain::request::{
    CalculationResult, ItemUpdate, Request, RequestId, RequestStatus,
};
use crate::engine::{self, Aggregate};
use crate::error::{BeamcheckError, Result};
use crate::manager::Storage;

/// The actor's current draft and its badge count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSummary {
    pub request_id: RequestId,
    /// Sum of item quantities
    pub total_quantity: u64,
}

/// A line item as shown to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemView {
    pub beam_id: BeamId,
    pub beam_name: Option<String>,
    pub material: Option<String>,
    pub quantity: u32,
    pub length_m: Option<f64>,
    pub udl_kn_m: Option<f64>,
    pub position: u32,
    /// Rounded to 6 decimals; only present once the request has a result
    pub deflection_mm: Option<f64>,
}

/// A request as shown to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestView {
    pub id: RequestId,
    pub status: RequestStatus,
    pub creator_id: ActorId,
    pub moderator_id: Option<ActorId>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub formed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<CalculationResult>,
    pub generation: u64,
    pub total_quantity: u64,
    pub items: Vec<ItemView>,
}

impl RequestView {
    pub fn build(request: &Request, specs: &HashMap<BeamId, BeamSpec>) -> Self {
        let with_result = request.result.is_some();
        let mut items: Vec<ItemView> = request
            .items
            .iter()
            .map(|item| {
                let spec = specs.get(&item.beam_id);
                ItemView {
                    beam_id: item.beam_id,
                    beam_name: spec.map(|s| s.name.clone()),
                    material: spec.and_then(|s| s.material.clone()),
                    quantity: item.quantity,
                    length_m: item.length_m,
                    udl_kn_m: item.udl_kn_m,
                    position: item.position,
                    deflection_mm: with_result
                        .then(|| engine::item_deflection_mm(item, spec))
                        .flatten()
                        .map(engine::round_display),
                }
            })
            .collect();
        items.sort_by_key(|i| i.position);

        RequestView {
            id: request.id,
            status: request.status,
            creator_id: request.creator_id.clone(),
            moderator_id: request.moderator_id.clone(),
            note: request.note.clone(),
            created_at: request.created_at,
            formed_at: request.formed_at,
            completed_at: request.completed_at,
            result: request.result.clone(),
            generation: request.generation,
            total_quantity: request.total_quantity(),
            items,
        }
    }

    /// True while a completed request is still waiting for its result.
    pub fn awaiting_result(&self) -> bool {
        self.status == RequestStatus::Completed && self.result.is_none()
    }
}

/// Per-item engine output for a preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPreview {
    pub beam_id: BeamId,
    pub deflection_mm: Option<f64>,
    pub allowed_deflection_mm: Option<f64>,
}

/// Engine output over the current items, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub request_id: RequestId,
    pub items: Vec<ItemPreview>,
    pub aggregate: Option<Aggregate>,
}

pub struct RequestService<S, C> {
    storage: Arc<S>,
    catalog: Arc<C>,
    dispatcher: Arc<Dispatcher>,
}

impl<S, C> Clone for RequestService<S, C> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            catalog: self.catalog.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<S, C> RequestService<S, C>
where
    S: Storage,
    C: Catalog,
{
    pub fn new(storage: Arc<S>, catalog: Arc<C>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            storage,
            catalog,
            dispatcher,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn catalog(&self) -> &Arc<C> {
        &self.catalog
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The actor's single draft, created on first use.
    #[tracing::instrument(skip(self), fields(actor = %actor.id))]
    pub async fn ensure_draft(&self, actor: &Actor) -> Result<Request> {
        self.storage.ensure_draft(&actor.id).await
    }

    pub async fn cart_summary(&self, actor: &Actor) -> Result<CartSummary> {
        let draft = self.ensure_draft(actor).await?;
        Ok(CartSummary {
            request_id: draft.id,
            total_quantity: draft.total_quantity(),
        })
    }

    /// Read a request on behalf of its creator or a moderator.
    pub async fn get(&self, actor: &Actor, id: RequestId) -> Result<Request> {
        let request = self.storage.get_request(id).await?;
        request.authorize_view(actor)?;
        Ok(request)
    }

    pub async fn view(&self, actor: &Actor, id: RequestId) -> Result<RequestView> {
        let request = self.get(actor, id).await?;
        self.render(&request).await
    }

    /// Build the reader view of a request already loaded.
    pub async fn render(&self, request: &Request) -> Result<RequestView> {
        let specs = self.resolve_specs(request).await?;
        Ok(RequestView::build(request, &specs))
    }

    /// Run the engine over the current items without persisting anything.
    pub async fn preview(&self, actor: &Actor, id: RequestId) -> Result<Preview> {
        let request = self.get(actor, id).await?;
        let specs = self.resolve_specs(&request).await?;

        let items = request
            .items
            .iter()
            .map(|item| {
                let spec = specs.get(&item.beam_id);
                ItemPreview {
                    beam_id: item.beam_id,
                    deflection_mm: engine::item_deflection_mm(item, spec),
                    allowed_deflection_mm: item.length_m.and_then(|l| {
                        engine::allowed_deflection_mm(l, spec.and_then(|s| s.allowed_deflection_ratio))
                    }),
                }
            })
            .collect();

        Ok(Preview {
            request_id: request.id,
            items,
            aggregate: engine::aggregate(&request.items, &specs),
        })
    }

    #[tracing::instrument(skip(self), fields(actor = %actor.id, request_id = %id))]
    pub async fn add_item(
        &self,
        actor: &Actor,
        id: RequestId,
        beam_id: BeamId,
        quantity: u32,
    ) -> Result<Request> {
        if self.catalog.beam(beam_id).await?.is_none() {
            return Err(BeamcheckError::Validation(format!(
                "beam {} is not in the catalog",
                beam_id
            )));
        }
        let (request, ()) = self
            .storage
            .update_request(id, |r| r.add_item(actor, beam_id, quantity))
            .await?;
        Ok(request)
    }

    pub async fn update_item(
        &self,
        actor: &Actor,
        id: RequestId,
        beam_id: BeamId,
        update: &ItemUpdate,
    ) -> Result<Request> {
        let (request, ()) = self
            .storage
            .update_request(id, |r| r.update_item(actor, beam_id, update))
            .await?;
        Ok(request)
    }

    pub async fn remove_item(&self, actor: &Actor, id: RequestId, beam_id: BeamId) -> Result<Request> {
        let (request, ()) = self
            .storage
            .update_request(id, |r| r.remove_item(actor, beam_id))
            .await?;
        Ok(request)
    }

    pub async fn update_note(
        &self,
        actor: &Actor,
        id: RequestId,
        note: Option<String>,
    ) -> Result<Request> {
        let (request, ()) = self
            .storage
            .update_request(id, |r| r.update_note(actor, note))
            .await?;
        Ok(request)
    }

    #[tracing::instrument(skip(self), fields(actor = %actor.id, request_id = %id))]
    pub async fn form(&self, actor: &Actor, id: RequestId) -> Result<Request> {
        let (request, ()) = self
            .storage
            .update_request(id, |r| r.form(actor, Utc::now()))
            .await?;
        tracing::info!(items = request.items.len(), "Request formed");
        counter!("beamcheck_transitions_total", "transition" => "form").increment(1);
        Ok(request)
    }

    /// Formed → Completed, then dispatch the computation.
    ///
    /// Returns as soon as the transition has committed. The computation runs
    /// later; its failures are logged by the dispatcher.
    #[tracing::instrument(skip(self), fields(actor = %actor.id, request_id = %id))]
    pub async fn complete(&self, actor: &Actor, id: RequestId) -> Result<Request> {
        let (request, generation) = self
            .storage
            .update_request(id, |r| r.complete(actor, Utc::now()))
            .await?;
        tracing::info!(generation, "Request completed");
        counter!("beamcheck_transitions_total", "transition" => "complete").increment(1);

        let job = DispatchJob {
            request_id: request.id,
            generation,
        };
        if let Err(e) = self.dispatcher.dispatch(job) {
            tracing::error!(
                error = %e,
                generation,
                "Failed to dispatch computation, request remains completed without a result"
            );
        }
        Ok(request)
    }

    #[tracing::instrument(skip(self), fields(actor = %actor.id, request_id = %id))]
    pub async fn reject(&self, actor: &Actor, id: RequestId) -> Result<Request> {
        let (request, ()) = self
            .storage
            .update_request(id, |r| r.reject(actor, Utc::now()))
            .await?;
        tracing::info!("Request rejected");
        counter!("beamcheck_transitions_total", "transition" => "reject").increment(1);
        Ok(request)
    }

    #[tracing::instrument(skip(self), fields(actor = %actor.id, request_id = %id))]
    pub async fn delete(&self, actor: &Actor, id: RequestId) -> Result<()> {
        self.storage
            .update_request(id, |r| r.delete(actor, Utc::now()))
            .await?;
        tracing::info!("Request deleted");
        counter!("beamcheck_transitions_total", "transition" => "delete").increment(1);
        Ok(())
    }

    async fn resolve_specs(&self, request: &Request) -> Result<HashMap<BeamId, BeamSpec>> {
        let ids: Vec<BeamId> = request.items.iter().map(|i| i.beam_id).collect();
        self.catalog.resolve(&ids).await
    }
}
