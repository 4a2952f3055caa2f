//! Inbound result callback.
//!
//! The external computation service reports its result here. This is the
//! idempotent convergence point of the workflow: a result may be delivered
//! any number of times, each delivery overwriting the previous one, and every
//! delivery writes the three result fields together.
//!
//! Checks run in order, and none of them mutates state:
//!
//! 1. shared-secret token (constant-time compare, only when configured)
//! 2. path identifier vs payload identifier
//! 3. payload values are finite numbers, named items belong to the request
//! 4. the request exists, is visible and is `Completed`
//! 5. the presented generation, if any, is current
//!
//! Values missing from the payload are filled in by the deflection engine
//! over the request's items at callback time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::domain::beam::{BeamId, Catalog};
use crate::domain::request::{CalculationResult, Request, RequestId, RequestStatus};
use crate::engine;
use crate::error::{BeamcheckError, Result};
use crate::manager::Storage;

/// Body of a result callback. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub request_id: Option<RequestId>,
    pub result_deflection_mm: Option<f64>,
    pub within_norm: Option<bool>,
    /// Server time is used when absent
    pub calculated_at: Option<DateTime<Utc>>,
    pub items: Option<Vec<ResultItem>>,
    /// Completion generation the result was computed for
    pub generation: Option<u64>,
}

/// An item acknowledged by the external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultItem {
    pub beam_id: BeamId,
}

/// Accepts result deliveries for completed requests.
pub struct ResultCallback<S, C> {
    storage: Arc<S>,
    catalog: Arc<C>,
    token: Option<String>,
}

impl<S, C> ResultCallback<S, C>
where
    S: Storage,
    C: Catalog,
{
    /// `token` is the shared secret inbound callbacks must present; `None`
    /// (or blank) disables the check.
    pub fn new(storage: Arc<S>, catalog: Arc<C>, token: Option<String>) -> Self {
        let token = token.filter(|t| !t.trim().is_empty());
        Self {
            storage,
            catalog,
            token,
        }
    }

    pub fn requires_token(&self) -> bool {
        self.token.is_some()
    }

    /// Constant-time check of the presented token against the configured one.
    pub fn authorize(&self, presented: Option<&str>) -> Result<()> {
        let Some(expected) = self.token.as_deref() else {
            return Ok(());
        };
        let presented = presented.unwrap_or_default();
        if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(BeamcheckError::Unauthorized(
                "invalid or missing async token".to_string(),
            ))
        }
    }

    /// Ingest one delivery and return the result as written.
    #[tracing::instrument(skip(self, presented_token, payload), fields(request_id = %path_id))]
    pub async fn accept(
        &self,
        path_id: RequestId,
        presented_token: Option<&str>,
        payload: ResultPayload,
    ) -> Result<CalculationResult> {
        let outcome = self.ingest(path_id, presented_token, payload).await;
        match &outcome {
            Ok(result) => {
                counter!("beamcheck_callback_total", "outcome" => "accepted").increment(1);
                tracing::info!(
                    deflection_mm = result.deflection_mm,
                    within_norm = result.within_norm,
                    "Result callback accepted"
                );
            }
            Err(e) => {
                counter!("beamcheck_callback_total", "outcome" => "rejected").increment(1);
                tracing::warn!(error = %e, "Result callback rejected");
            }
        }
        outcome
    }

    async fn ingest(
        &self,
        path_id: RequestId,
        presented_token: Option<&str>,
        payload: ResultPayload,
    ) -> Result<CalculationResult> {
        self.authorize(presented_token)?;

        if let Some(payload_id) = payload.request_id
            && payload_id != path_id
        {
            return Err(BeamcheckError::IdMismatch {
                path: path_id,
                payload: payload_id,
            });
        }
        if let Some(v) = payload.result_deflection_mm
            && !v.is_finite()
        {
            return Err(BeamcheckError::Validation(
                "result_deflection_mm must be a finite number".to_string(),
            ));
        }

        let request = self.storage.get_request(path_id).await?;
        request.ensure_visible()?;
        if request.status != RequestStatus::Completed {
            return Err(BeamcheckError::InvalidState(
                request.id,
                request.status.to_string(),
                RequestStatus::Completed.to_string(),
            ));
        }
        if let Some(items) = &payload.items
            && let Some(unknown) = items.iter().find(|i| request.item(i.beam_id).is_none())
        {
            return Err(BeamcheckError::Validation(format!(
                "beam {} is not in this request",
                unknown.beam_id
            )));
        }

        let result = CalculationResult {
            deflection_mm: 0.0,
            within_norm: false,
            calculated_at: payload.calculated_at.unwrap_or_else(Utc::now),
        };
        let result = self.fill_in(&request, &payload, result).await?;

        let (_, ()) = self
            .storage
            .update_request(path_id, |r| {
                r.apply_callback_result(payload.generation, result.clone())
            })
            .await?;
        Ok(result)
    }

    async fn fill_in(
        &self,
        request: &Request,
        payload: &ResultPayload,
        mut result: CalculationResult,
    ) -> Result<CalculationResult> {
        if let (Some(deflection_mm), Some(within_norm)) =
            (payload.result_deflection_mm, payload.within_norm)
        {
            result.deflection_mm = deflection_mm;
            result.within_norm = within_norm;
            return Ok(result);
        }

        // Items are frozen once formed, so the aggregate matches what a write would see
        let beam_ids: Vec<BeamId> = request.items.iter().map(|i| i.beam_id).collect();
        let specs = self.catalog.resolve(&beam_ids).await?;
        let aggregate = engine::aggregate(&request.items, &specs).ok_or_else(|| {
            BeamcheckError::Validation(
                "result values missing and no item deflection can be computed".to_string(),
            )
        })?;
        tracing::debug!(
            items_computed = aggregate.items_computed,
            "Filling in missing result values"
        );

        result.deflection_mm = payload
            .result_deflection_mm
            .unwrap_or(aggregate.total_deflection_mm);
        result.within_norm = payload.within_norm.unwrap_or(aggregate.within_norm);
        Ok(result)
    }
}
