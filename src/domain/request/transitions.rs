//! State transitions for requests.
//!
//! Every transition is a guard followed by a mutation on a `&mut Request`.
//! Transitions are pure: they never touch storage. The store applies them
//! inside its per-record atomic update, so a guard that fails leaves the
//! stored record untouched, and two racing transitions on the same record
//! are serialized (the second one observes the first one's outcome).
//!
//! ```text
//!            ensure_draft
//!                 │
//!                 ▼
//!   ┌──────── Draft ──form()──> Formed ──complete()──> Completed ── result converges
//!   │           │                 │  │
//!   │           │                 │  └──reject()──> Rejected
//!   │           │                 │
//!   └─delete()──┴────delete()─────┴──── (any non-deleted) ──delete()──> Deleted
//! ```
//!
//! `Rejected` and `Deleted` are terminal. A deleted request reads as
//! not-found to every later transition, so it can never re-enter another
//! status.
//!
//! # Result writes
//!
//! `complete()` clears any previous result and bumps the request's
//! `generation`. Asynchronous writers present the generation they were
//! triggered with:
//!
//! - [`Request::apply_simulated_result`] writes only if the request is still
//!   `Completed`, still has no result and the generation still matches;
//!   otherwise it is a no-op.
//! - [`Request::apply_callback_result`] overwrites any existing result, but
//!   refuses a result that names an outdated generation.

use chrono::{DateTime, Utc};

use super::state::{CalculationResult, LineItem, Request, RequestStatus};
use crate::domain::actor::Actor;
use crate::domain::beam::BeamId;
use crate::error::{BeamcheckError, Result};

/// Largest quantity a line item may carry; stored as a signed 32-bit column.
pub const MAX_QUANTITY: u32 = i32::MAX as u32;

fn quantity_too_large(beam_id: BeamId) -> BeamcheckError {
    BeamcheckError::Validation(format!(
        "quantity of beam {} may not exceed {}",
        beam_id, MAX_QUANTITY
    ))
}

/// Field changes for a draft line item; `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ItemUpdate {
    pub quantity: Option<u32>,
    pub length_m: Option<f64>,
    pub udl_kn_m: Option<f64>,
}

/// Outcome of an asynchronous result write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultWrite {
    /// The result fields were written.
    Written,
    /// The guard did not hold; nothing changed.
    Skipped(SkipReason),
}

/// Why a simulated result write was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotCompleted(RequestStatus),
    AlreadyHasResult,
    GenerationChanged { triggered: u64, current: u64 },
}

impl Request {
    fn invalid_state(&self, expected: &str) -> BeamcheckError {
        BeamcheckError::InvalidState(self.id, self.status.to_string(), expected.to_string())
    }

    /// Deleted requests are invisible to every operation.
    pub fn ensure_visible(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(BeamcheckError::RequestNotFound(self.id));
        }
        Ok(())
    }

    fn ensure_creator(&self, actor: &Actor) -> Result<()> {
        if self.creator_id != actor.id {
            return Err(BeamcheckError::Unauthorized(format!(
                "request {} belongs to another user",
                self.id
            )));
        }
        Ok(())
    }

    fn ensure_moderator(&self, actor: &Actor) -> Result<()> {
        if !actor.moderator {
            return Err(BeamcheckError::Unauthorized(
                "moderator access required".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_status(&self, expected: RequestStatus) -> Result<()> {
        if self.status != expected {
            return Err(self.invalid_state(expected.as_str()));
        }
        Ok(())
    }

    /// Creators and moderators may read a request.
    pub fn authorize_view(&self, actor: &Actor) -> Result<()> {
        self.ensure_visible()?;
        if actor.moderator {
            return Ok(());
        }
        self.ensure_creator(actor)
    }

    /// Add a beam to the draft. Adding a beam already in the cart increases
    /// its quantity instead of creating a second line.
    pub fn add_item(&mut self, actor: &Actor, beam_id: BeamId, quantity: u32) -> Result<()> {
        self.ensure_visible()?;
        self.ensure_creator(actor)?;
        self.ensure_status(RequestStatus::Draft)?;
        if quantity == 0 {
            return Err(BeamcheckError::Validation(
                "quantity must be at least 1".to_string(),
            ));
        }

        if quantity > MAX_QUANTITY {
            return Err(quantity_too_large(beam_id));
        }

        if let Some(existing) = self.items.iter_mut().find(|i| i.beam_id == beam_id) {
            existing.quantity = existing
                .quantity
                .checked_add(quantity)
                .filter(|q| *q <= MAX_QUANTITY)
                .ok_or_else(|| quantity_too_large(beam_id))?;
            return Ok(());
        }

        let position = self.next_position();
        self.items.push(LineItem {
            beam_id,
            quantity,
            length_m: None,
            udl_kn_m: None,
            position,
        });
        Ok(())
    }

    pub fn update_item(&mut self, actor: &Actor, beam_id: BeamId, update: &ItemUpdate) -> Result<()> {
        self.ensure_visible()?;
        self.ensure_creator(actor)?;
        self.ensure_status(RequestStatus::Draft)?;

        if update.quantity == Some(0) {
            return Err(BeamcheckError::Validation(
                "quantity must be at least 1".to_string(),
            ));
        }
        if update.quantity.is_some_and(|q| q > MAX_QUANTITY) {
            return Err(quantity_too_large(beam_id));
        }
        for (field, value) in [("length_m", update.length_m), ("udl_kn_m", update.udl_kn_m)] {
            if let Some(v) = value
                && !v.is_finite()
            {
                return Err(BeamcheckError::Validation(format!(
                    "{} must be a finite number",
                    field
                )));
            }
        }

        let item = self
            .items
            .iter_mut()
            .find(|i| i.beam_id == beam_id)
            .ok_or_else(|| {
                BeamcheckError::Validation(format!("beam {} is not in this request", beam_id))
            })?;

        if let Some(quantity) = update.quantity {
            item.quantity = quantity;
        }
        if let Some(length_m) = update.length_m {
            item.length_m = Some(length_m);
        }
        if let Some(udl_kn_m) = update.udl_kn_m {
            item.udl_kn_m = Some(udl_kn_m);
        }
        Ok(())
    }

    pub fn remove_item(&mut self, actor: &Actor, beam_id: BeamId) -> Result<()> {
        self.ensure_visible()?;
        self.ensure_creator(actor)?;
        self.ensure_status(RequestStatus::Draft)?;

        let before = self.items.len();
        self.items.retain(|i| i.beam_id != beam_id);
        if self.items.len() == before {
            return Err(BeamcheckError::Validation(format!(
                "beam {} is not in this request",
                beam_id
            )));
        }
        Ok(())
    }

    /// The note stays editable while the request is a draft or formed.
    pub fn update_note(&mut self, actor: &Actor, note: Option<String>) -> Result<()> {
        self.ensure_visible()?;
        self.ensure_creator(actor)?;
        if !self.status.is_editable() {
            return Err(self.invalid_state("draft or formed"));
        }
        self.note = note.filter(|n| !n.trim().is_empty());
        Ok(())
    }

    /// Draft → Formed. Freezes the items.
    pub fn form(&mut self, actor: &Actor, now: DateTime<Utc>) -> Result<()> {
        self.ensure_visible()?;
        self.ensure_status(RequestStatus::Draft)?;
        self.ensure_creator(actor)?;

        if self.items.is_empty() {
            return Err(BeamcheckError::Validation("empty cart".to_string()));
        }
        if let Some(item) = self.items.iter().find(|i| !i.is_complete()) {
            return Err(BeamcheckError::Validation(format!(
                "beam {} needs a positive length and a non-negative load",
                item.beam_id
            )));
        }

        self.status = RequestStatus::Formed;
        self.formed_at = Some(now);
        Ok(())
    }

    /// Formed → Completed. Clears any prior result and starts a new
    /// completion generation, which is returned for the dispatcher.
    pub fn complete(&mut self, actor: &Actor, now: DateTime<Utc>) -> Result<u64> {
        self.ensure_visible()?;
        self.ensure_moderator(actor)?;
        self.ensure_status(RequestStatus::Formed)?;

        self.status = RequestStatus::Completed;
        self.moderator_id = Some(actor.id.clone());
        self.completed_at = Some(now);
        self.result = None;
        self.generation += 1;
        Ok(self.generation)
    }

    /// Formed → Rejected.
    pub fn reject(&mut self, actor: &Actor, now: DateTime<Utc>) -> Result<()> {
        self.ensure_visible()?;
        self.ensure_moderator(actor)?;
        self.ensure_status(RequestStatus::Formed)?;

        self.status = RequestStatus::Rejected;
        self.moderator_id = Some(actor.id.clone());
        self.completed_at = Some(now);
        Ok(())
    }

    /// Any non-deleted status → Deleted. Items are kept for audit.
    pub fn delete(&mut self, actor: &Actor, now: DateTime<Utc>) -> Result<()> {
        self.ensure_visible()?;
        self.ensure_creator(actor)?;

        self.status = RequestStatus::Deleted;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Write a result computed by the local simulation.
    ///
    /// No-op unless the request is still `Completed`, has no result yet and
    /// is still on the generation the simulation was triggered with.
    pub fn apply_simulated_result(
        &mut self,
        triggered_generation: u64,
        result: CalculationResult,
    ) -> ResultWrite {
        if self.status != RequestStatus::Completed {
            return ResultWrite::Skipped(SkipReason::NotCompleted(self.status));
        }
        if self.result.is_some() {
            return ResultWrite::Skipped(SkipReason::AlreadyHasResult);
        }
        if self.generation != triggered_generation {
            return ResultWrite::Skipped(SkipReason::GenerationChanged {
                triggered: triggered_generation,
                current: self.generation,
            });
        }
        self.result = Some(result);
        ResultWrite::Written
    }

    /// Write a result delivered through the callback channel.
    ///
    /// Overwrites an existing result. A result that names a generation other
    /// than the current one is refused.
    pub fn apply_callback_result(
        &mut self,
        presented_generation: Option<u64>,
        result: CalculationResult,
    ) -> Result<()> {
        self.ensure_visible()?;
        self.ensure_status(RequestStatus::Completed)?;
        if let Some(presented) = presented_generation
            && presented != self.generation
        {
            return Err(BeamcheckError::StaleGeneration {
                request_id: self.id,
                presented,
                current: self.generation,
            });
        }
        self.result = Some(result);
        Ok(())
    }
}
