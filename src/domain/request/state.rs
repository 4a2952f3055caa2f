//! Core types for the request workflow.
//!
//! A [`Request`] is the aggregate root: it owns its [`LineItem`]s, carries the
//! lifecycle [`RequestStatus`], and holds the optional [`CalculationResult`]
//! produced by the asynchronous computation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::actor::ActorId;
use crate::domain::beam::BeamId;

/// Lifecycle status of a request.
///
/// This enum represents the string values stored in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Draft,
    Formed,
    Completed,
    Rejected,
    Deleted,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Draft => "draft",
            RequestStatus::Formed => "formed",
            RequestStatus::Completed => "completed",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Deleted => "deleted",
        }
    }

    /// Terminal statuses never transition again.
    ///
    /// `Completed` is not terminal here only in the sense that its result can
    /// still converge; its status never changes except to `Deleted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Rejected | RequestStatus::Deleted)
    }

    /// Statuses in which the creator may edit the note.
    pub fn is_editable(&self) -> bool {
        matches!(self, RequestStatus::Draft | RequestStatus::Formed)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(RequestStatus::Draft),
            "formed" => Ok(RequestStatus::Formed),
            "completed" => Ok(RequestStatus::Completed),
            "rejected" => Ok(RequestStatus::Rejected),
            "deleted" => Ok(RequestStatus::Deleted),
            other => Err(format!("unknown request status '{}'", other)),
        }
    }
}

/// Unique identifier for a request in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RequestId)
    }
}

/// One beam selection within a request.
///
/// Line items have no lifecycle of their own: they are created and removed
/// freely while the owning request is a draft and frozen afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Reference into the external beam catalog
    pub beam_id: BeamId,
    /// Number of identical beams, always >= 1
    pub quantity: u32,
    /// Span length in metres, must be > 0 before forming
    pub length_m: Option<f64>,
    /// Uniformly distributed load in kN/m, must be >= 0 before forming
    pub udl_kn_m: Option<f64>,
    /// Ordering hint, never renumbered
    pub position: u32,
}

impl LineItem {
    /// True if the item carries a positive length and a non-negative load.
    pub fn is_complete(&self) -> bool {
        matches!(self.length_m, Some(l) if l.is_finite() && l > 0.0)
            && matches!(self.udl_kn_m, Some(w) if w.is_finite() && w >= 0.0)
    }
}

/// Authoritative outcome of the deflection computation.
///
/// Holding the three result fields in one value makes a partially populated
/// result unrepresentable: they are set together and cleared together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResult {
    pub deflection_mm: f64,
    pub within_norm: bool,
    pub calculated_at: DateTime<Utc>,
}

/// The request aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub status: RequestStatus,
    pub creator_id: ActorId,
    /// Set only by `complete` and `reject`
    pub moderator_id: Option<ActorId>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub formed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<CalculationResult>,
    /// Completion epoch, bumped on every `complete`. Asynchronous writers
    /// present the generation they were triggered with.
    pub generation: u64,
    /// Optimistic lock version, bumped by the store on every committed write
    pub version: u64,
    pub items: Vec<LineItem>,
}

impl Request {
    /// A fresh, empty draft owned by `creator_id`.
    pub fn new_draft(creator_id: ActorId) -> Self {
        Request {
            id: RequestId::new(),
            status: RequestStatus::Draft,
            creator_id,
            moderator_id: None,
            note: None,
            created_at: Utc::now(),
            formed_at: None,
            completed_at: None,
            result: None,
            generation: 0,
            version: 0,
            items: Vec::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == RequestStatus::Deleted
    }

    /// True while a completed request is still waiting for its result.
    pub fn awaiting_result(&self) -> bool {
        self.status == RequestStatus::Completed && self.result.is_none()
    }

    /// Sum of item quantities (the cart badge count).
    pub fn total_quantity(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.quantity)).sum()
    }

    pub fn item(&self, beam_id: BeamId) -> Option<&LineItem> {
        self.items.iter().find(|i| i.beam_id == beam_id)
    }

    /// Next free position; positions of removed items are never reused.
    pub(crate) fn next_position(&self) -> u32 {
        self.items
            .iter()
            .map(|i| i.position + 1)
            .max()
            .unwrap_or(0)
    }
}
