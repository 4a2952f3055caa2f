//! Beam catalog types.
//!
//! The catalog is an external, read-only collaborator. Its entries may be
//! stale or incomplete; a missing attribute degrades a single item's
//! deflection to "unavailable" instead of failing the request.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier of a catalog beam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BeamId(pub i64);

impl std::fmt::Display for BeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalog attributes of a beam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamSpec {
    pub id: BeamId,
    pub name: String,
    pub material: Option<String>,
    /// Young's modulus in GPa
    pub elasticity_gpa: Option<f64>,
    /// Second moment of area in cm⁴
    pub inertia_cm4: Option<f64>,
    /// Allowed deflection as span / ratio; missing or zero means no limit
    pub allowed_deflection_ratio: Option<f64>,
}

/// Read-only beam lookup.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Look up a beam; `Ok(None)` when the catalog has no such entry.
    async fn beam(&self, id: BeamId) -> Result<Option<BeamSpec>>;

    /// Resolve every distinct beam in `ids`, skipping unknown entries.
    async fn resolve(&self, ids: &[BeamId]) -> Result<HashMap<BeamId, BeamSpec>> {
        let mut specs = HashMap::with_capacity(ids.len());
        for id in ids {
            if specs.contains_key(id) {
                continue;
            }
            if let Some(spec) = self.beam(*id).await? {
                specs.insert(*id, spec);
            }
        }
        Ok(specs)
    }
}

/// Catalog held in process memory.
///
/// Used by tests and by the server binary, which seeds it from a JSON file.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    beams: RwLock<HashMap<BeamId, BeamSpec>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_beams(beams: impl IntoIterator<Item = BeamSpec>) -> Self {
        let catalog = Self::new();
        for beam in beams {
            catalog.insert(beam);
        }
        catalog
    }

    /// Load a JSON array of [`BeamSpec`] entries.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file {}", path.display()))?;
        let beams: Vec<BeamSpec> = serde_json::from_str(&raw)?;
        tracing::info!(path = %path.display(), beams = beams.len(), "Loaded beam catalog");
        Ok(Self::with_beams(beams))
    }

    pub fn insert(&self, beam: BeamSpec) {
        self.beams.write().insert(beam.id, beam);
    }

    pub fn remove(&self, id: BeamId) -> Option<BeamSpec> {
        self.beams.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.beams.read().len()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn beam(&self, id: BeamId) -> Result<Option<BeamSpec>> {
        Ok(self.beams.read().get(&id).cloned())
    }
}
