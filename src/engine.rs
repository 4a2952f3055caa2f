//! Deflection engine.
//!
//! Mid-span deflection of a simply supported beam under a uniformly
//! distributed load:
//!
//! ```text
//! δ = 5 · w · L⁴ / (384 · E · I)
//! ```
//!
//! with `w` in N/m, `L` in m, `E` in Pa and `I` in m⁴, reported in
//! millimetres. The engine is pure and synchronous. The same functions back
//! both the on-demand preview and the authoritative asynchronous result, so
//! the two can never disagree.
//!
//! An item whose inputs are out of range, or whose beam lacks a catalog
//! attribute, has an *undefined* deflection (`None`). Undefined items are
//! left out of the aggregate; they never count as zero.

use std::collections::HashMap;

use serde::Serialize;

use crate::domain::beam::{BeamId, BeamSpec};
use crate::domain::request::LineItem;

const GPA_TO_PA: f64 = 1e9;
const CM4_TO_M4: f64 = 1e-8;
const KN_TO_N: f64 = 1000.0;
const M_TO_MM: f64 = 1000.0;

/// Deflection in millimetres, or `None` when undefined.
pub fn deflection_mm(
    length_m: f64,
    udl_kn_m: f64,
    elasticity_gpa: f64,
    inertia_cm4: f64,
) -> Option<f64> {
    if !(length_m.is_finite() && length_m > 0.0) || !(udl_kn_m.is_finite() && udl_kn_m >= 0.0) {
        return None;
    }

    let e_pa = elasticity_gpa * GPA_TO_PA;
    let i_m4 = inertia_cm4 * CM4_TO_M4;
    let w_n_m = udl_kn_m * KN_TO_N;

    let stiffness = 384.0 * e_pa * i_m4;
    if !(stiffness.is_finite() && stiffness > 0.0) {
        return None;
    }

    let deflection_m = 5.0 * w_n_m * length_m.powi(4) / stiffness;
    let mm = deflection_m * M_TO_MM;
    mm.is_finite().then_some(mm)
}

/// Deflection of one line item against its catalog entry.
pub fn item_deflection_mm(item: &LineItem, spec: Option<&BeamSpec>) -> Option<f64> {
    let spec = spec?;
    deflection_mm(
        item.length_m?,
        item.udl_kn_m?,
        spec.elasticity_gpa?,
        spec.inertia_cm4?,
    )
}

/// Largest admissible deflection for a span, `None` meaning no limit.
pub fn allowed_deflection_mm(length_m: f64, ratio: Option<f64>) -> Option<f64> {
    match ratio {
        Some(r) if r.is_finite() && r > 0.0 => Some(length_m * M_TO_MM / r),
        _ => None,
    }
}

/// Per-request aggregate over all items with a defined deflection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Aggregate {
    /// Σ item deflection × quantity
    pub total_deflection_mm: f64,
    /// Every computed item stays within its allowed deflection
    pub within_norm: bool,
    /// Number of items that contributed
    pub items_computed: usize,
}

/// Aggregate a request's items.
///
/// Returns `None` if no item has a defined deflection.
pub fn aggregate(items: &[LineItem], specs: &HashMap<BeamId, BeamSpec>) -> Option<Aggregate> {
    let mut total = 0.0;
    let mut within_norm = true;
    let mut computed = 0usize;

    for item in items {
        let spec = specs.get(&item.beam_id);
        let Some(deflection) = item_deflection_mm(item, spec) else {
            tracing::trace!(beam_id = %item.beam_id, "Deflection undefined, item excluded");
            continue;
        };

        total += deflection * f64::from(item.quantity);
        computed += 1;

        // length_m is present whenever the deflection is defined
        let length_m = item.length_m.unwrap_or_default();
        if let Some(limit) =
            allowed_deflection_mm(length_m, spec.and_then(|s| s.allowed_deflection_ratio))
        {
            within_norm &= deflection <= limit;
        }
    }

    (computed > 0).then_some(Aggregate {
        total_deflection_mm: total,
        within_norm,
        items_computed: computed,
    })
}

/// Round to the 6 decimals shown in request views.
pub fn round_display(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}
