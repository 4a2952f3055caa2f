//! Wire types for the outbound trigger.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::beam::{BeamId, BeamSpec};
use crate::domain::request::{Request, RequestId};

/// Body POSTed to the external computation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub request_id: RequestId,
    /// Completion generation; echo it in the callback to have stale results refused
    pub generation: u64,
    pub items: Vec<TriggerItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerItem {
    pub beam_id: BeamId,
    pub quantity: u32,
    pub length_m: Option<f64>,
    pub udl_kn_m: Option<f64>,
    pub beam: BeamFields,
}

/// The catalog attributes the engine needs, `null` when unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeamFields {
    pub elasticity_gpa: Option<f64>,
    pub inertia_cm4: Option<f64>,
    pub allowed_deflection_ratio: Option<f64>,
}

impl From<&BeamSpec> for BeamFields {
    fn from(spec: &BeamSpec) -> Self {
        BeamFields {
            elasticity_gpa: spec.elasticity_gpa,
            inertia_cm4: spec.inertia_cm4,
            allowed_deflection_ratio: spec.allowed_deflection_ratio,
        }
    }
}

/// Where and how the external service should deliver its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackDescriptor {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl CallbackDescriptor {
    /// Build the descriptor from a URL template, substituting `{id}` and `:id`.
    pub fn from_template(template: &str, id: RequestId, token: Option<&str>) -> Self {
        let id = id.to_string();
        CallbackDescriptor {
            url: template.replace("{id}", &id).replace(":id", &id),
            token: token.map(str::to_string),
        }
    }
}

impl TriggerPayload {
    pub fn build(
        request: &Request,
        specs: &HashMap<BeamId, BeamSpec>,
        callback: Option<CallbackDescriptor>,
    ) -> Self {
        TriggerPayload {
            request_id: request.id,
            generation: request.generation,
            items: request
                .items
                .iter()
                .map(|item| TriggerItem {
                    beam_id: item.beam_id,
                    quantity: item.quantity,
                    length_m: item.length_m,
                    udl_kn_m: item.udl_kn_m,
                    beam: specs
                        .get(&item.beam_id)
                        .map(BeamFields::from)
                        .unwrap_or_default(),
                })
                .collect(),
            callback,
        }
    }
}
