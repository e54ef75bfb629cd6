use core::fmt;
use std::fmt::Display;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod racdatabase;

/// Role of an ASM disk group.
///
/// `Others` groups are plain block mounts: they get volumes like every other
/// group but never show up in ASM status or the startup envfile.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum DiskGroupType {
    #[serde(rename = "CRS")]
    Crs,
    #[default]
    #[serde(rename = "DATA")]
    Data,
    #[serde(rename = "RECOVERY")]
    Recovery,
    #[serde(rename = "REDO")]
    Redo,
    #[serde(rename = "OTHERS")]
    Others,
}

impl Display for DiskGroupType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DiskGroupType::Crs => write!(f, "CRS"),
            DiskGroupType::Data => write!(f, "DATA"),
            DiskGroupType::Recovery => write!(f, "RECOVERY"),
            DiskGroupType::Redo => write!(f, "REDO"),
            DiskGroupType::Others => write!(f, "OTHERS"),
        }
    }
}

/// Lifecycle of a `RacDatabase` as persisted in `status.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum LifecycleState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROVISIONING")]
    Provisioning,
    #[serde(rename = "UPDATING")]
    Updating,
    #[serde(rename = "PODAVAILABLE")]
    PodAvailable,
    #[serde(rename = "RAC_INST_ADDITION")]
    AddingInstance,
    #[serde(rename = "DELETING")]
    Deleting,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "MANUAL")]
    Manual,
    #[serde(rename = "AVAILABLE")]
    Available,
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LifecycleState::Pending => write!(f, "PENDING"),
            LifecycleState::Provisioning => write!(f, "PROVISIONING"),
            LifecycleState::Updating => write!(f, "UPDATING"),
            LifecycleState::PodAvailable => write!(f, "PODAVAILABLE"),
            LifecycleState::AddingInstance => write!(f, "RAC_INST_ADDITION"),
            LifecycleState::Deleting => write!(f, "DELETING"),
            LifecycleState::Failed => write!(f, "FAILED"),
            LifecycleState::Manual => write!(f, "MANUAL"),
            LifecycleState::Available => write!(f, "AVAILABLE"),
        }
    }
}

pub fn conditions_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let schema = serde_json::json!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "lastTransitionTime",
                "message",
                "reason",
                "status",
                "type"
            ],
        },
    });
    serde_json::from_value(schema).unwrap_or(schemars::schema::Schema::Bool(true))
}
