// src/models/job.rs
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The analysis job carried by launch requests and status updates.
///
/// Only the fields this crate looks at are typed; anything else the
/// producer sent is kept in `extra` so a job survives a decode/encode pass
/// unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "uuid", default)]
    pub invocation_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub submitter: String,

    #[serde(default)]
    pub app_id: String,

    #[serde(default)]
    pub output_dir: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    pub fn new(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            ..Self::default()
        }
    }
}
