use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::models::Job;
use crate::rabbitmq::Result;

/// A message kind that travels over the broker as a self-describing JSON body.
///
/// The transport never looks inside the payload; the consumer knows which
/// envelope to expect from the queue it is reading.
pub trait Envelope: Serialize + DeserializeOwned {
    fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// What a job request asks the runner to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Command {
    Launch = 0,
    Stop = 1,
}

/// Exit status reported by job steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0,
    DockerPullFailed = 1,
    DockerCreateFailed = 2,
    InputFailed = 3,
    StepFailed = 4,
    OutputFailed = 5,
    Killed = 6,
    TimeLimit = 7,
    BadDuration = 8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Submitted,
    Running,
    ImpendingCancellation,
    Canceled,
    #[serde(rename = "Completed")]
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(rename = "Job")]
    pub job: Option<Job>,
    #[serde(rename = "Command")]
    pub command: Command,
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Version")]
    pub version: i32,
}

impl JobRequest {
    pub fn launch(job: Job) -> Self {
        Self {
            job: Some(job),
            command: Command::Launch,
            message: String::new(),
            version: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(rename = "Reason", default)]
    pub reason: String,
    #[serde(rename = "Username", default)]
    pub username: String,
    #[serde(rename = "Version")]
    pub version: i32,
    #[serde(rename = "InvocationID", default)]
    pub invocation_id: String,
}

impl StopRequest {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    #[serde(rename = "Job")]
    pub job: Option<Job>,
    #[serde(rename = "Version")]
    pub version: i32,
    #[serde(rename = "State")]
    pub state: JobState,
    #[serde(rename = "Message", default)]
    pub message: String,
    /// Milliseconds since the epoch, as a string.
    #[serde(rename = "SentOn", default)]
    pub sent_on: String,
    /// Host name of the sender.
    #[serde(rename = "Sender", default)]
    pub sender: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeLimitRequest {
    #[serde(rename = "InvocationID")]
    pub invocation_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeLimitResponse {
    #[serde(rename = "InvocationID")]
    pub invocation_id: String,
    #[serde(rename = "MillisecondsRemaining")]
    pub milliseconds_remaining: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeLimitDelta {
    #[serde(rename = "InvocationID")]
    pub invocation_id: String,
    /// Go-style duration string, e.g. `"10s"` or `"-1h30m"`.
    #[serde(rename = "Delta")]
    pub delta: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailRequest {
    #[serde(rename = "template")]
    pub template_name: String,
    #[serde(rename = "values", default)]
    pub template_values: HashMap<String, Value>,
    pub subject: String,
    #[serde(rename = "to")]
    pub to_address: String,
    #[serde(rename = "cc", default, skip_serializing_if = "String::is_empty")]
    pub courtesy_copy_address: String,
    #[serde(rename = "from-addr", default, skip_serializing_if = "String::is_empty")]
    pub from_address: String,
    #[serde(rename = "from-name", default, skip_serializing_if = "String::is_empty")]
    pub from_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub deleted: bool,
    pub email: bool,
    pub email_template: String,
    pub message: HashMap<String, Value>,
    pub payload: Value,
    pub seen: bool,
    pub subject: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub user: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WrappedNotificationMessage {
    pub total: i64,
    pub message: NotificationMessage,
}

impl Envelope for JobRequest {}
impl Envelope for StopRequest {}
impl Envelope for UpdateMessage {}
impl Envelope for TimeLimitRequest {}
impl Envelope for TimeLimitResponse {}
impl Envelope for TimeLimitDelta {}
impl Envelope for EmailRequest {}
impl Envelope for NotificationMessage {}
impl Envelope for WrappedNotificationMessage {}
