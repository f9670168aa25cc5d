// src/keys.rs
// Routing keys and per-job queue names.

pub const REINDEX_ALL_KEY: &str = "index.all";
pub const REINDEX_TEMPLATES_KEY: &str = "index.templates";
pub const LAUNCHES_KEY: &str = "jobs.launches";
pub const UPDATES_KEY: &str = "jobs.updates";
pub const STOPS_KEY: &str = "jobs.stops";
pub const COMMANDS_KEY: &str = "jobs.commands";
pub const TIME_LIMIT_REQUESTS_KEY: &str = "jobs.timelimits.requests";
pub const TIME_LIMIT_RESPONSE_KEY: &str = "jobs.timelimits.responses";
pub const TIME_LIMIT_DELTA_KEY: &str = "jobs.timelimits.deltas";
pub const EMAIL_REQUEST_PUBLISHING_KEY: &str = "email.requests";
pub const NOTIFICATION_KEY_PREFIX: &str = "notification";

const QUEUE_PREFIX: &str = "road-runner";

fn scoped_key(base: &str, invocation_id: &str) -> String {
    format!("{}.{}", base, invocation_id)
}

fn job_queue(invocation_id: &str, suffix: &str) -> String {
    format!("{}-{}-{}", QUEUE_PREFIX, invocation_id, suffix)
}

pub fn time_limit_request_key(invocation_id: &str) -> String {
    scoped_key(TIME_LIMIT_REQUESTS_KEY, invocation_id)
}

pub fn time_limit_request_queue_name(invocation_id: &str) -> String {
    job_queue(invocation_id, "tl-request")
}

pub fn time_limit_responses_key(invocation_id: &str) -> String {
    scoped_key(TIME_LIMIT_RESPONSE_KEY, invocation_id)
}

pub fn time_limit_responses_queue_name(invocation_id: &str) -> String {
    job_queue(invocation_id, "tl-response")
}

pub fn time_limit_delta_request_key(invocation_id: &str) -> String {
    scoped_key(TIME_LIMIT_DELTA_KEY, invocation_id)
}

pub fn time_limit_delta_queue_name(invocation_id: &str) -> String {
    job_queue(invocation_id, "tl-delta")
}

pub fn stop_request_key(invocation_id: &str) -> String {
    scoped_key(STOPS_KEY, invocation_id)
}

pub fn stop_queue_name(invocation_id: &str) -> String {
    job_queue(invocation_id, "stops-request")
}

/// Per-user notification key, e.g. `notification.ipcdev`.
pub fn notification_key(user: &str) -> String {
    scoped_key(NOTIFICATION_KEY_PREFIX, user)
}
