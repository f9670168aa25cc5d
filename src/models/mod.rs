// src/models/mod.rs
mod job;

pub use job::Job;
