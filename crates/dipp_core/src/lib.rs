//! Core of a deadline- and energy-aware batch scheduler for an on-satellite
//! image pipeline: effort-level selection per module, a fingerprint-keyed
//! cost cache, persistent priority queues, isolated module execution, and a
//! battery signal. Durable storage/upload, the real telemetry channel, and
//! dynamic module loading are external collaborators, expressed here only as
//! traits (see [`interfaces`]).

pub mod battery;
pub mod config;
pub mod cost_cache;
pub mod error;
pub mod executor;
pub mod hash;
pub mod heuristic;
pub mod interfaces;
pub mod model;
pub mod pqueue;
pub mod scheduler;

pub use error::{DippError, DippResult};
