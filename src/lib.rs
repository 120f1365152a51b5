//! Flagpole server-side SDK core: local flag evaluation against a prebuilt
//! WebAssembly bucketing engine.
//!
//! # Overview
//!
//! The crate is organized as a set of building blocks around an opaque
//! evaluation engine. The engine performs all targeting/bucketing and owns
//! the event queue; this crate keeps it configured, calls into it, and
//! drains what it buffers.
//!
//! [`engine::BucketingEngine`] is the narrow interface to the engine.
//! [`engine::WasmBucketing`] is its production implementation: it embeds
//! the prebuilt WebAssembly module, marshals values across the memory
//! boundary in the engine's native layouts, and serializes every call
//! behind one mutex.
//!
//! [`configuration::EnvironmentConfigManager`] keeps the engine's
//! configuration fresh: a background poll loop with ETag/Last-Modified
//! conditioning, plus an optional realtime stream that triggers out-of-band
//! refetches and reconnects with capped exponential backoff.
//!
//! [`events::EventQueueManager`] drains the engine's event queue on an
//! interval, publishes batches to the events API, and reports each
//! payload's outcome back to the engine, with admission control so the
//! queue never grows unbounded.
//!
//! [`Client`] ties the blocks together behind a small validating façade.
//! Evaluation calls never fail for engine or network reasons; they fall
//! back to the caller-supplied default with a reason attached.
//!
//! # Logging
//!
//! The crate logs through the [`log`](https://docs.rs/log) crate under the
//! `flagpole` target. Install any `log`-compatible logger for visibility
//! into background synchronization.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod backoff;
pub mod configuration;
pub mod engine;
pub mod events;

mod bucketed_config;
mod client;
mod error;
mod options;
mod platform_data;
mod user;
mod variable;

pub use bucketed_config::{BucketedConfig, Environment, Feature, FeatureVariation, Project};
pub use client::Client;
pub use configuration::ConfigMetadata;
pub use error::{Error, Result};
pub use events::{Event, EventType};
pub use options::{InitializedCallback, Options};
pub use platform_data::PlatformData;
pub use user::User;
pub use variable::{EvalReason, Variable, VariableType, VariableValue};
