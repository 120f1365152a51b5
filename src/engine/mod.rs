//! The boundary to the native evaluation engine.
//!
//! The engine is an opaque, prebuilt WebAssembly module that performs all
//! targeting/bucketing and owns the event queue. The host reaches it only
//! through [`BucketingEngine`]; allocation, pinning, and wire encodings are
//! hidden entirely behind [`WasmBucketing`].

use crate::events::FlushPayload;
use crate::{BucketedConfig, Result, User, Variable, VariableType};

mod layout;
mod wasm;

pub use wasm::WasmBucketing;

/// Host-side interface to the evaluation engine.
///
/// Every operation is a fast, synchronous, in-process call; none performs
/// I/O. Implementations serialize all calls internally (the engine is not
/// reentrant).
pub trait BucketingEngine: Send + Sync {
    /// Replace the engine's project configuration. `config_json` is passed
    /// through opaquely.
    fn store_config(&self, config_json: &str) -> Result<()>;

    /// Set host platform data attached to generated events.
    fn set_platform_data(&self, platform_json: &str) -> Result<()>;

    /// Set client-wide custom data merged into every evaluation.
    fn set_client_custom_data(&self, custom_data_json: &str) -> Result<()>;

    /// Evaluate one variable for a user.
    ///
    /// Returns `None` when the key is unknown or the engine-resolved type
    /// does not match `requested_type` (the mismatch check happens inside
    /// the engine). The engine enqueues its own aggregate usage event for
    /// the evaluation.
    fn evaluate_variable(
        &self,
        user: &User,
        key: &str,
        requested_type: VariableType,
    ) -> Result<Option<Variable>>;

    /// Evaluate everything at once: the user's full bucketed configuration.
    fn generate_bucketed_config(&self, user: &User) -> Result<BucketedConfig>;

    /// Initialize the engine's event queue. Must be called before any other
    /// queue operation.
    fn init_event_queue(&self, client_instance_id: &str, options_json: &str) -> Result<()>;

    /// Enqueue a caller-tracked event.
    fn queue_event(&self, user_json: &str, event_json: &str) -> Result<()>;

    /// Enqueue an aggregate event; the engine coalesces these.
    fn queue_aggregate_event(&self, event_json: &str, variation_map_json: &str) -> Result<()>;

    /// Current number of events buffered inside the engine.
    fn event_queue_size(&self) -> Result<usize>;

    /// Atomically drain the queue into per-user batches. Returns an empty
    /// list when nothing is pending.
    fn flush_event_queue(&self) -> Result<Vec<FlushPayload>>;

    /// Acknowledge a flushed payload by id. Success and non-retryable
    /// failure discard the payload; a retryable failure requeues it.
    ///
    /// An unknown `payload_id` is a programming error and surfaces as a
    /// fatal engine abort.
    fn report_payload_outcome(&self, payload_id: &str, success: bool, retryable: bool)
        -> Result<()>;
}
