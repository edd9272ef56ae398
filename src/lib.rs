//! Transform Engine - sandboxed, deadline-bounded execution of developer tools
//!
//! Runs either a trusted catalog transform or a dynamically-authored Rhai
//! script against user input, and normalizes whatever comes back into one
//! closed [`ExecutionResult`] taxonomy.
//!
//! ## Execution paths
//!
//! - **In-process** - trusted, cheap catalog tools run on a blocking thread,
//!   raced against the deadline
//! - **Isolated** - scripts and CPU-heavy tools (hashing, diffing, image
//!   processing) run in a fresh worker process that is killed on timeout or
//!   cancellation
//!
//! Scripts see only an explicit [`CapabilitySet`] plus `input` and `opts`.
//! That keeps accidents and runaway loops contained; it is not a boundary
//! against hostile code.
//!
//! ## Example
//!
//! ```ignore
//! use transform_engine::{Dispatcher, EngineConfig, ExecutionResult, TransformRequest};
//!
//! let dispatcher = Dispatcher::new(EngineConfig::from_env()?);
//!
//! let result = dispatcher
//!     .execute(TransformRequest::code("input.to_upper()").with_input("abc"), None)
//!     .await?;
//!
//! assert_eq!(result, ExecutionResult::text("ABC"));
//! ```
//!
//! ## Worker mode
//!
//! The isolated path re-launches the configured worker program (by default the
//! current executable) with the `worker` argument. A host binary must route
//! that argument to [`serve_worker`] on stdin/stdout.

pub mod capabilities;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod isolation;
pub mod normalize;
pub mod sandbox;
pub mod types;
pub mod validation;

pub use capabilities::{Capability, CapabilitySet};
pub use catalog::{CATALOG, ToolCategory, ToolEntry, ToolId, Transform};
pub use config::{EngineConfig, RoutingPolicy, WorkerConfig};
pub use dispatcher::{Dispatcher, ExecutionHandle, ExecutionSlot, Route};
pub use engine::{Harness, dynamic_to_json};
pub use isolation::{IsolatedJob, IsolationLayer, serve_worker};
pub use normalize::normalize;
pub use sandbox::{
    ExecutionLimits,
    // Default limit constants
    DEFAULT_DEADLINE_MS, DEFAULT_MAX_ARRAY_SIZE, DEFAULT_MAX_MAP_SIZE, DEFAULT_MAX_OPERATIONS,
    DEFAULT_MAX_STRING_SIZE,
    // Profile constants
    EXTENDED_DEADLINE_MS, EXTENDED_MAX_OPERATIONS, QUICK_DEADLINE_MS, QUICK_MAX_OPERATIONS,
};
pub use types::{
    Cancelled, EngineError, ExecutionResult, Failure, FailureKind, InputPayload, OptionValue,
    Options, StructuredResult, Target, TransformRequest,
};
pub use validation::{TestOutcome, TestSummary};
