//! Shared protocol definitions for controller ↔ agent communication.
//! Keeping this in a dedicated crate lets both binaries (and any future
//! dashboard bindings) agree on the wire format without pulling in the
//! heavier runtime code of either side.

pub mod records;
pub mod token;
pub mod wire;

pub use records::{AgentRecord, Connectivity, JobKind, JobRecord, JobStatus};
pub use wire::{AgentActivity, AgentMessage, Browser, ControllerMessage, JobEvent, RunMode};
