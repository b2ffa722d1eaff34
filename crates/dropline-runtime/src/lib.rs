//! Dropline Runtime Engine
//!
//! This crate drives the `dropline-core` protocol pieces against a concrete
//! transport:
//! - `SessionDriverTask`: the single task that owns the endpoint and every
//!   state transition
//! - connection, recovery and delivery managers
//! - `RuntimeBuilder` / `RuntimeHandle`: the API a UI shell uses

pub mod builder;
pub mod managers;
mod runtime;
pub mod tasks;

pub use builder::{create_test_runtime, RuntimeBuilder};
pub use managers::*;
pub use runtime::*;
pub use tasks::{RuntimeCommand, SessionDriverTask};

// Re-export core types for convenience
pub use dropline_core::{
    share_link, ConnectionState, ConnectionStatus, Direction, DroplineConfig, DroplineError,
    DroplineEvent, DroplineEventReceiver, DroplineResult, Envelope, ErrorReason, RecordId,
    SessionIdentity, TimelineRecord, Transport,
};
