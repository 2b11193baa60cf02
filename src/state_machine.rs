//! Core conversation state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{Effect, Notification};
pub use event::Event;
pub use state::{
    ApprovalDecision, Checkpoint, ConvContext, ConvState, ExecutionStatus, DEFAULT_MAX_LLM_ATTEMPTS,
};
pub use transition::{resume, transition, TransitionError, TransitionResult};
