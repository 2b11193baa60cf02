//! turnstile - interruptible tool-calling conversation orchestrator
//!
//! A conversation alternates model turns and tool dispatch. Gated tools
//! suspend the turn at a persisted checkpoint until a human approves or
//! denies the call; the session's events stream to the client with every
//! tool input paired to exactly one output.

pub mod api;
pub mod config;
pub mod db;
pub mod history;
pub mod llm;
pub mod runtime;
pub mod state_machine;
pub mod tools;
pub mod translator;
