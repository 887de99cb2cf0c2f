//! Turn-executor backends for the crew daemon.
//!
//! The contract ([`crew_core::agent::TurnExecutor`]) lives in the core
//! crate; this crate provides the CLI subprocess backend and a scripted
//! mock for tests.

pub mod claude;
pub mod event;
pub mod mock;

pub use claude::ClaudeExecutor;
pub use mock::{ScriptedExecutor, ScriptedTurn};
