//! ABOUTME: Test support crate for maestro
//! ABOUTME: Scripted agent executors and event-capture helpers

pub mod events;
pub mod executors;

pub use events::collect_until_terminal;
pub use executors::{EchoExecutor, ScriptedExecutor, ScriptedReply};
