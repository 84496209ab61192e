//! Agent Subsystem
//!
//! The turn loop and the prompt builder it feeds.

pub mod prompt;
pub mod turn_loop;

pub use turn_loop::AgentLoopController;
