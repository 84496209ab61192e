//! Lithos -- Local Multi-Agent Chat Backend
//!
//! A desktop assistant backend: a roster of locally-served model agents
//! with sandboxed filesystem tools, shared long-term memory, and a
//! line-delimited JSON IPC surface over stdio.

pub mod types;
pub mod error;
pub mod config;
pub mod sandbox;
pub mod tools;
pub mod extract;
pub mod history;
pub mod model;
pub mod memory;
pub mod agent;
pub mod transcript;
pub mod server;
