//! Thread execution engine for Kernl.
//!
//! A [`Thread`] drives one agent conversation through repeated ticks: model
//! call, guardrails, concurrent tool dispatch, handoff checks, and an
//! append-only event log kept in a [`kernl_threadstore::ThreadStore`].
//! [`Kernl`] owns the agent and model registries, tracks in-flight threads,
//! and re-emits every agent's lifecycle hooks.

pub mod agent;
pub mod config;
pub mod context;
pub mod errors;
pub mod guardrails;
pub mod handoff;
pub mod hooks;
pub mod kernl;
pub mod registry;
pub mod schema;
pub mod thread;
pub mod tools;

pub use agent::*;
pub use config::*;
pub use context::*;
pub use errors::*;
pub use guardrails::*;
pub use handoff::*;
pub use hooks::*;
pub use kernl::*;
pub use registry::*;
pub use thread::*;
pub use tools::*;
