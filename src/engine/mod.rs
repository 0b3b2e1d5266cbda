// FlowForge engine - graph compiler, agent registry and execution engine

//! # Engine Module
//!
//! The layer between the domain models and the outside world:
//!
//! - `registry`: the [`Agent`] capability trait, the error taxonomy agents
//!   report in, and the process-wide [`AgentRegistry`] populated at startup
//! - `compiler`: turns a [`crate::models::WorkflowDefinition`] into a
//!   [`CompiledGraph`], rejecting design errors at save time
//! - `builtins`: the agent kinds shipped with the engine (aggregator,
//!   router, AI completion, checkpoint)
//! - `executor`: the execution engine proper - frontier scheduling, durable
//!   checkpointing, retries, signals and crash recovery

pub mod builtins;
pub mod compiler;
pub mod executor;
pub mod registry;


pub use builtins::register_builtins;
pub use compiler::{compile, CompiledGraph, ValidationError, ValidationReport};
pub use executor::{EngineConfig, ExecutionEngine, ExecutionSignal, ExecutionView};
pub use registry::{Agent, AgentContext, AgentError, AgentOutcome, AgentRegistry, StateFragment};
