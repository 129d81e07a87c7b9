//! Engine contract, session pool, render pipeline, and request orchestration.

pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod render;
