//! Fleetrun engine library
//!
//! Orchestration core for running agent subprocesses:
//! - Bounded worker pool
//! - Task graph with cycle detection and priority ordering
//! - Dependency executor driving the graph onto the pool
//! - Session store and manager for supervised subprocesses

pub mod executor;
pub mod graph;
pub mod pool;
pub mod session;
