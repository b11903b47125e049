//! Workflow execution engine.
//!
//! This module provides the core execution engine for NoETL:
//!
//! - **Planner**: One-shot plan-row persistence + `workflow_initialized`, triggered by the broker's reaction to `execution_started`
//! - **Broker**: Reactive `EventListener` that drives dispatch on every append
//! - **State**: Reconstructs execution state from events
//! - **Evaluator**: Evaluates conditions and when/then logic (all-match `next:` fan-out)
//! - **Retry**: Evaluates `retry:` policies against failures, first-match, plus pagination
//! - **Iterator**: Expands `loop:` steps, worker-side or one-child-execution-per-item
//! - **Aggregate**: Shared result-aggregation strategies for retry pagination and iteration
//! - **Context**: Shared evaluation context builder

pub mod aggregate;
pub mod context;
pub mod evaluator;
pub mod iterator;
pub mod orchestrator;
pub mod planner;
pub mod retry;
pub mod state;

pub use evaluator::ConditionEvaluator;
pub use iterator::IteratorController;
pub use orchestrator::WorkflowBroker;
pub use planner::Planner;
pub use retry::RetryEvaluator;
pub use state::{ExecutionState, StepState, WorkflowState};
