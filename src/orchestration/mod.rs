//! Session orchestration: scheduling, verification, and admission control.

pub mod controller;
pub mod limiter;
pub mod orchestrator;
pub mod pools;
pub mod verify;

pub use controller::{ControllerHandle, ExitReason, LoopConfig, LoopOutcome, TaskController};
pub use limiter::{InvocationLimiter, InvocationPermit, InvocationPriority};
pub use orchestrator::{
    ExecutionState, ExecutionStatus, Orchestrator, OrchestratorConfig, OrchestratorEvent,
    TickSummary,
};
pub use pools::PoolManager;
pub use verify::{
    VerificationCheck, VerificationReport, VerificationResult, VerificationRunner, Verifier,
};
