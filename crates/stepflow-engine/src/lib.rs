pub mod binding;
pub mod compiler;
pub mod condition;
pub mod context;
pub mod gate;
pub mod registry;
pub mod retry;
pub mod run_log;
pub mod runner;

pub use binding::{BindingRef, BindingSpec};
pub use compiler::{compile, validate, CompiledEdge, CompiledNode, CompiledWorkflow};
pub use condition::{Branch, BranchSet, ConditionExpr};
pub use context::RunContext;
pub use gate::{GateBroker, GateDecision, GateResolution, PendingGate};
pub use registry::HandlerRegistry;
pub use run_log::RunLogger;
pub use runner::WorkflowRunner;
