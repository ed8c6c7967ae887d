//! Workflow authoring model, condition language, and the compiler.

pub mod compile;
pub mod condition;
pub mod contracts;
pub mod model;
pub mod prompt;

pub use compile::{
    CompileError, CompiledLeafStep, CompiledLoop, CompiledStep, CompiledWorkflow,
    CompiledWorkflowBody, MAX_ITERATIONS_CEILING, compile,
};
pub use condition::{
    Comparison, Condition, ConditionGuidance, Context, coerce_bool, coerce_number, evaluate,
    evaluate_with_guidance, lenient_equals,
};
pub use contracts::{
    Artifact, Contract, ContractRegistry, LOOP_CONTROL_CONTRACT, LoopDecision,
};
pub use model::{
    ConditionSource, CountSource, LeafStep, LoopBody, LoopConfig, LoopKind, LoopStep,
    StepDefinition, WorkflowDefinition,
};
pub use prompt::{PromptBlocks, PromptPart, SnippetRegistry, expand_functions, render_blocks};
