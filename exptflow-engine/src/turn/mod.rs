//! Per-turn evaluation pipeline.

mod input;
mod pipeline;

pub use input::InputLayout;
pub use pipeline::{
    evaluator_concurrency, PipelineServices, PriorResults, TurnEvalContext, TurnEvalResult,
    TurnPipeline,
};
