pub mod exec;


use crate::{
    catalogue::{Job, ParameterSet},
    metrics::Evaluation,
};
use std::{path::Path, time::Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Failed to spawn evaluator: {0}")]
    Spawn(std::io::Error),
    #[error("Failed to communicate with evaluator: {0}")]
    ChildError(#[from] std::io::Error),
    #[error("Evaluator exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("Failed to deserialize evaluator output: {0}")]
    DeserializeOutput(#[from] serde_yaml::Error),
    #[error("Failed to serialize parameters: {0}")]
    SerializeInput(#[from] serde_json::Error),
    #[error("Evaluation deadline exceeded")]
    Timeout,
    #[error("Evaluation raised: {0}")]
    Raised(String),
}

/// Everything the evaluator gets to know about a single evaluation
#[derive(Debug, Clone)]
pub struct EvaluationRequest<'a> {
    pub job: &'a Job,
    pub combo_index: usize,
    pub parameters: &'a ParameterSet,
    pub dataset: &'a Path,
    /// wall clock deadline of the whole job, evaluations past it are cancelled
    pub deadline: Instant,
}

/// The opaque backtest, computes the metrics of one parameter set on the dataset
pub trait Evaluator: Sync {
    fn evaluate(&self, request: &EvaluationRequest<'_>) -> Result<Evaluation, EvaluationError>;
}

impl<F> Evaluator for F
where
    F: Fn(&EvaluationRequest<'_>) -> Result<Evaluation, EvaluationError> + Sync,
{
    fn evaluate(&self, request: &EvaluationRequest<'_>) -> Result<Evaluation, EvaluationError> {
        self(request)
    }
}
