/// Folding of converging branch events into a single node input

use crate::workflow::types::{InputMergeStrategy, WorkflowEvent};
use serde_json::Value;

/// Label recorded in `merge_strategy` metadata
pub fn strategy_label(strategy: &InputMergeStrategy) -> String {
    match strategy {
        InputMergeStrategy::WaitForAll => "wait_for_all".to_string(),
        InputMergeStrategy::FirstWins => "first_wins".to_string(),
        InputMergeStrategy::TimeoutBased(seconds) => format!("timeout_based({seconds})"),
    }
}

/// Merge `inputs`, given in incoming-edge order
///
/// A single input passes through untouched. Otherwise `data` becomes the array of
/// every input's data, headers and condition results are unioned with later inputs
/// winning, and metadata is the first input's plus merge bookkeeping and
/// `input_{i}_{key}` copies of every input's metadata.
pub fn merge_inputs(strategy: &InputMergeStrategy, mut inputs: Vec<WorkflowEvent>) -> WorkflowEvent {
    if inputs.len() <= 1 {
        return inputs.pop().unwrap_or_default();
    }

    let mut merged = WorkflowEvent {
        data: Value::Array(inputs.iter().map(|event| event.data.clone()).collect()),
        metadata: inputs[0].metadata.clone(),
        ..Default::default()
    };

    for (i, input) in inputs.iter().enumerate() {
        merged
            .headers
            .extend(input.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
            .condition_results
            .extend(input.condition_results.iter().map(|(k, v)| (k.clone(), *v)));
        for (key, value) in &input.metadata {
            merged.metadata.insert(format!("input_{i}_{key}"), value.clone());
        }
    }

    merged
        .with_metadata("merge_strategy", strategy_label(strategy))
        .with_metadata("input_count", inputs.len())
        .with_metadata("merge_timestamp", chrono::Utc::now().to_rfc3339())
}
