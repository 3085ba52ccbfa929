use axum::{extract::State, Json};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::NlQueryRequest;
use crate::pipeline::{FinalResult, RunRequest};

/// Execute a natural-language query through the full pipeline.
///
/// Ambiguous and failed runs are successful HTTP responses carrying the
/// serialized result; only request-level problems map to error statuses.
pub async fn run_nl_query(
    State(state): State<AppState>,
    Json(request): Json<NlQueryRequest>,
) -> Result<Json<FinalResult>, AppError> {
    if request.question.trim().is_empty() {
        return Err(AppError::Validation(
            "question must not be empty".to_string(),
        ));
    }

    let run = RunRequest {
        question: request.question,
        dataset_id: request.dataset_id,
        clarify_answers: request.clarify_answers,
    };
    let result = state.orchestrator.run(&run).await?;
    Ok(Json(result))
}
