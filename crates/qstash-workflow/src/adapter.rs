// Axum adapter
// Decision: The queue only looks at the status code; 2xx acknowledges the delivery and
//           anything else makes the queue retry it

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;

use crate::error::WorkflowError;
use crate::serve::{InvocationResponse, WorkflowHandler, WorkflowRequest};

/// Error body returned to the queue
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl From<WorkflowError> for WorkflowErrorResponse {
    fn from(err: WorkflowError) -> Self {
        let status = match err {
            WorkflowError::Signature(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            error: err.kind().to_string(),
            message: err.to_string(),
            status,
        }
    }
}

impl IntoResponse for WorkflowErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedResponse {
    workflow_run_id: String,
}

impl WorkflowHandler {
    /// Router serving this workflow with POST on `path`
    pub fn into_router(self, path: &str) -> Router {
        Router::new()
            .route(path, post(workflow_endpoint))
            .with_state(self)
    }
}

async fn workflow_endpoint(
    State(handler): State<WorkflowHandler>,
    headers: HeaderMap,
    uri: Uri,
    body: String,
) -> Result<Json<AcceptedResponse>, WorkflowErrorResponse> {
    let url = request_url(&headers, &uri);
    let InvocationResponse {
        workflow_run_id, ..
    } = handler
        .handle(WorkflowRequest { url, headers, body })
        .await?;
    Ok(Json(AcceptedResponse { workflow_run_id }))
}

/// Absolute url of the request as the caller addressed it
fn request_url(headers: &HeaderMap, uri: &Uri) -> String {
    if uri.scheme().is_some() {
        return uri.to_string();
    }

    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    format!("{scheme}://{host}{path}")
}
