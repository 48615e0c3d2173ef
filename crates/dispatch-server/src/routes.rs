//! HTTP routes
//!
//! | Request               | Action                          |
//! |-----------------------|---------------------------------|
//! | `GET /phone=<number>` | submit a call and wait for it   |
//! | `GET /update`         | reload the configuration        |
//! | anything else         | `404 Not Found`                 |

use std::sync::Arc;

use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use callcenter_dispatch_core::cdr::{CallResult, CallStatus};
use callcenter_dispatch_core::Dispatcher;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

const PHONE_PREFIX: &str = "/phone=";
const UPDATE_PREFIX: &str = "/update";

/// Build the router serving `dispatcher`
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(dispatcher)
        .layer(TraceLayer::new_for_http())
}

async fn handle_request(
    State(dispatcher): State<Arc<Dispatcher>>,
    method: Method,
    uri: Uri,
) -> Response {
    let path = uri.path();
    if method != Method::GET {
        return not_found();
    }

    if let Some(number) = path.strip_prefix(PHONE_PREFIX) {
        process_phone_call(&dispatcher, number).await
    } else if path.starts_with(UPDATE_PREFIX) {
        process_update(dispatcher).await
    } else {
        not_found()
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

async fn process_phone_call(dispatcher: &Dispatcher, number: &str) -> Response {
    debug!(number, "📞 Incoming call request");
    let (call_id, future) = match dispatcher.submit(number) {
        Ok(admitted) => admitted,
        Err(e) => {
            error!(number, error = %e, "Call could not be submitted");
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("Call refused: {}\n", e))
                .into_response();
        }
    };

    match future.await {
        Ok(result) => (status_code(result.status), call_body(&result)).into_response(),
        Err(e) => {
            warn!(call_id, error = %e, "Call failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("CallID: {}\n Error: {}\n", call_id, e),
            )
                .into_response()
        }
    }
}

async fn process_update(dispatcher: Arc<Dispatcher>) -> Response {
    let updated = tokio::task::spawn_blocking(move || dispatcher.request_reconfigure())
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "Reconfiguration task failed");
            false
        });

    if updated {
        (StatusCode::OK, "Updated").into_response()
    } else {
        (StatusCode::FORBIDDEN, "Could not update").into_response()
    }
}

/// HTTP status reported for a finished call
pub fn status_code(status: CallStatus) -> StatusCode {
    match status {
        CallStatus::Awaiting | CallStatus::Completed => StatusCode::OK,
        CallStatus::Duplication => StatusCode::CONFLICT,
        CallStatus::Overloaded => StatusCode::TOO_MANY_REQUESTS,
        CallStatus::Rejected => StatusCode::NOT_ACCEPTABLE,
        CallStatus::Timeout => StatusCode::REQUEST_TIMEOUT,
    }
}

/// Response body for a finished call
pub fn call_body(result: &CallResult) -> String {
    format!(
        "CallID: {} call duration: {}s\n Status: {}\n",
        result.call_id,
        result.call_duration.as_secs(),
        result.status
    )
}
