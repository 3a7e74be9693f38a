//! The status page handler.

use askama::Template;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use crate::StatusState;
use crate::snapshot::{ReconfigureRequest, StatusSnapshot};

fn render<T: Template>(tmpl: T) -> Html<String> {
    Html(tmpl.render().unwrap_or_else(|e| {
        format!("<pre>Template error: {e}</pre>")
    }))
}

#[derive(Template)]
#[template(path = "status.html")]
struct StatusTemplate {
    snapshot: StatusSnapshot,
    notice: Option<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    reparse_config: Option<String>,
}

pub async fn status_page(
    State(state): State<StatusState>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> Response {
    let notice = if query.reparse_config.as_deref() == Some("1") {
        Some(request_reconfigure(&state))
    } else {
        None
    };

    let snapshot = state.snapshot.borrow().clone();
    if wants_json(&headers) {
        return Json(snapshot).into_response();
    }
    render(StatusTemplate { snapshot, notice }).into_response()
}

fn request_reconfigure(state: &StatusState) -> &'static str {
    match state.reconfigure.try_send(ReconfigureRequest) {
        Ok(()) => {
            info!("configuration reparse requested");
            "Configuration reparse requested; it applies on the next tick."
        }
        Err(TrySendError::Full(_)) => "A configuration reparse is already pending.",
        Err(TrySendError::Closed(_)) => {
            warn!("configuration reparse requested while scheduler is stopping");
            "Scheduler is stopping; reparse ignored."
        }
    }
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}
