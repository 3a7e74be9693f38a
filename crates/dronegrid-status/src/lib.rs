//! dronegrid-status — the scheduler's status page.
//!
//! A single read-only route renders the latest [`StatusSnapshot`] published
//! by the dispatcher. The only mutating action, `?reparse_config=1`, does
//! not touch scheduler state: it queues a [`ReconfigureRequest`] that the
//! dispatcher applies at the start of its next tick.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Status page (HTML, or JSON with `Accept: application/json`) |
//! | GET | `/?reparse_config=1` | Reload configuration, then show status |

pub mod error;
pub mod pages;
pub mod server;
pub mod snapshot;

use axum::Router;
use axum::routing::get;
use tokio::sync::{mpsc, watch};

pub use error::{StatusError, StatusResult};
pub use server::StatusServer;
pub use snapshot::{ReconfigureRequest, StatusSnapshot};

/// Shared state for the status handler.
#[derive(Clone)]
pub struct StatusState {
    pub snapshot: watch::Receiver<StatusSnapshot>,
    pub reconfigure: mpsc::Sender<ReconfigureRequest>,
}

/// Build the status router.
pub fn status_router(state: StatusState) -> Router {
    Router::new()
        .route("/", get(pages::status_page))
        .with_state(state)
}
