//! REST handlers for the AXIS6 API.

pub mod auth;
pub mod billing;
pub mod error;
pub mod mentions;
pub mod messages;
pub mod middleware;
pub mod reactions;
pub mod rooms;
pub mod routes;
pub mod search;
pub mod wellness;

use axis_db::Database;
use tracing::error;

use crate::auth::AppState;
use crate::error::ApiError;

/// Run blocking DB work off the async runtime.
pub(crate) async fn blocking<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("blocking task failed"))
        })?
        .map_err(ApiError::from)
}
