//! Get a single user.

use axum::Json;
use axum::extract::{Path, State};

use crate::user::{Projection, User};
use crate::{AppState, ServerError};

pub async fn handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<User>, ServerError> {
    let user = state.repo.find_by_id(&user_id).await.inspect_err(|err| {
        tracing::debug!(%user_id, error = %err, "user lookup failed");
    })?;

    Ok(Json(Projection::default().apply(user)))
}
