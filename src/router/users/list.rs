//! List every user.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use serde::Deserialize;

use crate::user::{Projection, User};
use crate::{AppState, ServerError};

#[derive(Debug, Default, Deserialize)]
pub struct Params {
    /// Comma separated field names, e.g. `username,email`.
    #[serde(default)]
    fields: String,
}

pub async fn handler(
    State(state): State<AppState>,
    params: Result<Query<Params>, QueryRejection>,
) -> Result<Json<Vec<User>>, ServerError> {
    let Query(params) = params?;
    let projection = Projection::parse(&params.fields)?;

    Ok(Json(state.repo.find_all(&projection).await?))
}
