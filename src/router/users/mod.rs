//! Users-related HTTP API.
//!
//! Every route is read-only and requires a requester id with its current
//! token as query parameters.
mod get;
mod list;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, Request, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Router, middleware};
use serde::Deserialize;

use crate::{AppState, ServerError};

/// Requester credentials.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Credentials {
    token: String,
    requester_id: String,
}

/// Custom middleware for authorization.
async fn auth(
    State(state): State<AppState>,
    credentials: Result<Query<Credentials>, QueryRejection>,
    req: Request,
    next: middleware::Next,
) -> Result<Response, ServerError> {
    let Ok(Query(credentials)) = credentials else {
        return Err(ServerError::Unauthorized);
    };

    if !state
        .authorizer
        .verify(&credentials.requester_id, &credentials.token)
        .await
    {
        return Err(ServerError::Unauthorized);
    }

    Ok(next.run(req).await)
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // `GET /users` goes to `list`.
        .route("/", get(list::handler))
        // `GET /users/:ID` goes to `get`.
        .route("/{user_id}", get(get::handler))
        .route_layer(middleware::from_fn_with_state(state, auth))
}
