//! Public service status.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::config::Configuration;

/// Structured status.
#[derive(Debug, Serialize)]
pub struct Status {
    name: String,
    version: String,
}

/// Public server status (configuration).
pub async fn status(State(config): State<Arc<Configuration>>) -> Json<Status> {
    Json(Status {
        name: config.name.clone(),
        version: config.version.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;

    use crate::user::MemoryUserRepository;
    use crate::*;

    #[tokio::test]
    async fn test_status_handler() {
        let app = app(test_state(Arc::new(MemoryUserRepository::new())));

        let response = make_request(app, Method::GET, "/status.json").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["name"], "userdir");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
