use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::driver::Modification;
use crate::model::{ExposureSpec, LaunchRequest, Principal, ResourceSpec};
use crate::{Result, Tycho, TychoError};

/// Shared state behind the HTTP handlers.
pub struct ApiState {
    pub tycho: Tycho,
}

/// Body of `POST /system/start`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartBody {
    pub name: String,
    pub principal: Principal,
    #[serde(default)]
    pub system: Option<serde_json::Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub services: BTreeMap<String, ExposureSpec>,
    #[serde(default)]
    pub resource_request: Option<ResourceSpec>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub conn_string: Option<String>,
}

/// Body of `POST /system/status`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusBody {
    #[serde(default)]
    pub name: Option<String>,
}

/// Body of `POST /system/delete`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteBody {
    /// The GUID the system's artifacts are labeled with
    pub name: String,
}

/// Uniform response envelope.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Envelope {
    fn success(result: Option<serde_json::Value>) -> Self {
        Self {
            status: "success".to_string(),
            message: None,
            result,
        }
    }

    fn failure(message: String) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message),
            result: None,
        }
    }
}

/// Build the API router over a connected engine.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/system/start", post(start_system))
        .route("/system/status", post(system_status))
        .route("/system/delete", post(delete_system))
        .route("/system/modify", post(modify_system))
        .with_state(state)
}

/// Serve the API until the process is stopped.
pub async fn serve(state: Arc<ApiState>, port: u16) -> Result<()> {
    let address = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("tycho api listening on {address}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn start_system(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<StartBody>,
) -> (StatusCode, Json<Envelope>) {
    let request = match launch_request(body) {
        Ok(request) => request,
        Err(e) => return reject(e),
    };
    match state.tycho.start(request).await {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(value) => (StatusCode::OK, Json(Envelope::success(Some(value)))),
            Err(e) => reject(TychoError::Json(e)),
        },
        Err(e) => reject(e),
    }
}

async fn system_status(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<StatusBody>,
) -> (StatusCode, Json<Envelope>) {
    match state.tycho.status(body.name.as_deref()).await {
        Ok(statuses) => match serde_json::to_value(&statuses) {
            Ok(value) => (StatusCode::OK, Json(Envelope::success(Some(value)))),
            Err(e) => reject(TychoError::Json(e)),
        },
        Err(e) => reject(e),
    }
}

async fn delete_system(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<DeleteBody>,
) -> (StatusCode, Json<Envelope>) {
    match state.tycho.delete(&body.name).await {
        Ok(()) => (StatusCode::OK, Json(Envelope::success(None))),
        Err(e) => reject(e),
    }
}

async fn modify_system(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Modification>,
) -> (StatusCode, Json<Envelope>) {
    match state.tycho.modify(body).await {
        Ok(()) => (StatusCode::OK, Json(Envelope::success(None))),
        Err(e) => reject(e),
    }
}

/// Convert the wire shape into an engine launch request. Service keys in
/// the body are sorted, which keeps generated manifests reproducible; the
/// parser reorders exposures by compose declaration anyway.
fn launch_request(body: StartBody) -> Result<LaunchRequest> {
    let system = match body.system {
        Some(value) => Some(serde_yaml::to_value(value)?),
        None => None,
    };
    Ok(LaunchRequest {
        name: body.name,
        principal: body.principal,
        system,
        env: body.env.into_iter().collect(),
        services: body.services.into_iter().collect(),
        resource_request: body.resource_request,
        app_id: body.app_id,
        product: body.product,
        conn_string: body.conn_string,
    })
}

fn reject(error: TychoError) -> (StatusCode, Json<Envelope>) {
    let code = status_code(&error);
    if code.is_server_error() {
        error!("request failed: {error}");
    }
    (code, Json(Envelope::failure(error.to_string())))
}

/// Map the error taxonomy onto HTTP statuses.
fn status_code(error: &TychoError) -> StatusCode {
    match error {
        TychoError::InvalidCompose(_)
        | TychoError::InvalidVolumeSpec(_)
        | TychoError::UnknownService(_) => StatusCode::BAD_REQUEST,
        TychoError::AppNotAuthorized(_) => StatusCode::FORBIDDEN,
        TychoError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_error_kind() {
        assert_eq!(
            status_code(&TychoError::InvalidCompose("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_code(&TychoError::InvalidVolumeSpec("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_code(&TychoError::UnknownService("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_code(&TychoError::AppNotAuthorized("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_code(&TychoError::Timeout("x".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_code(&TychoError::Delete("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_start_body_rejects_unknown_fields() {
        let result: std::result::Result<StartBody, _> = serde_json::from_str(
            r#"{ "name": "x", "principal": { "username": "renci" }, "bogus": 1 }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_launch_request_conversion() {
        let body: StartBody = serde_json::from_str(
            r#"{
                "name": "test",
                "principal": { "username": "renci" },
                "system": { "services": { "web": { "image": "nginx:1.20" } } },
                "env": { "A": "1" },
                "services": { "web": { "port": 80, "clients": ["127.0.0.1"] } }
            }"#,
        )
        .unwrap();
        let request = launch_request(body).unwrap();
        assert_eq!(request.name, "test");
        assert_eq!(request.env, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(request.services.len(), 1);
        assert_eq!(request.services[0].1.port, 80);
        let compose = request.system.unwrap();
        assert!(compose.get("services").is_some());
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = Envelope::success(Some(serde_json::json!({"sid": "abc"})));
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(text.contains("\"status\":\"success\""));
        assert!(!text.contains("message"));

        let envelope = Envelope::failure("boom".to_string());
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(text.contains("\"status\":\"error\""));
        assert!(text.contains("boom"));
    }
}
