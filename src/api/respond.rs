use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::auth::{AUTH_SCHEME, AuthedMeta};
use crate::database::queries::annotate_request;
use crate::fil::ActorId;

use super::env::Env;
use super::types::{ErrCode, ResponseEnvelope};

/// All responses leave pretty-printed, caller-side `curl` is a first-class
/// consumer of this API.
pub fn render(status: StatusCode, envelope: ResponseEnvelope, extra: &[(HeaderName, &str)]) -> Response {
    let body = serde_json::to_string_pretty(&envelope)
        .unwrap_or_else(|e| format!("{{\"encoding_failure\":\"{}\"}}", e));
    let mut response = (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response();
    for (name, value) in extra {
        if let Ok(v) = HeaderValue::from_str(value) {
            response.headers_mut().insert(name.clone(), v);
        }
    }
    response
}

fn entry_count(payload: &serde_json::Value) -> Option<usize> {
    match payload {
        serde_json::Value::Array(a) => Some(a.len()),
        _ => None,
    }
}

/// The uniform response path: wraps the payload in the envelope, logs the
/// refusal (if any) onto the caller's request row, renders.
pub async fn ret_payload_annotated<P: Serialize>(
    env: &Env,
    meta: Option<&AuthedMeta>,
    status: StatusCode,
    err: Option<ErrCode>,
    payload: P,
    msg: &str,
) -> Response {
    let payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
    let lines: Option<Vec<String>> = if msg.is_empty() {
        None
    } else {
        Some(msg.split('\n').map(str::to_owned).collect())
    };

    let mut envelope = ResponseEnvelope {
        request_id: meta.map(|m| m.request_uuid.clone()).unwrap_or_default(),
        response_timestamp: Utc::now(),
        response_state_epoch: meta.and_then(|m| m.state_epoch),
        response_code: status.as_u16(),
        error_code: None,
        error_slug: None,
        error_lines: None,
        info_lines: None,
        response_entries: entry_count(&payload),
        response: payload.clone(),
    };

    if status.as_u16() < 400 {
        envelope.info_lines = lines;
    } else if let Some(err) = err {
        envelope.error_code = Some(err.code());
        envelope.error_slug = Some(err.slug());
        envelope.error_lines = lines;

        // the request log mirrors what the caller was told
        if let Some(meta) = meta {
            let patch = serde_json::json!({
                "error": msg,
                "error_code": err.code(),
                "error_slug": err.slug(),
                "payload": payload,
            });
            if let Err(e) = annotate_request(
                &env.writer.connection(),
                &meta.request_uuid,
                &patch.to_string(),
            )
            .await
            {
                warn!("failed to annotate request {}: {}", meta.request_uuid, e);
            }
        }
    }

    render(status, envelope, &[])
}

/// DO NOT use 400 for semantic refusals: transport-level 400s get rewritten
/// by fronting proxies, 403 passes through untouched.
pub async fn ret_fail(
    env: &Env,
    meta: Option<&AuthedMeta>,
    err: ErrCode,
    msg: String,
) -> Response {
    ret_payload_annotated(
        env,
        meta,
        StatusCode::FORBIDDEN,
        Some(err),
        serde_json::Value::Null,
        &msg,
    )
    .await
}

pub async fn ret_auth_fail(env: &Env, msg: String) -> Response {
    let mut response = ret_payload_annotated(
        env,
        None,
        StatusCode::UNAUTHORIZED,
        Some(ErrCode::UnauthorizedAccess),
        serde_json::Value::Null,
        &format!("Unauthorized\n\n{}", msg),
    )
    .await;
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static(AUTH_SCHEME),
    );
    response
}

/// The self-documenting invocation hint shown in info lines.
pub fn curl_authed_for_sp(host: &str, sp: ActorId, path: &str) -> String {
    format!(
        "echo curl -sLH \"Authorization: $( ./fil-spid.bash {} )\" http://{}{} | sh",
        sp, host, path,
    )
}
