use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::prelude::*;
use chrono::Utc;
use uuid::Uuid;

use crate::auth::{self, AuthedMeta};
use crate::database::queries::{
    get_market_state_epoch, get_provider, get_provider_info, insert_request,
};
use crate::poller::SpInfo;

use super::env::Env;
use super::error::Error;
use super::respond::ret_auth_fail;

pub const HDR_REQUEST_UUID: &str = "x-brokkr-request-uuid";
pub const HDR_FIL_SPID: &str = "x-brokkr-fil-spid";

/// Headers that must never reach the request log.
const STRIP_HEADERS: [&str; 3] = ["x-real-ip", "x-forwarded-for", "cf-connecting-ip"];

enum AuthFailure {
    Reject(String),
    Internal(anyhow::Error),
}

#[axum::debug_middleware]
pub async fn spid_auth(State(env): State<Env>, mut req: Request, next: Next) -> Response {
    let raw_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let dump = request_dump(&req);

    match authenticate(&env, raw_header, dump).await {
        Ok(meta) => {
            let spid = meta.sp.to_string();
            let request_uuid = meta.request_uuid.clone();
            req.extensions_mut().insert(meta);
            let mut response = next.run(req).await;
            let headers = response.headers_mut();
            if let Ok(v) = HeaderValue::from_str(&spid) {
                headers.insert(HeaderName::from_static(HDR_FIL_SPID), v);
            }
            if let Ok(v) = HeaderValue::from_str(&request_uuid) {
                headers.insert(HeaderName::from_static(HDR_REQUEST_UUID), v);
            }
            response
        }
        Err(AuthFailure::Reject(msg)) => ret_auth_fail(&env, msg).await,
        Err(AuthFailure::Internal(e)) => Error::from(e).into_response(),
    }
}

async fn authenticate(
    env: &Env,
    raw_header: String,
    dump: serde_json::Value,
) -> Result<AuthedMeta, AuthFailure> {
    let challenge = auth::parse_header(&raw_header).map_err(AuthFailure::Reject)?;
    auth::check_epoch_window(&challenge).map_err(AuthFailure::Reject)?;

    let arg = BASE64_STANDARD
        .decode(challenge.arg_b64.as_deref().unwrap_or_default())
        .map_err(|e| AuthFailure::Reject(format!("unable to decode optional argument: {}", e)))?;

    let verdict = match env.auth_caches.cached_verdict(&raw_header) {
        Some(verdict) => verdict,
        None => {
            let verdict = auth::verify_challenge(&env.chain, &env.auth_caches, &challenge, &arg)
                .await
                .map_err(AuthFailure::Internal)?;
            env.auth_caches.store_verdict(&raw_header, verdict.clone());
            verdict
        }
    };
    if let Some(reason) = verdict {
        return Err(AuthFailure::Reject(reason));
    }

    let request_uuid = Uuid::new_v4().to_string();
    let conn = env.writer.connection();
    insert_request(
        &conn,
        &request_uuid,
        challenge.actor.0 as i64,
        Utc::now().timestamp_millis(),
        &dump.to_string(),
    )
    .await
    .map_err(|e| AuthFailure::Internal(e.into()))?;

    let state_epoch = get_market_state_epoch(&conn)
        .await
        .map_err(|e| AuthFailure::Internal(e.into()))?;
    let provider = get_provider(&conn, challenge.actor.0 as i64)
        .await
        .map_err(|e| AuthFailure::Internal(e.into()))?;
    let info_row = get_provider_info(&conn, challenge.actor.0 as i64)
        .await
        .map_err(|e| AuthFailure::Internal(e.into()))?;

    let (sp_info, sp_info_last_polled) = match info_row {
        Some(row) => {
            let parsed: SpInfo = serde_json::from_str(&row.info)
                .map_err(|e| AuthFailure::Internal(e.into()))?;
            (Some(parsed), Some(row.provider_last_polled))
        }
        None => (None, None),
    };

    Ok(AuthedMeta {
        sp: challenge.actor,
        request_uuid,
        state_epoch,
        provider,
        sp_info,
        sp_info_last_polled,
        auth_arg: arg,
    })
}

fn request_dump(req: &Request) -> serde_json::Value {
    let headers: serde_json::Map<String, serde_json::Value> = req
        .headers()
        .iter()
        .filter(|(name, _)| !STRIP_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| {
            (
                name.to_string(),
                serde_json::Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();
    serde_json::json!({
        "method": req.method().as_str(),
        "host": req.headers().get(header::HOST).and_then(|h| h.to_str().ok()),
        "url": req.uri().to_string(),
        "headers": headers,
    })
}
