use std::collections::HashMap;

use axum::Extension;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use chrono::{DateTime, Utc};
use cid::Cid;

use crate::admission::{self, Outcome, ineligible_sp_msg, sp_ineligible_code};
use crate::chain;
use crate::database::queries::{eligible_pieces, pending_proposals, piece_sources};
use crate::database::types::{EligiblePieceRow, PendingProposalRow};
use crate::fil::{self, ActorId, EPOCHS_IN_HOUR, big_now, mainnet_time, wall_time_epoch};
use crate::peer::types::STORAGE_PROPOSAL_PROTOCOL;
use crate::poller::POLLED_SP_INFO_STALE_AFTER_MINUTES;

use super::env::Env;
use super::error;
use super::respond::{curl_authed_for_sp, ret_fail, ret_payload_annotated};
use super::types::{
    DealProposalInfo, ErrCode, FilSourceDag, Piece, ProposalFailure, ResponseDealRequest,
    ResponsePendingProposals, trim_cid_string,
};
use crate::auth::AuthedMeta;

const LIST_ELIGIBLE_DEFAULT_SIZE: u64 = 500;
const LIST_ELIGIBLE_MAX_SIZE: u64 = 2 << 20;
const SHOW_RECENT_FAILURES_HOURS: i64 = 24;

type Params = HashMap<String, String>;

fn truthy_bool_param(params: &Params, name: &str) -> bool {
    match params.get(name) {
        None => false,
        Some(v) => {
            let v = v.to_ascii_lowercase();
            v != "0" && v != "false" && v != "no"
        }
    }
}

fn parse_uint_param(params: &Params, name: &str, min: u64, max: u64) -> Result<Option<u64>, String> {
    let Some(raw) = params.get(name) else {
        return Ok(None);
    };
    let val: u64 = raw
        .parse()
        .map_err(|_| format!("provided '{}' value '{}' is not a valid integer", name, raw))?;
    if val < min || val > max {
        return Err(format!(
            "provided '{}' value '{}' is out of bounds ( {} ~ {} )",
            name, raw, min, max
        ));
    }
    Ok(Some(val))
}

fn host_of(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost")
        .to_owned()
}

fn is_stale_chain(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<chain::Error>(),
        Some(chain::Error::StaleChain(_))
    )
}

pub async fn sp_status(
    State(env): State<Env>,
    Extension(meta): Extension<AuthedMeta>,
) -> Response {
    ret_fail(
        &env,
        Some(&meta),
        ErrCode::SystemTemporarilyDisabled,
        format!(
            "
                                            !!! COMING SOON !!!

This area will contain various information regarding the system and the current state of storage provider {}
",
            meta.sp,
        ),
    )
    .await
}

pub async fn catch_all(State(env): State<Env>, req: axum::extract::Request) -> Response {
    ret_fail(
        &env,
        None,
        ErrCode::InvalidRequest,
        format!("there is nothing at {}", req.uri()),
    )
    .await
}

pub async fn list_eligible(
    State(env): State<Env>,
    Extension(meta): Extension<AuthedMeta>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> error::Result<Response> {
    let limit = match parse_uint_param(&params, "limit", 1, LIST_ELIGIBLE_MAX_SIZE) {
        Ok(v) => v.unwrap_or(LIST_ELIGIBLE_DEFAULT_SIZE),
        Err(e) => return Ok(ret_fail(&env, Some(&meta), ErrCode::InvalidRequest, e).await),
    };
    let tenant = match parse_uint_param(&params, "tenant", 1, 1 << 15) {
        Ok(v) => v.unwrap_or(0) as i64,
        Err(e) => return Ok(ret_fail(&env, Some(&meta), ErrCode::InvalidRequest, e).await),
    };
    let orglocal_only = truthy_bool_param(&params, "orglocal-only");
    let include_sourceless = truthy_bool_param(&params, "include-sourceless");

    // start small by default; large requests and the explicit escape hatch
    // get the plan that applies every per-granularity ceiling
    let full_scan = if params.contains_key("internal-nolateral") {
        truthy_bool_param(&params, "internal-nolateral")
    } else {
        limit > LIST_ELIGIBLE_DEFAULT_SIZE
    };

    let Some(provider) = meta.provider.clone() else {
        return Ok(ret_fail(
            &env,
            Some(&meta),
            ErrCode::StorageProviderSuspended,
            ineligible_sp_msg(meta.sp),
        )
        .await);
    };
    let sector_log2_size = meta
        .sp_info
        .as_ref()
        .map(|i| i.sector_log2_size as i64)
        .filter(|s| *s > 0)
        .unwrap_or(36);

    let conn = env.reader.connection().await?;
    let mut rows: Vec<EligiblePieceRow> = eligible_pieces(
        &conn,
        &provider,
        sector_log2_size,
        tenant,
        include_sourceless,
        orglocal_only,
        full_scan,
        (limit + 1) as i64,
    )
    .await?;

    let host = host_of(&headers);
    let mut info: Vec<String> = vec![
        "List of qualifying Piece CIDs together with their availability from various sources.".into(),
        "".into(),
        "In order to satisfy a FilPlus deal from this deal engine, all you need to do is obtain the ".into(),
        "corresponding .car file (usually by retrieving it from one of the sources within this list).".into(),
        "".into(),
        "Once you have selected a Piece CID you would like to seal, and are reasonably confident".into(),
        "you can obtain the data for it - request a deal from the system by invoking the API as".into(),
        "shown in the corresponding `sample_request_cmd`. You will then receive a deal within 5 minutes,".into(),
        "and can proceed to import the corresponding car file into your market node.".into(),
        "".into(),
        "In order to see what proposals you have currently pending, you can invoke:".into(),
        format!(" {}", curl_authed_for_sp(&host, meta.sp, "/sp/pending_proposals")),
    ];

    if orglocal_only {
        info.splice(
            0..1,
            [
                format!(
                    "List of qualifying Piece CIDs currently active within any provider belonging to the Org of SP {}",
                    meta.sp,
                ),
                "".into(),
                "This list is ordered by most recently expiring/expired first, and reflects all pieces of data".into(),
                "that are still present within your own organization. It is recommended you reseal these first,".into(),
                "as data for them is readily obtainable.".into(),
                "".into(),
            ],
        );
    }

    if rows.len() as u64 > limit {
        rows.truncate(limit as usize);
        let ex_lim = limit.max(LIST_ELIGIBLE_DEFAULT_SIZE);
        info.splice(
            0..0,
            [
                format!("NOTE: The complete list of entries has been TRUNCATED to the top {}.", limit),
                "Use the 'limit' param in your API call to request more of the (possibly very large) list:".into(),
                format!(
                    " {}",
                    curl_authed_for_sp(
                        &host,
                        meta.sp,
                        &format!("/sp/eligible_pieces?limit={}", (2 * ex_lim) / 100 * 100),
                    )
                ),
                "".into(),
            ],
        );
    }

    let sourced_ids: Vec<i64> = rows
        .iter()
        .filter(|r| r.has_sources_fil_active != 0)
        .map(|r| r.piece_id)
        .collect();
    let org_filter = if orglocal_only { provider.org_id } else { 0 };
    let sources = piece_sources(&conn, &sourced_ids, org_filter).await?;

    let mut pieces: Vec<Piece> = Vec::with_capacity(rows.len());
    let mut index_of: HashMap<i64, usize> = HashMap::with_capacity(rows.len());
    for row in &rows {
        index_of.insert(row.piece_id, pieces.len());
        pieces.push(Piece {
            piece_cid: row.piece_cid.clone(),
            padded_piece_size: 1u64 << row.piece_log2_size,
            tenants: row.tenant_id_list(),
            sample_request_cmd: curl_authed_for_sp(
                &host,
                meta.sp,
                &format!("/sp/request_piece/{}", row.piece_cid),
            ),
            sources: vec![],
        });
    }
    for src in sources {
        let Some(&i) = index_of.get(&src.piece_id) else {
            continue;
        };
        // the query is rank-ordered, only the top source per piece is shown
        if pieces[i].sources.is_empty() {
            let piece_cid = pieces[i].piece_cid.clone();
            pieces[i].sources.push(FilSourceDag::new(
                src.deal_id,
                ActorId(src.provider_id as u64).to_string(),
                src.decoded_label,
                mainnet_time(src.end_epoch),
                src.is_filplus != 0,
                &piece_cid,
            ));
        }
    }

    Ok(ret_payload_annotated(
        &env,
        Some(&meta),
        StatusCode::OK,
        None,
        pieces,
        &info.join("\n"),
    )
    .await)
}

pub async fn list_pending_proposals(
    State(env): State<Env>,
    Extension(meta): Extension<AuthedMeta>,
) -> error::Result<Response> {
    let conn = env.reader.connection().await?;

    let min_start_epoch = wall_time_epoch(Utc::now()) + EPOCHS_IN_HOUR - 28_000;
    let failstamp_cutoff = big_now() - SHOW_RECENT_FAILURES_HOURS * 3600 * 1_000_000_000;
    let rows: Vec<PendingProposalRow> =
        pending_proposals(&conn, meta.sp.0 as i64, min_start_epoch, failstamp_cutoff).await?;

    let mut to_propose: i64 = 0;
    let mut to_activate: i64 = 0;
    let mut outstanding_bytes: i64 = 0;
    let mut fails: HashMap<(i64, i64), ProposalFailure> = HashMap::new();
    let mut pending: Vec<DealProposalInfo> = vec![];
    let mut source_rows: Vec<(usize, i64)> = vec![];

    let now = Utc::now();
    for row in &rows {
        outstanding_bytes += 1 << row.piece_log2_size;

        if row.is_published != 0 {
            to_activate += 1;
        } else if row.proposal_failstamp > 0 {
            let key = (row.piece_id, row.tenant_id);
            let timestamp = DateTime::from_timestamp_nanos(row.proposal_failstamp);
            let failure = ProposalFailure {
                timestamp,
                error: row.error.clone().unwrap_or_default(),
                piece_cid: row.piece_cid.clone(),
                deal_proposal_id: row.proposal_uuid.clone(),
                deal_proposal_cid: row.proposal_cid.clone(),
                tenant_id: row.tenant_id,
                tenant_client_id: ActorId(row.client_id as u64).to_string(),
            };
            match fails.get(&key) {
                Some(prev) if prev.timestamp >= failure.timestamp => {}
                _ => {
                    fails.insert(key, failure);
                }
            }
        } else if row.proposal_delivered.is_none() {
            to_propose += 1;
        } else {
            let start_time = mainnet_time(row.start_epoch);
            let import_cmd = match &row.proposal_cid {
                Some(cid) => format!(
                    "lotus-miner storage-deals import-data {} {}.car",
                    cid,
                    trim_cid_string(&row.piece_cid),
                ),
                None => String::new(),
            };
            if row.has_sources_fil_active != 0 {
                source_rows.push((pending.len(), row.piece_id));
            }
            pending.push(DealProposalInfo {
                deal_proposal_id: row.proposal_uuid.clone(),
                deal_proposal_cid: row.proposal_cid.clone(),
                hours_remaining: (start_time - now).num_hours(),
                piece_size: 1 << row.piece_log2_size,
                piece_cid: row.piece_cid.clone(),
                tenant_id: row.tenant_id,
                tenant_client_id: ActorId(row.client_id as u64).to_string(),
                deal_start_time: start_time,
                deal_start_epoch: row.start_epoch,
                sample_import_cmd: import_cmd,
                sources: vec![],
            });
        }
    }

    let sources = piece_sources(
        &conn,
        &source_rows.iter().map(|(_, p)| *p).collect::<Vec<_>>(),
        0,
    )
    .await?;
    for (i, piece_id) in source_rows {
        if let Some(src) = sources.iter().find(|s| s.piece_id == piece_id) {
            let piece_cid = pending[i].piece_cid.clone();
            pending[i].sources.push(FilSourceDag::new(
                src.deal_id,
                ActorId(src.provider_id as u64).to_string(),
                src.decoded_label.clone(),
                mainnet_time(src.end_epoch),
                src.is_filplus != 0,
                &piece_cid,
            ));
        }
    }

    let mut msg = format!(
        "
This is an overview of deals recently proposed to SP {}

There currently are {:.2} GiB of pending deals:
  {:>4} deal-proposals to send out
  {:>4} successful proposals pending publishing
  {:>4} deals published on chain awaiting sector activation

You can request deal proposals using API endpoints as described in the docs",
        meta.sp,
        outstanding_bytes as f64 / (1u64 << 30) as f64,
        to_propose,
        pending.len(),
        to_activate,
    );

    let mut recent_failures: Vec<ProposalFailure> = fails.into_values().collect();
    if !recent_failures.is_empty() {
        msg.push_str(&format!(
            "\n\nIn the past {}h there were {} proposal errors, shown in recent_failures below.",
            SHOW_RECENT_FAILURES_HOURS,
            recent_failures.len(),
        ));
        recent_failures.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    Ok(ret_payload_annotated(
        &env,
        Some(&meta),
        StatusCode::OK,
        None,
        ResponsePendingProposals {
            recent_failures,
            pending_proposals: pending,
        },
        &msg,
    )
    .await)
}

pub async fn request_piece(
    State(env): State<Env>,
    Extension(meta): Extension<AuthedMeta>,
    headers: HeaderMap,
    Path(piece_cid_arg): Path<String>,
    Query(params): Query<Params>,
) -> error::Result<Response> {
    let piece_cid = match Cid::try_from(piece_cid_arg.as_str()) {
        Ok(c) => c,
        Err(e) => {
            return Ok(ret_fail(
                &env,
                Some(&meta),
                ErrCode::InvalidRequest,
                format!("Requested PieceCid '{}' is not valid: {}", piece_cid_arg, e),
            )
            .await);
        }
    };
    if let Err(e) = fil::market::validate_piece_cid(&piece_cid) {
        return Ok(ret_fail(&env, Some(&meta), ErrCode::InvalidRequest, e.to_string()).await);
    }

    let tenant = match parse_uint_param(&params, "tenant", 1, 1 << 15) {
        Ok(v) => v.unwrap_or(0) as i64,
        Err(e) => return Ok(ret_fail(&env, Some(&meta), ErrCode::InvalidRequest, e).await),
    };

    // check whether the provider has been polled recently enough
    let info_stale_cutoff =
        Utc::now().timestamp_millis() - POLLED_SP_INFO_STALE_AFTER_MINUTES * 60_000;
    if meta
        .sp_info_last_polled
        .is_none_or(|polled| polled < info_stale_cutoff)
    {
        return Ok(ret_fail(
            &env,
            Some(&meta),
            ErrCode::StorageProviderInfoTooOld,
            "Provider has not been dialed by the polling system recently: please try again in about a minute".into(),
        )
        .await);
    }

    let host = host_of(&headers);
    let sp_info = meta.sp_info.clone().unwrap_or_default();
    if !sp_info.is_dialable() {
        return Ok(ret_fail(
            &env,
            Some(&meta),
            ErrCode::StorageProviderUndialable,
            format!(
                "It appears your provider can not be libp2p-dialed over the TCP transport.\nPlease invoke the status endpoint for further details:\n{}",
                curl_authed_for_sp(&host, meta.sp, "/sp/status"),
            ),
        )
        .await);
    }
    if !sp_info.supports_storage_proposals() {
        return Ok(ret_fail(
            &env,
            Some(&meta),
            ErrCode::StorageProviderUnsupported,
            format!(
                "It appears your provider does not support {}.\nYou must upgrade your market node to a version speaking it in order to use this API",
                STORAGE_PROPOSAL_PROTOCOL,
            ),
        )
        .await);
    }

    match sp_ineligible_code(
        &env.chain,
        &env.chain_eligibility,
        meta.provider.as_ref(),
        env.config.lotus_lookback_epochs,
    )
    .await
    {
        Ok(None) => {}
        Ok(Some(code)) => {
            return Ok(ret_fail(&env, Some(&meta), code, ineligible_sp_msg(meta.sp)).await);
        }
        Err(e) if is_stale_chain(&e) => {
            return Ok(ret_fail(
                &env,
                Some(&meta),
                ErrCode::SystemTemporarilyDisabled,
                format!("The system is temporarily unable to process requests: {}", e),
            )
            .await);
        }
        Err(e) => return Err(e.into()),
    }
    let provider = meta
        .provider
        .clone()
        .expect("eligibility returned None, the provider row exists");

    let outcome = admission::evaluate(
        &env.writer.connection(),
        &env.chain,
        &env.collateral,
        &env.reservation_lock,
        &provider,
        sp_info.sector_log2_size as i64,
        &piece_cid,
        tenant,
        env.config.lotus_lookback_epochs,
    )
    .await;

    match outcome {
        Ok(Outcome::Granted {
            start_epoch, states, ..
        }) => Ok(ret_payload_annotated(
            &env,
            Some(&meta),
            StatusCode::OK,
            None,
            ResponseDealRequest {
                tenant_replication_states: states,
                deal_start_time: Some(mainnet_time(start_epoch)),
                deal_start_epoch: Some(start_epoch),
            },
            &format!(
                "Deal queued for PieceCID {}\n\nIn about 5 minutes check the pending list:\n {}",
                piece_cid,
                curl_authed_for_sp(&host, meta.sp, "/sp/pending_proposals"),
            ),
        )
        .await),
        Ok(Outcome::Refused {
            code,
            message,
            states,
        }) => {
            if states.is_empty() {
                Ok(ret_fail(&env, Some(&meta), code, message).await)
            } else {
                Ok(ret_payload_annotated(
                    &env,
                    Some(&meta),
                    StatusCode::FORBIDDEN,
                    Some(code),
                    ResponseDealRequest {
                        tenant_replication_states: states,
                        deal_start_time: None,
                        deal_start_epoch: None,
                    },
                    &message,
                )
                .await)
            }
        }
        Err(e) if is_stale_chain(&e) => Ok(ret_fail(
            &env,
            Some(&meta),
            ErrCode::SystemTemporarilyDisabled,
            format!("The system is temporarily unable to process requests: {}", e),
        )
        .await),
        Err(e) => Err(e.into()),
    }
}
