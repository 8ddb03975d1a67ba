use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use libp2p::{Multiaddr, PeerId};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::database::queries::{
    fail_proposal, mark_delivered, proposals_to_deliver, record_delivery_diagnostics,
};
use crate::database::types::DeliveryPendingRow;
use crate::database::writer::Writer;
use crate::fil::market::{ClientDealProposal, DealProposal, Signature};
use crate::fil::{ActorId, big_now};
use crate::peer::PeerNode;
use crate::peer::types::StorageProposalParams;

#[derive(Clone, Copy)]
pub struct ProposeOptions {
    pub sleep_between_proposals: Duration,
    pub proposal_timeout: Duration,
    pub per_sp_timeout: Duration,
}

impl Default for ProposeOptions {
    fn default() -> Self {
        ProposeOptions {
            sleep_between_proposals: Duration::from_secs(3),
            proposal_timeout: Duration::from_secs(30),
            per_sp_timeout: Duration::from_secs(270),
        }
    }
}

struct Delivery {
    uuid: Uuid,
    peer_id: PeerId,
    addrs: Vec<Multiaddr>,
    params: StorageProposalParams,
}

#[derive(Default)]
struct RunTotals {
    delivered: AtomicI32,
    timedout: AtomicI32,
    failed: AtomicI32,
}

fn delivery_of(row: &DeliveryPendingRow) -> Result<Option<Delivery>> {
    let (Some(peer_id), Some(multiaddrs)) = (&row.peer_id, &row.multiaddrs) else {
        return Ok(None);
    };
    let Ok(peer_id) = PeerId::from_str(peer_id) else {
        return Ok(None);
    };
    let addr_strings: Vec<String> =
        serde_json::from_str(multiaddrs).context("stored multiaddrs are a JSON array")?;
    let addrs: Vec<Multiaddr> = addr_strings
        .iter()
        .filter_map(|a| Multiaddr::from_str(a).ok())
        .collect();
    if addrs.is_empty() {
        return Ok(None);
    }

    let uuid = Uuid::from_str(&row.proposal_uuid).context("stored proposal uuid")?;
    let proposal = DealProposal::for_reservation(
        &row.piece_cid,
        row.proposal_label.as_deref(),
        ActorId(row.provider_id as u64),
        ActorId(row.client_id as u64),
        row.start_epoch,
        row.end_epoch,
        row.proxied_log2_size,
        &row.provider_collateral,
    )?;
    let signature: Signature = serde_json::from_str(
        row.signature
            .as_deref()
            .context("signed reservation carries a signature")?,
    )?;
    let deal_data_root = proposal.piece_cid;

    Ok(Some(Delivery {
        uuid,
        peer_id,
        addrs,
        params: StorageProposalParams {
            deal_uuid: uuid,
            // not negotiable: out-of-band transfers forever
            is_offline: true,
            client_deal_proposal: ClientDealProposal {
                proposal,
                client_signature: signature,
            },
            // there is no separate data root, always the piece itself
            deal_data_root,
            remove_unsealed_copy: false,
            skip_ipni_announce: false,
        },
    }))
}

/// Delivers signed reservations: one peer host and one dial per SP, strict
/// creation order within an SP, everything across SPs in parallel.
pub async fn run(
    cancel_token: CancellationToken,
    writer: &Writer,
    opts: ProposeOptions,
) -> Result<()> {
    let conn = writer.connection();
    let pending = proposals_to_deliver(&conn).await?;

    let totals = Arc::new(RunTotals::default());
    let mut per_sp: BTreeMap<i64, Vec<Delivery>> = BTreeMap::new();
    let mut proposals = 0;

    for row in &pending {
        match delivery_of(row)? {
            Some(delivery) => {
                per_sp.entry(row.provider_id).or_default().push(delivery);
                proposals += 1;
            }
            None => {
                // failure recording must survive cancellation, hence the
                // writer connection rather than anything scoped
                fail_proposal(
                    &conn,
                    &row.proposal_uuid,
                    big_now(),
                    "provider not dialable: insufficient information published on chain",
                )
                .await?;
            }
        }
    }

    let unique_providers = per_sp.len();
    let mut groups = JoinSet::new();
    for (sp, deliveries) in per_sp {
        let conn = conn.clone();
        let totals = totals.clone();
        let cancel_token = cancel_token.clone();
        groups.spawn(async move {
            propose_to_sp(cancel_token, conn, ActorId(sp as u64), deliveries, opts, totals).await
        });
    }

    let mut first_err = None;
    while let Some(joined) = groups.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(e) => {
                first_err.get_or_insert(anyhow::Error::from(e));
            }
        }
    }

    info!(
        unique_providers,
        proposals,
        successful = totals.delivered.load(Ordering::Relaxed),
        failed = totals.failed.load(Ordering::Relaxed),
        timedout = totals.timedout.load(Ordering::Relaxed),
        "summary"
    );

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn propose_to_sp(
    cancel_token: CancellationToken,
    conn: libsql::Connection,
    sp: ActorId,
    deliveries: Vec<Delivery>,
    opts: ProposeOptions,
    totals: Arc<RunTotals>,
) -> Result<()> {
    if deliveries.is_empty() {
        return Ok(());
    }

    let deal_count = deliveries.len();
    let job_desc = format!("proposing {} deals to {}", deal_count, sp);
    info!("START {}", job_desc);
    let t0 = Instant::now();

    // some SPs take *FOREVER* to respond; cap the whole batch so the rest of
    // the queue is not held up, the leftovers retry next cycle
    let deadline = t0 + opts.per_sp_timeout;

    let mut delivered = 0;
    let mut failed = 0;
    let mut timedout = 0;

    let mut node: Option<PeerNode> = None;
    let mut local_peer_id: Option<String> = None;
    let mut dial_took_msecs: Option<i64> = None;

    'deliveries: for (i, delivery) in deliveries.into_iter().enumerate() {
        // wait a bit between deliveries
        if i != 0 {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break 'deliveries,
                _ = cancel_token.cancelled() => break 'deliveries,
                _ = tokio::time::sleep(opts.sleep_between_proposals) => {}
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        // connect once, lazily
        let mut never_connected = false;
        let mut rpc_error: Option<String> = None;
        if node.is_none() {
            let mut fresh = PeerNode::new(opts.proposal_timeout, opts.per_sp_timeout)?;
            local_peer_id = Some(fresh.local_peer_id().to_string());
            let dial_timeout = remaining.min(opts.proposal_timeout);
            match fresh.connect(delivery.peer_id, delivery.addrs.clone(), dial_timeout).await {
                Ok(took) => {
                    dial_took_msecs = Some(took.as_millis() as i64);
                    node = Some(fresh);
                }
                Err(e) => {
                    never_connected = true;
                    rpc_error = Some(e.to_string());
                }
            }
        }

        let mut proposal_took_msecs: Option<i64> = None;
        let mut did_timeout = false;
        if rpc_error.is_none() {
            let host = node.as_mut().expect("connected above");
            let rpc_timeout = remaining.min(opts.proposal_timeout);
            let t1 = Instant::now();
            let outcome =
                tokio::time::timeout(rpc_timeout, host.propose(delivery.peer_id, delivery.params))
                    .await;
            proposal_took_msecs = Some(t1.elapsed().as_millis() as i64);
            match outcome {
                Ok(Ok(response)) if response.accepted => {}
                Ok(Ok(response)) => rpc_error = Some(response.message),
                Ok(Err(e)) => rpc_error = Some(e.to_string()),
                Err(_) => {
                    did_timeout = true;
                    rpc_error = Some(format!(
                        "proposal deadline exceeded after {}s",
                        rpc_timeout.as_secs()
                    ));
                }
            }
        }

        // diagnostics are kept regardless of outcome so external tooling can
        // observe dial health
        record_delivery_diagnostics(
            &conn,
            &delivery.uuid.to_string(),
            local_peer_id.clone(),
            dial_took_msecs,
            proposal_took_msecs,
        )
        .await?;

        match rpc_error {
            None => {
                delivered += 1;
                totals.delivered.fetch_add(1, Ordering::Relaxed);
                mark_delivered(
                    &conn,
                    &delivery.uuid.to_string(),
                    Utc::now().timestamp_millis(),
                )
                .await?;
            }
            Some(reason) => {
                error!("{}", reason);
                if did_timeout {
                    timedout += 1;
                    totals.timedout.fetch_add(1, Ordering::Relaxed);
                } else {
                    failed += 1;
                    totals.failed.fetch_add(1, Ordering::Relaxed);
                }
                fail_proposal(&conn, &delivery.uuid.to_string(), big_now(), &reason).await?;

                // two distinct bail conditions: we never managed to connect
                // at all, or the SP just ate a full timeout
                if never_connected || did_timeout {
                    break;
                }
            }
        }
    }

    info!(
        "END {}, out of {} proposals: {} succeeded, {} failed, {} timed out, took {:?}",
        job_desc,
        deal_count,
        delivered,
        failed,
        timedout,
        t0.elapsed(),
    );
    Ok(())
}
