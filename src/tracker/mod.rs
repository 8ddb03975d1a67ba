use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use cid::Cid;
use num_bigint::BigInt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chain::{ChainRpc, lookback_tipset};
use crate::database::queries::{
    affiliated_clients, fail_overdue_proposals, fail_proposals_of_terminated_deals, known_deals,
    known_pieces, link_activated_deal, mark_active_piece_sizes_proven, set_market_state,
    terminate_gone_deals, update_client_address, update_client_datacap, upsert_published_deal,
};
use crate::database::types::PublishedDealRow;
use crate::database::writer::Writer;
use crate::fil::market::cid_v1;
use crate::fil::{ActorId, ChainEpoch, EPOCHS_IN_DAY, big_now, mainnet_time};

/// Deals whose start epoch is more than one update interval in the past
/// without a sector are never going to make it.
const DEAL_UPDATES_INTERVAL: ChainEpoch = 2880;

struct Reconciled {
    row: PublishedDealRow,
    newly_active: bool,
}

/// Reconciles the store with authoritative market-actor state at the
/// lookback tipset. All writes land in one transaction: a partial prior run
/// cannot corrupt anything, the next run simply rebuilds the same picture.
pub async fn run<C: ChainRpc>(
    _cancel_token: CancellationToken,
    writer: &Writer,
    chain: &C,
    lookback_epochs: i64,
) -> Result<()> {
    let conn = writer.connection();

    let state_tipset = lookback_tipset(chain, lookback_epochs).await?;
    info!(
        epoch = state_tipset.height,
        "retrieving market deals from lookback state"
    );

    let deals_fetch = tokio::spawn({
        let chain = chain.clone();
        let tsk = state_tipset.key();
        async move { chain.market_deals(&tsk).await }
    });

    // refresh DataCap while the big fetch runs
    let clients = affiliated_clients(&conn).await?;
    let mut chain_datacap: HashMap<i64, Option<BigInt>> = HashMap::with_capacity(clients.len());
    for client in &clients {
        let addr = client
            .client_address
            .clone()
            .unwrap_or_else(|| ActorId(client.client_id as u64).to_string());
        let dcap = chain
            .verified_client_status(&addr, &state_tipset.key())
            .await
            .with_context(|| format!("querying datacap of {}", addr))?;
        chain_datacap.insert(client.client_id, dcap);
    }
    info!("queried datacap for {} clients", chain_datacap.len());
    let affiliated: HashMap<i64, Option<String>> = clients
        .iter()
        .map(|c| (c.client_id, c.client_address.clone()))
        .collect();

    let piece_ids: HashMap<String, i64> = known_pieces(&conn)
        .await?
        .into_iter()
        .map(|(id, cid)| (cid, id))
        .collect();
    let mut prior_deals: HashMap<i64, (i64, String)> = known_deals(&conn)
        .await?
        .into_iter()
        .map(|d| (d.deal_id, (d.piece_id, d.status)))
        .collect();

    let mut totals: HashMap<&'static str, i64> = HashMap::new();
    let mut new_deal_count = 0i64;
    let mut terminated_deal_count = 0i64;

    if piece_ids.is_empty() {
        info!("no known pieces, nothing to reconcile");
        return Ok(());
    }

    let market = deals_fetch
        .await
        .context("joining market deals fetch")??;
    info!("retrieved {} state deal records", market.len());

    let now_ms = Utc::now().timestamp_millis();
    let mut providers_seen: HashMap<i64, ()> = HashMap::new();
    let mut robust_addresses: HashMap<i64, String> = HashMap::new();
    let mut pending_verified_bytes: HashMap<i64, BigInt> = HashMap::new();
    let mut changes: Vec<Reconciled> = vec![];

    for (deal_id_str, deal) in &market {
        // only deals over trackable pieces matter
        let Some(&piece_id) = piece_ids.get(&deal.proposal.piece_cid.0.to_string()) else {
            continue;
        };
        let deal_id: i64 = deal_id_str
            .parse()
            .with_context(|| format!("market deal key '{}' is not numeric", deal_id_str))?;

        let prev_status = prior_deals.remove(&deal_id).map(|(_, s)| s);
        let initial_encounter = prev_status.is_none();

        let provider: ActorId = deal.proposal.provider.parse()?;
        let client: ActorId = deal.proposal.client.parse()?;
        providers_seen.insert(provider.0 as i64, ());

        let client_id = client.0 as i64;
        if affiliated.contains_key(&client_id) && !robust_addresses.contains_key(&client_id) {
            let robust = chain
                .account_key(&deal.proposal.client, &state_tipset.key())
                .await
                .with_context(|| format!("resolving robust address of {}", client))?;
            robust_addresses.insert(client_id, robust);
        }

        let (status, status_meta, sector_start, termination_time) =
            if deal.state.slash_epoch != -1 {
                (
                    "terminated",
                    Some("entered final-slashed state".to_string()),
                    None,
                    Some(now_ms),
                )
            } else if deal.state.sector_start_epoch > 0 {
                (
                    "active",
                    Some(format!(
                        "containing sector active as of {} at epoch {}",
                        mainnet_time(deal.state.sector_start_epoch).format("%Y-%m-%d %H:%M:%S"),
                        deal.state.sector_start_epoch,
                    )),
                    Some(deal.state.sector_start_epoch),
                    None,
                )
            } else if deal.proposal.start_epoch + DEAL_UPDATES_INTERVAL < state_tipset.height {
                (
                    "terminated",
                    Some(format!(
                        "containing sector missed expected sealing epoch {}",
                        deal.proposal.start_epoch,
                    )),
                    None,
                    Some(now_ms),
                )
            } else {
                ("published", None, None, None)
            };

        *totals
            .entry(match status {
                "terminated" => "terminated",
                "active" => "active",
                _ => "published",
            })
            .or_default() += 1;
        if initial_encounter {
            if status == "terminated" {
                terminated_deal_count += 1;
            } else {
                new_deal_count += 1;
            }
        }

        if deal.proposal.verified_deal && status == "published" {
            if affiliated.contains_key(&client_id) {
                // commitments not yet activated still consume allowance
                *pending_verified_bytes.entry(client_id).or_default() +=
                    BigInt::from(deal.proposal.piece_size);
            }
        }

        // nothing to upsert when the status did not move
        if prev_status.as_deref() == Some(status) {
            continue;
        }

        if deal.proposal.piece_size.count_ones() != 1 {
            bail!(
                "deal {} claims piece size {} which is not a power of two",
                deal_id,
                deal.proposal.piece_size
            );
        }

        let label_bytes = match &deal.proposal.label {
            serde_json::Value::String(s) => s.as_bytes().to_vec(),
            other => bail!(
                "deal {} label is neither bytes nor string: {}",
                deal_id,
                other
            ),
        };
        let decoded_label = std::str::from_utf8(&label_bytes)
            .ok()
            .and_then(|s| Cid::try_from(s).ok())
            .map(|c| cid_v1(c).to_string());

        changes.push(Reconciled {
            newly_active: status == "active" && prev_status.as_deref() != Some("active"),
            row: PublishedDealRow::builder()
                .deal_id(deal_id)
                .client_id(client_id)
                .provider_id(provider.0 as i64)
                .piece_id(piece_id)
                .label(label_bytes)
                .maybe_decoded_label(decoded_label)
                .is_filplus(deal.proposal.verified_deal as i64)
                .status(status.to_string())
                .maybe_status_meta(status_meta)
                .start_epoch(deal.proposal.start_epoch)
                .end_epoch(deal.proposal.end_epoch)
                .maybe_sector_start_epoch(sector_start)
                .maybe_termination_detection_time(termination_time)
                .build(),
        });
    }
    let known_provider_count = providers_seen.len();

    // whatever remains was not in the market state and is gone for good
    let mut gone: Vec<i64> = vec![];
    for (deal_id, (_, status)) in &prior_deals {
        *totals.entry("terminated").or_default() += 1;
        if status == "terminated" {
            continue;
        }
        terminated_deal_count += 1;
        gone.push(*deal_id);
    }

    let tx = conn
        .transaction()
        .await
        .context("opening reconciliation transaction")?;

    for change in &changes {
        upsert_published_deal(&tx, &change.row).await?;
        if change.newly_active {
            link_activated_deal(
                &tx,
                change.row.deal_id,
                change.row.piece_id,
                change.row.provider_id,
                change.row.client_id,
            )
            .await?;
        }
    }

    terminate_gone_deals(&tx, &gone, now_ms).await?;

    for (client_id, robust) in &robust_addresses {
        if affiliated.get(client_id).map(Option::as_deref) != Some(Some(robust.as_str())) {
            update_client_address(&tx, *client_id, robust).await?;
        }
    }

    // the stored value answers "how much is still activatable": the chain
    // figure less everything published-but-unactivated
    for (client_id, dcap) in &chain_datacap {
        let stored = dcap.as_ref().map(|d| {
            let pending = pending_verified_bytes
                .get(client_id)
                .cloned()
                .unwrap_or_default();
            (d - pending).to_string()
        });
        update_client_datacap(&tx, *client_id, stored).await?;
    }

    mark_active_piece_sizes_proven(&tx).await?;
    fail_overdue_proposals(&tx, big_now(), state_tipset.height - EPOCHS_IN_DAY).await?;
    fail_proposals_of_terminated_deals(&tx, big_now()).await?;
    set_market_state(
        &tx,
        state_tipset.height,
        &serde_json::to_string(&state_tipset.key())?,
    )
    .await?;

    tx.commit().await.context("committing reconciliation")?;

    info!(
        known_pieces = piece_ids.len(),
        related_deals = ?totals,
        total_providers = known_provider_count,
        newly_added = new_deal_count,
        newly_terminated = terminated_deal_count,
        "summary"
    );
    Ok(())
}
