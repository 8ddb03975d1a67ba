use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use cid::Cid;
use libsql::Connection;
use tracing::info;
use uuid::Uuid;

use crate::api::types::{ErrCode, TenantReplicationState};
use crate::chain::{ChainRpc, CollateralCache, lookback_tipset};
use crate::database::queries::{insert_proposal, piece_eligibility};
use crate::database::types::{ProposalRow, ProviderRow, TenantEligibilityRow};
use crate::fil::{self, ChainEpoch, EPOCHS_IN_DAY, EPOCHS_IN_HOUR, wall_time_epoch};

/// One reservation decision: either a queued proposal or the most specific
/// refusal the competing tenant rules produce.
#[derive(Debug)]
pub enum Outcome {
    Granted {
        proposal_uuid: Uuid,
        start_epoch: ChainEpoch,
        states: Vec<TenantReplicationState>,
    },
    Refused {
        code: ErrCode,
        message: String,
        states: Vec<TenantReplicationState>,
    },
}

const CHAIN_ELIGIBILITY_TTL: Duration = Duration::from_secs(60);

/// Short-TTL verdict cache for the chain-side mining-eligibility probe.
/// Chain-independent factors (suspension) are never cached.
#[derive(Default)]
pub struct ChainEligibilityCache {
    inner: Mutex<HashMap<u64, (Instant, Option<ErrCode>)>>,
}

pub async fn sp_ineligible_code<C: ChainRpc>(
    chain: &C,
    cache: &ChainEligibilityCache,
    provider: Option<&ProviderRow>,
    lookback_epochs: i64,
) -> Result<Option<ErrCode>> {
    let Some(provider) = provider else {
        return Ok(Some(ErrCode::StorageProviderSuspended));
    };
    if provider.globally_inactivated != 0 {
        return Ok(Some(ErrCode::StorageProviderSuspended));
    }
    if provider.ignore_chain_eligibility != 0 {
        return Ok(None);
    }

    let sp_id = provider.provider_id as u64;
    if let Some((at, verdict)) = cache.inner.lock().expect("poisoned").get(&sp_id) {
        if at.elapsed() < CHAIN_ELIGIBILITY_TTL {
            return Ok(*verdict);
        }
    }

    let ts = lookback_tipset(chain, lookback_epochs).await?;
    let mbi = chain
        .miner_base_info(fil::ActorId(sp_id), ts.height, &ts.key())
        .await?;
    let verdict = match mbi {
        Some(mbi) if mbi.eligible_for_mining => None,
        _ => Some(ErrCode::StorageProviderIneligibleToMine),
    };
    cache
        .inner
        .lock()
        .expect("poisoned")
        .insert(sp_id, (Instant::now(), verdict));
    Ok(verdict)
}

pub fn ineligible_sp_msg(sp: fil::ActorId) -> String {
    format!(
        "
At the time of this request storage provider {} is not eligible to use this API
( this state is almost certainly *temporary* )

Make sure that you:
- Have registered your SP in accordance with each individual tenant
- Are continuing to serve previously onboarded datasets reliably and free of charge
- Have sufficient quality-adjusted power to participate in block rewards
- Have not faulted in the past 48h
",
        sp,
    )
}

fn replication_state(row: &TenantEligibilityRow) -> TenantReplicationState {
    TenantReplicationState {
        tenant_id: row.tenant_id,
        tenant_client_id: row.client_id_to_use.map(|c| fil::ActorId(c as u64).to_string()),
        tenant_max_in_flight_bytes: row.max_in_flight_bytes,
        actual_in_flight_bytes: row.cur_in_flight_bytes,
        tenant_max_total: row.max_total,
        tenant_max_per_org: row.max_per_org,
        tenant_max_per_city: row.max_per_city,
        tenant_max_per_country: row.max_per_country,
        tenant_max_per_continent: row.max_per_continent,
        actual_total: row.cur_total,
        actual_within_org: row.cur_in_org,
        actual_within_city: row.cur_in_city,
        actual_within_country: row.cur_in_country,
        actual_within_continent: row.cur_in_continent,
        sp_holds_qualifying_deal: row.deal_already_exists != 0,
    }
}

/// The transactional heart of the broker. Holds the process-wide
/// reservation lock for the duration of one evaluation + insert, so
/// concurrent requests observe each other's reservations and quotas can
/// never be overshot.
#[allow(clippy::too_many_arguments)]
pub async fn evaluate<C: ChainRpc>(
    conn: &Connection,
    chain: &C,
    collateral: &CollateralCache,
    reservation_lock: &tokio::sync::Mutex<()>,
    provider: &ProviderRow,
    sector_log2_size: i64,
    piece_cid: &Cid,
    tenant_filter: i64,
    lookback_epochs: i64,
) -> Result<Outcome> {
    let _guard = reservation_lock.lock().await;

    let now = Utc::now();
    let cur_epoch = wall_time_epoch(now);
    let piece_cid_str = piece_cid.to_string();

    let tx = conn
        .transaction()
        .await
        .context("opening reservation transaction")?;

    let rows = piece_eligibility(&tx, provider, &piece_cid_str, tenant_filter, cur_epoch).await?;

    if rows.is_empty() {
        return Ok(Outcome::Refused {
            code: ErrCode::UnclaimedPieceCid,
            message: format!("Piece {} is not claimed by any selected tenant", piece_cid),
            states: vec![],
        });
    }

    if rows[0].piece_size_bytes() > 1 << sector_log2_size {
        return Ok(Outcome::Refused {
            code: ErrCode::OversizedPiece,
            message: format!(
                "Piece {} weighing {} GiB is larger than the {} GiB sector size your SP supports",
                piece_cid,
                rows[0].piece_size_bytes() >> 30,
                1i64 << (sector_log2_size - 30),
            ),
            states: vec![],
        });
    }

    let mut count_no_datacap = 0;
    let mut count_already_dealt = 0;
    let mut count_over_replicated = 0;
    let mut count_over_pending = 0;
    let mut chosen: Option<&TenantEligibilityRow> = None;
    let mut states: Vec<TenantReplicationState> = Vec::with_capacity(rows.len());

    for row in &rows {
        states.push(replication_state(row));

        let mut invalidated = false;
        if row.client_id_to_use.is_none() {
            count_no_datacap += 1;
            invalidated = true;
        }
        if row.deal_already_exists != 0 {
            count_already_dealt += 1;
            invalidated = true;
        }
        if row.cur_total >= row.max_total
            || row.cur_in_org >= row.max_per_org
            || row.cur_in_city >= row.max_per_city
            || row.cur_in_country >= row.max_per_country
            || row.cur_in_continent >= row.max_per_continent
        {
            count_over_replicated += 1;
            invalidated = true;
        }
        if row.cur_in_flight_bytes + row.piece_size_bytes() > row.max_in_flight_bytes {
            count_over_pending += 1;
            invalidated = true;
        }

        if !invalidated && chosen.is_none() {
            chosen = Some(row);
        }
    }

    let Some(chosen) = chosen else {
        // a mixed refusal has no single theme, hence the catch-all last
        let (code, message) = if rows.len() == count_already_dealt {
            (
                ErrCode::ProviderHasReplica,
                format!(
                    "Provider already has proposed or active replica for {} according to all selected replication rules",
                    piece_cid,
                ),
            )
        } else if rows.len() == count_no_datacap {
            (
                ErrCode::TenantsOutOfDatacap,
                format!("All selected tenants with claim to {} are out of DataCap 🙀", piece_cid),
            )
        } else if rows.len() == count_over_replicated {
            (
                ErrCode::TooManyReplicas,
                format!("Piece {} is over-replicated according to all selected replication rules", piece_cid),
            )
        } else if rows.len() == count_over_pending {
            (
                ErrCode::ProviderAboveMaxInFlight,
                "Provider has more proposals in-flight than permitted by selected tenant rules".to_string(),
            )
        } else {
            (
                ErrCode::ReplicationRulesViolation,
                format!(
                    "None of the selected tenants would grant a deal for {} according to their individual rules",
                    piece_cid,
                ),
            )
        };
        return Ok(Outcome::Refused { code, message, states });
    };

    let start_epoch = match chosen.recently_used_start_epoch {
        Some(e) => e,
        None => wall_time_epoch(now + chrono::Duration::hours(chosen.start_within_hours)),
    };
    let end_epoch = start_epoch + chosen.deal_duration_days * EPOCHS_IN_DAY;

    // round down to a day boundary; derived from start_epoch so that retry
    // deals come out byte-identical
    let collateral_epoch = ((start_epoch
        - lookback_epochs
        - EPOCHS_IN_HOUR * chosen.start_within_hours)
        / EPOCHS_IN_DAY)
        * EPOCHS_IN_DAY;
    let per_gib = collateral.collateral_per_gib(chain, collateral_epoch).await?;
    let provider_collateral = per_gib.scale_gib(chosen.piece_size_bytes() as u64);

    let proposal_uuid = Uuid::new_v4();
    let client_id = chosen
        .client_id_to_use
        .expect("chosen tenant always carries a funded client");

    insert_proposal(
        &tx,
        ProposalRow::builder()
            .proposal_uuid(proposal_uuid.to_string())
            .piece_id(chosen.piece_id)
            .provider_id(provider.provider_id)
            .client_id(client_id)
            .start_epoch(start_epoch)
            .end_epoch(end_epoch)
            .proxied_log2_size(chosen.piece_log2_size)
            .provider_collateral(provider_collateral.to_decimal())
            .entry_created(now.timestamp_millis())
            .build(),
    )
    .await?;

    tx.commit().await.context("committing reservation")?;

    info!(
        piece = %piece_cid,
        provider = %fil::ActorId(provider.provider_id as u64),
        tenant = chosen.tenant_id,
        %proposal_uuid,
        start_epoch,
        "reservation granted"
    );

    // bump the counts where applicable and return the post-insert view
    let piece_size = chosen.piece_size_bytes();
    for (i, row) in rows.iter().enumerate() {
        if row.exclusive_replication != 0 && row.tenant_id != chosen.tenant_id {
            continue;
        }
        let s = &mut states[i];
        s.actual_total += 1;
        s.actual_within_org += 1;
        s.actual_within_city += 1;
        s.actual_within_country += 1;
        s.actual_within_continent += 1;
        s.sp_holds_qualifying_deal = true;
        s.actual_in_flight_bytes += piece_size;
    }

    Ok(Outcome::Granted {
        proposal_uuid,
        start_epoch,
        states,
    })
}
