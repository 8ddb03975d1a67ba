use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chain::ChainRpc;
use crate::database::queries::{proposals_to_sign, record_signature};
use crate::database::types::SignPendingRow;
use crate::database::writer::Writer;
use crate::fil::ActorId;
use crate::fil::market::{ClientDealProposal, DealProposal};

fn proposal_of(row: &SignPendingRow) -> Result<DealProposal> {
    DealProposal::for_reservation(
        &row.piece_cid,
        row.proposal_label.as_deref(),
        ActorId(row.provider_id as u64),
        ActorId(row.client_id as u64),
        row.start_epoch,
        row.end_epoch,
        row.proxied_log2_size,
        &row.provider_collateral,
    )
}

/// Walks reservations lacking a signature and obtains one from the heavy
/// node's wallet. Single-stream on purpose: signing latency dominates and
/// re-runs only ever see rows still unsigned.
pub async fn run<C: ChainRpc>(
    cancel_token: CancellationToken,
    writer: &Writer,
    chain: &C,
) -> Result<()> {
    let conn = writer.connection();
    let pending = proposals_to_sign(&conn).await?;

    let mut wallets: HashSet<i64> = HashSet::new();
    let mut signed = 0u32;

    for row in &pending {
        if cancel_token.is_cancelled() {
            break;
        }
        wallets.insert(row.client_id);

        let proposal = proposal_of(row)?;
        let raw = proposal
            .to_signing_bytes()
            .with_context(|| format!("encoding proposal {}", row.proposal_uuid))?;

        let client_addr = row
            .client_address
            .clone()
            .unwrap_or_else(|| ActorId(row.client_id as u64).to_string());
        let signature = chain
            .wallet_sign(&client_addr, &raw)
            .await
            .with_context(|| format!("signing proposal {} for {}", row.proposal_uuid, client_addr))?;

        let signed_proposal = ClientDealProposal {
            proposal,
            client_signature: signature.clone(),
        };
        let signed_cid = signed_proposal.signed_cid()?;

        record_signature(
            &conn,
            &row.proposal_uuid,
            Utc::now().timestamp_millis(),
            &serde_json::to_string(&signature)?,
            &signed_cid.to_string(),
        )
        .await?;
        signed += 1;
    }

    info!(
        unique_wallets = wallets.len(),
        successful = signed,
        pending = pending.len(),
        "summary"
    );
    Ok(())
}
