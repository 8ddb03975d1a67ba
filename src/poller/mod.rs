use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::Utc;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::ChainRpc;
use crate::database::queries::{providers_to_poll, upsert_provider_info};
use crate::database::writer::Writer;
use crate::fil::ActorId;
use crate::peer::PeerNode;
use crate::peer::types::{RETRIEVAL_TRANSPORTS_PROTOCOL, STORAGE_PROPOSAL_PROTOCOL};

/// Reservation requests are refused when the caller's poll record is older
/// than this.
pub const POLLED_SP_INFO_STALE_AFTER_MINUTES: i64 = 15;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PeerInfo {
    /// Advertised protocol set, keyed by protocol name for cheap lookups.
    pub libp2p_protocols: BTreeMap<String, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
}

/// The latest poll result for one SP, stored as a JSON blob on
/// `providers_info` and consumed by admission preconditions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpInfo {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<String>,
    pub sector_log2_size: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peerid: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub multiaddrs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_info: Option<PeerInfo>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub retrieval_protocols: BTreeMap<String, Vec<String>>,
}

impl SpInfo {
    pub fn supports_storage_proposals(&self) -> bool {
        self.peer_info
            .as_ref()
            .is_some_and(|pi| pi.libp2p_protocols.contains_key(STORAGE_PROPOSAL_PROTOCOL))
    }

    pub fn is_dialable(&self) -> bool {
        self.peer_info
            .as_ref()
            .is_some_and(|pi| !pi.libp2p_protocols.is_empty())
    }
}

pub struct PollOptions {
    pub requery_all: bool,
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        PollOptions {
            requery_all: false,
            concurrency: 64,
            timeout: Duration::from_secs(10),
        }
    }
}

struct ProbeResult {
    info: SpInfo,
    local_peer_id: Option<String>,
    dial_took_msecs: Option<i64>,
}

/// Queries metadata of recently-seen storage providers: one throwaway peer
/// host per SP, each probe mutating only its own `providers_info` row.
pub async fn run<C: ChainRpc>(
    cancel_token: CancellationToken,
    writer: &Writer,
    chain: &C,
    opts: PollOptions,
) -> Result<()> {
    let conn = writer.connection();

    let now_ms = Utc::now().timestamp_millis();
    let stale_cutoff = now_ms - POLLED_SP_INFO_STALE_AFTER_MINUTES * 60_000 * 2 / 3;
    let sps = providers_to_poll(
        &conn,
        opts.requery_all,
        now_ms - 24 * 3600 * 1000,
        stale_cutoff,
        now_ms - 3 * 3600 * 1000,
        STORAGE_PROPOSAL_PROTOCOL,
    )
    .await?;

    let total_queried = Arc::new(AtomicI32::new(0));
    let unaddressable = Arc::new(AtomicI32::new(0));
    let undialable = Arc::new(AtomicI32::new(0));
    let lacks_proposal_proto = Arc::new(AtomicI32::new(0));

    info!("about to query state of {} SPs", sps.len());

    let semaphore = Arc::new(Semaphore::new(opts.concurrency));
    let mut probes = JoinSet::new();
    for sp in sps {
        if cancel_token.is_cancelled() {
            break;
        }
        let semaphore = semaphore.clone();
        let chain = chain.clone();
        let conn = conn.clone();
        let timeout = opts.timeout;
        let total_queried = total_queried.clone();
        let unaddressable = unaddressable.clone();
        let undialable = undialable.clone();
        let lacks_proposal_proto = lacks_proposal_proto.clone();

        probes.spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closes");

            let result = probe_sp(&chain, ActorId(sp as u64), timeout).await?;
            total_queried.fetch_add(1, Ordering::Relaxed);
            if result.info.multiaddrs.is_empty() {
                unaddressable.fetch_add(1, Ordering::Relaxed);
            } else if result.info.peer_info.is_none() {
                undialable.fetch_add(1, Ordering::Relaxed);
            } else if !result.info.supports_storage_proposals() {
                lacks_proposal_proto.fetch_add(1, Ordering::Relaxed);
            }

            upsert_provider_info(
                &conn,
                sp,
                Utc::now().timestamp_millis(),
                result.dial_took_msecs,
                result.local_peer_id,
                &serde_json::to_string(&result.info)?,
            )
            .await?;
            Ok::<(), anyhow::Error>(())
        });
    }

    let mut first_err = None;
    while let Some(joined) = probes.join_next().await {
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
        total_queried = total_queried.load(Ordering::Relaxed),
        unaddressable = unaddressable.load(Ordering::Relaxed),
        undialable = undialable.load(Ordering::Relaxed),
        lacks_proposal_proto = lacks_proposal_proto.load(Ordering::Relaxed),
        "summary"
    );

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn probe_sp<C: ChainRpc>(
    chain: &C,
    sp: ActorId,
    timeout: Duration,
) -> Result<ProbeResult> {
    let mut result = ProbeResult {
        info: SpInfo::default(),
        local_peer_id: None,
        dial_took_msecs: None,
    };
    let info = &mut result.info;

    let miner_info = chain
        .miner_info(sp, &vec![])
        .await
        .with_context(|| format!("fetching miner info of {}", sp))?;

    if miner_info.sector_size.count_ones() != 1 {
        info.errors.push(format!(
            "the SectorSize value {} is not a power of 2",
            miner_info.sector_size
        ));
        return Ok(result);
    }
    info.sector_log2_size = miner_info.sector_size.trailing_zeros() as u8;

    let Some(peer_id_str) = miner_info.peer_id else {
        info.errors
            .push("the PeerID field in MinerInfo is not set".to_string());
        return Ok(result);
    };
    let peer_id = match PeerId::from_str(&peer_id_str) {
        Ok(p) => p,
        Err(e) => {
            info.errors.push(format!(
                "the PeerID value '{}' in MinerInfo is malformed: {}",
                peer_id_str, e
            ));
            return Ok(result);
        }
    };
    info.peerid = Some(peer_id_str);

    let mut addrs = vec![];
    for (i, enc) in miner_info.multiaddrs.unwrap_or_default().iter().enumerate() {
        let parsed = BASE64_STANDARD
            .decode(enc)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| Multiaddr::try_from(bytes).map_err(anyhow::Error::from));
        match parsed {
            Ok(ma) => {
                info.multiaddrs.push(ma.to_string());
                addrs.push(ma);
            }
            Err(e) => {
                let w = format!(
                    "multiaddress entry '{}' (#{}) within the MinerInfo of SP {} is malformed: {}",
                    enc, i, sp, e
                );
                warn!("{}", w);
                info.errors.push(w);
            }
        }
    }
    if addrs.is_empty() {
        info.errors.push("no usable multiaddrs in MinerInfo".to_string());
        return Ok(result);
    }

    let mut node = PeerNode::new(timeout, timeout * 2)?;
    result.local_peer_id = Some(node.local_peer_id().to_string());

    let dialed = node.connect(peer_id, addrs, timeout).await;
    match dialed {
        Ok(took) => result.dial_took_msecs = Some(took.as_millis() as i64),
        Err(e) => {
            info.errors.push(e.to_string());
            return Ok(result);
        }
    }

    let identify = match node.identify_info(peer_id, timeout).await {
        Ok(identify) => identify,
        Err(e) => {
            info.errors.push(e.to_string());
            return Ok(result);
        }
    };
    info.peer_info = Some(PeerInfo {
        libp2p_protocols: identify
            .protocols
            .iter()
            .map(|p| (p.to_string(), true))
            .collect(),
        agent_version: Some(identify.agent_version.clone()),
    });

    if info
        .peer_info
        .as_ref()
        .is_some_and(|pi| pi.libp2p_protocols.contains_key(RETRIEVAL_TRANSPORTS_PROTOCOL))
    {
        match node.request_transports(peer_id).await {
            Ok(transports) => {
                for proto in transports.protocols {
                    let mut parsed = vec![];
                    for (i, a) in proto.addresses.iter().enumerate() {
                        match Multiaddr::try_from(a.clone()) {
                            Ok(ma) => parsed.push(ma.to_string()),
                            Err(e) => {
                                let w = format!(
                                    "multiaddress entry '{:x?}' (#{}) for protocol {} is malformed \
                                     in the RetrievalTransports response of SP {}: {}",
                                    a, i, proto.name, sp, e
                                );
                                warn!("{}", w);
                                info.errors.push(w);
                            }
                        }
                    }
                    parsed.sort();
                    info.retrieval_protocols.insert(proto.name, parsed);
                }
            }
            Err(e) => info.errors.push(e.to_string()),
        }
    }

    Ok(result)
}
