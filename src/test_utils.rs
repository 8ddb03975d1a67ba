use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use chrono::Utc;
use cid::Cid;
use num_bigint::BigInt;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::chain::error::Error as ChainError;
use crate::chain::types::{
    BeaconEntry, BlockHeader, CollateralBounds, MarketDeals, MinerInfo, MiningBaseInfo, TipSet,
    TipSetKey,
};
use crate::chain::ChainRpc;
use crate::database::{Reader, Writer};
use crate::fil::market::{
    FIL_COMMITMENT_UNSEALED, SHA2_256_TRUNC254_PADDED, SIG_TYPE_BLS, Signature,
};
use crate::fil::{ActorId, ChainEpoch, wall_time_epoch};
use crate::poller::{PeerInfo, SpInfo};

pub async fn new_test_db() -> Result<(Reader, Writer, TempDir)> {
    let temp_dir = TempDir::new()?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)?
        .as_nanos()
        .to_string();
    let db_name = format!("test_db_{}.db", timestamp);
    let writer = Writer::new(temp_dir.path(), &db_name).await?;
    let reader = Reader::new(temp_dir.path(), &db_name).await?;
    Ok((reader, writer, temp_dir))
}

/// A commitment-shaped CID derived from an arbitrary seed.
pub fn new_mock_piece_cid(seed: &str) -> Cid {
    let digest = Sha256::digest(seed.as_bytes());
    let mut trunc = [0u8; 32];
    trunc.copy_from_slice(&digest);
    trunc[31] &= 0b0011_1111;
    let mh = cid::multihash::Multihash::wrap(SHA2_256_TRUNC254_PADDED, &trunc)
        .expect("32 bytes always wrap");
    Cid::new_v1(FIL_COMMITMENT_UNSEALED, mh)
}

#[derive(Clone, Copy)]
pub struct TenantRules {
    pub tenant_id: i64,
    pub max_total: i64,
    pub max_per_org: i64,
    pub max_per_city: i64,
    pub max_per_country: i64,
    pub max_per_continent: i64,
    pub max_in_flight_bytes: i64,
    pub exclusive: bool,
}

impl TenantRules {
    pub fn permissive(tenant_id: i64, max_total: i64) -> Self {
        TenantRules {
            tenant_id,
            max_total,
            max_per_org: 1000,
            max_per_city: 1000,
            max_per_country: 1000,
            max_per_continent: 1000,
            max_in_flight_bytes: 1 << 50,
            exclusive: false,
        }
    }
}

pub async fn seed_tenant(conn: &libsql::Connection, rules: TenantRules) -> Result<()> {
    conn.execute(
        "INSERT INTO tenants
            (tenant_id, tenant_name, max_total, max_per_org, max_per_city, max_per_country,
             max_per_continent, max_in_flight_bytes, exclusive_replication,
             deal_duration_days, start_within_hours)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 530, 72)",
        (
            rules.tenant_id,
            format!("tenant-{}", rules.tenant_id),
            rules.max_total,
            rules.max_per_org,
            rules.max_per_city,
            rules.max_per_country,
            rules.max_per_continent,
            rules.max_in_flight_bytes,
            rules.exclusive as i64,
        ),
    )
    .await?;
    Ok(())
}

pub async fn seed_piece(
    conn: &libsql::Connection,
    piece_cid: &Cid,
    log2_size: i64,
    label: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO pieces (piece_cid, piece_log2_size, proposal_label) VALUES (?, ?, ?)",
        (piece_cid.to_string(), log2_size, label),
    )
    .await?;
    Ok(conn.last_insert_rowid())
}

pub async fn claim_piece(conn: &libsql::Connection, tenant_id: i64, piece_id: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO tenant_pieces (tenant_id, piece_id) VALUES (?, ?)",
        (tenant_id, piece_id),
    )
    .await?;
    Ok(())
}

pub async fn seed_client(
    conn: &libsql::Connection,
    client_id: i64,
    tenant_id: i64,
    datacap: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO clients (client_id, client_address, tenant_id, activatable_datacap)
         VALUES (?, ?, ?, ?)",
        (
            client_id,
            ActorId(client_id as u64).to_string(),
            tenant_id,
            datacap,
        ),
    )
    .await?;
    Ok(())
}

pub async fn seed_provider(
    conn: &libsql::Connection,
    provider_id: i64,
    org_id: i64,
    city_id: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO providers (provider_id, org_id, city_id, country_id, continent_id)
         VALUES (?, ?, ?, ?, ?)",
        (provider_id, org_id, city_id, city_id, city_id),
    )
    .await?;
    Ok(())
}

/// Marks the provider as freshly polled with a proposal-capable info blob.
pub async fn seed_provider_info(
    conn: &libsql::Connection,
    provider_id: i64,
    sector_log2_size: u8,
) -> Result<()> {
    let info = SpInfo {
        sector_log2_size,
        peerid: Some("12D3KooWBmWUPFdC5VqLDPw66PPBGhDvGjLxWyDSMYbz8PJxXAvq".to_string()),
        multiaddrs: vec!["/ip4/127.0.0.1/tcp/24001".to_string()],
        peer_info: Some(PeerInfo {
            libp2p_protocols: [(
                crate::peer::types::STORAGE_PROPOSAL_PROTOCOL.to_string(),
                true,
            )]
            .into_iter()
            .collect(),
            agent_version: Some("boost-2.4.0".to_string()),
        }),
        ..Default::default()
    };
    conn.execute(
        "INSERT INTO providers_info (provider_id, provider_last_polled, info)
         VALUES (?, ?, ?)
         ON CONFLICT (provider_id) DO UPDATE SET
            provider_last_polled = EXCLUDED.provider_last_polled,
            info = EXCLUDED.info",
        (
            provider_id,
            Utc::now().timestamp_millis(),
            serde_json::to_string(&info)?,
        ),
    )
    .await?;
    Ok(())
}

pub async fn seed_published_deal(
    conn: &libsql::Connection,
    deal_id: i64,
    piece_id: i64,
    provider_id: i64,
    client_id: i64,
    status: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO published_deals
            (deal_id, client_id, provider_id, piece_id, label, is_filplus, status,
             start_epoch, end_epoch)
         VALUES (?, ?, ?, ?, X'', 1, ?, 3000000, 4000000)",
        (deal_id, client_id, provider_id, piece_id, status),
    )
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct MockChainState {
    pub head_epoch: ChainEpoch,
    /// Defaults to "now", keeping the staleness guard happy.
    pub head_timestamp: Option<u64>,
    pub beacons: HashMap<ChainEpoch, Vec<u8>>,
    pub miner_infos: HashMap<u64, MinerInfo>,
    pub account_keys: HashMap<String, String>,
    pub datacaps: HashMap<String, BigInt>,
    pub market: MarketDeals,
    pub collateral_min_per_gib: String,
    pub eligible_for_mining: HashMap<u64, bool>,
    pub wallet_verify_result: bool,
}

/// In-memory stand-in for the two chain endpoints, teacher-style: every
/// query answered from the shared state map.
#[derive(Clone, Default)]
pub struct MockChain {
    pub state: Arc<Mutex<MockChainState>>,
}

impl MockChain {
    pub fn new() -> Self {
        let mut state = MockChainState {
            head_epoch: wall_time_epoch(Utc::now()),
            collateral_min_per_gib: "1000000000000000".to_string(),
            wallet_verify_result: true,
            ..Default::default()
        };
        state.beacons.insert(
            state.head_epoch,
            b"mock drand randomness for the head".to_vec(),
        );
        MockChain {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn snapshot(&self) -> MockChainState {
        self.state.lock().expect("poisoned").clone()
    }

    fn tipset(&self, height: ChainEpoch, timestamp: u64) -> TipSet {
        TipSet {
            cids: vec![],
            blocks: vec![BlockHeader { timestamp }],
            height,
        }
    }
}

impl ChainRpc for MockChain {
    async fn chain_head(&self) -> Result<TipSet, ChainError> {
        let s = self.snapshot();
        let ts = s
            .head_timestamp
            .unwrap_or_else(|| Utc::now().timestamp() as u64);
        Ok(self.tipset(s.head_epoch, ts))
    }

    async fn tipset_at(&self, epoch: ChainEpoch, _tsk: &TipSetKey) -> Result<TipSet, ChainError> {
        Ok(self.tipset(epoch, 0))
    }

    async fn miner_info(&self, actor: ActorId, _tsk: &TipSetKey) -> Result<MinerInfo, ChainError> {
        self.snapshot()
            .miner_infos
            .get(&actor.0)
            .cloned()
            .ok_or_else(|| ChainError::Unexpected(format!("no mock miner info for {}", actor)))
    }

    async fn account_key(&self, addr: &str, _tsk: &TipSetKey) -> Result<String, ChainError> {
        Ok(self
            .snapshot()
            .account_keys
            .get(addr)
            .cloned()
            .unwrap_or_else(|| addr.to_string()))
    }

    async fn market_deals(&self, _tsk: &TipSetKey) -> Result<MarketDeals, ChainError> {
        Ok(self.snapshot().market)
    }

    async fn verified_client_status(
        &self,
        addr: &str,
        _tsk: &TipSetKey,
    ) -> Result<Option<BigInt>, ChainError> {
        Ok(self.snapshot().datacaps.get(addr).cloned())
    }

    async fn miner_base_info(
        &self,
        actor: ActorId,
        _epoch: ChainEpoch,
        _tsk: &TipSetKey,
    ) -> Result<Option<MiningBaseInfo>, ChainError> {
        Ok(self
            .snapshot()
            .eligible_for_mining
            .get(&actor.0)
            .map(|&eligible| MiningBaseInfo {
                eligible_for_mining: eligible,
            }))
    }

    async fn beacon_entry(&self, epoch: ChainEpoch) -> Result<BeaconEntry, ChainError> {
        self.snapshot()
            .beacons
            .get(&epoch)
            .map(|data| BeaconEntry {
                round: epoch as u64,
                data: data.clone(),
            })
            .ok_or_else(|| ChainError::Unexpected(format!("no mock beacon for epoch {}", epoch)))
    }

    async fn wallet_sign(&self, addr: &str, msg: &[u8]) -> Result<Signature, ChainError> {
        // deterministic per (addr, payload) so signed-cid checks hold
        let digest = Sha256::digest([addr.as_bytes(), msg].concat());
        Ok(Signature {
            sig_type: SIG_TYPE_BLS,
            data: digest.to_vec(),
        })
    }

    async fn wallet_verify(
        &self,
        _addr: &str,
        _msg: &[u8],
        _sig: &Signature,
    ) -> Result<bool, ChainError> {
        Ok(self.snapshot().wallet_verify_result)
    }

    async fn provider_collateral_bounds(
        &self,
        _padded_piece_size: u64,
        _verified: bool,
        _tsk: &TipSetKey,
    ) -> Result<CollateralBounds, ChainError> {
        let s = self.snapshot();
        Ok(CollateralBounds {
            min: s.collateral_min_per_gib,
            max: "0".to_string(),
        })
    }
}
