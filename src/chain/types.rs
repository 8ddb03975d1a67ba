use std::collections::HashMap;

use cid::Cid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::fil::ChainEpoch;

/// Lotus renders CIDs as `{"/": "bafy..."}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LotusCid(pub Cid);

impl Serialize for LotusCid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut m = std::collections::BTreeMap::new();
        m.insert("/", self.0.to_string());
        m.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LotusCid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Slash {
            #[serde(rename = "/")]
            v: String,
        }
        let s = Slash::deserialize(deserializer)?;
        Ok(LotusCid(s.v.parse().map_err(serde::de::Error::custom)?))
    }
}

/// The tipset key as it appears on the wire: the block CIDs in order.
pub type TipSetKey = Vec<LotusCid>;

#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeader {
    #[serde(rename = "Timestamp")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TipSet {
    #[serde(rename = "Cids")]
    pub cids: TipSetKey,
    #[serde(rename = "Blocks")]
    pub blocks: Vec<BlockHeader>,
    #[serde(rename = "Height")]
    pub height: ChainEpoch,
}

impl TipSet {
    pub fn key(&self) -> TipSetKey {
        self.cids.clone()
    }

    /// Wall-clock second of the first block, the canonical tipset timestamp.
    pub fn timestamp(&self) -> Option<u64> {
        self.blocks.first().map(|b| b.timestamp)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeaconEntry {
    #[serde(rename = "Round")]
    pub round: u64,
    #[serde(rename = "Data", with = "super::b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerInfo {
    #[serde(rename = "Worker")]
    pub worker: String,
    #[serde(rename = "PeerId")]
    pub peer_id: Option<String>,
    #[serde(rename = "Multiaddrs")]
    pub multiaddrs: Option<Vec<String>>,
    #[serde(rename = "SectorSize")]
    pub sector_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MiningBaseInfo {
    #[serde(rename = "EligibleForMining", default)]
    pub eligible_for_mining: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDealProposal {
    #[serde(rename = "PieceCID")]
    pub piece_cid: LotusCid,
    #[serde(rename = "PieceSize")]
    pub piece_size: u64,
    #[serde(rename = "VerifiedDeal")]
    pub verified_deal: bool,
    #[serde(rename = "Client")]
    pub client: String,
    #[serde(rename = "Provider")]
    pub provider: String,
    #[serde(rename = "Label")]
    pub label: serde_json::Value,
    #[serde(rename = "StartEpoch")]
    pub start_epoch: ChainEpoch,
    #[serde(rename = "EndEpoch")]
    pub end_epoch: ChainEpoch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDealState {
    #[serde(rename = "SectorStartEpoch")]
    pub sector_start_epoch: ChainEpoch,
    #[serde(rename = "LastUpdatedEpoch")]
    pub last_updated_epoch: ChainEpoch,
    #[serde(rename = "SlashEpoch")]
    pub slash_epoch: ChainEpoch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDeal {
    #[serde(rename = "Proposal")]
    pub proposal: MarketDealProposal,
    #[serde(rename = "State")]
    pub state: MarketDealState,
}

/// `StateMarketDeals` returns the whole market actor state keyed by the
/// decimal deal id; tens of MB on mainnet.
pub type MarketDeals = HashMap<String, MarketDeal>;

#[derive(Debug, Clone, Deserialize)]
pub struct CollateralBounds {
    #[serde(rename = "Min")]
    pub min: String,
    #[serde(rename = "Max")]
    pub max: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    pub params: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorDetail {
    pub code: i64,
    pub message: String,
}
