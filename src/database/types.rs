use bon::Builder;
use serde::{Deserialize, Serialize};

pub trait HasRowId {
    fn id(&self) -> i64;
    fn id_name() -> String;
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct ProviderRow {
    pub provider_id: i64,
    #[builder(default = 0)]
    pub org_id: i64,
    #[builder(default = 0)]
    pub city_id: i64,
    #[builder(default = 0)]
    pub country_id: i64,
    #[builder(default = 0)]
    pub continent_id: i64,
    #[builder(default = 0)]
    pub globally_inactivated: i64,
    #[builder(default = 0)]
    pub ignore_chain_eligibility: i64,
    pub max_in_flight_bytes_override: Option<i64>,
}

impl HasRowId for ProviderRow {
    fn id(&self) -> i64 {
        self.provider_id
    }
    fn id_name() -> String {
        "provider_id".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfoRow {
    pub provider_id: i64,
    pub provider_last_polled: i64,
    pub info_dialing_took_msecs: Option<i64>,
    pub info_dialing_peerid: Option<String>,
    pub info: String,
}

/// One row per tenant claiming a piece, as produced by the realtime
/// eligibility query. Every count reflects active plus pending replicas at
/// the instant of evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantEligibilityRow {
    pub tenant_id: i64,
    pub exclusive_replication: i64,
    pub deal_duration_days: i64,
    pub start_within_hours: i64,

    pub piece_id: i64,
    pub piece_log2_size: i64,
    pub proposal_label: Option<String>,

    pub max_total: i64,
    pub max_per_org: i64,
    pub max_per_city: i64,
    pub max_per_country: i64,
    pub max_per_continent: i64,
    pub max_in_flight_bytes: i64,

    pub cur_total: i64,
    pub cur_in_org: i64,
    pub cur_in_city: i64,
    pub cur_in_country: i64,
    pub cur_in_continent: i64,
    pub cur_in_flight_bytes: i64,

    pub deal_already_exists: i64,
    pub client_id_to_use: Option<i64>,
    pub client_address_to_use: Option<String>,
    pub recently_used_start_epoch: Option<i64>,
}

impl TenantEligibilityRow {
    pub fn piece_size_bytes(&self) -> i64 {
        1 << self.piece_log2_size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct ProposalRow {
    pub proposal_uuid: String,
    pub piece_id: i64,
    pub provider_id: i64,
    pub client_id: i64,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub proxied_log2_size: i64,
    pub provider_collateral: String,
    pub entry_created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignPendingRow {
    pub proposal_uuid: String,
    pub piece_cid: String,
    pub proposal_label: Option<String>,
    pub provider_id: i64,
    pub client_id: i64,
    pub client_address: Option<String>,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub proxied_log2_size: i64,
    pub provider_collateral: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPendingRow {
    pub proposal_uuid: String,
    pub piece_cid: String,
    pub proposal_label: Option<String>,
    pub provider_id: i64,
    pub client_id: i64,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub proxied_log2_size: i64,
    pub provider_collateral: String,
    pub signature: Option<String>,
    pub signed_proposal_cid: Option<String>,
    pub peer_id: Option<String>,
    pub multiaddrs: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingProposalRow {
    pub proposal_uuid: String,
    pub piece_id: i64,
    pub piece_cid: String,
    pub proposal_cid: Option<String>,
    pub start_epoch: i64,
    pub client_id: i64,
    pub tenant_id: i64,
    pub piece_log2_size: i64,
    pub proposal_delivered: Option<i64>,
    pub proposal_failstamp: i64,
    pub error: Option<String>,
    pub is_published: i64,
    pub has_sources_fil_active: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligiblePieceRow {
    pub piece_id: i64,
    pub piece_cid: String,
    pub piece_log2_size: i64,
    /// Comma-joined list of claiming tenant ids, as GROUP_CONCAT emits it.
    pub tenant_ids: String,
    pub has_sources_fil_active: i64,
}

impl EligiblePieceRow {
    pub fn tenant_id_list(&self) -> Vec<i64> {
        self.tenant_ids
            .split(',')
            .filter_map(|t| t.trim().parse().ok())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceSourceRow {
    pub piece_id: i64,
    pub deal_id: i64,
    pub end_epoch: i64,
    pub provider_id: i64,
    pub is_filplus: i64,
    pub decoded_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct PublishedDealRow {
    pub deal_id: i64,
    pub client_id: i64,
    pub provider_id: i64,
    pub piece_id: i64,
    pub label: Vec<u8>,
    pub decoded_label: Option<String>,
    #[builder(default = 1)]
    pub is_filplus: i64,
    pub status: String,
    pub status_meta: Option<String>,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub sector_start_epoch: Option<i64>,
    pub termination_detection_time: Option<i64>,
}

impl HasRowId for PublishedDealRow {
    fn id(&self) -> i64 {
        self.deal_id
    }
    fn id_name() -> String {
        "deal_id".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownDealRow {
    pub deal_id: i64,
    pub piece_id: i64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRow {
    pub client_id: i64,
    pub client_address: Option<String>,
    pub tenant_id: i64,
}
