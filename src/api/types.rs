use chrono::{DateTime, Utc};
use serde::Serialize;

/// Wire error taxonomy. The integer goes out as `error_code`, the slug as
/// `error_slug`; HTTP status is always 403 for semantic refusals and 401
/// for authentication, so proxies cannot rewrite the interesting part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrCode {
    InvalidRequest = 4400,
    UnauthorizedAccess = 4401,
    SystemTemporarilyDisabled = 4503,

    OversizedPiece = 4011,
    StorageProviderSuspended = 4012,
    StorageProviderIneligibleToMine = 4013,
    StorageProviderInfoTooOld = 4014,
    StorageProviderUndialable = 4015,
    StorageProviderUnsupported = 4016,

    UnclaimedPieceCid = 4020,
    ProviderHasReplica = 4021,
    TenantsOutOfDatacap = 4022,
    TooManyReplicas = 4023,
    ProviderAboveMaxInFlight = 4024,
    ReplicationRulesViolation = 4029,

    ExternalReservationRefused = 4030,
}

impl ErrCode {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn slug(self) -> &'static str {
        match self {
            ErrCode::InvalidRequest => "INVALID_REQUEST",
            ErrCode::UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
            ErrCode::SystemTemporarilyDisabled => "SYSTEM_TEMPORARILY_DISABLED",
            ErrCode::OversizedPiece => "OVERSIZED_PIECE",
            ErrCode::StorageProviderSuspended => "SP_SUSPENDED",
            ErrCode::StorageProviderIneligibleToMine => "SP_INELIGIBLE_TO_MINE",
            ErrCode::StorageProviderInfoTooOld => "SP_INFO_TOO_OLD",
            ErrCode::StorageProviderUndialable => "SP_UNDIALABLE",
            ErrCode::StorageProviderUnsupported => "SP_UNSUPPORTED",
            ErrCode::UnclaimedPieceCid => "UNCLAIMED_PIECE_CID",
            ErrCode::ProviderHasReplica => "PROVIDER_HAS_REPLICA",
            ErrCode::TenantsOutOfDatacap => "TENANTS_OUT_OF_DATACAP",
            ErrCode::TooManyReplicas => "TOO_MANY_REPLICAS",
            ErrCode::ProviderAboveMaxInFlight => "PROVIDER_ABOVE_MAX_INFLIGHT",
            ErrCode::ReplicationRulesViolation => "REPLICATION_RULES_VIOLATION",
            ErrCode::ExternalReservationRefused => "EXTERNAL_RESERVATION_REFUSED",
        }
    }
}

/// The structure wrapping every response from the broker.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    pub response_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_state_epoch: Option<i64>,
    pub response_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_slug: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_lines: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_lines: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_entries: Option<usize>,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TenantReplicationState {
    pub tenant_id: i64,
    pub tenant_client_id: Option<String>,

    pub tenant_max_in_flight_bytes: i64,
    pub actual_in_flight_bytes: i64,

    pub tenant_max_total: i64,
    pub tenant_max_per_org: i64,
    pub tenant_max_per_city: i64,
    pub tenant_max_per_country: i64,
    pub tenant_max_per_continent: i64,

    pub actual_total: i64,
    pub actual_within_org: i64,
    pub actual_within_city: i64,
    pub actual_within_country: i64,
    pub actual_within_continent: i64,

    pub sp_holds_qualifying_deal: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ResponseDealRequest {
    pub tenant_replication_states: Vec<TenantReplicationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_start_epoch: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Piece {
    pub piece_cid: String,
    pub padded_piece_size: u64,
    pub tenants: Vec<i64>,
    pub sample_request_cmd: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<FilSourceDag>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DealProposalInfo {
    pub deal_proposal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_proposal_cid: Option<String>,
    pub hours_remaining: i64,
    pub piece_size: i64,
    pub piece_cid: String,
    pub tenant_id: i64,
    pub tenant_client_id: String,
    pub deal_start_time: DateTime<Utc>,
    pub deal_start_epoch: i64,
    pub sample_import_cmd: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<FilSourceDag>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalFailure {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub piece_cid: String,
    pub deal_proposal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_proposal_cid: Option<String>,
    pub tenant_id: i64,
    pub tenant_client_id: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ResponsePendingProposals {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_failures: Vec<ProposalFailure>,
    pub pending_proposals: Vec<DealProposalInfo>,
}

/// An active on-chain copy retrievable over a block-transport protocol.
#[derive(Debug, Clone, Serialize)]
pub struct FilSourceDag {
    pub source_type: &'static str,
    pub deal_id: i64,
    pub provider_id: String,
    pub original_payload_cid: String,
    pub deal_expiration: DateTime<Utc>,
    pub is_filplus: bool,
    pub sample_retrieve_cmd: String,
}

const CID_TRIM_PREFIX: usize = 6;
const CID_TRIM_SUFFIX: usize = 8;

pub fn trim_cid_string(cs: &str) -> String {
    if cs.len() <= CID_TRIM_PREFIX + CID_TRIM_SUFFIX + 2 {
        return cs.to_owned();
    }
    format!(
        "{}~{}",
        &cs[..CID_TRIM_PREFIX],
        &cs[cs.len() - CID_TRIM_SUFFIX..]
    )
}

impl FilSourceDag {
    pub fn new(
        deal_id: i64,
        provider_id: String,
        original_payload_cid: String,
        deal_expiration: DateTime<Utc>,
        is_filplus: bool,
        piece_cid: &str,
    ) -> Self {
        let sample_retrieve_cmd = format!(
            "lotus client retrieve --provider {} --maxPrice 0 --allow-local --car '{}' $(pwd)/{}.car",
            provider_id,
            original_payload_cid,
            trim_cid_string(piece_cid),
        );
        FilSourceDag {
            source_type: "FilecoinDAG",
            deal_id,
            provider_id,
            original_payload_cid,
            deal_expiration,
            is_filplus,
            sample_retrieve_cmd,
        }
    }
}
