use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::admission::ChainEligibilityCache;
use crate::auth::AuthCaches;
use crate::chain::{Client, CollateralCache};
use crate::config::Config;
use crate::database::{Reader, Writer};

/// The one context value threaded through every component; tests build it
/// around mocks instead of reaching for module globals.
#[derive(Clone)]
pub struct Env {
    pub config: Config,
    pub cancel_token: CancellationToken,
    pub reader: Reader,
    pub writer: Writer,
    pub chain: Client,
    /// Serializes all reservation decisions process-wide; held for the span
    /// of one admission transaction only.
    pub reservation_lock: Arc<tokio::sync::Mutex<()>>,
    pub collateral: Arc<CollateralCache>,
    pub auth_caches: Arc<AuthCaches>,
    pub chain_eligibility: Arc<ChainEligibilityCache>,
}
