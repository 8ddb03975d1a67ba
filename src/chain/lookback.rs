use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::Utc;
use lru::LruCache;

use crate::fil::market::TokenAmount;
use crate::fil::{
    ChainEpoch, EPOCH_DURATION_SECONDS, MAX_TIPSETS_BEHIND, PROPAGATION_DELAY_SECONDS,
};

use super::client::ChainRpc;
use super::error::Error;
use super::types::TipSet;

/// The state against which all chain-final reads run: `head - lookback`,
/// refused outright when the node's view of the world has drifted.
pub async fn lookback_tipset<C: ChainRpc>(
    chain: &C,
    lookback_epochs: ChainEpoch,
) -> Result<TipSet, Error> {
    let head = chain.chain_head().await?;

    let wall_unix = Utc::now().timestamp();
    let fil_unix = head
        .timestamp()
        .ok_or_else(|| Error::Unexpected("chain head tipset carries no blocks".to_string()))?
        as i64;

    // couple seconds of clock-drift tolerance on the lagging side
    if wall_unix < fil_unix - 2
        || wall_unix
            > fil_unix + PROPAGATION_DELAY_SECONDS + MAX_TIPSETS_BEHIND * EPOCH_DURATION_SECONDS
    {
        return Err(Error::StaleChain(format!(
            "chain head reports unixtime {} (height: {}) while walltime is {} (delta: {}s)",
            fil_unix,
            head.height,
            wall_unix,
            wall_unix - fil_unix,
        )));
    }

    chain
        .tipset_at(head.height - lookback_epochs, &head.key())
        .await
}

/// Collateral estimates change slowly and the admission path calls this with
/// day-rounded epochs, so a handful of entries is plenty.
pub struct CollateralCache {
    cache: Mutex<LruCache<ChainEpoch, TokenAmount>>,
}

impl Default for CollateralCache {
    fn default() -> Self {
        CollateralCache {
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(128).expect("nonzero"))),
        }
    }
}

impl CollateralCache {
    /// Minimum provider collateral for 1 GiB verified at `source_epoch`,
    /// inflated 1.7x so state fluctuation between reservation and publishing
    /// does not invalidate the proposal. Callers scale by piece size with
    /// [`TokenAmount::scale_gib`].
    pub async fn collateral_per_gib<C: ChainRpc>(
        &self,
        chain: &C,
        source_epoch: ChainEpoch,
    ) -> Result<TokenAmount, Error> {
        if let Some(hit) = self.cache.lock().expect("poisoned").get(&source_epoch) {
            return Ok(hit.clone());
        }

        let ts = chain.tipset_at(source_epoch, &vec![]).await?;
        let bounds = chain
            .provider_collateral_bounds(1 << 30, true, &ts.key())
            .await?;
        let min = TokenAmount::from_decimal(&bounds.min)
            .map_err(|e| Error::Unexpected(e.to_string()))?;
        let inflated = TokenAmount((min.0 * 17) / 10);

        self.cache
            .lock()
            .expect("poisoned")
            .put(source_epoch, inflated.clone());
        Ok(inflated)
    }
}
