use std::num::NonZeroUsize;
use std::sync::Mutex;

use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::Utc;
use lru::LruCache;
use regex::Regex;
use std::sync::LazyLock;

use crate::chain::ChainRpc;
use crate::chain::types::BeaconEntry;
use crate::database::types::ProviderRow;
use crate::fil::market::{SIG_TYPE_BLS, Signature};
use crate::fil::{ActorId, CHAIN_FINALITY, wall_time_epoch};
use crate::poller::SpInfo;

pub const AUTH_SCHEME: &str = "FIL-SPID-V0";
pub const SIG_GRACE_EPOCHS: i64 = 3;

static SP_AUTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^FIL-SPID-V0\s+",
        // fil epoch
        r"([0-9]+)\s*;\s*",
        // spID
        r"([ft]0[0-9]+)\s*;",
        // legacy infix, tolerated until contract signing lands everywhere
        r"(?:\s*2\s*;)?\s*",
        // signature
        r"([^; ]+)",
        // optional signed argument
        r"(?:\s*;\s*([^; ]+))?\s*$",
    ))
    .expect("static regex")
});

#[derive(Debug, Clone)]
pub struct Challenge {
    pub raw_header: String,
    pub epoch: i64,
    pub actor: ActorId,
    pub sig_b64: String,
    pub arg_b64: Option<String>,
}

/// Shape-level parse only; epoch freshness and the signature itself are
/// checked separately.
pub fn parse_header(header: &str) -> Result<Challenge, String> {
    let caps = SP_AUTH_RE.captures(header).ok_or_else(|| {
        format!(
            "invalid/unexpected {} Authorization header '{}'",
            AUTH_SCHEME, header
        )
    })?;
    let epoch: i64 = caps[1]
        .parse()
        .map_err(|_| format!("unexpected {} auth epoch '{}'", AUTH_SCHEME, &caps[1]))?;
    let actor: ActorId = caps[2]
        .parse()
        .map_err(|_| format!("unexpected {} auth address '{}'", AUTH_SCHEME, &caps[2]))?;
    Ok(Challenge {
        raw_header: header.to_owned(),
        epoch,
        actor,
        sig_b64: caps[3].to_owned(),
        arg_b64: caps.get(4).map(|m| m.as_str().to_owned()),
    })
}

/// Epoch window guard: headers from the future or older than the grace
/// window are replayable and rejected before any chain work happens.
pub fn check_epoch_window(challenge: &Challenge) -> Result<(), String> {
    let cur = wall_time_epoch(Utc::now());
    if cur < challenge.epoch {
        return Err(format!(
            "{} auth epoch '{}' is in the future",
            AUTH_SCHEME, challenge.epoch
        ));
    }
    if cur - challenge.epoch > SIG_GRACE_EPOCHS {
        return Err(format!(
            "{} auth epoch '{}' is too far in the past",
            AUTH_SCHEME, challenge.epoch
        ));
    }
    Ok(())
}

/// `None` = signature valid; `Some(reason)` = invalid. A chain-gateway
/// error is a hard `Err` and must never be cached as a verdict.
type Verdict = Option<String>;

pub struct AuthCaches {
    beacons: Mutex<LruCache<i64, BeaconEntry>>,
    verdicts: Mutex<LruCache<String, Verdict>>,
}

impl Default for AuthCaches {
    fn default() -> Self {
        AuthCaches {
            beacons: Mutex::new(LruCache::new(
                NonZeroUsize::new((SIG_GRACE_EPOCHS * 4) as usize).expect("nonzero"),
            )),
            verdicts: Mutex::new(LruCache::new(
                NonZeroUsize::new((SIG_GRACE_EPOCHS * 128) as usize).expect("nonzero"),
            )),
        }
    }
}

impl AuthCaches {
    pub fn cached_verdict(&self, raw_header: &str) -> Option<Verdict> {
        self.verdicts
            .lock()
            .expect("poisoned")
            .get(raw_header)
            .cloned()
    }

    pub fn store_verdict(&self, raw_header: &str, verdict: Verdict) {
        self.verdicts
            .lock()
            .expect("poisoned")
            .put(raw_header.to_owned(), verdict);
    }
}

/// Verifies the BLS signature over `0x20 0x20 0x20 ‖ beacon ‖ arg` against
/// the SP's worker key as it stood one finality before the claimed epoch.
pub async fn verify_challenge<C: ChainRpc>(
    chain: &C,
    caches: &AuthCaches,
    challenge: &Challenge,
    arg: &[u8],
) -> Result<Verdict> {
    let sig = match BASE64_STANDARD.decode(&challenge.sig_b64) {
        Ok(sig) => sig,
        Err(_) => {
            return Ok(Some(format!(
                "unexpected {} auth signature encoding '{}'",
                AUTH_SCHEME, challenge.sig_b64
            )));
        }
    };

    let beacon = {
        let cached = caches
            .beacons
            .lock()
            .expect("poisoned")
            .get(&challenge.epoch)
            .cloned();
        match cached {
            Some(b) => b,
            None => {
                let fetched = chain
                    .beacon_entry(challenge.epoch)
                    .await
                    .context("fetching beacon entry")?;
                caches
                    .beacons
                    .lock()
                    .expect("poisoned")
                    .put(challenge.epoch, fetched.clone());
                fetched
            }
        }
    };

    let finality_ts = chain
        .tipset_at(challenge.epoch - CHAIN_FINALITY, &vec![])
        .await
        .context("resolving finality-stable tipset")?;
    let miner_info = chain
        .miner_info(challenge.actor, &finality_ts.key())
        .await
        .context("fetching miner info")?;
    let worker_key = chain
        .account_key(&miner_info.worker, &finality_ts.key())
        .await
        .context("resolving worker account key")?;

    let mut payload = vec![0x20, 0x20, 0x20];
    payload.extend_from_slice(&beacon.data);
    payload.extend_from_slice(arg);

    let sig_matches = chain
        .wallet_verify(
            &worker_key,
            &payload,
            &Signature {
                sig_type: SIG_TYPE_BLS,
                data: sig,
            },
        )
        .await
        .context("verifying wallet signature")?;

    if !sig_matches {
        return Ok(Some(format!(
            "{} signature validation failed for auth header '{}'",
            AUTH_SCHEME, challenge.raw_header
        )));
    }
    Ok(None)
}

/// Everything request handlers get to know about the caller.
#[derive(Debug, Clone)]
pub struct AuthedMeta {
    pub sp: ActorId,
    pub request_uuid: String,
    pub state_epoch: Option<i64>,
    pub provider: Option<ProviderRow>,
    pub sp_info: Option<SpInfo>,
    pub sp_info_last_polled: Option<i64>,
    pub auth_arg: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_shapes() {
        let c = parse_header("FIL-SPID-V0 2347113;f01234;dGVzdHNpZw==").unwrap();
        assert_eq!(c.epoch, 2347113);
        assert_eq!(c.actor, ActorId(1234));
        assert_eq!(c.sig_b64, "dGVzdHNpZw==");
        assert!(c.arg_b64.is_none());

        // optional signed argument
        let c = parse_header("FIL-SPID-V0 99;t055;c2ln;YXJn").unwrap();
        assert_eq!(c.actor, ActorId(55));
        assert_eq!(c.arg_b64.as_deref(), Some("YXJn"));

        // tolerated legacy infix
        let c = parse_header("FIL-SPID-V0 99;f055; 2 ;c2ln").unwrap();
        assert_eq!(c.sig_b64, "c2ln");

        for bad in [
            "",
            "Bearer whatever",
            "FIL-SPID-V0 notanepoch;f01;sig",
            "FIL-SPID-V0 99;f1abc;sig",
            "FIL-SPID-V0 99;f01",
        ] {
            assert!(parse_header(bad).is_err(), "{} should not parse", bad);
        }
    }
}
