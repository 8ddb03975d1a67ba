pub mod market;

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mainnet genesis block unix timestamp.
pub const GENESIS_UNIX: i64 = 1598306400;
pub const EPOCH_DURATION_SECONDS: i64 = 30;
pub const EPOCHS_IN_HOUR: i64 = 3600 / EPOCH_DURATION_SECONDS;
pub const EPOCHS_IN_DAY: i64 = 24 * EPOCHS_IN_HOUR;

/// Number of epochs before miner worker-key changes become effective.
pub const CHAIN_FINALITY: i64 = 900;

/// How far behind head all chain-final reads go.
pub const DEFAULT_LOOKBACK_EPOCHS: i64 = 10;

/// A nul tipset is indistinguishable from loss of sync, do not set too low.
pub const MAX_TIPSETS_BEHIND: i64 = 3;
pub const PROPAGATION_DELAY_SECONDS: i64 = 10;

pub type ChainEpoch = i64;

/// A short-form chain identity (`f0...`/`t0...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub u64);

impl Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f0{}", self.0)
    }
}

impl FromStr for ActorId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() < 3 || (&s[..2] != "f0" && &s[..2] != "t0") {
            return Err(anyhow!("input '{}' does not have expected prefix", s));
        }
        let val: u64 = s[2..]
            .parse()
            .map_err(|e| anyhow!("unable to parse value of input '{}': {}", s, e))?;
        Ok(ActorId(val))
    }
}

impl ActorId {
    /// Filecoin binary address form: ID protocol byte followed by the
    /// uvarint-encoded actor number.
    pub fn to_address_bytes(&self) -> Vec<u8> {
        let mut out = vec![0x00];
        let mut v = self.0;
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        out
    }
}

pub fn mainnet_time(epoch: ChainEpoch) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch * EPOCH_DURATION_SECONDS + GENESIS_UNIX, 0)
        .expect("mainnet epochs stay well within chrono range")
}

pub fn wall_time_epoch(t: DateTime<Utc>) -> ChainEpoch {
    (t.timestamp() - GENESIS_UNIX) / EPOCH_DURATION_SECONDS
}

/// Failstamp resolution: nanoseconds since the unix epoch.
pub fn big_now() -> i64 {
    Utc::now()
        .timestamp_nanos_opt()
        .expect("wall clock within nanosecond range")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_id_round_trip() {
        let a: ActorId = "f01234".parse().unwrap();
        assert_eq!(a, ActorId(1234));
        assert_eq!(a.to_string(), "f01234");
        let t: ActorId = "t0999".parse().unwrap();
        assert_eq!(t.0, 999);
        assert!("f1abc".parse::<ActorId>().is_err());
        assert!("f0".parse::<ActorId>().is_err());
        assert!("f0xyz".parse::<ActorId>().is_err());
    }

    #[test]
    fn id_address_bytes() {
        assert_eq!(ActorId(1).to_address_bytes(), vec![0x00, 0x01]);
        assert_eq!(ActorId(1234).to_address_bytes(), vec![0x00, 0xd2, 0x09]);
    }

    #[test]
    fn epoch_math() {
        let t = mainnet_time(0);
        assert_eq!(t.timestamp(), GENESIS_UNIX);
        assert_eq!(wall_time_epoch(mainnet_time(100)), 100);
        assert_eq!(
            wall_time_epoch(mainnet_time(100) + chrono::Duration::seconds(29)),
            100
        );
        assert_eq!(
            wall_time_epoch(mainnet_time(100) + chrono::Duration::seconds(30)),
            101
        );
    }
}
