pub mod client;
pub mod error;
pub mod lookback;
pub mod types;

pub use client::{ChainRpc, Client};
pub use error::Error;
pub use lookback::{CollateralCache, lookback_tipset};

/// Lotus encodes `[]byte` fields as standard base64 strings.
pub mod b64 {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64_STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
