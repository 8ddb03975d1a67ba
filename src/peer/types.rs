use cid::Cid;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::fil::market::{ByteBuf, ClientDealProposal};

/// Storage proposal sub-protocol, boost-specific.
pub const STORAGE_PROPOSAL_PROTOCOL: &str = "/fil/storage/mk/1.2.0";
/// Retrieval transport announcements, boost-specific.
pub const RETRIEVAL_TRANSPORTS_PROTOCOL: &str = "/fil/retrieval/transports/1.0.0";

/// On-wire deal proposal parameters. Map-encoded CBOR with the field names
/// the receiving market node expects.
#[derive(Debug, Clone, Serialize)]
pub struct StorageProposalParams {
    #[serde(rename = "DealUUID", with = "uuid_bytes")]
    pub deal_uuid: Uuid,
    #[serde(rename = "IsOffline")]
    pub is_offline: bool,
    #[serde(rename = "ClientDealProposal")]
    pub client_deal_proposal: ClientDealProposal,
    #[serde(rename = "DealDataRoot")]
    pub deal_data_root: Cid,
    #[serde(rename = "RemoveUnsealedCopy")]
    pub remove_unsealed_copy: bool,
    #[serde(rename = "SkipIPNIAnnounce")]
    pub skip_ipni_announce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageProposalResponse {
    #[serde(rename = "Accepted")]
    pub accepted: bool,
    /// The reason the proposal was rejected; empty on acceptance.
    #[serde(rename = "Message", default)]
    pub message: String,
}

mod uuid_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    use crate::fil::market::ByteBuf;

    pub fn serialize<S: Serializer>(u: &Uuid, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(u.as_bytes())
    }

    #[allow(dead_code)]
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Uuid, D::Error> {
        let b = ByteBuf::deserialize(deserializer)?;
        Uuid::from_slice(&b.0).map_err(serde::de::Error::custom)
    }
}

/// A retrieval transport advertised by the SP: protocol name plus the raw
/// multiaddr bytes it listens on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportProtocol {
    pub name: String,
    pub addresses: Vec<Vec<u8>>,
}

/// Response of the retrieval-transports query. The addresses arrive as a
/// list of byte strings nested inside a list of maps, which generic derive
/// plumbing mangles, hence the hand-written decoder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetrievalTransports {
    pub protocols: Vec<TransportProtocol>,
}

impl<'de> Deserialize<'de> for TransportProtocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = TransportProtocol;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a transport protocol map")
            }
            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut out = TransportProtocol::default();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "Name" => out.name = map.next_value()?,
                        "Addresses" => {
                            let raw: Vec<ByteBuf> = map.next_value()?;
                            out.addresses = raw.into_iter().map(|b| b.0).collect();
                        }
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                Ok(out)
            }
        }
        deserializer.deserialize_map(V)
    }
}

impl<'de> Deserialize<'de> for RetrievalTransports {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = RetrievalTransports;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a retrieval transports response map")
            }
            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut out = RetrievalTransports::default();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "Protocols" => out.protocols = map.next_value()?,
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                Ok(out)
            }
            // some implementations respond with a bare list of protocols
            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut protocols = vec![];
                while let Some(p) = seq.next_element::<TransportProtocol>()? {
                    protocols.push(p);
                }
                Ok(RetrievalTransports { protocols })
            }
        }
        deserializer.deserialize_any(V)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transports_decoder_handles_nested_bytes() {
        let encoded = serde_ipld_dagcbor::to_vec(&serde_json::json!({
            "Protocols": [
                { "Name": "libp2p", "Addresses": [] },
            ]
        }))
        .unwrap();
        let decoded: RetrievalTransports = serde_ipld_dagcbor::from_slice(&encoded).unwrap();
        assert_eq!(decoded.protocols.len(), 1);
        assert_eq!(decoded.protocols[0].name, "libp2p");

        // bytes-of-bytes form, the case the generic path cannot express
        let mut hand_rolled: Vec<u8> = vec![
            0xa1, // map(1)
            0x69, // text(9)
        ];
        hand_rolled.extend(b"Protocols");
        hand_rolled.push(0x81); // array(1)
        hand_rolled.push(0xa2); // map(2)
        hand_rolled.push(0x64); // text(4)
        hand_rolled.extend(b"Name");
        hand_rolled.push(0x62); // text(2)
        hand_rolled.extend(b"gs");
        hand_rolled.push(0x69); // text(9)
        hand_rolled.extend(b"Addresses");
        hand_rolled.push(0x82); // array(2)
        hand_rolled.push(0x42); // bytes(2)
        hand_rolled.extend([0x04, 0x7f]);
        hand_rolled.push(0x41); // bytes(1)
        hand_rolled.extend([0x06]);

        let decoded: RetrievalTransports = serde_ipld_dagcbor::from_slice(&hand_rolled).unwrap();
        assert_eq!(decoded.protocols[0].name, "gs");
        assert_eq!(decoded.protocols[0].addresses, vec![vec![0x04, 0x7f], vec![0x06]]);
    }

    #[test]
    fn proposal_response_decodes() {
        let encoded = serde_ipld_dagcbor::to_vec(&serde_json::json!({
            "Accepted": false,
            "Message": "deal rejected: sealing pipeline full",
        }))
        .unwrap();
        let resp: StorageProposalResponse = serde_ipld_dagcbor::from_slice(&encoded).unwrap();
        assert!(!resp.accepted);
        assert!(resp.message.contains("pipeline full"));
    }
}
