use anyhow::{Result, anyhow};
use cid::Cid;
use cid::multibase::Base;
use num_bigint::{BigInt, Sign};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::{ActorId, ChainEpoch};

/// Piece or sector data commitment merkle root (CommP / CommD).
pub const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;
/// SHA2-256 truncated to 254 bits, as used for Filecoin proving trees.
pub const SHA2_256_TRUNC254_PADDED: u64 = 0x1012;

const DAG_CBOR: u64 = 0x71;
const SHA2_256: u64 = 0x12;

pub const SIG_TYPE_SECP256K1: u8 = 1;
pub const SIG_TYPE_BLS: u8 = 2;

/// Checks that a CID is a well-formed piece commitment.
pub fn validate_piece_cid(c: &Cid) -> Result<()> {
    if c.codec() != FIL_COMMITMENT_UNSEALED || c.hash().code() != SHA2_256_TRUNC254_PADDED {
        return Err(anyhow!(
            "cid '{}' does not have expected codec ({:#x}) and multihash ({:#x})",
            c,
            FIL_COMMITMENT_UNSEALED,
            SHA2_256_TRUNC254_PADDED,
        ));
    }
    Ok(())
}

/// The label applied to outgoing proposals: CIDv1 labels are re-encoded in
/// base64url multibase, anything else goes out verbatim.
pub fn proposal_label(raw: &str) -> Result<Label> {
    if let Ok(c) = Cid::try_from(raw) {
        if c.version() == cid::Version::V1 {
            return Ok(Label::Text(
                c.to_string_of_base(Base::Base64Url)
                    .map_err(|e| anyhow!("re-encoding label cid '{}': {}", raw, e))?,
            ));
        }
    }
    Ok(Label::Text(raw.to_owned()))
}

/// Chain-native token quantity in attoFIL, arbitrary precision.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenAmount(pub BigInt);

impl TokenAmount {
    pub fn zero() -> Self {
        TokenAmount(BigInt::from(0))
    }

    pub fn from_decimal(s: &str) -> Result<Self> {
        Ok(TokenAmount(
            s.parse()
                .map_err(|e| anyhow!("'{}' is not a decimal bigint: {}", s, e))?,
        ))
    }

    pub fn to_decimal(&self) -> String {
        self.0.to_string()
    }

    /// `(self * piece_bytes) >> 30`, the GiB-scaled form used for collateral.
    pub fn scale_gib(&self, piece_bytes: u64) -> TokenAmount {
        TokenAmount((&self.0 * BigInt::from(piece_bytes)) >> 30)
    }

    /// Chain wire form: empty bytes for zero, otherwise a sign byte followed
    /// by the big-endian magnitude.
    fn to_sign_bytes(&self) -> Vec<u8> {
        let (sign, mag) = self.0.to_bytes_be();
        match sign {
            Sign::NoSign => vec![],
            Sign::Plus => [vec![0x00], mag].concat(),
            Sign::Minus => [vec![0x01], mag].concat(),
        }
    }

    fn from_sign_bytes(b: &[u8]) -> Result<Self> {
        match b.split_first() {
            None => Ok(TokenAmount::zero()),
            Some((0x00, mag)) => Ok(TokenAmount(BigInt::from_bytes_be(Sign::Plus, mag))),
            Some((0x01, mag)) => Ok(TokenAmount(BigInt::from_bytes_be(Sign::Minus, mag))),
            Some((b, _)) => Err(anyhow!("invalid bigint sign byte {:#x}", b)),
        }
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_sign_bytes())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let b = ByteBuf::deserialize(deserializer)?;
        TokenAmount::from_sign_bytes(&b.0).map_err(de::Error::custom)
    }
}

/// Byte-string deserialization shim: dag-cbor hands byte strings to
/// `visit_byte_buf`, which `Vec<u8>` alone does not accept.
pub struct ByteBuf(pub Vec<u8>);

impl<'de> Deserialize<'de> for ByteBuf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = ByteBuf;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a byte string")
            }
            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<ByteBuf, E> {
                Ok(ByteBuf(v.to_vec()))
            }
            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<ByteBuf, E> {
                Ok(ByteBuf(v))
            }
        }
        deserializer.deserialize_byte_buf(V)
    }
}

/// A deal label is either a utf8 string or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Text(String),
    Bytes(Vec<u8>),
}

impl Label {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Label::Text(s) => s.as_bytes(),
            Label::Bytes(b) => b,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Label::Text(s) => Some(s),
            Label::Bytes(_) => None,
        }
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Label::Text(s) => serializer.serialize_str(s),
            Label::Bytes(b) => serializer.serialize_bytes(b),
        }
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Label;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a string or byte-string label")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<Label, E> {
                Ok(Label::Text(v.to_owned()))
            }
            fn visit_string<E: de::Error>(self, v: String) -> Result<Label, E> {
                Ok(Label::Text(v))
            }
            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Label, E> {
                Ok(Label::Bytes(v.to_vec()))
            }
            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Label, E> {
                Ok(Label::Bytes(v))
            }
        }
        deserializer.deserialize_any(V)
    }
}

/// Wallet signature, worker keys are always BLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(rename = "Type")]
    pub sig_type: u8,
    #[serde(rename = "Data", with = "crate::chain::b64")]
    pub data: Vec<u8>,
}

impl Signature {
    fn to_wire_bytes(&self) -> Vec<u8> {
        [&[self.sig_type][..], &self.data].concat()
    }

    fn from_wire_bytes(b: &[u8]) -> Result<Self> {
        match b.split_first() {
            Some((t @ &(SIG_TYPE_SECP256K1 | SIG_TYPE_BLS), data)) => Ok(Signature {
                sig_type: *t,
                data: data.to_vec(),
            }),
            _ => Err(anyhow!("malformed signature wire bytes")),
        }
    }
}

struct SignatureSer<'a>(&'a Signature);

impl Serialize for SignatureSer<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0.to_wire_bytes())
    }
}

struct AddressSer<'a>(&'a ActorId);

impl Serialize for AddressSer<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0.to_address_bytes())
    }
}

fn actor_id_from_address_bytes(b: &[u8]) -> Result<ActorId> {
    let Some((0x00, mut rest)) = b.split_first() else {
        return Err(anyhow!("not an ID-protocol address"));
    };
    let mut v: u64 = 0;
    let mut shift = 0;
    loop {
        let Some((byte, tail)) = rest.split_first() else {
            return Err(anyhow!("truncated uvarint in address"));
        };
        v |= ((byte & 0x7f) as u64) << shift;
        rest = tail;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(ActorId(v))
}

/// The market-actor deal proposal. Wire encoding is the canonical dag-cbor
/// tuple in field order, which is also what gets signed.
#[derive(Debug, Clone, PartialEq)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: u64,
    pub verified_deal: bool,
    pub client: ActorId,
    pub provider: ActorId,
    pub label: Label,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: TokenAmount,
    pub provider_collateral: TokenAmount,
    pub client_collateral: TokenAmount,
}

impl Serialize for DealProposal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            &self.piece_cid,
            &self.piece_size,
            &self.verified_deal,
            AddressSer(&self.client),
            AddressSer(&self.provider),
            &self.label,
            &self.start_epoch,
            &self.end_epoch,
            &self.storage_price_per_epoch,
            &self.provider_collateral,
            &self.client_collateral,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DealProposal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[allow(clippy::type_complexity)]
        let (
            piece_cid,
            piece_size,
            verified_deal,
            client,
            provider,
            label,
            start_epoch,
            end_epoch,
            storage_price_per_epoch,
            provider_collateral,
            client_collateral,
        ): (Cid, u64, bool, ByteBuf, ByteBuf, Label, i64, i64, TokenAmount, TokenAmount, TokenAmount) =
            Deserialize::deserialize(deserializer)?;
        Ok(DealProposal {
            piece_cid,
            piece_size,
            verified_deal,
            client: actor_id_from_address_bytes(&client.0).map_err(de::Error::custom)?,
            provider: actor_id_from_address_bytes(&provider.0).map_err(de::Error::custom)?,
            label,
            start_epoch,
            end_epoch,
            storage_price_per_epoch,
            provider_collateral,
            client_collateral,
        })
    }
}

impl DealProposal {
    pub fn to_signing_bytes(&self) -> Result<Vec<u8>> {
        serde_ipld_dagcbor::to_vec(self).map_err(|e| anyhow!("dag-cbor encoding proposal: {}", e))
    }

    /// Rebuilds the exact proposal a reservation stands for. Deterministic
    /// given the same stored fields, which is what keeps re-signing and
    /// re-delivery byte-stable across runs.
    #[allow(clippy::too_many_arguments)]
    pub fn for_reservation(
        piece_cid: &str,
        label: Option<&str>,
        provider: ActorId,
        client: ActorId,
        start_epoch: ChainEpoch,
        end_epoch: ChainEpoch,
        piece_log2_size: i64,
        provider_collateral: &str,
    ) -> Result<Self> {
        Ok(DealProposal {
            piece_cid: Cid::try_from(piece_cid)
                .map_err(|e| anyhow!("stored piece cid '{}' invalid: {}", piece_cid, e))?,
            piece_size: 1u64 << piece_log2_size,
            verified_deal: true,
            client,
            provider,
            label: proposal_label(label.unwrap_or_default())?,
            start_epoch,
            end_epoch,
            storage_price_per_epoch: TokenAmount::zero(),
            provider_collateral: TokenAmount::from_decimal(provider_collateral)?,
            client_collateral: TokenAmount::zero(),
        })
    }
}

/// Normalizes any CID to its v1 form, the way labels are compared and
/// rendered everywhere in the broker.
pub fn cid_v1(c: Cid) -> Cid {
    match c.version() {
        cid::Version::V1 => c,
        // v0 is implicitly dag-pb + sha2-256
        cid::Version::V0 => Cid::new_v1(0x70, *c.hash()),
    }
}

/// A proposal together with the client wallet signature over its encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    pub client_signature: Signature,
}

impl Serialize for ClientDealProposal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.proposal, SignatureSer(&self.client_signature)).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClientDealProposal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (proposal, sig): (DealProposal, ByteBuf) = Deserialize::deserialize(deserializer)?;
        Ok(ClientDealProposal {
            proposal,
            client_signature: Signature::from_wire_bytes(&sig.0).map_err(de::Error::custom)?,
        })
    }
}

impl ClientDealProposal {
    /// CID of the signed container. Stable for an unchanged payload, which is
    /// what lets the tracker cross-reference mangled re-publications.
    pub fn signed_cid(&self) -> Result<Cid> {
        let bytes = serde_ipld_dagcbor::to_vec(self)
            .map_err(|e| anyhow!("dag-cbor encoding signed proposal: {}", e))?;
        let digest = Sha256::digest(&bytes);
        let mh = cid::multihash::Multihash::wrap(SHA2_256, &digest)
            .map_err(|e| anyhow!("wrapping multihash: {}", e))?;
        Ok(Cid::new_v1(DAG_CBOR, mh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fil::EPOCHS_IN_DAY;

    fn test_piece_cid() -> Cid {
        let digest = Sha256::digest(b"not a real commP but the right shape");
        let mut trunc = [0u8; 32];
        trunc.copy_from_slice(&digest);
        trunc[31] &= 0b0011_1111;
        let mh = cid::multihash::Multihash::wrap(SHA2_256_TRUNC254_PADDED, &trunc).unwrap();
        Cid::new_v1(FIL_COMMITMENT_UNSEALED, mh)
    }

    fn test_proposal() -> DealProposal {
        DealProposal {
            piece_cid: test_piece_cid(),
            piece_size: 1 << 35,
            verified_deal: true,
            client: ActorId(1442),
            provider: ActorId(1234),
            label: Label::Text("uAXESIJq1".into()),
            start_epoch: 3_000_000,
            end_epoch: 3_000_000 + 530 * EPOCHS_IN_DAY,
            storage_price_per_epoch: TokenAmount::zero(),
            provider_collateral: TokenAmount::from_decimal("19382716049382716").unwrap(),
            client_collateral: TokenAmount::zero(),
        }
    }

    #[test]
    fn piece_cid_validation() {
        assert!(validate_piece_cid(&test_piece_cid()).is_ok());
        let digest = Sha256::digest(b"whatever");
        let mh = cid::multihash::Multihash::wrap(SHA2_256, &digest).unwrap();
        let plain = Cid::new_v1(DAG_CBOR, mh);
        assert!(validate_piece_cid(&plain).is_err());
    }

    #[test]
    fn token_amount_sign_bytes() {
        assert_eq!(TokenAmount::zero().to_sign_bytes(), Vec::<u8>::new());
        let one = TokenAmount(BigInt::from(1));
        assert_eq!(one.to_sign_bytes(), vec![0x00, 0x01]);
        let neg = TokenAmount(BigInt::from(-256));
        assert_eq!(neg.to_sign_bytes(), vec![0x01, 0x01, 0x00]);
        for v in ["0", "1", "-12345678901234567890", "987654321"] {
            let t = TokenAmount::from_decimal(v).unwrap();
            assert_eq!(TokenAmount::from_sign_bytes(&t.to_sign_bytes()).unwrap(), t);
        }
    }

    #[test]
    fn proposal_cbor_round_trip() {
        let prop = test_proposal();
        let bytes = prop.to_signing_bytes().unwrap();
        let back: DealProposal = serde_ipld_dagcbor::from_slice(&bytes).unwrap();
        assert_eq!(back, prop);
    }

    #[test]
    fn signed_cid_is_deterministic() {
        let signed = ClientDealProposal {
            proposal: test_proposal(),
            client_signature: Signature {
                sig_type: SIG_TYPE_BLS,
                data: vec![0x42; 96],
            },
        };
        let c1 = signed.signed_cid().unwrap();
        let c2 = signed.signed_cid().unwrap();
        assert_eq!(c1, c2);
        assert_eq!(c1.codec(), DAG_CBOR);

        let mut altered = signed.clone();
        altered.proposal.start_epoch += 1;
        assert_ne!(altered.signed_cid().unwrap(), c1);
    }

    #[test]
    fn label_reencodes_v1_cids() {
        let c = test_piece_cid();
        let l = proposal_label(&c.to_string()).unwrap();
        let s = l.as_str().unwrap();
        assert!(s.starts_with('u'));
        assert_eq!(Cid::try_from(s).unwrap(), c);

        let plain = proposal_label("some dataset label").unwrap();
        assert_eq!(plain.as_str(), Some("some dataset label"));
    }
}
