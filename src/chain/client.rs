use base64::prelude::*;
use num_bigint::BigInt;
use reqwest::{Client as HttpClient, ClientBuilder, header::HeaderMap};
use serde::Deserialize;
use serde_json::Value;

use crate::config::Config;
use crate::fil::market::Signature;
use crate::fil::{ActorId, ChainEpoch};

use super::error::Error;
use super::types::{
    BeaconEntry, CollateralBounds, MarketDeals, MinerInfo, MiningBaseInfo, Request, Response,
    RpcErrorDetail, TipSet, TipSetKey,
};

const JSONRPC: &str = "2.0";
const METHOD_NS: &str = "Filecoin.";

/// Timeouts per endpoint: the lite node serves fast state reads, the heavy
/// node also serves `StateMarketDeals` which can take minutes.
const LITE_TIMEOUT_SECS: u64 = 30;
const HEAVY_TIMEOUT_SECS: u64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Endpoint {
    Lite,
    Heavy,
}

/// Typed wrapper over the two chain node endpoints.
#[derive(Clone, Debug)]
pub struct Client {
    lite: HttpClient,
    lite_url: String,
    heavy: HttpClient,
    heavy_url: String,
}

impl Client {
    pub fn new(
        lite_url: String,
        heavy_url: String,
        heavy_token: Option<&str>,
    ) -> Result<Self, Error> {
        let lite = ClientBuilder::new()
            .timeout(std::time::Duration::from_secs(LITE_TIMEOUT_SECS))
            .default_headers(Self::base_headers(None)?)
            .build()?;
        let heavy = ClientBuilder::new()
            .timeout(std::time::Duration::from_secs(HEAVY_TIMEOUT_SECS))
            .default_headers(Self::base_headers(heavy_token)?)
            .build()?;
        Ok(Client {
            lite,
            lite_url: format!("{}/rpc/v0", lite_url.trim_end_matches('/')),
            heavy,
            heavy_url: format!("{}/rpc/v0", heavy_url.trim_end_matches('/')),
        })
    }

    pub fn new_from_config(config: &Config) -> Result<Self, Error> {
        Client::new(
            config.lotus_api_lite.clone(),
            config.lotus_api_heavy.clone(),
            config.lotus_api_heavy_token.as_deref(),
        )
    }

    fn base_headers(token: Option<&str>) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "application/json".parse()?);
        headers.insert("Accept", "application/json".parse()?);
        if let Some(token) = token {
            headers.insert("Authorization", format!("Bearer {}", token).parse()?);
        }
        Ok(headers)
    }

    fn handle_response<T>(response: Response) -> Result<T, Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        match (response.result, response.error) {
            (Some(result), None) => Ok(serde_json::from_value(result)?),
            (None, Some(error)) => {
                let detail: RpcErrorDetail = serde_json::from_value(error)?;
                Err(Error::Rpc {
                    code: detail.code,
                    message: detail.message,
                })
            }
            // `result: null` is a legitimate answer for nullable queries
            (None, None) => Ok(serde_json::from_value(Value::Null)?),
            (Some(_), Some(_)) => Err(Error::Unexpected(
                "both result and error present in RPC response".to_string(),
            )),
        }
    }

    async fn call<T>(&self, endpoint: Endpoint, method: &str, params: Vec<Value>) -> Result<T, Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        let (client, url) = match endpoint {
            Endpoint::Lite => (&self.lite, &self.lite_url),
            Endpoint::Heavy => (&self.heavy, &self.heavy_url),
        };
        let request = Request {
            jsonrpc: JSONRPC.to_owned(),
            id: "0".to_string(),
            method: format!("{}{}", METHOD_NS, method),
            params,
        };
        let response = client
            .post(url)
            .json(&request)
            .send()
            .await?
            .json::<Response>()
            .await?;
        Self::handle_response(response)
    }

    pub async fn chain_head(&self) -> Result<TipSet, Error> {
        self.call(Endpoint::Lite, "ChainHead", vec![]).await
    }

    pub async fn tipset_at(&self, epoch: ChainEpoch, tsk: &TipSetKey) -> Result<TipSet, Error> {
        self.call(
            Endpoint::Lite,
            "ChainGetTipSetByHeight",
            vec![epoch.into(), serde_json::to_value(tsk)?],
        )
        .await
    }

    pub async fn miner_info(&self, actor: ActorId, tsk: &TipSetKey) -> Result<MinerInfo, Error> {
        self.call(
            Endpoint::Lite,
            "StateMinerInfo",
            vec![actor.to_string().into(), serde_json::to_value(tsk)?],
        )
        .await
    }

    pub async fn account_key(&self, addr: &str, tsk: &TipSetKey) -> Result<String, Error> {
        self.call(
            Endpoint::Lite,
            "StateAccountKey",
            vec![addr.into(), serde_json::to_value(tsk)?],
        )
        .await
    }

    pub async fn market_deals(&self, tsk: &TipSetKey) -> Result<MarketDeals, Error> {
        self.call(
            Endpoint::Heavy,
            "StateMarketDeals",
            vec![serde_json::to_value(tsk)?],
        )
        .await
    }

    pub async fn verified_client_status(
        &self,
        addr: &str,
        tsk: &TipSetKey,
    ) -> Result<Option<BigInt>, Error> {
        let raw: Option<String> = self
            .call(
                Endpoint::Lite,
                "StateVerifiedClientStatus",
                vec![addr.into(), serde_json::to_value(tsk)?],
            )
            .await?;
        raw.map(|s| {
            s.parse()
                .map_err(|e| Error::Unexpected(format!("datacap '{}' not a bigint: {}", s, e)))
        })
        .transpose()
    }

    pub async fn miner_base_info(
        &self,
        actor: ActorId,
        epoch: ChainEpoch,
        tsk: &TipSetKey,
    ) -> Result<Option<MiningBaseInfo>, Error> {
        self.call(
            Endpoint::Heavy,
            "MinerGetBaseInfo",
            vec![
                actor.to_string().into(),
                epoch.into(),
                serde_json::to_value(tsk)?,
            ],
        )
        .await
    }

    pub async fn beacon_entry(&self, epoch: ChainEpoch) -> Result<BeaconEntry, Error> {
        self.call(Endpoint::Heavy, "StateGetBeaconEntry", vec![epoch.into()])
            .await
    }

    pub async fn wallet_sign(&self, addr: &str, msg: &[u8]) -> Result<Signature, Error> {
        self.call(
            Endpoint::Heavy,
            "WalletSign",
            vec![addr.into(), BASE64_STANDARD.encode(msg).into()],
        )
        .await
    }

    pub async fn wallet_verify(
        &self,
        addr: &str,
        msg: &[u8],
        sig: &Signature,
    ) -> Result<bool, Error> {
        self.call(
            Endpoint::Heavy,
            "WalletVerify",
            vec![
                addr.into(),
                BASE64_STANDARD.encode(msg).into(),
                serde_json::to_value(sig)?,
            ],
        )
        .await
    }

    pub async fn provider_collateral_bounds(
        &self,
        padded_piece_size: u64,
        verified: bool,
        tsk: &TipSetKey,
    ) -> Result<CollateralBounds, Error> {
        self.call(
            Endpoint::Heavy,
            "StateDealProviderCollateralBounds",
            vec![
                padded_piece_size.into(),
                verified.into(),
                serde_json::to_value(tsk)?,
            ],
        )
        .await
    }
}

/// The chain surface the broker consumes. Mirrors [`Client`] so tests can
/// substitute a mock.
pub trait ChainRpc: Send + Sync + Clone + 'static {
    fn chain_head(&self) -> impl Future<Output = Result<TipSet, Error>> + Send;

    fn tipset_at(
        &self,
        epoch: ChainEpoch,
        tsk: &TipSetKey,
    ) -> impl Future<Output = Result<TipSet, Error>> + Send;

    fn miner_info(
        &self,
        actor: ActorId,
        tsk: &TipSetKey,
    ) -> impl Future<Output = Result<MinerInfo, Error>> + Send;

    fn account_key(
        &self,
        addr: &str,
        tsk: &TipSetKey,
    ) -> impl Future<Output = Result<String, Error>> + Send;

    fn market_deals(
        &self,
        tsk: &TipSetKey,
    ) -> impl Future<Output = Result<MarketDeals, Error>> + Send;

    fn verified_client_status(
        &self,
        addr: &str,
        tsk: &TipSetKey,
    ) -> impl Future<Output = Result<Option<BigInt>, Error>> + Send;

    fn miner_base_info(
        &self,
        actor: ActorId,
        epoch: ChainEpoch,
        tsk: &TipSetKey,
    ) -> impl Future<Output = Result<Option<MiningBaseInfo>, Error>> + Send;

    fn beacon_entry(
        &self,
        epoch: ChainEpoch,
    ) -> impl Future<Output = Result<BeaconEntry, Error>> + Send;

    fn wallet_sign(
        &self,
        addr: &str,
        msg: &[u8],
    ) -> impl Future<Output = Result<Signature, Error>> + Send;

    fn wallet_verify(
        &self,
        addr: &str,
        msg: &[u8],
        sig: &Signature,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    fn provider_collateral_bounds(
        &self,
        padded_piece_size: u64,
        verified: bool,
        tsk: &TipSetKey,
    ) -> impl Future<Output = Result<CollateralBounds, Error>> + Send;
}

impl ChainRpc for Client {
    async fn chain_head(&self) -> Result<TipSet, Error> {
        self.chain_head().await
    }
    async fn tipset_at(&self, epoch: ChainEpoch, tsk: &TipSetKey) -> Result<TipSet, Error> {
        self.tipset_at(epoch, tsk).await
    }
    async fn miner_info(&self, actor: ActorId, tsk: &TipSetKey) -> Result<MinerInfo, Error> {
        self.miner_info(actor, tsk).await
    }
    async fn account_key(&self, addr: &str, tsk: &TipSetKey) -> Result<String, Error> {
        self.account_key(addr, tsk).await
    }
    async fn market_deals(&self, tsk: &TipSetKey) -> Result<MarketDeals, Error> {
        self.market_deals(tsk).await
    }
    async fn verified_client_status(
        &self,
        addr: &str,
        tsk: &TipSetKey,
    ) -> Result<Option<BigInt>, Error> {
        self.verified_client_status(addr, tsk).await
    }
    async fn miner_base_info(
        &self,
        actor: ActorId,
        epoch: ChainEpoch,
        tsk: &TipSetKey,
    ) -> Result<Option<MiningBaseInfo>, Error> {
        self.miner_base_info(actor, epoch, tsk).await
    }
    async fn beacon_entry(&self, epoch: ChainEpoch) -> Result<BeaconEntry, Error> {
        self.beacon_entry(epoch).await
    }
    async fn wallet_sign(&self, addr: &str, msg: &[u8]) -> Result<Signature, Error> {
        self.wallet_sign(addr, msg).await
    }
    async fn wallet_verify(&self, addr: &str, msg: &[u8], sig: &Signature) -> Result<bool, Error> {
        self.wallet_verify(addr, msg, sig).await
    }
    async fn provider_collateral_bounds(
        &self,
        padded_piece_size: u64,
        verified: bool,
        tsk: &TipSetKey,
    ) -> Result<CollateralBounds, Error> {
        self.provider_collateral_bounds(padded_piece_size, verified, tsk)
            .await
    }
}
