pub mod codec;
pub mod types;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use futures::StreamExt;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{
    Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder, identify,
    request_response::{self, ProtocolSupport},
    tcp,
};

use codec::{ProposalCodec, TransportsCodec};
use types::{
    RETRIEVAL_TRANSPORTS_PROTOCOL, RetrievalTransports, STORAGE_PROPOSAL_PROTOCOL,
    StorageProposalParams, StorageProposalResponse,
};

#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    identify: identify::Behaviour,
    proposals: request_response::Behaviour<ProposalCodec>,
    transports: request_response::Behaviour<TransportsCodec>,
}

/// A throwaway outbound-only peer host: random identity every time, no
/// listen addresses, TCP+TLS only. One instance serves one probe or one
/// per-SP proposal batch and is dropped afterwards.
pub struct PeerNode {
    swarm: Swarm<NodeBehaviour>,
    identified: HashMap<PeerId, identify::Info>,
}

impl PeerNode {
    pub fn new(rpc_timeout: Duration, idle_timeout: Duration) -> Result<Self> {
        let swarm = SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                libp2p::tls::Config::new,
                libp2p::yamux::Config::default,
            )?
            .with_behaviour(|key| NodeBehaviour {
                identify: identify::Behaviour::new(
                    identify::Config::new("ipfs/0.1.0".into(), key.public())
                        .with_agent_version(format!("brokkr-{}", env!("CARGO_PKG_VERSION"))),
                ),
                proposals: request_response::Behaviour::with_codec(
                    ProposalCodec,
                    std::iter::once((
                        StreamProtocol::new(STORAGE_PROPOSAL_PROTOCOL),
                        ProtocolSupport::Outbound,
                    )),
                    request_response::Config::default().with_request_timeout(rpc_timeout),
                ),
                transports: request_response::Behaviour::with_codec(
                    TransportsCodec,
                    std::iter::once((
                        StreamProtocol::new(RETRIEVAL_TRANSPORTS_PROTOCOL),
                        ProtocolSupport::Outbound,
                    )),
                    request_response::Config::default().with_request_timeout(rpc_timeout),
                ),
            })
            .map_err(|e| anyhow!("building peer behaviour: {}", e))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
            .build();

        Ok(PeerNode {
            swarm,
            identified: HashMap::new(),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    fn absorb(&mut self, event: &SwarmEvent<NodeBehaviourEvent>) {
        if let SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) = event
        {
            self.identified.insert(*peer_id, info.clone());
        }
    }

    /// Dials the peer over its published multiaddrs, returning how long the
    /// connection took to establish.
    pub async fn connect(
        &mut self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        timeout: Duration,
    ) -> Result<Duration> {
        let opts = DialOpts::peer_id(peer)
            .condition(PeerCondition::Always)
            .addresses(addrs)
            .build();
        let t0 = Instant::now();
        self.swarm.dial(opts)?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => bail!("dial of {} timed out", peer),
                event = self.swarm.select_next_some() => {
                    self.absorb(&event);
                    match event {
                        SwarmEvent::ConnectionEstablished { peer_id, .. } if peer_id == peer => {
                            return Ok(t0.elapsed());
                        }
                        SwarmEvent::OutgoingConnectionError { peer_id: Some(p), error, .. }
                            if p == peer =>
                        {
                            bail!("dial of {} failed: {}", peer, error);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// The remote's identify payload: advertised protocol set, listen addrs,
    /// agent string. Requires an established connection.
    pub async fn identify_info(
        &mut self,
        peer: PeerId,
        timeout: Duration,
    ) -> Result<identify::Info> {
        if let Some(info) = self.identified.get(&peer) {
            return Ok(info.clone());
        }
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => bail!("{} never volunteered identify info", peer),
                event = self.swarm.select_next_some() => {
                    self.absorb(&event);
                    if let Some(info) = self.identified.get(&peer) {
                        return Ok(info.clone());
                    }
                }
            }
        }
    }

    pub async fn request_transports(&mut self, peer: PeerId) -> Result<RetrievalTransports> {
        let request_id = self.swarm.behaviour_mut().transports.send_request(&peer, ());
        loop {
            let event = self.swarm.select_next_some().await;
            self.absorb(&event);
            match event {
                SwarmEvent::Behaviour(NodeBehaviourEvent::Transports(
                    request_response::Event::Message {
                        message: request_response::Message::Response { request_id: rid, response },
                        ..
                    },
                )) if rid == request_id => return Ok(response),
                SwarmEvent::Behaviour(NodeBehaviourEvent::Transports(
                    request_response::Event::OutboundFailure { request_id: rid, error, .. },
                )) if rid == request_id => {
                    bail!("transports query to {} failed: {}", peer, error)
                }
                _ => {}
            }
        }
    }

    pub async fn propose(
        &mut self,
        peer: PeerId,
        params: StorageProposalParams,
    ) -> Result<StorageProposalResponse> {
        let request_id = self
            .swarm
            .behaviour_mut()
            .proposals
            .send_request(&peer, params);
        loop {
            let event = self.swarm.select_next_some().await;
            self.absorb(&event);
            match event {
                SwarmEvent::Behaviour(NodeBehaviourEvent::Proposals(
                    request_response::Event::Message {
                        message: request_response::Message::Response { request_id: rid, response },
                        ..
                    },
                )) if rid == request_id => return Ok(response),
                SwarmEvent::Behaviour(NodeBehaviourEvent::Proposals(
                    request_response::Event::OutboundFailure { request_id: rid, error, .. },
                )) if rid == request_id => {
                    bail!("storage proposal to {} failed: {}", peer, error)
                }
                _ => {}
            }
        }
    }
}
