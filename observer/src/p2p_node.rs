//! A validator's node in the libp2p network. Streams for the attestation protocols are opened and accepted through
//! [P2pHost].

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use libp2p::{
    Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder, identify,
    kad::{self, store::MemoryStore},
    multiaddr::Protocol,
    noise,
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux,
};
use libp2p_stream as stream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::*;

use crate::{
    bridge::{PeerHost, PeerStream, StreamError},
    cfg::Config,
    crypto::SecretKey,
};

#[derive(NetworkBehaviour)]
struct Behaviour {
    stream: stream::Behaviour,
    identify: identify::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
}

/// A [PeerHost] backed by a running [P2pNode].
pub struct P2pHost {
    peer_id: PeerId,
    control: stream::Control,
    connected: Arc<Mutex<HashSet<PeerId>>>,
}

#[async_trait]
impl PeerHost for P2pHost {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn peers(&self) -> Vec<PeerId> {
        self.connected.lock().iter().copied().collect()
    }

    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<PeerStream, StreamError> {
        match self.control.clone().open_stream(peer, protocol).await {
            Ok(stream) => Ok(Box::new(stream)),
            Err(stream::OpenStreamError::UnsupportedProtocol(_)) => {
                Err(StreamError::ProtocolNotSupported)
            }
            Err(e) => Err(StreamError::Unavailable(e.to_string())),
        }
    }

    fn accept(&self, protocol: StreamProtocol) -> Result<BoxStream<'static, (PeerId, PeerStream)>> {
        let incoming = self
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|_| anyhow!("already accepting streams for {protocol}"))?;
        Ok(incoming
            .map(|(peer, stream)| (peer, Box::new(stream) as PeerStream))
            .boxed())
    }
}

pub struct P2pNode {
    peer_id: PeerId,
    p2p_port: u16,
    external_address: Option<Multiaddr>,
    bootstrap_address: Option<(PeerId, Multiaddr)>,
    swarm: Swarm<Behaviour>,
    host: Arc<P2pHost>,
}

impl P2pNode {
    pub fn new(secret_key: &SecretKey, config: &Config) -> Result<Self> {
        let key_pair = secret_key.to_libp2p_keypair();
        let peer_id = PeerId::from(key_pair.public());
        info!(%peer_id);

        let swarm = SwarmBuilder::with_existing_identity(key_pair)
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
            .with_behaviour(|key| Behaviour {
                stream: stream::Behaviour::new(),
                identify: identify::Behaviour::new(identify::Config::new(
                    "/observer/1.0.0".to_owned(),
                    key.public(),
                )),
                kademlia: kad::Behaviour::new(peer_id, MemoryStore::new(peer_id)),
            })?
            // Streams are opened on demand, so connections must outlive them.
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(300)))
            .build();

        let host = Arc::new(P2pHost {
            peer_id,
            control: swarm.behaviour().stream.new_control(),
            connected: Arc::new(Mutex::new(HashSet::new())),
        });

        Ok(P2pNode {
            peer_id,
            p2p_port: config.p2p_port,
            external_address: config.external_address.clone(),
            bootstrap_address: config.bootstrap_address.clone(),
            swarm,
            host,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn host(&self) -> Arc<P2pHost> {
        self.host.clone()
    }

    /// Drive the swarm until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut addr: Multiaddr = "/ip4/0.0.0.0".parse()?;
        addr.push(Protocol::Tcp(self.p2p_port));
        self.swarm.listen_on(addr)?;

        if let Some(external_address) = self.external_address.take() {
            self.swarm.add_external_address(external_address);
        }

        if let Some((peer, address)) = &self.bootstrap_address {
            if *peer != self.peer_id {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(peer, address.clone());
                self.swarm.dial(address.clone())?;
                self.swarm.behaviour_mut().kademlia.bootstrap()?;
            }
        }

        loop {
            tokio::select! {
                Some(event) = self.swarm.next() => self.handle_event(event),
                _ = shutdown.changed() => break,
            }
        }
        debug!("p2p node stopped");
        Ok(())
    }

    fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "started listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                if self.host.connected.lock().insert(peer_id) {
                    debug!(%peer_id, "peer connected");
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.host.connected.lock().remove(&peer_id);
                    debug!(%peer_id, "peer disconnected");
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                info: identify::Info { listen_addrs, .. },
                peer_id,
                ..
            })) => {
                for addr in listen_addrs {
                    trace!(%peer_id, %addr, "identity info received");
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
                peer,
                addresses,
                ..
            })) => {
                if !self.host.connected.lock().contains(&peer) {
                    if let Err(e) = self.swarm.dial(addresses.first().clone()) {
                        debug!(%peer, "failed to dial discovered peer: {e}");
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!(?peer_id, %error, "outgoing connection failed");
            }
            _ => {}
        }
    }
}
