//! Peer registry and peer selection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::seq::SliceRandom;
use tributary_core::{HostPort, NetworkProvider};

use super::{Endpoint, Peer, PeerConfig};
use crate::connection::Connection;
use crate::sync::{read, write};

/// Every peer a channel knows, keyed by address.
pub struct PeerManager<N: NetworkProvider> {
    network: N,
    endpoint: Arc<Endpoint>,
    config: PeerConfig,
    peers: RwLock<HashMap<HostPort, Arc<Peer<N>>>>,
}

impl<N: NetworkProvider> PeerManager<N> {
    pub(crate) fn new(network: N, endpoint: Arc<Endpoint>, config: PeerConfig) -> Self {
        Self {
            network,
            endpoint,
            config,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// The peer at `address`, if known.
    pub fn get(&self, address: &HostPort) -> Option<Arc<Peer<N>>> {
        read(&self.peers).get(address).cloned()
    }

    /// The peer at `address`, created on first use.
    pub fn get_or_add(&self, address: HostPort) -> Arc<Peer<N>> {
        if let Some(peer) = self.get(&address) {
            return peer;
        }
        write(&self.peers)
            .entry(address)
            .or_insert_with(|| {
                Arc::new(Peer::new(
                    address,
                    self.network.clone(),
                    self.endpoint.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Forget the peer at `address`. Its connections stay open until they
    /// close on their own or the channel shuts down.
    pub fn remove(&self, address: &HostPort) -> Option<Arc<Peer<N>>> {
        write(&self.peers).remove(address)
    }

    /// Snapshot of every known peer.
    pub fn peers(&self) -> Vec<Arc<Peer<N>>> {
        read(&self.peers).values().cloned().collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        read(&self.peers).len()
    }

    /// Whether no peer is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// File an accepted, identified connection under the peer that opened
    /// it, so calls to that peer can reuse it.
    ///
    /// Connections from clients without a listener are not filed.
    pub(crate) fn add_inbound(&self, connection: Arc<Connection>) {
        let Some(remote) = connection.remote() else {
            return;
        };
        match remote.host_port.parse::<HostPort>() {
            Ok(address) if !address.is_ephemeral() => {
                tracing::debug!(peer = %address, "filing inbound connection");
                self.get_or_add(address).add_connection(connection.clone());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(
                    host_port = %remote.host_port,
                    error = %e,
                    "inbound connection has no usable host_port"
                );
            }
        }
    }
}

impl<N: NetworkProvider> std::fmt::Debug for PeerManager<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("peers", &self.len())
            .finish()
    }
}

/// Choose the best-scored peer, breaking ties at random.
fn choose<N: NetworkProvider>(candidates: Vec<Arc<Peer<N>>>) -> Option<Arc<Peer<N>>> {
    let scored: Vec<(u64, Arc<Peer<N>>)> = candidates
        .into_iter()
        .map(|peer| (peer.score(), peer))
        .collect();
    let best = scored.iter().map(|(score, _)| *score).min()?;
    let tied: Vec<&Arc<Peer<N>>> = scored
        .iter()
        .filter(|(score, _)| *score == best)
        .map(|(_, peer)| peer)
        .collect();
    tied.choose(&mut rand::thread_rng()).map(|peer| Arc::clone(peer))
}

/// The candidate peers for one service.
pub struct PeerList<N: NetworkProvider> {
    manager: Arc<PeerManager<N>>,
    addresses: RwLock<Vec<HostPort>>,
}

impl<N: NetworkProvider> PeerList<N> {
    pub(crate) fn new(manager: Arc<PeerManager<N>>, addresses: Vec<HostPort>) -> Self {
        let mut list = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !list.contains(&address) {
                list.push(address);
            }
        }
        Self {
            manager,
            addresses: RwLock::new(list),
        }
    }

    /// Add a candidate. Returns `false` if it was already listed.
    pub fn add(&self, address: HostPort) -> bool {
        let mut addresses = write(&self.addresses);
        if addresses.contains(&address) {
            return false;
        }
        addresses.push(address);
        true
    }

    /// Remove a candidate. Returns whether it was listed.
    pub fn remove(&self, address: &HostPort) -> bool {
        let mut addresses = write(&self.addresses);
        let before = addresses.len();
        addresses.retain(|a| a != address);
        addresses.len() != before
    }

    /// Listed addresses.
    pub fn addresses(&self) -> Vec<HostPort> {
        read(&self.addresses).clone()
    }

    /// The peer at `address`, created on first use.
    pub fn peer(&self, address: HostPort) -> Arc<Peer<N>> {
        self.manager.get_or_add(address)
    }

    /// Pick the least loaded, healthiest peer not in `tried`.
    pub fn choose(&self, tried: &[HostPort]) -> Option<Arc<Peer<N>>> {
        let candidates = read(&self.addresses)
            .iter()
            .filter(|address| !tried.contains(address))
            .map(|address| self.manager.get_or_add(*address))
            .collect();
        choose(candidates)
    }
}

impl<N: NetworkProvider> std::fmt::Debug for PeerList<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerList")
            .field("addresses", &self.addresses())
            .finish()
    }
}
