// File: client.rs
//
// The purpose of this file is to provide the thin non-peer client: it
// keeps a pool of peer proxies, sends each request to a random one,
// and fails over when peers stop answering.

use crate::error::{Error, Result};
use crate::node::NodeRef;
use crate::proxy::NodeProxy;
use log::{debug, warn};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;

/// How many peers the client tries to stay connected to.
pub const DEFAULT_MIN_CONNECTIONS: usize = 3;

/// Client to a cloud of ring nodes.
pub struct Client {
    cloud: HashMap<String, Arc<NodeProxy>>,
    min_connections: usize,
}

impl Client {
    /// Connects to whichever of the given peers answer.
    ///
    /// # Arguments
    ///
    /// * `peers` - URLs of nodes to initiate the connections
    /// * `min_connections` - pool size the client tries to keep up
    pub fn connect(peers: &[String], min_connections: usize) -> Result<Client> {
        let mut cloud = HashMap::new();
        for url in peers {
            match NodeProxy::connect(url) {
                Ok(proxy) => {
                    cloud.insert(url.clone(), Arc::new(proxy));
                }
                Err(Error::Transport(e)) => {
                    debug!("peer {} unreachable: {}", url, e);
                }
                Err(e) => return Err(e),
            }
        }
        if cloud.is_empty() {
            return Err(Error::NoPeers);
        }
        let mut client = Client {
            cloud,
            min_connections,
        };
        if client.cloud.len() < client.min_connections {
            client.find_connections()?;
        }
        Ok(client)
    }

    /// Number of peers currently in the pool.
    pub fn peer_count(&self) -> usize {
        self.cloud.len()
    }

    /// Tops the pool back up from the fingers of surviving peers.
    fn find_connections(&mut self) -> Result<()> {
        let mut known: Vec<Arc<NodeProxy>> = self.cloud.values().cloned().collect();
        while self.cloud.len() < self.min_connections && !known.is_empty() {
            let peer = known.remove(0);
            let fingers = match peer.fingers() {
                Ok(fingers) => fingers,
                Err(Error::Transport(e)) => {
                    warn!("dropping peer {}: {}", peer.url(), e);
                    self.cloud.remove(peer.url());
                    continue;
                }
                Err(e) => return Err(e),
            };
            for finger in fingers.values() {
                let url = match finger.url() {
                    Some(url) => url,
                    None => continue,
                };
                if !self.cloud.contains_key(&url) {
                    let proxy = Arc::new(NodeProxy::with_id(&url, finger.id()));
                    self.cloud.insert(url.clone(), proxy.clone());
                    known.push(proxy);
                }
            }
        }
        if self.cloud.is_empty() {
            return Err(Error::NoPeers);
        }
        if self.cloud.len() < self.min_connections {
            warn!("only aware of {} peers", self.cloud.len());
        }
        Ok(())
    }

    /// Tries the operation on peers in random order, dropping each one
    /// that fails at the transport level.
    fn with_peer<T>(&mut self, op: impl Fn(&NodeProxy) -> Result<T>) -> Result<T> {
        while !self.cloud.is_empty() {
            let mut urls: Vec<String> = self.cloud.keys().cloned().collect();
            urls.shuffle(&mut rand::thread_rng());
            for url in urls {
                let peer = match self.cloud.get(&url) {
                    Some(peer) => peer.clone(),
                    None => continue,
                };
                match op(&peer) {
                    Err(Error::Transport(e)) => {
                        warn!("dropping peer {}: {}", url, e);
                        self.cloud.remove(&url);
                    }
                    other => return other,
                }
            }
        }
        Err(Error::NoPeers)
    }

    /// Looks up the value for a key anywhere on the ring.
    ///
    /// # Arguments
    ///
    /// * `key` - the key being queried
    pub fn lookup(&mut self, key: &str) -> Result<serde_json::Value> {
        self.find_connections()?;
        let raw = self.with_peer(|peer| peer.lookup(key))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Stores a JSON-encodable value for a key somewhere on the ring.
    ///
    /// # Arguments
    ///
    /// * `key` - the key being stored
    /// * `value` - a JSON-encodable value
    pub fn store(&mut self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.find_connections()?;
        let encoded = serde_json::to_string(value)?;
        self.with_peer(|peer| peer.store(key, &encoded))
    }
}
