// File: proxy.rs
//
// The purpose of this file is to present a remote peer through the same
// interface as a local node, and to translate wire descriptors into
// live references in both directions.

use crate::error::{Error, Result};
use crate::msg::{FingerMap, NodeDescr, PingReply, Reply, Request};
use crate::node::{Data, Node, NodeHandle, NodeRef};
use log::debug;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Timeout applied to every outbound call.
pub const DEFAULT_TIMEOUT_MS: i32 = 5000;

static CONTEXT: OnceLock<zmq::Context> = OnceLock::new();

/// The process-wide zmq context shared by proxies and servers.
pub fn context() -> &'static zmq::Context {
    CONTEXT.get_or_init(zmq::Context::new)
}

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Turns per-call logging on or off for every proxy in the process.
///
/// # Arguments
///
/// * `on` - whether each outbound call is logged at debug level
pub fn set_verbose(on: bool) {
    VERBOSE.store(on, Ordering::Relaxed);
}

fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Process-wide translation between wire descriptors and node
/// references. The server registers its local node here at startup so
/// a descriptor naming it resolves to the live node rather than a
/// proxy of ourselves.
pub struct Translator {
    url: parking_lot::RwLock<Option<String>>,
    local_nodes: parking_lot::RwLock<HashMap<u128, Weak<Node>>>,
}

static TRANSLATOR: OnceLock<Translator> = OnceLock::new();

pub fn translator() -> &'static Translator {
    TRANSLATOR.get_or_init(|| Translator {
        url: parking_lot::RwLock::new(None),
        local_nodes: parking_lot::RwLock::new(HashMap::new()),
    })
}

impl Translator {
    /// URL used to describe nodes served by this process.
    ///
    /// # Arguments
    ///
    /// * `url` - the endpoint this process serves its nodes at
    pub fn set_local_url(&self, url: &str) {
        *self.url.write() = Some(String::from(url));
    }

    /// Makes a local node resolvable by id
    ///
    /// # Arguments
    ///
    /// * `node` - the node served in this process
    pub fn register(&self, node: &Arc<Node>) {
        self.local_nodes
            .write()
            .insert(node.id(), Arc::downgrade(node));
    }

    /// Forgets a local node
    ///
    /// # Arguments
    ///
    /// * `id` - the identifier of the node to drop
    pub fn unregister(&self, id: u128) {
        self.local_nodes.write().remove(&id);
    }

    /// Describes a node for the wire
    ///
    /// # Arguments
    ///
    /// * `node` - the ring member being described
    pub fn to_descr(&self, node: &dyn NodeRef) -> NodeDescr {
        let url = node
            .url()
            .or_else(|| self.url.read().clone())
            .unwrap_or_default();
        NodeDescr { id: node.id(), url }
    }

    /// Resolves a descriptor to a live local node or a remote proxy
    ///
    /// # Arguments
    ///
    /// * `descr` - the descriptor received from a peer
    pub fn from_descr(&self, descr: &NodeDescr) -> NodeHandle {
        if let Some(weak) = self.local_nodes.read().get(&descr.id) {
            if let Some(node) = weak.upgrade() {
                return node;
            }
        }
        Arc::new(NodeProxy::with_id(&descr.url, descr.id))
    }

    /// Renders a finger table for the wire; map keys must be strings.
    ///
    /// # Arguments
    ///
    /// * `fingers` - the finger entries keyed by offset
    pub fn fingers_to_wire(&self, fingers: &BTreeMap<u128, NodeHandle>) -> FingerMap {
        fingers
            .iter()
            .map(|(step, node)| (step.to_string(), self.to_descr(node.as_ref())))
            .collect()
    }

    /// Resolves a wire finger table back into node references
    ///
    /// # Arguments
    ///
    /// * `fingers` - the finger descriptors keyed by offset string
    pub fn fingers_from_wire(&self, fingers: &FingerMap) -> Result<BTreeMap<u128, NodeHandle>> {
        let mut result = BTreeMap::new();
        for (step, descr) in fingers {
            let step: u128 = step
                .parse()
                .map_err(|_| Error::Transport(format!("bad finger step {:?}", step)))?;
            result.insert(step, self.from_descr(descr));
        }
        Ok(result)
    }
}

/// A stand-in for a remote node. Acts like a local node, but every
/// call travels over the transport; an unresponsive peer surfaces as a
/// transport error once the timeout passes.
pub struct NodeProxy {
    url: String,
    id: u128,
    timeout_ms: i32,
}

impl NodeProxy {
    /// Proxy for a peer whose id is already known (the usual case when
    /// translating a descriptor).
    ///
    /// # Arguments
    ///
    /// * `url` - the peer's endpoint
    /// * `id` - the peer's ring identifier
    pub fn with_id(url: &str, id: u128) -> NodeProxy {
        NodeProxy {
            url: String::from(url),
            id,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Proxy with a call timeout other than the default
    ///
    /// # Arguments
    ///
    /// * `url` - the peer's endpoint
    /// * `id` - the peer's ring identifier
    /// * `timeout_ms` - how long each call may wait before failing
    pub fn with_timeout(url: &str, id: u128, timeout_ms: i32) -> NodeProxy {
        NodeProxy {
            url: String::from(url),
            id,
            timeout_ms,
        }
    }

    /// Proxy for a peer known only by URL: pings it to learn its id.
    ///
    /// # Arguments
    ///
    /// * `url` - the peer's endpoint
    pub fn connect(url: &str) -> Result<NodeProxy> {
        let mut proxy = NodeProxy::with_id(url, 0);
        proxy.id = NodeRef::ping(&proxy)?;
        Ok(proxy)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn call(&self, request: &Request) -> Result<serde_json::Value> {
        let socket = context().socket(zmq::REQ)?;
        socket.set_rcvtimeo(self.timeout_ms)?;
        socket.set_sndtimeo(self.timeout_ms)?;
        socket.set_linger(0)?;
        socket.connect(&self.url)?;
        let body = serde_json::to_string(request)?;
        if verbose() {
            debug!("-> {} {}", self.url, body);
        }
        socket.send(body.as_str(), 0)?;
        let raw = socket
            .recv_string(0)?
            .map_err(|_| Error::Transport(String::from("reply was not utf-8")))?;
        if verbose() {
            debug!("<- {} {}", self.url, raw);
        }
        match serde_json::from_str(&raw)? {
            Reply::Result(value) => Ok(value),
            Reply::Fault { code, message } => Err(Error::from_fault(code, message)),
        }
    }

    fn call_unit(&self, request: &Request) -> Result<()> {
        self.call(request).map(|_| ())
    }

    fn call_node(&self, request: &Request) -> Result<NodeHandle> {
        let value = self.call(request)?;
        let descr: NodeDescr = serde_json::from_value(value)?;
        Ok(translator().from_descr(&descr))
    }
}

impl NodeRef for NodeProxy {
    fn id(&self) -> u128 {
        self.id
    }

    fn url(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn ping(&self) -> Result<u128> {
        let value = self.call(&Request::Ping)?;
        let reply: PingReply = serde_json::from_value(value)?;
        Ok(reply.id)
    }

    fn lookup(&self, key: &str) -> Result<String> {
        let value = self.call(&Request::Lookup {
            key: String::from(key),
        })?;
        Ok(serde_json::from_value(value)?)
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.call_unit(&Request::Store {
            key: String::from(key),
            value: String::from(value),
        })
    }

    fn store_backup(
        &self,
        key: &str,
        value: &str,
        claimed_predecessor: &NodeHandle,
    ) -> Result<()> {
        self.call_unit(&Request::StoreBackup {
            key: String::from(key),
            value: String::from(value),
            predecessor: translator().to_descr(claimed_predecessor.as_ref()),
        })
    }

    fn update_backup(&self, data: Data) -> Result<()> {
        self.call_unit(&Request::UpdateBackup { data })
    }

    fn find_node(&self, key_hash: u128) -> Result<NodeHandle> {
        self.call_node(&Request::FindNode { hash: key_hash })
    }

    fn closest_preceding_node(&self, key_hash: u128) -> Result<NodeHandle> {
        self.call_node(&Request::ClosestPrecedingNode { hash: key_hash })
    }

    fn next(&self) -> Result<NodeHandle> {
        self.call_node(&Request::GetNext)
    }

    fn set_next(&self, new_next: NodeHandle) -> Result<()> {
        self.call_unit(&Request::SetNext {
            node: translator().to_descr(new_next.as_ref()),
        })
    }

    fn predecessor(&self) -> Result<NodeHandle> {
        self.call_node(&Request::GetPredecessor)
    }

    fn fingers(&self) -> Result<BTreeMap<u128, NodeHandle>> {
        let value = self.call(&Request::GetFingers)?;
        let wire: FingerMap = serde_json::from_value(value)?;
        translator().fingers_from_wire(&wire)
    }

    fn prepend_node(&self, newnode: NodeHandle) -> Result<()> {
        self.call_unit(&Request::PrependNode {
            node: translator().to_descr(newnode.as_ref()),
        })
    }

    fn setup(
        &self,
        predecessor: NodeHandle,
        fingers: BTreeMap<u128, NodeHandle>,
        data: Data,
    ) -> Result<()> {
        self.call_unit(&Request::Setup {
            predecessor: translator().to_descr(predecessor.as_ref()),
            fingers: translator().fingers_to_wire(&fingers),
            data,
        })
    }

    fn update_fingers_on_insert(&self, newnode: &NodeHandle) -> Result<()> {
        self.call_unit(&Request::UpdateFingersOnInsert {
            node: translator().to_descr(newnode.as_ref()),
        })
    }

    fn update_fingers_on_leave(
        &self,
        leaving: &NodeHandle,
        successor_of_leaving: &NodeHandle,
    ) -> Result<()> {
        self.call_unit(&Request::UpdateFingersOnLeave {
            leaving: translator().to_descr(leaving.as_ref()),
            successor: translator().to_descr(successor_of_leaving.as_ref()),
        })
    }

    fn successor_leaving(&self, new_successor: NodeHandle) -> Result<()> {
        self.call_unit(&Request::SuccessorLeaving {
            successor: translator().to_descr(new_successor.as_ref()),
        })
    }

    fn predecessor_leaving(&self, new_predecessor: NodeHandle, data: Data) -> Result<()> {
        self.call_unit(&Request::PredecessorLeaving {
            predecessor: translator().to_descr(new_predecessor.as_ref()),
            data,
        })
    }

    fn repair_fingers(&self) -> Result<()> {
        self.call_unit(&Request::RepairFingers)
    }

    fn repair_predecessor(&self) -> Result<()> {
        self.call_unit(&Request::RepairPredecessor)
    }

    fn leave(&self) -> Result<()> {
        self.call_unit(&Request::Leave)
    }
}
