// File: service.rs
//
// The purpose of this file is to bind the transport entry points to
// node operations: parse requests, translate descriptors both ways,
// and serialize replies. Routing entry points get one repair-and-retry
// around transient pointer corruption.

use crate::error::{Error, Result};
use crate::msg::{Reply, Request};
use crate::node::{find_node, Node, NodeHandle};
use crate::proxy::translator;
use log::{error, info, warn};
use serde_json::json;
use std::sync::Arc;

/// Adapts one node to the wire.
pub struct NodeService {
    node: Arc<Node>,
    log_requests: bool,
}

impl NodeService {
    /// Returns a new service adapter for a node
    ///
    /// # Arguments
    ///
    /// * `node` - the node served through this adapter
    /// * `log_requests` - whether each served RPC is logged at info
    pub fn new(node: Arc<Node>, log_requests: bool) -> NodeService {
        NodeService { node, log_requests }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Parses a raw request, serves it, and serializes the reply.
    /// Every failure becomes a fault reply; nothing propagates to the
    /// transport loop.
    ///
    /// # Arguments
    ///
    /// * `raw` - the request body as received from the socket
    pub fn handle(&self, raw: &str) -> String {
        let reply = match serde_json::from_str::<Request>(raw) {
            Ok(request) => {
                if self.log_requests {
                    info!("serving {}", request.method());
                }
                match self.dispatch(request) {
                    Ok(value) => Reply::Result(value),
                    Err(e) => Reply::Fault {
                        code: e.fault_code(),
                        message: e.to_string(),
                    },
                }
            }
            Err(e) => Reply::Fault {
                code: 500,
                message: format!("unparseable request: {}", e),
            },
        };
        serde_json::to_string(&reply).unwrap_or_else(|_| {
            String::from(r#"{"fault":{"code":500,"message":"unserializable reply"}}"#)
        })
    }

    fn dispatch(&self, request: Request) -> Result<serde_json::Value> {
        match request {
            Request::Ping => Ok(json!({ "id": self.node.id() })),
            Request::Lookup { key } => {
                let value = self.lookup(&key)?;
                Ok(json!(value))
            }
            Request::Store { key, value } => {
                self.store(&key, &value)?;
                Ok(json!(null))
            }
            Request::StoreBackup {
                key,
                value,
                predecessor,
            } => {
                let claimed = translator().from_descr(&predecessor);
                self.node.store_backup(&key, &value, &claimed)?;
                Ok(json!(null))
            }
            Request::UpdateBackup { data } => {
                self.node.update_backup(data)?;
                Ok(json!(null))
            }
            Request::FindNode { hash } => {
                let found = find_node(self.node.handle(), hash)?;
                self.descr_value(&found)
            }
            Request::ClosestPrecedingNode { hash } => {
                let found = self.closest_preceding_node(hash)?;
                self.descr_value(&found)
            }
            Request::GetNext => {
                let next = self.node.next()?;
                self.descr_value(&next)
            }
            Request::SetNext { node } => {
                self.node.set_next(translator().from_descr(&node))?;
                Ok(json!(null))
            }
            Request::GetPredecessor => {
                let predecessor = self.node.predecessor()?;
                self.descr_value(&predecessor)
            }
            Request::GetFingers => {
                let fingers = self.node.fingers()?;
                Ok(serde_json::to_value(translator().fingers_to_wire(&fingers))?)
            }
            Request::PrependNode { node } => {
                self.node.prepend_node(translator().from_descr(&node))?;
                Ok(json!(null))
            }
            Request::Setup {
                predecessor,
                fingers,
                data,
            } => {
                self.node.setup(
                    translator().from_descr(&predecessor),
                    translator().fingers_from_wire(&fingers)?,
                    data,
                )?;
                Ok(json!(null))
            }
            Request::UpdateFingersOnInsert { node } => {
                self.node
                    .update_fingers_on_insert(&translator().from_descr(&node))?;
                Ok(json!(null))
            }
            Request::UpdateFingersOnLeave { leaving, successor } => {
                self.node.update_fingers_on_leave(
                    &translator().from_descr(&leaving),
                    &translator().from_descr(&successor),
                )?;
                Ok(json!(null))
            }
            Request::SuccessorLeaving { successor } => {
                self.node
                    .successor_leaving(translator().from_descr(&successor))?;
                Ok(json!(null))
            }
            Request::PredecessorLeaving { predecessor, data } => {
                self.node
                    .predecessor_leaving(translator().from_descr(&predecessor), data)?;
                Ok(json!(null))
            }
            Request::RepairFingers => {
                self.node.repair_fingers()?;
                Ok(json!(null))
            }
            Request::RepairPredecessor => {
                self.node.repair_predecessor()?;
                Ok(json!(null))
            }
            Request::Leave => {
                self.node.leave()?;
                Ok(json!(null))
            }
        }
    }

    fn descr_value(&self, node: &NodeHandle) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(translator().to_descr(node.as_ref()))?)
    }

    /// Routed lookup with the repair retry.
    ///
    /// # Arguments
    ///
    /// * `key` - the key being queried
    pub fn lookup(&self, key: &str) -> Result<String> {
        self.with_repair(|| self.node.lookup(key))
    }

    /// Routed store with the repair retry.
    ///
    /// # Arguments
    ///
    /// * `key` - the key being stored
    /// * `value` - the value being stored
    pub fn store(&self, key: &str, value: &str) -> Result<()> {
        self.with_repair(|| self.node.store(key, value))
    }

    /// Closest-preceding query with the repair retry
    ///
    /// # Arguments
    ///
    /// * `hash` - the ring position being routed to
    pub fn closest_preceding_node(&self, hash: u128) -> Result<NodeHandle> {
        self.with_repair(|| self.node.closest_preceding_node(hash))
    }

    /// Runs an operation at most twice: a transport failure or a broken
    /// ring triggers one predecessor-and-finger repair cycle before the
    /// retry; the second failure surfaces.
    fn with_repair<T>(&self, op: impl Fn() -> Result<T>) -> Result<T> {
        match op() {
            Err(e) if e.is_routing_transient() => {
                warn!("routing failure ({}), repairing before retry", e);
                if let Err(repair) = self.node.repair_predecessor() {
                    warn!("predecessor repair failed: {}", repair);
                }
                if let Err(repair) = self.node.repair_fingers() {
                    warn!("finger repair failed: {}", repair);
                }
                op().map_err(|e| {
                    error!("node pointer corruption: {}", e);
                    e
                })
            }
            other => other,
        }
    }
}
