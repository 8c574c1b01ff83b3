// File: msg.rs
//
// The purpose of this file is to define the message types exchanged
// between peers: node descriptors, the request envelope for every RPC
// in the contract, and the result/fault reply envelope.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Wire form of a node reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescr {
    pub id: u128,
    pub url: String,
}

impl NodeDescr {
    /// Returns a new node descriptor
    ///
    /// # Arguments
    ///
    /// * `id` - the node's ring identifier
    /// * `url` - the endpoint the node is served at
    pub fn new(id: u128, url: &str) -> NodeDescr {
        NodeDescr {
            id,
            url: String::from(url),
        }
    }
}

/// Key/value payload moved during joins, leaves, and backups.
pub type DataMap = HashMap<String, String>;

/// Finger table on the wire. Map keys must be strings, so each finger
/// step is rendered as its decimal form.
pub type FingerMap = BTreeMap<String, NodeDescr>;

/// One request per RPC in the contract. Serialized with external
/// tagging, so a request reads as `{"find_node":{"hash":...}}` and a
/// parameterless one as just `"ping"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Ping,
    Lookup {
        key: String,
    },
    Store {
        key: String,
        value: String,
    },
    StoreBackup {
        key: String,
        value: String,
        predecessor: NodeDescr,
    },
    UpdateBackup {
        data: DataMap,
    },
    FindNode {
        hash: u128,
    },
    ClosestPrecedingNode {
        hash: u128,
    },
    GetNext,
    SetNext {
        node: NodeDescr,
    },
    GetPredecessor,
    GetFingers,
    PrependNode {
        node: NodeDescr,
    },
    Setup {
        predecessor: NodeDescr,
        fingers: FingerMap,
        data: DataMap,
    },
    UpdateFingersOnInsert {
        node: NodeDescr,
    },
    UpdateFingersOnLeave {
        leaving: NodeDescr,
        successor: NodeDescr,
    },
    SuccessorLeaving {
        successor: NodeDescr,
    },
    PredecessorLeaving {
        predecessor: NodeDescr,
        data: DataMap,
    },
    RepairFingers,
    RepairPredecessor,
    Leave,
}

impl Request {
    /// Method name, for request logging.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::Lookup { .. } => "lookup",
            Request::Store { .. } => "store",
            Request::StoreBackup { .. } => "store_backup",
            Request::UpdateBackup { .. } => "update_backup",
            Request::FindNode { .. } => "find_node",
            Request::ClosestPrecedingNode { .. } => "closest_preceding_node",
            Request::GetNext => "get_next",
            Request::SetNext { .. } => "set_next",
            Request::GetPredecessor => "get_predecessor",
            Request::GetFingers => "get_fingers",
            Request::PrependNode { .. } => "prepend_node",
            Request::Setup { .. } => "setup",
            Request::UpdateFingersOnInsert { .. } => "update_fingers_on_insert",
            Request::UpdateFingersOnLeave { .. } => "update_fingers_on_leave",
            Request::SuccessorLeaving { .. } => "successor_leaving",
            Request::PredecessorLeaving { .. } => "predecessor_leaving",
            Request::RepairFingers => "repair_fingers",
            Request::RepairPredecessor => "repair_predecessor",
            Request::Leave => "leave",
        }
    }
}

/// Reply envelope: a result payload, or a fault with a code the caller
/// can translate back into an error kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Result(serde_json::Value),
    Fault { code: u16, message: String },
}

/// Payload of a `ping` reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct PingReply {
    pub id: u128,
}
