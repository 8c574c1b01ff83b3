// File: lib.rs
//
// The purpose of this file is to wire the crate's modules together and
// re-export the types that make up the public surface of the ring.

#[macro_use]
extern crate chan;

pub mod client;
pub mod config;
pub mod error;
pub mod metric;
pub mod monitor;
pub mod msg;
pub mod node;
pub mod proxy;
pub mod rwlock;
pub mod server;
pub mod service;

pub use crate::client::Client;
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::metric::{finger_steps, Md5Metric, Metric, TrivialMetric};
pub use crate::monitor::PredecessorMonitor;
pub use crate::node::{announce, find_node, find_predecessor, walk, Node, NodeHandle, NodeRef};
pub use crate::proxy::{translator, NodeProxy};
pub use crate::server::Server;
pub use crate::service::NodeService;
