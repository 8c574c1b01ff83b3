// File: server.rs
//
// The purpose of this file is to serve a node's RPC endpoint: a ROUTER
// front socket, a small pool of worker threads behind an inproc DEALER,
// and the bring-up walk that joins an existing ring.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::{find_node, Node, NodeRef};
use crate::proxy::{context, translator, NodeProxy};
use crate::service::NodeService;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const WORKERS: usize = 4;
// how long sockets wait before re-checking the stop flag
const POLL_INTERVAL_MS: i32 = 100;

/// A running RPC endpoint for one node.
pub struct Server {
    url: String,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    /// Binds the node's endpoint, registers it with the descriptor
    /// translator, and starts the broker and worker threads.
    ///
    /// # Arguments
    ///
    /// * `node` - the node to serve
    /// * `config` - port and request-logging settings
    pub fn start(node: Arc<Node>, config: &Config) -> Result<Server> {
        let url = format!("tcp://127.0.0.1:{}", config.port);
        node.set_url(&url);
        translator().set_local_url(&url);
        translator().register(&node);

        let ctx = context();
        let router = ctx.socket(zmq::ROUTER)?;
        router.set_linger(0)?;
        router.bind(&url)?;
        let backend = format!("inproc://quoit-workers-{}", config.port);
        let dealer = ctx.socket(zmq::DEALER)?;
        dealer.set_linger(0)?;
        dealer.bind(&backend)?;

        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        for index in 0..WORKERS {
            let worker = ctx.socket(zmq::REP)?;
            worker.set_linger(0)?;
            worker.set_rcvtimeo(POLL_INTERVAL_MS)?;
            worker.connect(&backend)?;
            let service = NodeService::new(node.clone(), config.log_requests);
            let stop_flag = stop.clone();
            let handle = thread::Builder::new()
                .name(format!("quoit-worker-{}", index))
                .spawn(move || worker_loop(worker, service, stop_flag))
                .map_err(|e| Error::Config(format!("cannot spawn worker thread: {}", e)))?;
            threads.push(handle);
        }

        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name(String::from("quoit-broker"))
            .spawn(move || broker_loop(router, dealer, stop_flag))
            .map_err(|e| Error::Config(format!("cannot spawn broker thread: {}", e)))?;
        threads.push(handle);

        info!("serving node {} at {}", node.id(), url);
        Ok(Server { url, stop, threads })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stops the broker and workers and waits for them to finish.
    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

fn worker_loop(socket: zmq::Socket, service: NodeService, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        let raw = match socket.recv_string(0) {
            Ok(Ok(raw)) => raw,
            Ok(Err(_)) => {
                // a reply is owed before the next receive
                let fault = r#"{"fault":{"code":500,"message":"request was not utf-8"}}"#;
                if let Err(e) = socket.send(fault, 0) {
                    warn!("worker send error: {}", e);
                }
                continue;
            }
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => {
                warn!("worker receive error: {}", e);
                continue;
            }
        };
        let reply = service.handle(&raw);
        if let Err(e) = socket.send(reply.as_str(), 0) {
            warn!("worker send error: {}", e);
        }
    }
}

fn broker_loop(router: zmq::Socket, dealer: zmq::Socket, stop: Arc<AtomicBool>) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let mut items = [
            router.as_poll_item(zmq::POLLIN),
            dealer.as_poll_item(zmq::POLLIN),
        ];
        match zmq::poll(&mut items, i64::from(POLL_INTERVAL_MS)) {
            Ok(_) => (),
            Err(e) => {
                warn!("broker poll error: {}", e);
                return;
            }
        }
        let router_ready = items[0].is_readable();
        let dealer_ready = items[1].is_readable();
        drop(items);
        if router_ready {
            if let Err(e) = shuttle(&router, &dealer) {
                warn!("broker forward error: {}", e);
            }
        }
        if dealer_ready {
            if let Err(e) = shuttle(&dealer, &router) {
                warn!("broker forward error: {}", e);
            }
        }
    }
}

fn shuttle(from: &zmq::Socket, to: &zmq::Socket) -> Result<()> {
    let parts = from.recv_multipart(0)?;
    to.send_multipart(parts, 0)?;
    Ok(())
}

/// Joins an existing ring through the first reachable cloud member, or
/// bootstraps a ring of one when nobody answers. Either way the node
/// comes out initialized.
///
/// # Arguments
///
/// * `node` - the node being brought into a ring
/// * `own_url` - this node's endpoint, skipped in the member list
/// * `cloud_members` - peer URLs to try joining through
pub fn join_ring(node: &Arc<Node>, own_url: &str, cloud_members: &[String]) -> Result<()> {
    for member in cloud_members {
        if member == own_url {
            // the same configuration file is reused across test nodes
            continue;
        }
        let neighbor = match NodeProxy::connect(member) {
            Ok(proxy) => proxy,
            Err(Error::Transport(e)) => {
                debug!("cloud member {} is down: {}", member, e);
                continue;
            }
            Err(e) => return Err(e),
        };
        let successor = match find_node(Arc::new(neighbor), node.id()) {
            Ok(successor) => successor,
            Err(Error::Transport(e)) => {
                warn!("ring walk through {} failed: {}", member, e);
                continue;
            }
            Err(e) => return Err(e),
        };
        info!(
            "connecting to node {} at {}",
            successor.id(),
            successor.url().unwrap_or_default()
        );
        match successor.prepend_node(node.handle()) {
            Ok(()) => {
                node.mark_initialized();
                return Ok(());
            }
            Err(Error::Transport(e)) => {
                // it might have gone down while we were connecting
                warn!("unable to connect to node {}: {}", successor.id(), e);
                continue;
            }
            // a join rejection means a duplicate id or a wrong arc;
            // that aborts startup rather than trying other members
            Err(e) => return Err(e),
        }
    }
    info!("unable to find other nodes to join; starting a ring of one");
    node.mark_initialized();
    Ok(())
}
