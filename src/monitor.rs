// File: monitor.rs
//
// The purpose of this file is to watch a node's predecessor from a
// background thread and trigger repair when it stops answering.

use crate::node::{Node, NodeRef};
use log::{debug, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One background task per node that periodically pings the
/// predecessor. Stopping is event-driven: `stop` interrupts the wait
/// immediately instead of finishing the current sleep.
pub struct PredecessorMonitor {
    stop_tx: chan::Sender<()>,
    thread: JoinHandle<()>,
}

impl PredecessorMonitor {
    /// Starts the monitor thread for a node
    ///
    /// # Arguments
    ///
    /// * `node` - the node whose predecessor is watched
    /// * `heartbeat` - how long to wait between pings
    pub fn spawn(node: Arc<Node>, heartbeat: Duration) -> PredecessorMonitor {
        let (stop_tx, stop_rx) = chan::sync(1);
        let thread = thread::spawn(move || run(node, heartbeat, stop_rx));
        PredecessorMonitor { stop_tx, thread }
    }

    /// Stops the monitor and waits for its thread.
    pub fn stop(self) {
        self.stop_tx.send(());
        let _ = self.thread.join();
    }
}

fn run(node: Arc<Node>, heartbeat: Duration, stop_rx: chan::Receiver<()>) {
    let tick = chan::tick_ms(heartbeat.as_millis() as u32);
    loop {
        chan_select! {
            stop_rx.recv() => {
                return;
            },
            tick.recv() => {
                check_predecessor(&node);
            },
        }
    }
}

fn check_predecessor(node: &Arc<Node>) {
    debug!("checking predecessor");
    let predecessor = match node.predecessor() {
        Ok(predecessor) => predecessor,
        Err(e) => {
            warn!("cannot read predecessor: {}", e);
            return;
        }
    };
    if predecessor.id() == node.id() {
        return;
    }
    if let Err(e) = predecessor.ping() {
        warn!(
            "predecessor {} at {} non-responsive: {}",
            predecessor.id(),
            predecessor.url().unwrap_or_default(),
            e
        );
        if let Err(e) = node.repair_predecessor() {
            warn!("predecessor repair failed: {}", e);
        }
    }
}
