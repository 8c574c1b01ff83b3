// In-process ring scenarios: placement, joins, leaves, backups, and
// repair, with the trivial 4-bit metric so every position is easy to
// reason about.

use quoit::node::Data;
use quoit::{
    find_node, walk, Error, Md5Metric, Metric, Node, NodeHandle, NodeRef, Result, TrivialMetric,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn trivial() -> Arc<dyn Metric> {
    Arc::new(TrivialMetric::new(4))
}

/// Builds a ring by joining nodes one at a time, the way a live ring
/// grows: the first node bootstraps, later ones join through the owner
/// of their own id.
fn build_ring(ids: &[u128], n_backups: usize, nfingers: usize) -> Vec<Arc<Node>> {
    let mut nodes: Vec<Arc<Node>> = Vec::new();
    for id in ids {
        let node = Node::with_backups(Some(*id), Some(nfingers), trivial(), n_backups);
        join(&nodes, &node);
        nodes.push(node);
    }
    nodes
}

fn trivial_ring(ids: &[u128]) -> Vec<Arc<Node>> {
    build_ring(ids, 0, 1)
}

fn join(existing: &[Arc<Node>], node: &Arc<Node>) {
    match existing.first() {
        None => node.mark_initialized(),
        Some(seed) => {
            let successor = find_node(seed.handle(), node.id()).unwrap();
            successor.prepend_node(node.handle()).unwrap();
        }
    }
}

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

/// Ring closure and predecessor mutuality over a set of live nodes.
fn check_ring(nodes: &[Arc<Node>]) {
    let ids: HashSet<u128> = nodes.iter().map(|n| n.id()).collect();
    for node in nodes {
        let seen: Vec<u128> = walk(node.handle()).map(|n| n.unwrap().id()).collect();
        assert_eq!(seen.len(), nodes.len(), "walk from {} skipped nodes", node.id());
        assert_eq!(
            seen.iter().cloned().collect::<HashSet<u128>>(),
            ids,
            "walk from {} saw the wrong nodes",
            node.id()
        );
        let predecessor = node.predecessor().unwrap();
        assert_eq!(
            predecessor.next().unwrap().id(),
            node.id(),
            "predecessor of {} does not point back",
            node.id()
        );
    }
}

fn successor_of(nodes: &[Arc<Node>], metric: &dyn Metric, hash: u128) -> u128 {
    nodes
        .iter()
        .map(|n| n.id())
        .min_by_key(|id| metric.distance(hash, *id))
        .unwrap()
}

/// Every finger must resolve to the successor of its offset.
fn check_fingers(nodes: &[Arc<Node>], metric: &dyn Metric) {
    for node in nodes {
        for (step, finger) in node.fingers().unwrap() {
            let target = node.id().wrapping_add(step) & metric.space_mask();
            assert_eq!(
                finger.id(),
                successor_of(nodes, metric, target),
                "finger {} of node {} is stale",
                step,
                node.id()
            );
        }
    }
}

// ---- scenarios ----------------------------------------------------------

#[test]
fn solo_ring_serves_its_own_keys() {
    let node = Node::with_backups(Some(5), Some(1), trivial(), 0);
    node.mark_initialized();
    node.store("5", "v").unwrap();
    assert_eq!(node.lookup("5").unwrap(), "v");
    assert_eq!(node.len().unwrap(), 1);
}

#[test]
fn three_node_placement() {
    let nodes = trivial_ring(&[0, 3, 8]);
    nodes[0].store("1", "one").unwrap();
    assert!(nodes[1].contains("1").unwrap());
    assert!(!nodes[0].contains("1").unwrap());
    assert!(!nodes[2].contains("1").unwrap());
    for node in &nodes {
        assert_eq!(node.lookup("1").unwrap(), "one");
    }
    check_ring(&nodes);
}

#[test]
fn join_moves_data_to_the_new_owner() {
    let mut nodes = trivial_ring(&[0, 3, 8]);
    nodes[0].store("1", "one").unwrap();

    let two = Node::with_backups(Some(2), Some(1), trivial(), 0);
    join(&nodes, &two);
    nodes.push(two.clone());

    assert_eq!(two.get("1").unwrap(), "one");
    // the old owner only held it as handed-off data; the cleanup task
    // drops it
    wait_until("handed-off key cleanup", || !nodes[1].contains("1").unwrap());
    for node in &nodes {
        assert_eq!(node.lookup("1").unwrap(), "one");
    }
    check_ring(&nodes);
}

#[test]
fn leave_moves_data_to_the_successor() {
    let nodes = trivial_ring(&[0, 3, 8]);
    nodes[0].store("1", "one").unwrap();

    nodes[1].leave().unwrap();

    assert!(nodes[2].contains("1").unwrap());
    assert!(!nodes[0].contains("1").unwrap());
    assert_eq!(nodes[2].get("1").unwrap(), "one");
    let remaining = vec![nodes[0].clone(), nodes[2].clone()];
    check_ring(&remaining);
    assert_eq!(remaining[0].lookup("1").unwrap(), "one");
}

#[test]
fn leave_with_matching_id_data() {
    let nodes = trivial_ring(&[0, 3, 8]);
    nodes[0].store("0", "zero").unwrap();
    assert!(nodes[0].contains("0").unwrap());

    nodes[0].leave().unwrap();

    assert!(nodes[1].contains("0").unwrap());
    assert_eq!(nodes[1].get("0").unwrap(), "zero");
    let remaining = vec![nodes[1].clone(), nodes[2].clone()];
    check_ring(&remaining);
}

#[test]
fn routing_survives_churn_with_many_keys() {
    let metric: Arc<dyn Metric> = Arc::new(Md5Metric::default());
    let mut nodes: Vec<Arc<Node>> = Vec::new();
    while nodes.len() < 10 {
        let node = Node::new(None, None, metric.clone());
        if nodes.iter().any(|n| n.id() == node.id()) {
            continue;
        }
        join(&nodes, &node);
        nodes.push(node);
    }

    let mut expected = HashMap::new();
    for i in 0..10_000 {
        let key = format!("key-{}", i);
        let value = format!("value-{}", i);
        nodes[0].store(&key, &value).unwrap();
        expected.insert(key, value);
    }

    let newcomer = loop {
        let node = Node::new(None, None, metric.clone());
        if nodes.iter().all(|n| n.id() != node.id()) {
            break node;
        }
    };
    join(&nodes, &newcomer);
    nodes.push(newcomer);

    for (key, value) in &expected {
        let owner = find_node(nodes[3].handle(), metric.hash_key(key)).unwrap();
        assert_eq!(owner.lookup(key).unwrap(), *value, "key {} moved badly", key);
    }
}

// ---- round trips and invariants -----------------------------------------

#[test]
fn overwrite_returns_the_latest_value() {
    let nodes = trivial_ring(&[0, 3, 8]);
    nodes[2].store("1", "one").unwrap();
    nodes[2].store("1", "uno").unwrap();
    assert_eq!(nodes[0].lookup("1").unwrap(), "uno");
}

#[test]
fn join_then_leave_restores_the_ring() {
    let nodes = trivial_ring(&[0, 3, 8]);
    let pairs = [("1", "one"), ("4", "four"), ("9", "nine"), ("15", "fifteen")];
    for (k, v) in &pairs {
        nodes[0].store(k, v).unwrap();
    }
    let metric = trivial();
    let owners: Vec<u128> = pairs
        .iter()
        .map(|(k, _)| find_node(nodes[0].handle(), metric.hash_key(k)).unwrap().id())
        .collect();

    let two = Node::with_backups(Some(2), Some(1), trivial(), 0);
    join(&nodes, &two);
    wait_until("handed-off key cleanup", || !nodes[1].contains("1").unwrap());
    two.leave().unwrap();

    check_ring(&nodes);
    for ((k, v), owner) in pairs.iter().zip(owners) {
        assert_eq!(nodes[2].lookup(k).unwrap(), *v);
        assert_eq!(
            find_node(nodes[0].handle(), metric.hash_key(k)).unwrap().id(),
            owner,
            "ownership of {} did not come back",
            k
        );
    }
}

#[test]
fn update_fingers_restores_the_finger_invariant() {
    let nodes = build_ring(&[0, 3, 8], 0, 4);
    for node in &nodes {
        node.update_fingers().unwrap();
    }
    let metric = trivial();
    check_fingers(&nodes, metric.as_ref());

    // and on a converged healthy ring, repair changes nothing
    let before: Vec<Vec<u128>> = nodes
        .iter()
        .map(|n| n.fingers().unwrap().values().map(|f| f.id()).collect())
        .collect();
    for node in &nodes {
        node.repair_fingers().unwrap();
    }
    let after: Vec<Vec<u128>> = nodes
        .iter()
        .map(|n| n.fingers().unwrap().values().map(|f| f.id()).collect())
        .collect();
    assert_eq!(before, after);
}

#[test]
fn repair_fingers_is_idempotent_on_a_healthy_ring() {
    let nodes = trivial_ring(&[0, 3, 8]);
    let before: Vec<u128> = nodes.iter().map(|n| n.next().unwrap().id()).collect();
    for node in &nodes {
        node.repair_fingers().unwrap();
    }
    let after: Vec<u128> = nodes.iter().map(|n| n.next().unwrap().id()).collect();
    assert_eq!(before, after);
    check_ring(&nodes);
}

#[test]
fn lookup_of_an_absent_key_travels_as_not_found() {
    let nodes = trivial_ring(&[0, 3, 8]);
    match nodes[1].lookup("9") {
        Err(Error::NotFound(_)) => (),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn find_predecessor_stays_within_the_hop_bound() {
    let nodes = build_ring(&[0, 2, 5, 7, 9, 12, 14], 0, 4);
    for node in &nodes {
        node.update_fingers().unwrap();
    }
    // every id resolves without the routing walking more nodes than
    // twice the finger count
    let metric = trivial();
    for hash in 0..16 {
        let owner = find_node(nodes[0].handle(), hash).unwrap();
        assert_eq!(owner.id(), successor_of(&nodes, metric.as_ref(), hash));
    }
}

// ---- backups ------------------------------------------------------------

#[test]
fn writes_mirror_to_the_successor() {
    let nodes = build_ring(&[0, 3, 8], 1, 1);
    nodes[0].store("1", "one").unwrap();

    // owner 3 keeps the key, successor 8 carries the copy
    assert!(nodes[1].contains("1").unwrap());
    assert!(nodes[2].contains("1").unwrap());
    assert!(!nodes[0].contains("1").unwrap());

    // the backup holder does not serve reads for it
    match nodes[2].get("1") {
        Err(Error::NotResponsible(_)) => (),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(nodes[1].len().unwrap(), 1);
    assert_eq!(nodes[2].len().unwrap(), 0);
}

#[test]
fn iter_keys_skips_backup_copies() {
    let nodes = build_ring(&[0, 3, 8], 1, 1);
    nodes[0].store("1", "one").unwrap();
    nodes[0].store("2", "two").unwrap();

    let mut owned = nodes[1].iter_keys().unwrap();
    owned.sort();
    assert_eq!(owned, vec!["1", "2"]);
    // the successor physically holds the copies but owns none of them
    assert!(nodes[2].contains("1").unwrap());
    assert!(nodes[2].iter_keys().unwrap().is_empty());
}

#[test]
fn backup_from_the_wrong_predecessor_is_rejected() {
    let nodes = build_ring(&[0, 3, 8], 1, 1);
    let stranger = Node::with_backups(Some(12), Some(1), trivial(), 1);
    stranger.mark_initialized();
    match nodes[2].store_backup("1", "one", &stranger.handle()) {
        Err(Error::RingBroken(_)) => (),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn failed_backup_rolls_back_the_write() {
    let node = Node::with_backups(Some(5), Some(1), trivial(), 1);
    node.mark_initialized();
    let dead: NodeHandle = Arc::new(DeadNode { id: 9 });
    node.set_next(dead).unwrap();

    match node.put("3", "v") {
        Err(Error::Transport(_)) => (),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!node.contains("3").unwrap());
}

#[test]
fn leave_hands_backup_data_to_the_next_successor() {
    let nodes = build_ring(&[0, 3, 8], 1, 1);
    nodes[0].store("1", "one").unwrap();

    nodes[1].leave().unwrap();

    // node 8 owns the key now and node 0 carries the fresh copy
    assert_eq!(nodes[2].get("1").unwrap(), "one");
    assert!(nodes[0].contains("1").unwrap());
    check_ring(&[nodes[0].clone(), nodes[2].clone()]);
}

// ---- failures and repair ------------------------------------------------

#[test]
fn walk_detects_a_broken_ring() {
    let five = Node::with_backups(Some(5), Some(1), trivial(), 0);
    let nine = Node::with_backups(Some(9), Some(1), trivial(), 0);
    let twelve = Node::with_backups(Some(12), Some(1), trivial(), 0);
    for node in &[&five, &nine, &twelve] {
        node.mark_initialized();
    }
    // a next-chain that circles without returning to its start
    five.set_next(nine.handle()).unwrap();
    nine.set_next(twelve.handle()).unwrap();
    twelve.set_next(nine.handle()).unwrap();

    let mut saw_broken = false;
    for entry in walk(five.handle()) {
        match entry {
            Ok(_) => continue,
            Err(Error::RingBroken(_)) => {
                saw_broken = true;
                break;
            }
            Err(other) => panic!("unexpected {:?}", other),
        }
    }
    assert!(saw_broken);
}

#[test]
fn repair_predecessor_adopts_the_last_live_node() {
    // the ring was {0, 3, 8} and node 3 died without leaving
    let zero = Node::with_backups(Some(0), Some(1), trivial(), 0);
    let eight = Node::with_backups(Some(8), Some(1), trivial(), 0);
    let dead: NodeHandle = Arc::new(DeadNode { id: 3 });

    let mut fingers = BTreeMap::new();
    fingers.insert(1u128, dead.clone());
    zero.setup(eight.handle(), fingers, HashMap::new()).unwrap();
    let mut fingers = BTreeMap::new();
    fingers.insert(1u128, zero.handle());
    eight.setup(dead.clone(), fingers, HashMap::new()).unwrap();

    eight.repair_predecessor().unwrap();

    assert_eq!(eight.predecessor().unwrap().id(), 0);
    // adopting also told node 0 its successor left, healing its pointer
    assert_eq!(zero.next().unwrap().id(), 8);
    check_ring(&[zero, eight]);
}

#[test]
fn repair_sequence_recovers_from_a_dead_successor() {
    // the ring was {0, 3, 8} and node 3 (node 0's successor) died
    let zero = Node::with_backups(Some(0), Some(1), trivial(), 0);
    let eight = Node::with_backups(Some(8), Some(1), trivial(), 0);
    let dead: NodeHandle = Arc::new(DeadNode { id: 3 });

    let mut fingers = BTreeMap::new();
    fingers.insert(1u128, dead.clone());
    zero.setup(eight.handle(), fingers, HashMap::new()).unwrap();
    let mut fingers = BTreeMap::new();
    fingers.insert(1u128, zero.handle());
    eight.setup(dead.clone(), fingers, HashMap::new()).unwrap();

    // the monitor notices first and repairs the predecessor link,
    // which notifies node 0 about its lost successor
    eight.repair_predecessor().unwrap();
    // a later routing failure on node 0 runs the finger repair
    zero.repair_fingers().unwrap();

    assert_eq!(zero.next().unwrap().id(), 8);
    assert_eq!(eight.next().unwrap().id(), 0);
    check_ring(&[zero, eight]);
}

#[test]
fn repair_predecessor_keeps_a_healthy_ring_unchanged() {
    let nodes = trivial_ring(&[0, 3, 8]);
    for node in &nodes {
        node.repair_predecessor().unwrap();
    }
    check_ring(&nodes);
}

/// A ring member that stopped answering: every call fails at the
/// transport level, as a timed-out proxy would.
struct DeadNode {
    id: u128,
}

fn down() -> Error {
    Error::Transport(String::from("node is down"))
}

impl NodeRef for DeadNode {
    fn id(&self) -> u128 {
        self.id
    }

    fn url(&self) -> Option<String> {
        Some(String::from("tcp://127.0.0.1:9"))
    }

    fn ping(&self) -> Result<u128> {
        Err(down())
    }

    fn lookup(&self, _key: &str) -> Result<String> {
        Err(down())
    }

    fn store(&self, _key: &str, _value: &str) -> Result<()> {
        Err(down())
    }

    fn store_backup(
        &self,
        _key: &str,
        _value: &str,
        _claimed_predecessor: &NodeHandle,
    ) -> Result<()> {
        Err(down())
    }

    fn update_backup(&self, _data: Data) -> Result<()> {
        Err(down())
    }

    fn find_node(&self, _key_hash: u128) -> Result<NodeHandle> {
        Err(down())
    }

    fn closest_preceding_node(&self, _key_hash: u128) -> Result<NodeHandle> {
        Err(down())
    }

    fn next(&self) -> Result<NodeHandle> {
        Err(down())
    }

    fn set_next(&self, _new_next: NodeHandle) -> Result<()> {
        Err(down())
    }

    fn predecessor(&self) -> Result<NodeHandle> {
        Err(down())
    }

    fn fingers(&self) -> Result<BTreeMap<u128, NodeHandle>> {
        Err(down())
    }

    fn prepend_node(&self, _newnode: NodeHandle) -> Result<()> {
        Err(down())
    }

    fn setup(
        &self,
        _predecessor: NodeHandle,
        _fingers: BTreeMap<u128, NodeHandle>,
        _data: Data,
    ) -> Result<()> {
        Err(down())
    }

    fn update_fingers_on_insert(&self, _newnode: &NodeHandle) -> Result<()> {
        Err(down())
    }

    fn update_fingers_on_leave(
        &self,
        _leaving: &NodeHandle,
        _successor_of_leaving: &NodeHandle,
    ) -> Result<()> {
        Err(down())
    }

    fn successor_leaving(&self, _new_successor: NodeHandle) -> Result<()> {
        Err(down())
    }

    fn predecessor_leaving(&self, _new_predecessor: NodeHandle, _data: Data) -> Result<()> {
        Err(down())
    }

    fn repair_fingers(&self) -> Result<()> {
        Err(down())
    }

    fn repair_predecessor(&self) -> Result<()> {
        Err(down())
    }

    fn leave(&self) -> Result<()> {
        Err(down())
    }
}
