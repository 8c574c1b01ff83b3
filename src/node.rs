// File: node.rs
//
// The purpose of this file is to implement one ring member: its local
// key/value storage, its routing state (predecessor and finger table),
// and every membership, maintenance, and repair operation of the ring.

use crate::error::{Error, Result};
use crate::metric::{finger_steps, Metric, FINGER_TABLE_SIZE};
use crate::rwlock::RwLock;
use log::{debug, info, warn};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

/// Shared reference to a ring member, local or remote.
pub type NodeHandle = Arc<dyn NodeRef>;

/// Key/value pairs held by a node.
pub type Data = HashMap<String, String>;

/// The capability set every ring member presents: the RPC surface plus
/// its identity. `Node` implements it in-process and `NodeProxy`
/// implements it over the transport; consumers never branch on which
/// one they hold.
pub trait NodeRef: Send + Sync {
    fn id(&self) -> u128;
    fn url(&self) -> Option<String>;
    fn ping(&self) -> Result<u128>;
    fn lookup(&self, key: &str) -> Result<String>;
    fn store(&self, key: &str, value: &str) -> Result<()>;
    fn store_backup(&self, key: &str, value: &str, claimed_predecessor: &NodeHandle)
        -> Result<()>;
    fn update_backup(&self, data: Data) -> Result<()>;
    fn find_node(&self, key_hash: u128) -> Result<NodeHandle>;
    fn closest_preceding_node(&self, key_hash: u128) -> Result<NodeHandle>;
    fn next(&self) -> Result<NodeHandle>;
    fn set_next(&self, new_next: NodeHandle) -> Result<()>;
    fn predecessor(&self) -> Result<NodeHandle>;
    fn fingers(&self) -> Result<BTreeMap<u128, NodeHandle>>;
    fn prepend_node(&self, newnode: NodeHandle) -> Result<()>;
    fn setup(
        &self,
        predecessor: NodeHandle,
        fingers: BTreeMap<u128, NodeHandle>,
        data: Data,
    ) -> Result<()>;
    fn update_fingers_on_insert(&self, newnode: &NodeHandle) -> Result<()>;
    fn update_fingers_on_leave(
        &self,
        leaving: &NodeHandle,
        successor_of_leaving: &NodeHandle,
    ) -> Result<()>;
    fn successor_leaving(&self, new_successor: NodeHandle) -> Result<()>;
    fn predecessor_leaving(&self, new_predecessor: NodeHandle, data: Data) -> Result<()>;
    fn repair_fingers(&self) -> Result<()>;
    fn repair_predecessor(&self) -> Result<()>;
    fn leave(&self) -> Result<()>;
}

/// Routing state guarded by the finger lock. The predecessor pointer
/// lives here because it is essentially another finger; `None` reads as
/// "myself" (a node starts solitary).
struct Routing {
    predecessor: Option<NodeHandle>,
    fingers: Vec<NodeHandle>,
}

/// One ring member.
///
/// Owns the keys it is responsible for plus at most one layer of
/// predecessor backup, all in a single map. The data map and the
/// routing state are guarded by independent reader/writer locks; when
/// both are needed the data lock is taken first.
pub struct Node {
    id: u128,
    metric: Arc<dyn Metric>,
    finger_steps: Vec<u128>,
    n_backups: usize,
    initialized: AtomicBool,
    url: parking_lot::Mutex<Option<String>>,
    data_lock: RwLock<Data>,
    finger_lock: RwLock<Routing>,
    self_ref: Weak<Node>,
}

impl Node {
    /// Creates a new node with the default single backup layer.
    ///
    /// # Arguments
    ///
    /// * `id` - the node's ring identifier, `None` for a random one
    /// * `nfingers` - finger table size, `None` for the default
    /// * `metric` - the ring metric to place keys and nodes with
    pub fn new(id: Option<u128>, nfingers: Option<usize>, metric: Arc<dyn Metric>) -> Arc<Node> {
        Node::with_backups(id, nfingers, metric, 1)
    }

    /// Creates a new node mirroring each owned write to `n_backups`
    /// successors (0 disables the backup layer).
    ///
    /// # Arguments
    ///
    /// * `id` - the node's ring identifier, `None` for a random one
    /// * `nfingers` - finger table size, `None` for the default
    /// * `metric` - the ring metric to place keys and nodes with
    /// * `n_backups` - how many successors mirror each owned write
    pub fn with_backups(
        id: Option<u128>,
        nfingers: Option<usize>,
        metric: Arc<dyn Metric>,
        n_backups: usize,
    ) -> Arc<Node> {
        let id = id.unwrap_or_else(|| rand::thread_rng().gen::<u128>()) & metric.space_mask();
        let steps = finger_steps(metric.hash_bits(), nfingers.unwrap_or(FINGER_TABLE_SIZE));
        let node = Arc::new_cyclic(|weak: &Weak<Node>| Node {
            id,
            metric,
            finger_steps: steps,
            n_backups,
            initialized: AtomicBool::new(false),
            url: parking_lot::Mutex::new(None),
            data_lock: RwLock::new(HashMap::new()),
            finger_lock: RwLock::new(Routing {
                predecessor: None,
                fingers: Vec::new(),
            }),
            self_ref: weak.clone(),
        });
        {
            // a fresh node is solitary: every finger points home
            let handle = node.handle();
            let mut routing = node.finger_lock.write();
            routing.fingers = vec![handle; node.finger_steps.len()];
        }
        node
    }

    /// Handle to this node usable wherever a ring member is expected.
    pub fn handle(&self) -> NodeHandle {
        let strong: Arc<Node> = self.self_ref.upgrade().expect("node no longer alive");
        strong
    }

    pub fn id(&self) -> u128 {
        self.id
    }

    /// Places a key on the ring with this node's metric
    ///
    /// # Arguments
    ///
    /// * `key` - the key to be hashed
    pub fn hash_key(&self, key: &str) -> u128 {
        self.metric.hash_key(key)
    }

    fn distance(&self, a: u128, b: u128) -> u128 {
        self.metric.distance(a, b)
    }

    fn space_mask(&self) -> u128 {
        self.metric.space_mask()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Marks the node ready to serve. Called by `setup` when joining,
    /// or directly when the node bootstraps a ring of one.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    /// Records the endpoint this node is served at
    ///
    /// # Arguments
    ///
    /// * `url` - the URL peers can reach this node through
    pub fn set_url(&self, url: &str) {
        *self.url.lock() = Some(String::from(url));
    }

    fn predecessor_of(&self, routing: &Routing) -> NodeHandle {
        routing
            .predecessor
            .clone()
            .unwrap_or_else(|| self.handle())
    }

    fn not_responsible(&self, key_hash: u128) -> Error {
        Error::NotResponsible(format!(
            "node {} is not responsible for key hash {}",
            self.id, key_hash
        ))
    }

    // ---- data operations ------------------------------------------------

    /// Whether this node owns the given hash: true when alone, or when
    /// self is closer (clockwise from the hash) than the predecessor.
    ///
    /// # Arguments
    ///
    /// * `key_hash` - the ring position being tested
    pub fn responsible_for(&self, key_hash: u128) -> Result<bool> {
        self.ensure_ready()?;
        let routing = self.finger_lock.read();
        let predecessor = self.predecessor_of(&routing);
        if predecessor.id() == self.id {
            // only node up
            return Ok(true);
        }
        Ok(self.distance(key_hash, self.id) < self.distance(key_hash, predecessor.id()))
    }

    /// Returns the value stored for a key this node owns.
    ///
    /// # Arguments
    ///
    /// * `key` - the key being queried
    pub fn get(&self, key: &str) -> Result<String> {
        self.ensure_ready()?;
        if !self.responsible_for(self.hash_key(key))? {
            return Err(self.not_responsible(self.hash_key(key)));
        }
        let data = self.data_lock.read();
        data.get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(String::from(key)))
    }

    /// Writes a key this node owns and mirrors it to the next
    /// `n_backups` successors. If any backup write fails the local
    /// write is rolled back and the error surfaces.
    ///
    /// # Arguments
    ///
    /// * `key` - the key being stored
    /// * `value` - the value being stored
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_ready()?;
        debug!("setting key {} to value {}", key, value);
        if !self.responsible_for(self.hash_key(key))? {
            return Err(self.not_responsible(self.hash_key(key)));
        }
        let mut data = self.data_lock.write();
        let old_value = data.get(key).cloned();
        data.insert(String::from(key), String::from(value));
        if let Err(e) = self.backup_write(key, value) {
            info!("problem backing up data, rolling back");
            match old_value {
                Some(v) => data.insert(String::from(key), v),
                None => data.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn backup_write(&self, key: &str, value: &str) -> Result<()> {
        if self.n_backups == 0 {
            return Ok(());
        }
        debug!("backing up in successors");
        // Each recipient is told which node preceded it in the walk so
        // it can validate its predecessor pointer.
        let mut current = self.handle();
        for entry in walk(self.next()?).take(self.n_backups) {
            let node = entry?;
            if node.id() == self.id {
                break;
            }
            node.store_backup(key, value, &current)?;
            current = node;
        }
        Ok(())
    }

    /// Stores a backup copy on behalf of the claimed predecessor. A
    /// mismatch with the actual predecessor means the ring pointers are
    /// wrong somewhere; the writer gets a distinct error so it can
    /// repair and retry.
    ///
    /// # Arguments
    ///
    /// * `key` - the key being mirrored
    /// * `value` - the value being mirrored
    /// * `claimed_predecessor` - the node the writer walked through
    ///   just before this one
    pub fn store_backup(
        &self,
        key: &str,
        value: &str,
        claimed_predecessor: &NodeHandle,
    ) -> Result<()> {
        self.ensure_ready()?;
        let mut data = self.data_lock.write();
        let predecessor = self.predecessor()?;
        if claimed_predecessor.id() != predecessor.id() {
            return Err(Error::RingBroken(format!(
                "storing backup for node {}, but actual predecessor is {}",
                claimed_predecessor.id(),
                predecessor.id()
            )));
        }
        data.insert(String::from(key), String::from(value));
        Ok(())
    }

    /// Merges a map of backup data into the local store.
    ///
    /// # Arguments
    ///
    /// * `data` - the key/value pairs to carry as backup
    pub fn update_backup(&self, data: Data) -> Result<()> {
        let mut store = self.data_lock.write();
        store.extend(data);
        Ok(())
    }

    /// Deletes a key locally. Deletes do not propagate around the ring.
    ///
    /// # Arguments
    ///
    /// * `key` - the key being removed
    pub fn delete(&self, key: &str) -> Result<()> {
        self.ensure_ready()?;
        let mut data = self.data_lock.write();
        data.remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(String::from(key)))
    }

    /// Whether the key is present locally, owned or as a backup copy
    ///
    /// # Arguments
    ///
    /// * `key` - the key being checked
    pub fn contains(&self, key: &str) -> Result<bool> {
        self.ensure_ready()?;
        let data = self.data_lock.read();
        Ok(data.contains_key(key))
    }

    /// Number of keys this node is responsible for. Backup entries
    /// share the data map, so this is O(#data) rather than O(1).
    pub fn len(&self) -> Result<usize> {
        self.ensure_ready()?;
        let data = self.data_lock.read();
        let mut count = 0;
        for key in data.keys() {
            if self.responsible_for(self.hash_key(key))? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of the keys this node is responsible for. Taken under
    /// the read lock; concurrent writes after the call are not
    /// reflected.
    pub fn iter_keys(&self) -> Result<Vec<String>> {
        self.ensure_ready()?;
        let data = self.data_lock.read();
        let mut keys = Vec::new();
        for key in data.keys() {
            if self.responsible_for(self.hash_key(key))? {
                keys.push(key.clone());
            }
        }
        Ok(keys)
    }

    // ---- routed entry points --------------------------------------------

    /// Serves a lookup locally when responsible, otherwise forwards it
    /// to the owner of the key's hash.
    ///
    /// # Arguments
    ///
    /// * `key` - the key being queried
    pub fn lookup(&self, key: &str) -> Result<String> {
        let key_hash = self.hash_key(key);
        if self.responsible_for(key_hash)? {
            return self.get(key);
        }
        let target = find_node(self.handle(), key_hash)?;
        target.lookup(key)
    }

    /// Serves a store locally when responsible, otherwise forwards it
    /// to the owner of the key's hash.
    ///
    /// # Arguments
    ///
    /// * `key` - the key being stored
    /// * `value` - the value being stored
    pub fn store(&self, key: &str, value: &str) -> Result<()> {
        let key_hash = self.hash_key(key);
        if self.responsible_for(key_hash)? {
            return self.put(key, value);
        }
        let target = find_node(self.handle(), key_hash)?;
        target.store(key, value)
    }

    // ---- pointers -------------------------------------------------------

    /// The immediate successor. Needs the lock in case a join is
    /// swinging pointers at the same time.
    pub fn next(&self) -> Result<NodeHandle> {
        let routing = self.finger_lock.read();
        Ok(routing.fingers[0].clone())
    }

    /// Installs a new successor, rewriting every finger that pointed
    /// into the arc the new successor now covers.
    ///
    /// # Arguments
    ///
    /// * `new_next` - the node taking over as the immediate successor
    pub fn set_next(&self, new_next: NodeHandle) -> Result<()> {
        let mut routing = self.finger_lock.write();
        let reach = self.distance(self.id, new_next.id());
        routing.fingers[0] = new_next.clone();
        for i in 1..routing.fingers.len() {
            if self.distance(self.id, routing.fingers[i].id()) < reach {
                routing.fingers[i] = new_next.clone();
            }
        }
        Ok(())
    }

    pub fn predecessor(&self) -> Result<NodeHandle> {
        let routing = self.finger_lock.read();
        Ok(self.predecessor_of(&routing))
    }

    /// The finger table keyed by offset.
    pub fn fingers(&self) -> Result<BTreeMap<u128, NodeHandle>> {
        let routing = self.finger_lock.read();
        Ok(self
            .finger_steps
            .iter()
            .cloned()
            .zip(routing.fingers.iter().cloned())
            .collect())
    }

    // ---- routing --------------------------------------------------------

    /// Returns the closest known node preceding `key_hash`, the local
    /// step of the O(log N) lookup.
    ///
    /// # Arguments
    ///
    /// * `key_hash` - the ring position being routed to
    pub fn closest_preceding_node(&self, key_hash: u128) -> Result<NodeHandle> {
        self.ensure_ready()?;
        let routing = self.finger_lock.read();
        let from_node = self.distance(self.id, key_hash);
        if from_node == 0 {
            // the hash is this node's id, so self succeeds its predecessor
            return Ok(self.predecessor_of(&routing));
        }
        let to_node = self.distance(key_hash, self.id);
        for (step, finger) in self
            .finger_steps
            .iter()
            .rev()
            .zip(routing.fingers.iter().rev())
        {
            if finger.id() == key_hash {
                return finger.predecessor();
            }
            if *step >= from_node {
                // following this finger would circle past the hash
                continue;
            }
            if to_node < self.distance(key_hash, finger.id()) {
                return Ok(finger.clone());
            }
        }
        Ok(self.handle())
    }

    pub fn ping(&self) -> Result<u128> {
        Ok(self.id)
    }

    // ---- joins ----------------------------------------------------------

    /// Brings `newnode` into the ring as this node's new predecessor:
    /// hands off the data it will own, installs it via `setup`, swings
    /// the neighbor pointers, and announces it around the ring.
    ///
    /// Both write locks are held through the `setup` hand-off, so no
    /// write can slip into the delegated arc while it changes hands.
    ///
    /// # Arguments
    ///
    /// * `newnode` - the joining node, still uninitialized
    pub fn prepend_node(&self, newnode: NodeHandle) -> Result<()> {
        self.ensure_ready()?;
        let old_predecessor;
        let to_delete;
        {
            let data = self.data_lock.write();
            let mut routing = self.finger_lock.write();
            old_predecessor = self.predecessor_of(&routing);
            if newnode.id() == self.id {
                return Err(Error::JoinRejected(format!(
                    "preexisting node with id {}",
                    self.id
                )));
            }
            let to_newnode = self.distance(self.id, newnode.id());
            let to_predecessor = self.distance(self.id, old_predecessor.id());
            if to_newnode < to_predecessor {
                return Err(Error::JoinRejected(String::from(
                    "nodes must be attached to their successor",
                )));
            }
            if to_newnode == to_predecessor {
                return Err(Error::JoinRejected(format!(
                    "preexisting node with id {}",
                    newnode.id()
                )));
            }

            debug!("preparing data to send");
            let mut delegated = HashMap::new();
            let mut pending = HashSet::new();
            for (k, v) in data.iter() {
                let key_hash = self.hash_key(k);
                if self.distance(key_hash, newnode.id()) < self.distance(key_hash, self.id) {
                    delegated.insert(k.clone(), v.clone());
                    // Keys held only as the predecessor's backup are not
                    // needed once the newcomer owns them; with no backup
                    // layer nothing delegated needs to stay at all.
                    if self.n_backups == 0
                        || self.distance(key_hash, old_predecessor.id())
                            < self.distance(key_hash, newnode.id())
                    {
                        pending.insert(k.clone());
                    }
                }
            }
            debug!(
                "sending {} keys to joining node {}",
                delegated.len(),
                newnode.id()
            );
            newnode.setup(
                old_predecessor.clone(),
                old_predecessor.fingers()?,
                delegated,
            )?;

            debug!("setting my predecessor to the new node");
            routing.predecessor = Some(newnode.clone());
            to_delete = pending;
        }

        // Done outside the locks: the old predecessor will come back
        // asking for fingers while it updates its own.
        debug!("setting successor of predecessor to the new node");
        old_predecessor.set_next(newnode.clone())?;

        announce(&newnode)?;

        // The unneeded values can go whenever; don't keep the caller
        // blocked for it.
        if !to_delete.is_empty() {
            let janitor: Arc<Node> = self.self_ref.upgrade().expect("node no longer alive");
            thread::spawn(move || janitor.data_cleanup(&to_delete));
        }
        Ok(())
    }

    fn data_cleanup(&self, keys: &HashSet<String>) {
        let mut data = self.data_lock.write();
        for k in keys {
            data.remove(k);
        }
        debug!("cleaned up {} handed-off keys", keys.len());
    }

    /// Installs predecessor, fingers, and data in one shot and marks
    /// the node ready. Called on a joining node by its new successor.
    ///
    /// # Arguments
    ///
    /// * `predecessor` - the node this one now succeeds
    /// * `fingers` - starting finger entries keyed by offset
    /// * `data` - the keys this node takes ownership of
    pub fn setup(
        &self,
        predecessor: NodeHandle,
        fingers: BTreeMap<u128, NodeHandle>,
        data: Data,
    ) -> Result<()> {
        debug!(
            "setting up node {} with predecessor {} and {} keys",
            self.id,
            predecessor.id(),
            data.len()
        );
        let mut store = self.data_lock.write();
        let mut routing = self.finger_lock.write();
        let mut new_fingers = Vec::with_capacity(self.finger_steps.len());
        for step in &self.finger_steps {
            match fingers.get(step) {
                Some(finger) => new_fingers.push(finger.clone()),
                None => {
                    return Err(Error::JoinRejected(format!(
                        "finger map is missing offset {}",
                        step
                    )))
                }
            }
        }
        routing.predecessor = Some(predecessor);
        routing.fingers = new_fingers;
        store.extend(data);
        self.mark_initialized();
        Ok(())
    }

    // ---- finger maintenance ---------------------------------------------

    /// Recomputes every finger, using the current entry as the search
    /// start.
    pub fn update_fingers(&self) -> Result<()> {
        let mut routing = self.finger_lock.write();
        for i in 0..self.finger_steps.len() {
            let target = self.id.wrapping_add(self.finger_steps[i]) & self.space_mask();
            let old = routing.fingers[i].clone();
            routing.fingers[i] = find_node(old, target)?;
        }
        Ok(())
    }

    /// Refreshes only the fingers a newly inserted node can have
    /// displaced. A new node displaces fingers that pointed to at most
    /// one distinct node, so the scan stops early once a refresh comes
    /// back unchanged.
    ///
    /// # Arguments
    ///
    /// * `newnode` - the node that just joined the ring
    pub fn update_fingers_on_insert(&self, newnode: &NodeHandle) -> Result<()> {
        debug!(
            "updating fingers on node {} for new node {}",
            self.id,
            newnode.id()
        );
        if newnode.id() == self.id {
            debug!("new node is self, so updating all fingers");
            return self.update_fingers();
        }
        let mut routing = self.finger_lock.write();
        let mut last_changed: Option<u128> = None;
        for i in 0..self.finger_steps.len() {
            let mut old_finger = routing.fingers[i].clone();
            if old_finger.id() == self.id {
                // a finger with our own id must be the local handle
                routing.fingers[i] = self.handle();
                old_finger = routing.fingers[i].clone();
            }
            if old_finger.id() == newnode.id() {
                // already registered, probably set during the join
                continue;
            }
            if old_finger.id() != self.id
                && self.distance(self.id, old_finger.id()) < self.distance(self.id, newnode.id())
            {
                // points before the new node; unaffected
                continue;
            }
            if let Some(changed) = last_changed {
                if old_finger.id() != changed {
                    break;
                }
            }
            let target = self.id.wrapping_add(self.finger_steps[i]) & self.space_mask();
            let refreshed = find_node(old_finger.clone(), target)?;
            routing.fingers[i] = refreshed.clone();
            if refreshed.id() == old_finger.id() {
                // unchanged, so no later finger changes either
                break;
            }
            last_changed = Some(old_finger.id());
        }
        debug!("end updating fingers for new node");
        Ok(())
    }

    /// Replaces fingers pointing at a departed node. Offsets beyond the
    /// distance to the departed node cannot point at it, so the scan
    /// stops there.
    ///
    /// # Arguments
    ///
    /// * `leaving` - the node that left the ring
    /// * `successor_of_leaving` - the node that inherited its arc
    pub fn update_fingers_on_leave(
        &self,
        leaving: &NodeHandle,
        successor_of_leaving: &NodeHandle,
    ) -> Result<()> {
        debug!("fixing fingers for departure of {}", leaving.id());
        {
            let routing = self.finger_lock.read();
            if !routing.fingers.iter().any(|f| f.id() == leaving.id()) {
                return Ok(());
            }
        }
        let to_leaving = self.distance(self.id, leaving.id());
        let mut routing = self.finger_lock.write();
        for (i, step) in self.finger_steps.iter().enumerate() {
            if *step > to_leaving {
                break;
            }
            if routing.fingers[i].id() != leaving.id() {
                continue;
            }
            routing.fingers[i] = successor_of_leaving.clone();
        }
        Ok(())
    }

    // ---- leave and repair -----------------------------------------------

    /// Gracefully leaves the ring: the successor inherits the data, the
    /// predecessor gets the new successor.
    pub fn leave(&self) -> Result<()> {
        let data = self.data_lock.write();
        let routing = self.finger_lock.read();
        info!("disconnecting from peers");
        let successor = routing.fingers[0].clone();
        let predecessor = self.predecessor_of(&routing);
        if successor.id() != self.id {
            debug!("notifying successor {}", successor.id());
            successor.predecessor_leaving(predecessor.clone(), data.clone())?;
        }
        if predecessor.id() != self.id {
            predecessor.successor_leaving(successor)?;
        }
        Ok(())
    }

    /// Absorbs a departing predecessor: merge its data, adopt its
    /// predecessor, drop fingers that pointed at it, and pass the
    /// inherited data to the successor as backup.
    ///
    /// # Arguments
    ///
    /// * `new_predecessor` - the node this one succeeds from now on
    /// * `data` - the departing predecessor's keys
    pub fn predecessor_leaving(&self, new_predecessor: NodeHandle, data: Data) -> Result<()> {
        let old_predecessor;
        {
            let mut store = self.data_lock.write();
            let mut routing = self.finger_lock.write();
            old_predecessor = self.predecessor_of(&routing);
            info!("predecessor {} shutting down", old_predecessor.id());
            debug!(
                "taking over {} keys, new predecessor {}",
                data.len(),
                new_predecessor.id()
            );
            store.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
            routing.predecessor = Some(new_predecessor);
            for i in (0..routing.fingers.len()).rev() {
                if routing.fingers[i].id() == old_predecessor.id() {
                    routing.fingers[i] = self.handle();
                } else if routing.fingers[i].id() != self.id {
                    break;
                }
            }
        }
        let next = self.next()?;
        if self.n_backups > 0 && next.id() != self.id && next.id() != old_predecessor.id() {
            next.update_backup(data)?;
        }
        Ok(())
    }

    /// Replaces a departing successor in the finger table, tells the
    /// rest of the ring, and re-sends the owned keys to the new
    /// successor as backup.
    ///
    /// # Arguments
    ///
    /// * `new_successor` - the node that took over the departed arc
    pub fn successor_leaving(&self, new_successor: NodeHandle) -> Result<()> {
        let old_successor;
        {
            let mut routing = self.finger_lock.write();
            old_successor = routing.fingers[0].clone();
            for i in 0..routing.fingers.len() {
                if routing.fingers[i].id() == old_successor.id() {
                    routing.fingers[i] = new_successor.clone();
                }
            }
        }

        for entry in walk(new_successor.clone()) {
            let node = entry?;
            if node.id() == self.id {
                break;
            }
            node.update_fingers_on_leave(&old_successor, &new_successor)?;
        }

        if self.n_backups == 0 || new_successor.id() == self.id {
            return Ok(());
        }
        debug!("backing up data on new successor");
        // A clean shutdown already moved this data; re-sending costs
        // only network time.
        let mut to_backup = HashMap::new();
        {
            let data = self.data_lock.read();
            let routing = self.finger_lock.read();
            let predecessor = self.predecessor_of(&routing);
            for (k, v) in data.iter() {
                let key_hash = self.hash_key(k);
                if predecessor.id() == self.id
                    || self.distance(key_hash, self.id) < self.distance(key_hash, predecessor.id())
                {
                    to_backup.insert(k.clone(), v.clone());
                }
            }
        }
        new_successor.update_backup(to_backup)?;
        Ok(())
    }

    /// Pings every finger, substitutes dead ones with the last
    /// responsive finger seen, recomputes the table, and finally
    /// re-derives the successor from the predecessor chain.
    pub fn repair_fingers(&self) -> Result<()> {
        info!("repairing fingers");
        {
            let mut routing = self.finger_lock.write();
            let mut furthest_known: Option<NodeHandle> = None;
            let mut unresolved: Vec<usize> = Vec::new();
            for i in 0..routing.fingers.len() {
                let finger = routing.fingers[i].clone();
                match finger.ping() {
                    Ok(_) => {
                        if furthest_known.is_none() {
                            // back-propagate the first live finger over
                            // the dead slots before it
                            for j in unresolved.drain(..) {
                                routing.fingers[j] = finger.clone();
                            }
                        }
                        furthest_known = Some(finger);
                    }
                    Err(_) => match &furthest_known {
                        Some(known) => routing.fingers[i] = known.clone(),
                        None => unresolved.push(i),
                    },
                }
            }
            // Nothing answered at all: point the leftovers home and let
            // the successor repair below recover whatever is reachable.
            for j in unresolved {
                warn!("no responsive finger found for slot {}", j);
                routing.fingers[j] = self.handle();
            }
        }
        // every slot points somewhere live, now correct them
        self.update_fingers()?;
        // Repair the successor more carefully: it must be the node that
        // considers us its predecessor.
        self.repair_successor()
    }

    /// Walks the predecessor chain back from the current successor
    /// until reaching the node that names self as its predecessor.
    pub fn repair_successor(&self) -> Result<()> {
        let mut routing = self.finger_lock.write();
        debug!("ensuring successor points to a node with us as predecessor");
        let mut seen = HashSet::new();
        let mut successor = routing.fingers[0].clone();
        loop {
            let predecessor = successor.predecessor()?;
            if predecessor.id() == self.id {
                break;
            }
            if !seen.insert(predecessor.id()) {
                return Err(Error::RingBroken(format!(
                    "predecessor chain loops at {}",
                    predecessor.id()
                )));
            }
            successor = predecessor;
        }
        routing.fingers[0] = successor;
        Ok(())
    }

    /// Checks the predecessor and, if it is down, adopts the last
    /// responsive node before it and notifies it that its successor
    /// has left.
    pub fn repair_predecessor(&self) -> Result<()> {
        debug!("repairing predecessor");
        let adopted;
        {
            let mut routing = self.finger_lock.write();
            let old_predecessor = self.predecessor_of(&routing);
            if old_predecessor.ping().is_ok() {
                return Ok(());
            }
            warn!("preceding node {} down", old_predecessor.id());

            // who should it be...
            let mut furthest_known = self.handle();
            for i in (0..routing.fingers.len()).rev() {
                let finger = routing.fingers[i].clone();
                if finger.id() == self.id {
                    continue;
                } else if finger.id() == old_predecessor.id() {
                    routing.fingers[i] = self.handle();
                } else {
                    furthest_known = finger;
                    break;
                }
            }
            if furthest_known.id() == self.id {
                warn!("unable to find any other nodes");
                routing.predecessor = Some(self.handle());
                return Ok(());
            }

            // Walk the successors from the furthest live finger up to
            // the hop just before the dead predecessor, then try the
            // candidates back to front; only the predecessor itself is
            // expected to be down.
            debug!("walking for a replacement predecessor");
            let mut candidates = Vec::new();
            for entry in walk(furthest_known) {
                let node = entry?;
                if node.id() == old_predecessor.id() {
                    break;
                }
                candidates.push(node);
            }
            let mut replacement = None;
            while let Some(candidate) = candidates.pop() {
                if candidate.ping().is_ok() {
                    replacement = Some(candidate);
                    break;
                }
            }
            match replacement {
                Some(node) => {
                    routing.predecessor = Some(node.clone());
                    adopted = node;
                }
                None => {
                    warn!("no candidate predecessor responded");
                    routing.predecessor = Some(self.handle());
                    return Ok(());
                }
            }
        }
        debug!("notifying new predecessor {}", adopted.id());
        adopted.successor_leaving(self.handle())
    }
}

impl NodeRef for Node {
    fn id(&self) -> u128 {
        self.id
    }

    fn url(&self) -> Option<String> {
        self.url.lock().clone()
    }

    fn ping(&self) -> Result<u128> {
        Node::ping(self)
    }

    fn lookup(&self, key: &str) -> Result<String> {
        Node::lookup(self, key)
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        Node::store(self, key, value)
    }

    fn store_backup(
        &self,
        key: &str,
        value: &str,
        claimed_predecessor: &NodeHandle,
    ) -> Result<()> {
        Node::store_backup(self, key, value, claimed_predecessor)
    }

    fn update_backup(&self, data: Data) -> Result<()> {
        Node::update_backup(self, data)
    }

    fn find_node(&self, key_hash: u128) -> Result<NodeHandle> {
        find_node(self.handle(), key_hash)
    }

    fn closest_preceding_node(&self, key_hash: u128) -> Result<NodeHandle> {
        Node::closest_preceding_node(self, key_hash)
    }

    fn next(&self) -> Result<NodeHandle> {
        Node::next(self)
    }

    fn set_next(&self, new_next: NodeHandle) -> Result<()> {
        Node::set_next(self, new_next)
    }

    fn predecessor(&self) -> Result<NodeHandle> {
        Node::predecessor(self)
    }

    fn fingers(&self) -> Result<BTreeMap<u128, NodeHandle>> {
        Node::fingers(self)
    }

    fn prepend_node(&self, newnode: NodeHandle) -> Result<()> {
        Node::prepend_node(self, newnode)
    }

    fn setup(
        &self,
        predecessor: NodeHandle,
        fingers: BTreeMap<u128, NodeHandle>,
        data: Data,
    ) -> Result<()> {
        Node::setup(self, predecessor, fingers, data)
    }

    fn update_fingers_on_insert(&self, newnode: &NodeHandle) -> Result<()> {
        Node::update_fingers_on_insert(self, newnode)
    }

    fn update_fingers_on_leave(
        &self,
        leaving: &NodeHandle,
        successor_of_leaving: &NodeHandle,
    ) -> Result<()> {
        Node::update_fingers_on_leave(self, leaving, successor_of_leaving)
    }

    fn successor_leaving(&self, new_successor: NodeHandle) -> Result<()> {
        Node::successor_leaving(self, new_successor)
    }

    fn predecessor_leaving(&self, new_predecessor: NodeHandle, data: Data) -> Result<()> {
        Node::predecessor_leaving(self, new_predecessor, data)
    }

    fn repair_fingers(&self) -> Result<()> {
        Node::repair_fingers(self)
    }

    fn repair_predecessor(&self) -> Result<()> {
        Node::repair_predecessor(self)
    }

    fn leave(&self) -> Result<()> {
        Node::leave(self)
    }
}

/// Advances from `start` one closest-preceding hop at a time until the
/// routing reaches a fixpoint: the node that precedes `key_hash`.
///
/// # Arguments
///
/// * `start` - the node the search begins at
/// * `key_hash` - the ring position being located
pub fn find_predecessor(start: NodeHandle, key_hash: u128) -> Result<NodeHandle> {
    debug!(
        "finding predecessor for {} starting at node {}",
        key_hash,
        start.id()
    );
    let mut current = start;
    loop {
        let next = current.closest_preceding_node(key_hash)?;
        if next.id() == current.id() {
            return Ok(current);
        }
        current = next;
    }
}

/// The node responsible for `key_hash`: the successor of its
/// predecessor.
///
/// # Arguments
///
/// * `start` - the node the search begins at
/// * `key_hash` - the ring position being located
pub fn find_node(start: NodeHandle, key_hash: u128) -> Result<NodeHandle> {
    Ok(find_predecessor(start, key_hash)?.next()?)
}

/// Iterator over the ring's successor chain starting at `start`,
/// ending when the walk returns to its start. Seeing any other id
/// twice means the pointers are broken.
pub struct RingWalk {
    start_id: u128,
    pending: Option<NodeHandle>,
    prev: Option<NodeHandle>,
    seen: HashSet<u128>,
}

/// Walks the successor chain starting at a node
///
/// # Arguments
///
/// * `start` - the node the walk begins and ends at
pub fn walk(start: NodeHandle) -> RingWalk {
    RingWalk {
        start_id: start.id(),
        pending: Some(start),
        prev: None,
        seen: HashSet::new(),
    }
}

impl Iterator for RingWalk {
    type Item = Result<NodeHandle>;

    fn next(&mut self) -> Option<Result<NodeHandle>> {
        let node = match self.pending.take() {
            Some(start) => start,
            None => {
                let prev = self.prev.take()?;
                let successor = match prev.next() {
                    Ok(successor) => successor,
                    Err(e) => return Some(Err(e)),
                };
                if successor.id() == self.start_id {
                    return None;
                }
                successor
            }
        };
        if !self.seen.insert(node.id()) {
            return Some(Err(Error::RingBroken(format!(
                "infinite loop: seen {} twice",
                node.id()
            ))));
        }
        self.prev = Some(node.clone());
        Some(Ok(node))
    }
}

/// Walks the ring forward from the new node's successor so every peer
/// can refresh the fingers that now ought to point through it.
///
/// # Arguments
///
/// * `new_node` - the node that just joined the ring
pub fn announce(new_node: &NodeHandle) -> Result<()> {
    let mut seen = HashSet::new();
    let mut current = new_node.next()?;
    while current.id() != new_node.id() {
        if !seen.insert(current.id()) {
            return Err(Error::RingBroken(format!(
                "announce looped: seen {} twice",
                current.id()
            )));
        }
        info!("announcing new node {} to node {}", new_node.id(), current.id());
        current.update_fingers_on_insert(new_node)?;
        current = current.next()?;
    }
    Ok(())
}
