// File: rwlock.rs
//
// The purpose of this file is to provide the reader/writer lock used to
// guard a node's data and routing state: writer-preferring, reentrant
// for the holding thread, with scoped guards for both modes.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

/// A reader/writer lock that allows multiple readers or one writer.
///
/// Writers have priority over readers: once a writer is waiting, new
/// readers queue behind it. The lock is reentrant in a limited fashion:
/// a thread holding a read lock can take another read lock, a thread
/// holding the write lock can take the write lock again, and a writer
/// may additionally take a read lock (counted as one more write level).
/// A thread holding only a read lock must not request the write lock;
/// that upgrade is a programming error and panics.
pub struct RwLock<T> {
    state: Mutex<LockState>,
    readers: Condvar,
    writers: Condvar,
    value: UnsafeCell<T>,
}

// The exclusion rules above guarantee that `&mut T` is only reachable
// from the single thread currently holding the write lock.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send> Sync for RwLock<T> {}

struct LockState {
    // positive: active read acquisitions, negative: write recursion depth
    held: isize,
    waiting_readers: usize,
    waiting_writers: usize,
    // threads will be few, so a plain list is not inefficient
    owners: Vec<ThreadId>,
}

impl LockState {
    fn owns(&self, me: ThreadId) -> bool {
        self.owners.contains(&me)
    }

    fn try_write(&mut self, me: ThreadId) -> bool {
        if self.held == 0 || (self.held < 0 && self.owns(me)) {
            self.held -= 1;
            self.owners.push(me);
            return true;
        }
        if self.held > 0 && self.owns(me) {
            panic!("cannot upgrade a read lock to a write lock");
        }
        false
    }

    fn try_read(&mut self, me: ThreadId) -> bool {
        if self.held < 0 {
            // Write-locked. The owning thread may reenter; it goes on
            // the books as one more write level so release bookkeeping
            // stays uniform.
            if self.owns(me) {
                self.held -= 1;
                self.owners.push(me);
                return true;
            }
            return false;
        }
        if self.waiting_writers == 0 || self.owns(me) {
            self.held += 1;
            self.owners.push(me);
            return true;
        }
        false
    }
}

impl<T> RwLock<T> {
    /// Returns a new unlocked lock
    ///
    /// # Arguments
    ///
    /// * `value` - the state the lock guards
    pub fn new(value: T) -> RwLock<T> {
        RwLock {
            state: Mutex::new(LockState {
                held: 0,
                waiting_readers: 0,
                waiting_writers: 0,
                owners: Vec::new(),
            }),
            readers: Condvar::new(),
            writers: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock for reading, blocking while a writer on
    /// another thread holds it or is waiting for it.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while !state.try_read(me) {
            state.waiting_readers += 1;
            self.readers.wait(&mut state);
            state.waiting_readers -= 1;
        }
        ReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquires the lock for writing, blocking until every other thread
    /// has released it.
    pub fn write(&self) -> WriteGuard<'_, T> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while !state.try_write(me) {
            state.waiting_writers += 1;
            self.writers.wait(&mut state);
            state.waiting_writers -= 1;
        }
        WriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owners.iter().position(|&owner| owner == me) {
            Some(pos) => {
                state.owners.swap_remove(pos);
            }
            None => panic!("cannot release an unacquired lock"),
        }
        if state.held > 0 {
            state.held -= 1;
        } else {
            state.held += 1;
        }
        if state.held == 0 {
            if state.waiting_writers > 0 {
                self.writers.notify_one();
            } else if state.waiting_readers > 0 {
                self.readers.notify_all();
            }
        }
    }
}

/// Scoped read access. Released on drop.
pub struct ReadGuard<'a, T> {
    lock: &'a RwLock<T>,
    // release must happen on the acquiring thread
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Scoped write access. Released on drop.
pub struct WriteGuard<'a, T> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reentrant_read() {
        let lock = RwLock::new(7);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 14);
    }

    #[test]
    fn reentrant_write() {
        let lock = RwLock::new(0);
        let mut a = lock.write();
        *a = 1;
        {
            let mut b = lock.write();
            *b = 2;
        }
        *a += 1;
        drop(a);
        assert_eq!(*lock.read(), 3);
    }

    #[test]
    fn read_under_own_write() {
        let lock = RwLock::new(5);
        let mut w = lock.write();
        *w = 6;
        drop(w);
        let w = lock.write();
        let r = lock.read();
        assert_eq!(*r, 6);
        drop(r);
        drop(w);
    }

    #[test]
    #[should_panic(expected = "upgrade")]
    fn upgrade_panics() {
        let lock = RwLock::new(0);
        let _r = lock.read();
        let _w = lock.write();
    }

    #[test]
    fn readers_run_concurrently() {
        let lock = Arc::new(RwLock::new(0usize));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(thread::spawn(move || {
                let _guard = lock.read();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn writer_excludes_other_threads() {
        let lock = Arc::new(RwLock::new(0u32));
        let writer_lock = lock.clone();
        let entered = Arc::new(AtomicUsize::new(0));
        let entered2 = entered.clone();
        let guard = lock.write();
        let reader = thread::spawn(move || {
            let g = writer_lock.read();
            entered2.store(1, Ordering::SeqCst);
            *g
        });
        thread::sleep(Duration::from_millis(80));
        assert_eq!(entered.load(Ordering::SeqCst), 0);
        drop(guard);
        reader.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn holder_can_reread_past_a_waiting_writer() {
        let lock = Arc::new(RwLock::new(0u32));
        let first = lock.read();
        let wlock = lock.clone();
        let writer = thread::spawn(move || {
            let _g = wlock.write();
        });
        thread::sleep(Duration::from_millis(80));
        // the holding thread is not starved by the queued writer
        let again = lock.read();
        assert_eq!(*again, 0);
        drop(again);
        drop(first);
        writer.join().unwrap();
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let lock = Arc::new(RwLock::new(0u32));
        let first_read = lock.read();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let wlock = lock.clone();
        let worder = order.clone();
        let writer = thread::spawn(move || {
            let _g = wlock.write();
            worder.lock().push("writer");
        });
        // let the writer queue up before starting the late reader
        thread::sleep(Duration::from_millis(80));

        let rlock = lock.clone();
        let rorder = order.clone();
        let reader = thread::spawn(move || {
            let _g = rlock.read();
            rorder.lock().push("reader");
        });
        thread::sleep(Duration::from_millis(80));
        assert!(order.lock().is_empty());

        drop(first_read);
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(*order.lock(), vec!["writer", "reader"]);
    }
}
