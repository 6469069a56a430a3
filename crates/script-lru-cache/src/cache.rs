//! Arena-backed LRU with a byte budget

use crate::types::{CacheStats, CachedObject};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

type Handle = usize;

/// Removal counters are kept per stripe of the key space, not per key
const GENERATION_STRIPES: usize = 64;

fn stripe(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % GENERATION_STRIPES as u64) as usize
}

struct Node<M> {
    key: String,
    data: Bytes,
    metadata: M,
    /// Towards the most recently used end
    prev: Option<Handle>,
    /// Towards the least recently used end
    next: Option<Handle>,
}

/// Recency list stored in a slab of nodes addressed by index.
///
/// `head` is the most recently used node, `tail` the least recently used one.
struct LruState<M> {
    slots: Vec<Option<Node<M>>>,
    free: Vec<Handle>,
    index: HashMap<String, Handle>,
    head: Option<Handle>,
    tail: Option<Handle>,
    size: u64,
    /// Bumped by every explicit removal of a key in the stripe
    generations: [u64; GENERATION_STRIPES],
}

impl<M> LruState<M> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            size: 0,
            generations: [0; GENERATION_STRIPES],
        }
    }

    fn node(&self, handle: Handle) -> &Node<M> {
        self.slots[handle]
            .as_ref()
            .expect("lru handle points at a vacant slot")
    }

    fn node_mut(&mut self, handle: Handle) -> &mut Node<M> {
        self.slots[handle]
            .as_mut()
            .expect("lru handle points at a vacant slot")
    }

    /// Unlink a node from the recency list without freeing its slot
    fn detach(&mut self, handle: Handle) {
        let (prev, next) = {
            let node = self.node(handle);
            (node.prev, node.next)
        };

        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }

        let node = self.node_mut(handle);
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, handle: Handle) {
        let old_head = self.head;
        {
            let node = self.node_mut(handle);
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.node_mut(h).prev = Some(handle);
        }
        self.head = Some(handle);
        if self.tail.is_none() {
            self.tail = Some(handle);
        }
    }

    fn allocate(&mut self, node: Node<M>) -> Handle {
        match self.free.pop() {
            Some(handle) => {
                self.slots[handle] = Some(node);
                handle
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<Node<M>> {
        let handle = self.index.remove(key)?;
        self.detach(handle);
        let node = self.slots[handle].take()?;
        self.free.push(handle);
        self.size -= node.data.len() as u64;
        Some(node)
    }

    /// Drop the least recently used node. No-op on an empty list.
    fn evict_tail(&mut self) -> Option<String> {
        let tail = self.tail?;
        let key = self.node(tail).key.clone();
        self.remove(&key);
        Some(key)
    }

    fn touch(&mut self, handle: Handle) {
        if self.head != Some(handle) {
            self.detach(handle);
            self.push_front(handle);
        }
    }

    fn keys_by_recency(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let node = self.node(handle);
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }
}

/// A size-bounded, recency-ordered key → bytes + metadata store.
///
/// All operations take one lock over the whole arena, so the cache can be
/// shared across tasks behind an `Arc`.
pub struct ScriptCache<M> {
    state: Mutex<LruState<M>>,
    /// Byte budget
    max_size: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<M: Clone> ScriptCache<M> {
    /// Create an empty cache holding at most `max_size` payload bytes
    pub fn new(max_size: u64) -> Self {
        Self {
            state: Mutex::new(LruState::new()),
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Insert or replace `key`, evicting least recently used entries first.
    ///
    /// A payload that alone meets or exceeds the budget is still stored, into
    /// an otherwise empty cache.
    pub fn put(&self, key: impl Into<String>, data: Bytes, metadata: M) {
        let mut state = self.state.lock();
        self.insert(&mut state, key.into(), data, metadata);
    }

    /// Removal generation of `key`, for a later [`put_if_unchanged`](Self::put_if_unchanged)
    pub fn generation(&self, key: &str) -> u64 {
        self.state.lock().generations[stripe(key)]
    }

    /// Insert like [`put`](Self::put), unless `key` was removed since `generation`
    /// was read. Returns whether the entry was stored.
    ///
    /// Removals of other keys that share a stripe also count, so a fill can be
    /// skipped needlessly but never lands after a removal it raced with.
    pub fn put_if_unchanged(
        &self,
        key: impl Into<String>,
        data: Bytes,
        metadata: M,
        generation: u64,
    ) -> bool {
        let key = key.into();
        let mut state = self.state.lock();
        if state.generations[stripe(&key)] != generation {
            debug!(key = %key, "Skipped cache fill after removal");
            return false;
        }
        self.insert(&mut state, key, data, metadata);
        true
    }

    fn insert(&self, state: &mut LruState<M>, key: String, data: Bytes, metadata: M) {
        let incoming = data.len() as u64;
        state.remove(&key);

        while state.size + incoming >= self.max_size {
            match state.evict_tail() {
                Some(evicted) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %evicted, "Evicted least recently used cache entry");
                }
                None => break,
            }
        }

        let handle = state.allocate(Node {
            key: key.clone(),
            data,
            metadata,
            prev: None,
            next: None,
        });
        state.push_front(handle);
        state.index.insert(key, handle);
        state.size += incoming;
    }

    /// Look up `key`, promoting it to most recently used
    pub fn get(&self, key: &str) -> Option<CachedObject<M>> {
        let mut state = self.state.lock();
        let Some(&handle) = state.index.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        state.touch(handle);
        self.hits.fetch_add(1, Ordering::Relaxed);

        let node = state.node(handle);
        Some(CachedObject {
            data: node.data.clone(),
            metadata: node.metadata.clone(),
        })
    }

    /// Remove `key` if present. Returns whether anything was removed.
    ///
    /// Fills of `key` that started before this call are refused afterwards.
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let slot = &mut state.generations[stripe(key)];
        *slot = slot.wrapping_add(1);
        state.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held
    pub fn resident_size(&self) -> u64 {
        self.state.lock().size
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().keys_by_recency()
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.index.len(),
            total_size: state.size,
            max_size: self.max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
