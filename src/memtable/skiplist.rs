//! Concurrent sorted map over arena offsets.
//!
//! Writers link nodes with CAS on per-level forward pointers; overwrites
//! replace a node's value word with a single 64-bit atomic store. Readers
//! never take a lock and never observe a partially linked tower: the
//! base-level CAS is the linearization point, higher levels are advisory
//! and may lag briefly.

use std::cmp::Ordering as CmpOrdering;
use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::Rng;

use crate::entry::{Entry, ValueStruct};
use crate::keys::{compare_keys, parse_ts, same_key};

use super::arena::Arena;

pub(crate) const MAX_HEIGHT: usize = 20;

/// Probability of growing a tower by one level is ~1/3.
const HEIGHT_INCREASE: u32 = u32::MAX / 3;

/// Immutable after allocation except for `value` (atomically replaced on
/// overwrite) and the tower slots (CAS-linked). Towers are trimmed to the
/// sampled height at allocation; never index a slot at or above `height`.
#[repr(C)]
pub(crate) struct Node {
    value: AtomicU64,
    key_offset: u32,
    key_size: u16,
    height: u16,
    tower: [AtomicU32; MAX_HEIGHT],
}

impl Node {
    pub(crate) const MAX_SIZE: usize = mem::size_of::<Node>();

    fn alloc(arena: &Arena, key: &[u8], vs: &ValueStruct, height: usize) -> u32 {
        let node_offset = arena.put_node(height);
        let key_offset = arena.put_key(key);
        let value_word = Self::encode_value(arena.put_val(vs), vs.encoded_size());

        let node = unsafe { &mut *arena.get_node(node_offset) };
        node.value = AtomicU64::new(value_word);
        node.key_offset = key_offset;
        node.key_size = key.len() as u16;
        node.height = height as u16;
        node_offset
    }

    fn encode_value(offset: u32, size: u32) -> u64 {
        (size as u64) << 32 | offset as u64
    }

    fn decode_value(word: u64) -> (u32, u32) {
        (word as u32, (word >> 32) as u32)
    }

    fn key<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        arena.get_key(self.key_offset, self.key_size)
    }

    fn set_value(&self, arena: &Arena, vs: &ValueStruct) {
        let word = Self::encode_value(arena.put_val(vs), vs.encoded_size());
        self.value.store(word, Ordering::SeqCst);
    }

    fn value(&self, arena: &Arena) -> ValueStruct {
        let (offset, size) = Self::decode_value(self.value.load(Ordering::SeqCst));
        arena.get_val(offset, size)
    }

    fn next_offset(&self, level: usize) -> u32 {
        debug_assert!(level < self.height as usize);
        self.tower[level].load(Ordering::SeqCst)
    }

    fn cas_next_offset(&self, level: usize, old: u32, new: u32) -> bool {
        self.tower[level]
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

pub struct Skiplist {
    height: AtomicUsize,
    head_offset: u32,
    arena: Arena,
    refs: AtomicI32,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Skiplist {
    pub fn new(arena_size: u32) -> Skiplist {
        let arena = Arena::new(arena_size);
        // The head node carries no key and spans every level.
        let head_offset = arena.put_node(MAX_HEIGHT);
        unsafe {
            (*arena.get_node(head_offset)).height = MAX_HEIGHT as u16;
        }
        Skiplist {
            height: AtomicUsize::new(1),
            head_offset,
            arena,
            refs: AtomicI32::new(1),
            on_close: Mutex::new(None),
        }
    }

    fn height(&self) -> usize {
        self.height.load(Ordering::SeqCst)
    }

    fn head(&self) -> *const Node {
        self.arena.get_node(self.head_offset)
    }

    /// Bytes consumed in the arena.
    pub fn mem_size(&self) -> u32 {
        self.arena.size()
    }

    pub fn is_empty(&self) -> bool {
        let head = unsafe { &*self.head() };
        head.next_offset(0) == 0
    }

    pub fn incr_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops one reference; at zero the `on_close` hook runs.
    pub fn decr_ref(&self) {
        let left = self.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if left > 0 {
            return;
        }
        debug_assert_eq!(left, 0, "skiplist refcount underflow");
        if let Some(hook) = self.on_close.lock().unwrap().take() {
            hook();
        }
    }

    pub fn set_on_close(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.on_close.lock().unwrap() = Some(hook);
    }

    fn random_height(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen::<u32>() <= HEIGHT_INCREASE {
            height += 1;
        }
        height
    }

    /// Walks forward on `level` starting from `before`, returning the
    /// splice `(prev, next)` around `key`. `prev == next` means the key
    /// already exists at that node.
    fn find_splice_for_level(&self, key: &[u8], mut before: u32, level: usize) -> (u32, u32) {
        loop {
            let before_node = unsafe { &*self.arena.get_node(before) };
            let next_offset = before_node.next_offset(level);
            if next_offset == 0 {
                return (before, next_offset);
            }
            let next_node = unsafe { &*self.arena.get_node(next_offset) };
            match compare_keys(key, next_node.key(&self.arena)) {
                CmpOrdering::Equal => return (next_offset, next_offset),
                CmpOrdering::Less => return (before, next_offset),
                CmpOrdering::Greater => before = next_offset,
            }
        }
    }

    /// Returns the node nearest to `key`. With `less` false: the smallest
    /// node ≥ key (or > key when `allow_equal` is false). With `less`
    /// true: the largest node ≤ key (or < key). The bool reports an exact
    /// match.
    fn find_near(&self, key: &[u8], less: bool, allow_equal: bool) -> Option<(*const Node, bool)> {
        let head = self.head();
        let mut x = head;
        let mut level = self.height() - 1;
        loop {
            let node = unsafe { &*x };
            let next_offset = node.next_offset(level);
            if next_offset == 0 {
                if level > 0 {
                    level -= 1;
                    continue;
                }
                if !less || x == head {
                    return None;
                }
                return Some((x, false));
            }

            let next = self.arena.get_node(next_offset);
            let next_node = unsafe { &*next };
            match compare_keys(key, next_node.key(&self.arena)) {
                CmpOrdering::Greater => {
                    x = next;
                }
                CmpOrdering::Equal => {
                    if allow_equal {
                        return Some((next, true));
                    }
                    if !less {
                        let after = next_node.next_offset(0);
                        if after == 0 {
                            return None;
                        }
                        return Some((self.arena.get_node(after), false));
                    }
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if x == head {
                        return None;
                    }
                    return Some((x, false));
                }
                CmpOrdering::Less => {
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if !less {
                        return Some((next, false));
                    }
                    if x == head {
                        return None;
                    }
                    return Some((x, false));
                }
            }
        }
    }

    /// Inserts `entry` or, if its internal key is already present,
    /// atomically replaces that node's value word.
    pub fn add(&self, entry: &Entry) {
        let key = entry.key.as_slice();
        let vs = entry.value_struct();

        let mut list_height = self.height();
        let mut prev = [0u32; MAX_HEIGHT + 1];
        let mut next = [0u32; MAX_HEIGHT + 1];
        prev[list_height] = self.head_offset;
        for i in (0..list_height).rev() {
            let (p, n) = self.find_splice_for_level(key, prev[i + 1], i);
            prev[i] = p;
            next[i] = n;
            if p == n {
                let node = unsafe { &*self.arena.get_node(p) };
                node.set_value(&self.arena, &vs);
                return;
            }
        }

        let height = self.random_height();
        let node_offset = Node::alloc(&self.arena, key, &vs, height);
        while height > list_height {
            match self.height.compare_exchange(
                list_height,
                height,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => list_height = current,
            }
        }

        let node = unsafe { &*self.arena.get_node(node_offset) };
        for i in 0..height {
            loop {
                if prev[i] == 0 {
                    // This level was above the list height when splices
                    // were computed; start from the head.
                    let (p, n) = self.find_splice_for_level(key, self.head_offset, i);
                    prev[i] = p;
                    next[i] = n;
                    debug_assert_ne!(p, n, "duplicate key above the base level");
                }
                node.tower[i].store(next[i], Ordering::SeqCst);
                let prev_node = unsafe { &*self.arena.get_node(prev[i]) };
                if prev_node.cas_next_offset(i, next[i], node_offset) {
                    break;
                }
                // Lost the race at this level; recompute the splice.
                let (p, n) = self.find_splice_for_level(key, prev[i], i);
                if p == n {
                    // A concurrent writer installed the same key first.
                    debug_assert_eq!(i, 0, "duplicate key above the base level");
                    let winner = unsafe { &*self.arena.get_node(p) };
                    winner.set_value(&self.arena, &vs);
                    return;
                }
                prev[i] = p;
                next[i] = n;
            }
        }
    }

    /// Returns the value of the smallest internal key ≥ `key` that shares
    /// the user-key prefix.
    pub fn get(&self, key: &[u8]) -> Option<ValueStruct> {
        let (found, _) = self.find_near(key, false, true)?;
        let node = unsafe { &*found };
        let node_key = node.key(&self.arena);
        if !same_key(key, node_key) {
            return None;
        }
        let mut vs = node.value(&self.arena);
        vs.version = parse_ts(node_key);
        Some(vs)
    }

    /// Forward iterator at the base level. It may observe concurrent
    /// inserts but never a torn node.
    pub fn iter(&self) -> SkiplistIterator<'_> {
        SkiplistIterator {
            list: self,
            node: std::ptr::null(),
        }
    }
}

pub struct SkiplistIterator<'a> {
    list: &'a Skiplist,
    node: *const Node,
}

impl SkiplistIterator<'_> {
    pub fn rewind(&mut self) {
        let head = unsafe { &*self.list.head() };
        self.node = self.list.arena.get_node(head.next_offset(0));
    }

    /// Positions at the smallest internal key ≥ `key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.node = match self.list.find_near(key, false, true) {
            Some((node, _)) => node,
            None => std::ptr::null(),
        };
    }

    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe { (*self.node).key(&self.list.arena) }
    }

    pub fn value(&self) -> ValueStruct {
        debug_assert!(self.valid());
        let node = unsafe { &*self.node };
        let mut vs = node.value(&self.list.arena);
        vs.version = parse_ts(node.key(&self.list.arena));
        vs
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        let node = unsafe { &*self.node };
        self.node = self.list.arena.get_node(node.next_offset(0));
    }
}
