//! Intrusive circular doubly-linked lists with a sentinel node.
//!
//! Nodes are named by `u32` index. A `ChunkList` is nothing but the index of its sentinel; the
//! links themselves live wherever the `LinkStore` keeps them (for chunks, inside the chunk
//! header, right in front of the payload). That way a node can unlink itself without knowing
//! which list it is on, and a list costs no memory of its own.

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Links {
    pub prev: u32,
    pub next: u32,
}

/// Storage for the links of every node a list may touch, sentinels included.
pub trait LinkStore {
    fn links(&self, node: u32) -> Links;

    fn set_links(&mut self, node: u32, links: Links);

    fn set_next(&mut self, node: u32, next: u32) {
        let Links { prev, .. } = self.links(node);
        self.set_links(node, Links { prev, next });
    }

    fn set_prev(&mut self, node: u32, prev: u32) {
        let Links { next, .. } = self.links(node);
        self.set_links(node, Links { prev, next });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkList {
    sentinel: u32,
}

impl ChunkList {
    /// Point the sentinel at itself and hand back the (empty) list it heads.
    pub fn create_empty<S: LinkStore>(store: &mut S, sentinel: u32) -> Self {
        store.set_links(sentinel, Links { prev: sentinel, next: sentinel });
        Self { sentinel }
    }

    #[cfg(test)]
    pub fn sentinel(self) -> u32 {
        self.sentinel
    }

    #[inline(always)]
    pub fn is_empty<S: LinkStore>(self, store: &S) -> bool {
        store.links(self.sentinel).next == self.sentinel
    }

    /// The first node, without removing it.
    #[inline(always)]
    pub fn front<S: LinkStore>(self, store: &S) -> Option<u32> {
        let first = store.links(self.sentinel).next;
        (first != self.sentinel).then_some(first)
    }

    #[inline(always)]
    pub fn push_front<S: LinkStore>(self, store: &mut S, node: u32) {
        debug_assert!(node != self.sentinel);
        insert_after(store, self.sentinel, node);
    }

    #[inline(always)]
    pub fn push_back<S: LinkStore>(self, store: &mut S, node: u32) {
        debug_assert!(node != self.sentinel);
        let last = store.links(self.sentinel).prev;
        insert_after(store, last, node);
    }

    #[inline(always)]
    pub fn pop_front<S: LinkStore>(self, store: &mut S) -> Option<u32> {
        let first = self.front(store)?;
        unlink(store, first);
        Some(first)
    }

    /// O(n). Only for census and assertions.
    pub fn len<S: LinkStore>(self, store: &S) -> usize {
        self.iter(store).count()
    }

    pub fn iter<S: LinkStore>(self, store: &S) -> Iter<'_, S> {
        Iter { store, sentinel: self.sentinel, cur: store.links(self.sentinel).next }
    }
}

#[inline(always)]
fn insert_after<S: LinkStore>(store: &mut S, at: u32, node: u32) {
    let after = store.links(at).next;
    store.set_links(node, Links { prev: at, next: after });
    store.set_next(at, node);
    store.set_prev(after, node);
}

/// Remove `node` from whichever list currently holds it. The node is left pointing at itself.
#[inline(always)]
pub fn unlink<S: LinkStore>(store: &mut S, node: u32) {
    let Links { prev, next } = store.links(node);
    debug_assert_eq!(store.links(prev).next, node);
    debug_assert_eq!(store.links(next).prev, node);

    store.set_next(prev, next);
    store.set_prev(next, prev);
    store.set_links(node, Links { prev: node, next: node });
}

pub struct Iter<'a, S> {
    store: &'a S,
    sentinel: u32,
    cur: u32,
}

impl<S: LinkStore> Iterator for Iter<'_, S> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cur == self.sentinel {
            return None;
        }
        let node = self.cur;
        self.cur = self.store.links(node).next;
        Some(node)
    }
}
