//! Compressed trie mapping keys to their owning partition.
//!
//! Edges carry compressed byte strings; a node holding a partition payload
//! marks that partition's left boundary key. Payload-bearing nodes are
//! threaded into a doubly linked list in byte-wise key order, which makes
//! boundary and successor queries O(1) once the tree walk lands.
//!
//! Nodes live in a slab and reference each other by [`NodeId`] handles
//! rather than pointers, so collapsing and merging nodes cannot leave a
//! dangling link.
//!
//! Invariants:
//! - the root always carries a payload (the first/default partition, with
//!   the empty boundary key);
//! - every reachable node either carries a payload or has a payload
//!   somewhere in its subtree;
//! - the prev/next threading visits payload-bearing nodes in strictly
//!   ascending boundary-key order.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::partition::Partition;

type NodeId = usize;
const NIL: NodeId = usize::MAX;

struct Node {
    /// Compressed edge string on the link from the parent.
    edge: Vec<u8>,
    children: BTreeMap<u8, NodeId>,
    parent: NodeId,
    payload: Option<Arc<Partition>>,
    /// Full boundary key; meaningful only while `payload` is set.
    key: Vec<u8>,
    prev: NodeId,
    next: NodeId,
}

impl Node {
    fn empty(parent: NodeId) -> Self {
        Self {
            edge: Vec::new(),
            children: BTreeMap::new(),
            parent,
            payload: None,
            key: Vec::new(),
            prev: NIL,
            next: NIL,
        }
    }
}

pub struct TrieIndex {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    root: NodeId,
    head: NodeId,
    tail: NodeId,
    len: usize,
}

fn lcp(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl TrieIndex {
    /// The default partition handles the whole key space until the first
    /// split; its boundary key is the empty key at the root.
    pub fn new(default_partition: Arc<Partition>) -> Self {
        let mut root = Node::empty(NIL);
        root.payload = Some(default_partition);
        Self {
            nodes: vec![root],
            free: Vec::new(),
            root: 0,
            head: 0,
            tail: 0,
            len: 1,
        }
    }

    /// Number of boundary keys (live partitions) in the index.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id] = Node::empty(NIL);
        self.free.push(id);
    }

    // ----- order-list maintenance -----

    /// In-order predecessor position of `id` among payload-bearing nodes,
    /// ignoring any payload on `id` itself and everything in its subtree
    /// (descendants extend its key and therefore sort after it).
    fn pred_position(&self, mut id: NodeId) -> NodeId {
        loop {
            let parent = self.nodes[id].parent;
            if parent == NIL {
                return NIL;
            }
            let first = self.nodes[id].edge[0];
            // Largest payload inside the nearest smaller sibling subtree.
            if let Some((_, &sibling)) = self.nodes[parent]
                .children
                .range(..first)
                .next_back()
            {
                return self.max_payload_in_subtree(sibling);
            }
            if self.nodes[parent].payload.is_some() {
                return parent;
            }
            id = parent;
        }
    }

    /// Deepest payload node on the rightmost spine below `id`.
    fn max_payload_in_subtree(&self, mut id: NodeId) -> NodeId {
        loop {
            match self.nodes[id].children.values().next_back() {
                // A childless reachable node must carry a payload.
                None => return id,
                Some(&child) => {
                    // Descendants sort after the node's own payload.
                    id = child;
                }
            }
        }
    }

    /// Thread `id` into the order list right after its predecessor.
    fn splice_after_pred(&mut self, id: NodeId) {
        let pred = self.pred_position(id);
        if pred == NIL {
            // Smaller than every existing boundary.
            let old_head = self.head;
            self.nodes[id].prev = NIL;
            self.nodes[id].next = old_head;
            if old_head != NIL {
                self.nodes[old_head].prev = id;
            }
            self.head = id;
            if self.tail == NIL {
                self.tail = id;
            }
            return;
        }
        let next = self.nodes[pred].next;
        self.nodes[id].prev = pred;
        self.nodes[id].next = next;
        self.nodes[pred].next = id;
        if next != NIL {
            self.nodes[next].prev = id;
        } else {
            self.tail = id;
        }
    }

    fn unlink(&mut self, id: NodeId) {
        let prev = self.nodes[id].prev;
        let next = self.nodes[id].next;
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[id].prev = NIL;
        self.nodes[id].next = NIL;
    }

    /// Move `from`'s place in the order list onto `to` (used when a merge
    /// absorbs a payload-bearing node into its parent).
    fn relink(&mut self, from: NodeId, to: NodeId) {
        let prev = self.nodes[from].prev;
        let next = self.nodes[from].next;
        self.nodes[to].prev = prev;
        self.nodes[to].next = next;
        if prev != NIL {
            self.nodes[prev].next = to;
        } else if self.head == from {
            self.head = to;
        }
        if next != NIL {
            self.nodes[next].prev = to;
        } else if self.tail == from {
            self.tail = to;
        }
    }

    // ----- insert -----

    /// Register `partition` as the handler at boundary `key`. An existing
    /// payload at `key` is replaced in place, keeping its order links.
    pub fn insert(&mut self, key: &[u8], partition: Arc<Partition>) {
        let mut node = self.root;
        let mut consumed = 0usize;

        loop {
            if consumed == key.len() {
                if self.nodes[node].payload.is_none() {
                    self.nodes[node].key = key.to_vec();
                    self.nodes[node].payload = Some(partition);
                    self.splice_after_pred(node);
                    self.len += 1;
                } else {
                    self.nodes[node].payload = Some(partition);
                }
                return;
            }

            let byte = key[consumed];
            let child = match self.nodes[node].children.get(&byte) {
                Some(&c) => c,
                None => {
                    let leaf = self.alloc(Node {
                        edge: key[consumed..].to_vec(),
                        children: BTreeMap::new(),
                        parent: node,
                        payload: Some(partition),
                        key: key.to_vec(),
                        prev: NIL,
                        next: NIL,
                    });
                    self.nodes[node].children.insert(byte, leaf);
                    self.splice_after_pred(leaf);
                    self.len += 1;
                    return;
                }
            };

            let matched = lcp(&self.nodes[child].edge, &key[consumed..]);
            if matched == self.nodes[child].edge.len() {
                node = child;
                consumed += matched;
                continue;
            }

            // The match stops mid-edge: split `child` into a prefix node
            // and a suffix node. The suffix node keeps the original
            // payload, children and order-list position.
            let prefix = self.alloc(Node {
                edge: self.nodes[child].edge[..matched].to_vec(),
                children: BTreeMap::new(),
                parent: node,
                payload: None,
                key: Vec::new(),
                prev: NIL,
                next: NIL,
            });
            let suffix_byte = self.nodes[child].edge[matched];
            self.nodes[child].edge.drain(..matched);
            self.nodes[child].parent = prefix;
            self.nodes[node].children.insert(byte, prefix);
            self.nodes[prefix].children.insert(suffix_byte, child);

            if consumed + matched == key.len() {
                // The key ends exactly at the split point.
                self.nodes[prefix].key = key.to_vec();
                self.nodes[prefix].payload = Some(partition);
                self.splice_after_pred(prefix);
            } else {
                let leaf = self.alloc(Node {
                    edge: key[consumed + matched..].to_vec(),
                    children: BTreeMap::new(),
                    parent: prefix,
                    payload: Some(partition),
                    key: key.to_vec(),
                    prev: NIL,
                    next: NIL,
                });
                let leaf_byte = key[consumed + matched];
                self.nodes[prefix].children.insert(leaf_byte, leaf);
                self.splice_after_pred(leaf);
            }
            self.len += 1;
            return;
        }
    }

    // ----- lookup / routing -----

    fn find_exact(&self, key: &[u8]) -> Option<NodeId> {
        let mut node = self.root;
        let mut consumed = 0usize;
        loop {
            if consumed == key.len() {
                return self.nodes[node].payload.as_ref().map(|_| node);
            }
            let &child = self.nodes[node].children.get(&key[consumed])?;
            let edge = &self.nodes[child].edge;
            if key[consumed..].len() < edge.len() || &key[consumed..consumed + edge.len()] != edge.as_slice() {
                return None;
            }
            consumed += edge.len();
            node = child;
        }
    }

    /// Exact-match lookup: the full key must be consumed at a
    /// payload-bearing node.
    pub fn lookup(&self, key: &[u8]) -> Option<Arc<Partition>> {
        self.find_exact(key)
            .and_then(|id| self.nodes[id].payload.clone())
    }

    /// Payload node with the largest boundary key `<= key`. Total because
    /// the root holds the empty boundary key.
    fn floor(&self, key: &[u8]) -> NodeId {
        let mut node = self.root;
        let mut consumed = 0usize;

        loop {
            if consumed == key.len() {
                if self.nodes[node].payload.is_some() {
                    return node;
                }
                // Everything under `node` extends (exceeds) the key.
                return self.pred_position(node);
            }

            let byte = key[consumed];
            match self.nodes[node].children.get(&byte) {
                Some(&child) => {
                    let matched = lcp(&self.nodes[child].edge, &key[consumed..]);
                    if matched == self.nodes[child].edge.len() {
                        node = child;
                        consumed += matched;
                        continue;
                    }
                    let rest = &key[consumed..];
                    if matched == rest.len() || rest[matched] < self.nodes[child].edge[matched] {
                        // The child's whole subtree sorts after the key.
                        return self.floor_before_child(node, byte);
                    }
                    // The child's whole subtree sorts before the key.
                    return self.max_payload_in_subtree(child);
                }
                None => return self.floor_before_child(node, byte),
            }
        }
    }

    /// Largest payload strictly before the (missing or oversized) child
    /// slot `byte` under `node`.
    fn floor_before_child(&self, node: NodeId, byte: u8) -> NodeId {
        if let Some((_, &smaller)) = self.nodes[node].children.range(..byte).next_back() {
            return self.max_payload_in_subtree(smaller);
        }
        if self.nodes[node].payload.is_some() {
            return node;
        }
        self.pred_position(node)
    }

    /// Owning partition for `key`: the handler registered at the boundary
    /// at or immediately before it.
    pub fn route(&self, key: &[u8]) -> Arc<Partition> {
        let id = self.floor(key);
        self.nodes[id]
            .payload
            .clone()
            .expect("floor landed on a payload-less node")
    }

    /// Boundary key of the partition at or immediately before `key`.
    pub fn left_boundary(&self, key: &[u8]) -> Vec<u8> {
        self.nodes[self.floor(key)].key.clone()
    }

    /// Boundary key at or immediately after `key`, if any.
    pub fn right_boundary(&self, key: &[u8]) -> Option<Vec<u8>> {
        let id = self.floor(key);
        if self.nodes[id].key.as_slice() == key {
            return Some(self.nodes[id].key.clone());
        }
        let next = self.nodes[id].next;
        (next != NIL).then(|| self.nodes[next].key.clone())
    }

    // ----- removal -----

    /// Remove the boundary at `key`. Removing the root's own key re-homes
    /// the in-order successor's partition onto the root, so the low end of
    /// the key space always has a handler.
    pub fn remove(&mut self, key: &[u8]) -> Result<Arc<Partition>> {
        let node = self
            .find_exact(key)
            .ok_or(Error::NotFound)?;

        if node == self.root {
            let succ = self.nodes[node].next;
            if succ == NIL {
                return Err(Error::InvalidState(
                    "cannot remove the last partition".to_string(),
                ));
            }
            let succ_payload = self.nodes[succ]
                .payload
                .clone()
                .expect("order list holds only payload nodes");
            let removed = self.nodes[node]
                .payload
                .replace(succ_payload)
                .expect("root always carries a payload");
            // The root's boundary key stays empty; the successor's slot
            // disappears.
            self.nodes[self.root].key = Vec::new();
            self.remove_node(succ);
            return Ok(removed);
        }

        let removed = self.nodes[node]
            .payload
            .take()
            .expect("find_exact returned a payload node");
        self.unlink(node);
        self.nodes[node].key = Vec::new();
        self.len -= 1;
        self.collapse_upward(node);
        Ok(removed)
    }

    fn remove_node(&mut self, node: NodeId) {
        self.nodes[node].payload = None;
        self.unlink(node);
        self.nodes[node].key = Vec::new();
        self.len -= 1;
        self.collapse_upward(node);
    }

    /// Rebalance after a payload removal: drop empty payload-less nodes and
    /// merge single-child payload-less nodes with their child, recursively
    /// toward the root.
    fn collapse_upward(&mut self, mut node: NodeId) {
        while node != self.root && self.nodes[node].payload.is_none() {
            let parent = self.nodes[node].parent;
            match self.nodes[node].children.len() {
                0 => {
                    let byte = self.nodes[node].edge[0];
                    self.nodes[parent].children.remove(&byte);
                    self.release(node);
                    node = parent;
                }
                1 => {
                    // Merge the only child's edge string into this node;
                    // the absorbed child's payload, children and order
                    // links move up with it.
                    let (_, &child) = self.nodes[node]
                        .children
                        .iter()
                        .next()
                        .expect("len checked above");
                    let child_edge = std::mem::take(&mut self.nodes[child].edge);
                    let child_payload = self.nodes[child].payload.take();
                    let child_key = std::mem::take(&mut self.nodes[child].key);
                    let child_children = std::mem::take(&mut self.nodes[child].children);
                    let absorbed_payload = child_payload.is_some();
                    {
                        let n = &mut self.nodes[node];
                        n.edge.extend_from_slice(&child_edge);
                        n.payload = child_payload;
                        n.key = child_key;
                        n.children = child_children;
                    }
                    let grandchildren: Vec<NodeId> =
                        self.nodes[node].children.values().copied().collect();
                    for gc in grandchildren {
                        self.nodes[gc].parent = node;
                    }
                    if absorbed_payload {
                        self.relink(child, node);
                    }
                    self.release(child);
                    return;
                }
                _ => return,
            }
        }
    }

    // ----- iteration -----

    /// Boundary keys and their partitions in ascending key order.
    pub fn iter(&self) -> TrieIter<'_> {
        TrieIter {
            trie: self,
            cursor: self.head,
        }
    }

    /// All live partitions, in boundary order.
    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.iter().map(|(_, p)| p).collect()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        // Order list is strictly ascending and consistent both ways.
        let mut cursor = self.head;
        let mut prev_key: Option<Vec<u8>> = None;
        let mut count = 0;
        while cursor != NIL {
            let node = &self.nodes[cursor];
            assert!(node.payload.is_some(), "order list holds a payload-less node");
            if let Some(pk) = &prev_key {
                assert!(pk < &node.key, "order list out of order");
            }
            if node.next != NIL {
                assert_eq!(self.nodes[node.next].prev, cursor, "broken backlink");
            } else {
                assert_eq!(self.tail, cursor);
            }
            prev_key = Some(node.key.clone());
            cursor = node.next;
            count += 1;
        }
        assert_eq!(count, self.len, "order list length mismatch");
        assert!(
            self.nodes[self.root].payload.is_some(),
            "root lost its payload"
        );
        self.check_no_dead_ends(self.root);
    }

    #[cfg(test)]
    fn check_no_dead_ends(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        let mut reachable = node.payload.is_some();
        for &child in node.children.values() {
            reachable |= self.check_no_dead_ends(child);
        }
        assert!(
            reachable,
            "node without a payload anywhere in its subtree"
        );
        reachable
    }
}

impl std::fmt::Debug for TrieIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrieIndex")
            .field("partitions", &self.len)
            .field("nodes", &(self.nodes.len() - self.free.len()))
            .finish()
    }
}

pub struct TrieIter<'a> {
    trie: &'a TrieIndex,
    cursor: NodeId,
}

impl<'a> Iterator for TrieIter<'a> {
    type Item = (Vec<u8>, Arc<Partition>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = &self.trie.nodes[self.cursor];
        self.cursor = node.next;
        Some((
            node.key.clone(),
            node.payload.clone().expect("order list holds payload nodes"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn partition(id: u64, left: &[u8]) -> Arc<Partition> {
        let config = EngineConfig::default()
            .partition_capacity_bytes(64 * 1024)
            .hash_bucket_count(16)
            .arena_block_size(16 * 1024);
        Arc::new(Partition::with_config(id, left.to_vec(), None, &config))
    }

    fn trie() -> TrieIndex {
        TrieIndex::new(partition(0, b""))
    }

    #[test]
    fn test_route_everything_to_default() {
        let t = trie();
        assert_eq!(t.route(b"").id(), 0);
        assert_eq!(t.route(b"anything").id(), 0);
        assert_eq!(t.route(&[0xff]).id(), 0);
        assert_eq!(t.left_boundary(b"zzz"), b"");
    }

    #[test]
    fn test_insert_and_exact_lookup() {
        let mut t = trie();
        t.insert(b"foo", partition(1, b"foo"));
        t.insert(b"foobar", partition(2, b"foobar"));
        t.check_invariants();

        assert_eq!(t.lookup(b"foo").expect("missing").id(), 1);
        assert_eq!(t.lookup(b"foobar").expect("missing").id(), 2);
        assert!(t.lookup(b"foob").is_none());
        assert!(t.lookup(b"fo").is_none());
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn test_mid_edge_split() {
        let mut t = trie();
        t.insert(b"hello", partition(1, b"hello"));
        t.insert(b"help", partition(2, b"help"));
        t.check_invariants();

        assert_eq!(t.lookup(b"hello").expect("missing").id(), 1);
        assert_eq!(t.lookup(b"help").expect("missing").id(), 2);
        // The shared prefix node carries no payload.
        assert!(t.lookup(b"hel").is_none());
    }

    #[test]
    fn test_split_point_gets_payload() {
        let mut t = trie();
        t.insert(b"hello", partition(1, b"hello"));
        t.insert(b"hel", partition(2, b"hel"));
        t.check_invariants();

        assert_eq!(t.lookup(b"hel").expect("missing").id(), 2);
        assert_eq!(t.lookup(b"hello").expect("missing").id(), 1);
    }

    #[test]
    fn test_routing_between_boundaries() {
        let mut t = trie();
        t.insert(b"b", partition(1, b"b"));
        t.insert(b"d", partition(2, b"d"));
        t.insert(b"f", partition(3, b"f"));
        t.check_invariants();

        assert_eq!(t.route(b"a").id(), 0);
        assert_eq!(t.route(b"b").id(), 1);
        assert_eq!(t.route(b"banana").id(), 1);
        assert_eq!(t.route(b"c").id(), 1);
        assert_eq!(t.route(b"d").id(), 2);
        assert_eq!(t.route(b"e").id(), 2);
        assert_eq!(t.route(b"f").id(), 3);
        assert_eq!(t.route(b"zzz").id(), 3);
    }

    #[test]
    fn test_routing_with_nested_prefixes() {
        let mut t = trie();
        t.insert(b"app", partition(1, b"app"));
        t.insert(b"apple", partition(2, b"apple"));
        t.insert(b"applesauce", partition(3, b"applesauce"));
        t.insert(b"b", partition(4, b"b"));
        t.check_invariants();

        assert_eq!(t.route(b"aardvark").id(), 0);
        assert_eq!(t.route(b"app").id(), 1);
        assert_eq!(t.route(b"appl").id(), 1);
        assert_eq!(t.route(b"apple").id(), 2);
        assert_eq!(t.route(b"apples").id(), 2);
        assert_eq!(t.route(b"applesauce").id(), 3);
        assert_eq!(t.route(b"az").id(), 3);
        assert_eq!(t.route(b"c").id(), 4);
    }

    #[test]
    fn test_boundaries() {
        let mut t = trie();
        t.insert(b"b", partition(1, b"b"));
        t.insert(b"d", partition(2, b"d"));

        assert_eq!(t.left_boundary(b"c"), b"b");
        assert_eq!(t.right_boundary(b"c"), Some(b"d".to_vec()));
        // A boundary key is its own left and right boundary.
        assert_eq!(t.left_boundary(b"b"), b"b");
        assert_eq!(t.right_boundary(b"b"), Some(b"b".to_vec()));
        assert_eq!(t.right_boundary(b"e"), None);
        assert_eq!(t.left_boundary(b"a"), b"");
    }

    #[test]
    fn test_adjacent_boundary_consistency() {
        let mut t = trie();
        t.insert(b"m", partition(1, b"m"));

        // k1 < k2 in different partitions share the boundary between them.
        let k1 = b"a";
        let k2 = b"x";
        assert_ne!(t.route(k1).id(), t.route(k2).id());
        assert_eq!(t.right_boundary(k1), Some(t.left_boundary(k2)));
    }

    #[test]
    fn test_remove_leaf_collapses() {
        let mut t = trie();
        t.insert(b"hello", partition(1, b"hello"));
        t.insert(b"help", partition(2, b"help"));
        let removed = t.remove(b"help").expect("remove failed");
        assert_eq!(removed.id(), 2);
        t.check_invariants();

        // The split prefix node collapsed back into a single edge.
        assert_eq!(t.lookup(b"hello").expect("missing").id(), 1);
        assert!(t.lookup(b"help").is_none());
        // "hello" < "help": the floor for the removed key is partition 1.
        assert_eq!(t.route(b"help").id(), 1);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_remove_interior_payload() {
        let mut t = trie();
        t.insert(b"app", partition(1, b"app"));
        t.insert(b"apple", partition(2, b"apple"));
        t.remove(b"app").expect("remove failed");
        t.check_invariants();

        assert!(t.lookup(b"app").is_none());
        assert_eq!(t.lookup(b"apple").expect("missing").id(), 2);
        assert_eq!(t.route(b"app").id(), 0);
        assert_eq!(t.route(b"apple").id(), 2);
    }

    #[test]
    fn test_remove_root_rehomes_successor() {
        let mut t = trie();
        t.insert(b"m", partition(1, b"m"));
        let removed = t.remove(b"").expect("remove failed");
        assert_eq!(removed.id(), 0);
        t.check_invariants();

        // The successor partition now handles the low key range too.
        assert_eq!(t.route(b"a").id(), 1);
        assert_eq!(t.route(b"z").id(), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_remove_last_partition_rejected() {
        let mut t = trie();
        assert!(matches!(
            t.remove(b""),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_remove_missing_key() {
        let mut t = trie();
        t.insert(b"m", partition(1, b"m"));
        assert!(matches!(t.remove(b"q"), Err(Error::NotFound)));
    }

    #[test]
    fn test_iter_in_key_order() {
        let mut t = trie();
        t.insert(b"melon", partition(3, b"melon"));
        t.insert(b"apple", partition(1, b"apple"));
        t.insert(b"mango", partition(2, b"mango"));
        t.insert(b"zebra", partition(4, b"zebra"));
        t.check_invariants();

        let keys: Vec<Vec<u8>> = t.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                b"".to_vec(),
                b"apple".to_vec(),
                b"mango".to_vec(),
                b"melon".to_vec(),
                b"zebra".to_vec(),
            ]
        );
    }

    #[test]
    fn test_replace_payload_keeps_order() {
        let mut t = trie();
        t.insert(b"m", partition(1, b"m"));
        t.insert(b"m", partition(9, b"m"));
        t.check_invariants();

        assert_eq!(t.lookup(b"m").expect("missing").id(), 9);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_many_boundaries_random_order() {
        let mut t = trie();
        let mut keys: Vec<String> = (0..50).map(|i| format!("key{:03}", i * 7 % 50)).collect();
        for (i, key) in keys.iter().enumerate() {
            t.insert(key.as_bytes(), partition(i as u64 + 1, key.as_bytes()));
        }
        t.check_invariants();
        assert_eq!(t.len(), 51);

        keys.sort();
        let listed: Vec<Vec<u8>> = t.iter().skip(1).map(|(k, _)| k).collect();
        let expected: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        assert_eq!(listed, expected);

        // Routing agrees with a linear floor scan.
        for probe in ["key000", "key0245", "key049z", "aaaa", "zzzz"] {
            let routed = t.route(probe.as_bytes());
            let expected_left = keys
                .iter()
                .rev()
                .find(|k| k.as_bytes() <= probe.as_bytes())
                .map(|k| k.as_bytes().to_vec())
                .unwrap_or_default();
            assert_eq!(routed.left_bound(), expected_left.as_slice());
        }

        // Remove every other boundary and re-check.
        for key in keys.iter().step_by(2) {
            t.remove(key.as_bytes()).expect("remove failed");
        }
        t.check_invariants();
        assert_eq!(t.len(), 26);
    }
}
