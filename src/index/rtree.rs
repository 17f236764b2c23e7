use std::collections::HashMap;

use super::{IndexKind, IndexStats, SpatialIndex};
use crate::geometry::Envelope;

/// Node capacity; minimum occupancy after a split is half of it.
const MAX_ENTRIES: usize = 16;

#[derive(Debug)]
enum Node {
    Leaf {
        envelope: Envelope,
        entries: Vec<(i64, Envelope)>,
    },
    Branch {
        envelope: Envelope,
        children: Vec<Node>,
    },
}

impl Node {
    fn empty_leaf() -> Node {
        Node::Leaf {
            envelope: Envelope::EMPTY,
            entries: Vec::new(),
        }
    }

    fn envelope(&self) -> Envelope {
        match self {
            Node::Leaf { envelope, .. } | Node::Branch { envelope, .. } => *envelope,
        }
    }

    /// Descends along the least-enlargement path; splits full nodes by
    /// equal halves of the current entry order and returns the sibling.
    fn insert(&mut self, fid: i64, entry: Envelope) -> Option<Node> {
        match self {
            Node::Leaf { envelope, entries } => {
                entries.push((fid, entry));
                *envelope = envelope.union(&entry);
                if entries.len() > MAX_ENTRIES {
                    let upper = entries.split_off(entries.len() / 2);
                    *envelope = entries_envelope(entries);
                    return Some(Node::Leaf {
                        envelope: entries_envelope(&upper),
                        entries: upper,
                    });
                }
                None
            }
            Node::Branch { envelope, children } => {
                *envelope = envelope.union(&entry);
                let chosen = choose_child(children, &entry);
                if let Some(sibling) = children[chosen].insert(fid, entry) {
                    children.push(sibling);
                    if children.len() > MAX_ENTRIES {
                        let upper = children.split_off(children.len() / 2);
                        *envelope = children_envelope(children);
                        return Some(Node::Branch {
                            envelope: children_envelope(&upper),
                            children: upper,
                        });
                    }
                }
                None
            }
        }
    }

    fn search(&self, probe: &Envelope, hits: &mut Vec<i64>) {
        match self {
            Node::Leaf { entries, .. } => {
                for (fid, entry) in entries {
                    if entry.intersects(probe) {
                        hits.push(*fid);
                    }
                }
            }
            Node::Branch { children, .. } => {
                for child in children {
                    if child.envelope().intersects(probe) {
                        child.search(probe, hits);
                    }
                }
            }
        }
    }

    fn node_count(&self) -> usize {
        match self {
            Node::Leaf { .. } => 1,
            Node::Branch { children, .. } => {
                1 + children.iter().map(Node::node_count).sum::<usize>()
            }
        }
    }

    fn depth(&self) -> usize {
        match self {
            Node::Leaf { .. } => 1,
            Node::Branch { children, .. } => {
                1 + children.iter().map(Node::depth).max().unwrap_or(0)
            }
        }
    }
}

fn entries_envelope(entries: &[(i64, Envelope)]) -> Envelope {
    entries
        .iter()
        .fold(Envelope::EMPTY, |acc, (_, envelope)| acc.union(envelope))
}

fn children_envelope(children: &[Node]) -> Envelope {
    children
        .iter()
        .fold(Envelope::EMPTY, |acc, child| acc.union(&child.envelope()))
}

/// Least enlargement wins; ties broken by smaller current area.
fn choose_child(children: &[Node], entry: &Envelope) -> usize {
    let mut best = 0;
    let mut best_enlargement = f64::INFINITY;
    let mut best_area = f64::INFINITY;
    for (position, child) in children.iter().enumerate() {
        let current = child.envelope();
        let enlargement = current.union(entry).area() - current.area();
        let area = current.area();
        if enlargement < best_enlargement
            || (enlargement == best_enlargement && area < best_area)
        {
            best = position;
            best_enlargement = enlargement;
            best_area = area;
        }
    }
    best
}

pub struct RTreeIndex {
    root: Node,
    envelopes: HashMap<i64, Envelope>,
}

impl Default for RTreeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl RTreeIndex {
    pub fn new() -> Self {
        RTreeIndex {
            root: Node::empty_leaf(),
            envelopes: HashMap::new(),
        }
    }

    pub(crate) fn entry_map(&self) -> &HashMap<i64, Envelope> {
        &self.envelopes
    }
}

impl SpatialIndex for RTreeIndex {
    fn insert(&mut self, fid: i64, envelope: Envelope) {
        if envelope.is_empty() {
            return;
        }
        let _previous = self.envelopes.insert(fid, envelope);
        if let Some(sibling) = self.root.insert(fid, envelope) {
            let old_root = std::mem::replace(&mut self.root, Node::empty_leaf());
            let envelope = old_root.envelope().union(&sibling.envelope());
            self.root = Node::Branch {
                envelope,
                children: vec![old_root, sibling],
            };
        }
    }

    /// Removal drops the id from the entry map; the structural copy is
    /// filtered out at query time.
    fn remove(&mut self, fid: i64) {
        let _removed = self.envelopes.remove(&fid);
    }

    fn query(&self, envelope: &Envelope) -> Vec<i64> {
        let mut hits = Vec::new();
        self.root.search(envelope, &mut hits);
        hits.retain(|fid| {
            self.envelopes
                .get(fid)
                .is_some_and(|stored| stored.intersects(envelope))
        });
        hits.sort_unstable();
        hits.dedup();
        hits
    }

    fn count(&self) -> usize {
        self.envelopes.len()
    }

    fn clear(&mut self) {
        self.root = Node::empty_leaf();
        self.envelopes.clear();
    }

    fn envelope_of(&self, fid: i64) -> Option<Envelope> {
        self.envelopes.get(&fid).copied()
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            kind: IndexKind::RTree,
            entries: self.envelopes.len(),
            nodes: self.root.node_count(),
            depth: self.root.depth(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(fid: i64) -> (i64, Envelope) {
        // 10x10 grid of unit squares.
        let x = (fid % 10) as f64;
        let y = (fid / 10) as f64;
        (fid, Envelope::new(x, y, x + 1.0, y + 1.0))
    }

    #[test]
    fn splitting_keeps_every_entry_reachable() {
        let mut index = RTreeIndex::new();
        for fid in 0..100 {
            let (fid, envelope) = tile(fid);
            index.insert(fid, envelope);
        }
        assert_eq!(index.count(), 100);
        let stats = index.stats();
        assert!(stats.depth > 1, "one hundred entries must split the root");
        for fid in 0..100 {
            let (fid, envelope) = tile(fid);
            assert!(index.query(&envelope).contains(&fid));
        }
    }

    #[test]
    fn search_prunes_disjoint_subtrees() {
        let mut index = RTreeIndex::new();
        for fid in 0..100 {
            let (fid, envelope) = tile(fid);
            index.insert(fid, envelope);
        }
        // Strictly inside the unit square of feature 0 (corner tiles
        // touch at shared edges, which still intersects).
        let hits = index.query(&Envelope::new(0.2, 0.2, 0.8, 0.8));
        assert_eq!(hits, vec![0]);
    }

    #[test]
    fn duplicate_envelopes_coexist() {
        let mut index = RTreeIndex::new();
        let envelope = Envelope::new(0.0, 0.0, 1.0, 1.0);
        for fid in 0..40 {
            index.insert(fid, envelope);
        }
        let hits = index.query(&envelope);
        assert_eq!(hits.len(), 40);
    }
}
