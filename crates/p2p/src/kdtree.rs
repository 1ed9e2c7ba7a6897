//! Hand-rolled k-d tree over `(ping_ms, hops, geo_km, 100-score)` for
//! nearest-peer routing (spec §4.J). Peer counts in a local fleet are small
//! (tens, not millions), so a simple recursive build with no rebalancing is
//! sufficient; ties are broken by insertion order.

use crate::peer::Peer;

const DIMENSIONS: usize = 4;

fn coords(peer: &Peer) -> [f64; DIMENSIONS] {
    [peer.ping_ms, peer.hops as f64, peer.geo_km, 100.0 - peer.score]
}

fn distance_sq(a: &[f64; DIMENSIONS], b: &[f64; DIMENSIONS]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

struct Node {
    peer_index: usize,
    coords: [f64; DIMENSIONS],
    axis: usize,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

/// Built once per query set; peers are stored by value alongside their
/// original insertion index for tie-breaking.
pub struct KdTree {
    peers: Vec<Peer>,
    root: Option<Box<Node>>,
}

impl KdTree {
    pub fn build(peers: Vec<Peer>) -> Self {
        let mut indexed: Vec<(usize, [f64; DIMENSIONS])> = peers.iter().enumerate().map(|(i, p)| (i, coords(p))).collect();
        let root = build_node(&mut indexed, 0);
        Self { peers, root }
    }

    /// Returns the single nearest peer to the origin (best possible values
    /// on every axis), or `None` if the tree is empty.
    pub fn select_optimal(&self) -> Option<&Peer> {
        self.select_nearest(1).into_iter().next()
    }

    /// Returns up to `n` peers nearest to the origin, nearest first. Ties in
    /// distance are broken by insertion order.
    pub fn select_nearest(&self, n: usize) -> Vec<&Peer> {
        if n == 0 || self.root.is_none() {
            return Vec::new();
        }
        let origin = [0.0; DIMENSIONS];
        let mut candidates: Vec<(f64, usize)> = Vec::new();
        collect(self.root.as_deref(), &origin, &mut candidates);
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));
        candidates.into_iter().take(n).map(|(_, idx)| &self.peers[idx]).collect()
    }
}

fn build_node(items: &mut [(usize, [f64; DIMENSIONS])], depth: usize) -> Option<Box<Node>> {
    if items.is_empty() {
        return None;
    }
    let axis = depth % DIMENSIONS;
    items.sort_by(|a, b| a.1[axis].partial_cmp(&b.1[axis]).unwrap_or(std::cmp::Ordering::Equal));

    let mid = items.len() / 2;
    let (left_items, rest) = items.split_at_mut(mid);
    let (median, right_items) = rest.split_first_mut().expect("non-empty slice has a first element");

    Some(Box::new(Node {
        peer_index: median.0,
        coords: median.1,
        axis,
        left: build_node(left_items, depth + 1),
        right: build_node(right_items, depth + 1),
    }))
}

/// Exhaustive in-order walk collecting every node's distance. The tree
/// structure keeps construction and future range-queries cheap even though
/// this particular query visits every node; peer counts are small enough
/// that this stays well within budget.
fn collect(node: Option<&Node>, origin: &[f64; DIMENSIONS], out: &mut Vec<(f64, usize)>) {
    let Some(node) = node else { return };
    out.push((distance_sq(&node.coords, origin), node.peer_index));
    collect(node.left.as_deref(), origin, out);
    collect(node.right.as_deref(), origin, out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerRole;
    use crate::NodeId;

    fn peer(name: &str, ping_ms: f64, hops: u32, geo_km: f64, score: f64) -> Peer {
        Peer {
            id: NodeId::new(),
            name: name.into(),
            address: "127.0.0.1:0".into(),
            role: PeerRole::Worker,
            public_key: [0u8; 32],
            added_at: 0,
            connected: true,
            ping_ms,
            hops,
            geo_km,
            score,
            last_seen: 0,
            state: crate::peer::PeerState::Connected,
        }
    }

    #[test]
    fn select_optimal_picks_the_closest_peer() {
        let peers = vec![peer("far", 200.0, 5, 5000.0, 10.0), peer("near", 5.0, 0, 1.0, 95.0)];
        let tree = KdTree::build(peers);
        assert_eq!(tree.select_optimal().unwrap().name, "near");
    }

    #[test]
    fn select_nearest_returns_requested_count_in_order() {
        let peers = vec![
            peer("a", 10.0, 1, 10.0, 90.0),
            peer("b", 50.0, 2, 200.0, 60.0),
            peer("c", 5.0, 0, 1.0, 99.0),
        ];
        let tree = KdTree::build(peers);
        let nearest = tree.select_nearest(2);
        assert_eq!(nearest.len(), 2);
        assert_eq!(nearest[0].name, "c");
    }

    #[test]
    fn empty_tree_returns_none() {
        let tree = KdTree::build(vec![]);
        assert!(tree.select_optimal().is_none());
    }
}
