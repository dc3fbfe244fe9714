use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::PeerId;
use super::tracking::{AckTracker, FIRST_SEQUENCE, ReceiveTracker, next_sequence};

/// Hard ceiling on simultaneous peers, whatever the settings say.
pub const MAX_PEERS: u32 = 4095;

const MAX_IN_FLIGHT: usize = 1024;
const REORDER_WINDOW: u32 = 256;

/// One remote endpoint and its reliability state.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub client_salt: u64,
    pub acks: AckTracker,
    pub receive: ReceiveTracker,
    pub last_receive: Instant,
    pub last_send: Instant,
    send_sequence: u32,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr, client_salt: u64, now: Instant) -> Self {
        Self {
            id,
            addr,
            client_salt,
            acks: AckTracker::new(MAX_IN_FLIGHT),
            receive: ReceiveTracker::new(REORDER_WINDOW),
            last_receive: now,
            last_send: now,
            send_sequence: FIRST_SEQUENCE,
        }
    }

    /// Hands out the next payload sequence.
    pub fn take_sequence(&mut self) -> u32 {
        let sequence = self.send_sequence;
        self.send_sequence = next_sequence(sequence);
        sequence
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_receive = now;
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_receive) >= timeout
    }

    pub fn needs_keepalive(&self, now: Instant, interval: Duration) -> bool {
        now.duration_since(self.last_send) >= interval
    }
}

/// Salt for a new handshake.
pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut hasher = RandomState::new().build_hasher();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    hasher.write_u64(nanos);
    hasher.finish()
}

/// Server-side table of connected peers, indexed by id and by address.
#[derive(Debug)]
pub struct PeerTable {
    by_addr: HashMap<SocketAddr, PeerId>,
    peers: HashMap<PeerId, Peer>,
    next_id: u32,
    max_peers: u32,
}

impl PeerTable {
    pub fn new(max_peers: u32) -> Self {
        Self {
            by_addr: HashMap::new(),
            peers: HashMap::new(),
            next_id: 1,
            max_peers: max_peers.clamp(1, MAX_PEERS),
        }
    }

    pub fn set_max_peers(&mut self, max_peers: u32) {
        self.max_peers = max_peers.clamp(1, MAX_PEERS);
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers as usize
    }

    /// Adds a peer for `addr`, or returns `None` when the table is full.
    pub fn insert(&mut self, addr: SocketAddr, client_salt: u64, now: Instant) -> Option<&mut Peer> {
        if self.is_full() {
            return None;
        }

        let id = self.issue_id();
        self.by_addr.insert(addr, id);
        Some(
            self.peers
                .entry(id)
                .or_insert_with(|| Peer::new(id, addr, client_salt, now)),
        )
    }

    fn issue_id(&mut self) -> PeerId {
        loop {
            let id = PeerId(self.next_id);
            self.next_id = match self.next_id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if !self.peers.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn id_for(&self, addr: &SocketAddr) -> Option<PeerId> {
        self.by_addr.get(addr).copied()
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut Peer> {
        let id = self.by_addr.get(addr)?;
        self.peers.get_mut(id)
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        let peer = self.peers.remove(&id)?;
        self.by_addr.remove(&peer.addr);
        Some(peer)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|peer| peer.is_timed_out(now, timeout))
            .map(|peer| peer.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.by_addr.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn ids_start_at_one() {
        let now = Instant::now();
        let mut table = PeerTable::new(4);
        let first = table.insert(addr(1000), 1, now).unwrap().id;
        let second = table.insert(addr(1001), 2, now).unwrap().id;
        assert_eq!(first, PeerId(1));
        assert_eq!(second, PeerId(2));
        assert_eq!(table.id_for(&addr(1001)), Some(second));
        assert_eq!(table.ids(), vec![first, second]);
    }

    #[test]
    fn full_table_refuses() {
        let now = Instant::now();
        let mut table = PeerTable::new(1);
        assert!(table.insert(addr(1000), 1, now).is_some());
        assert!(table.insert(addr(1001), 2, now).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_clears_both_indices() {
        let now = Instant::now();
        let mut table = PeerTable::new(4);
        let id = table.insert(addr(1000), 1, now).unwrap().id;
        assert!(table.remove(id).is_some());
        assert!(table.id_for(&addr(1000)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn max_peers_is_capped() {
        let table = PeerTable::new(u32::MAX);
        assert_eq!(table.max_peers, MAX_PEERS);
    }

    #[test]
    fn timeouts_are_reported() {
        let now = Instant::now();
        let mut table = PeerTable::new(4);
        let id = table.insert(addr(1000), 1, now).unwrap().id;
        let later = now + Duration::from_secs(11);
        assert_eq!(table.timed_out(later, Duration::from_secs(10)), vec![id]);
        assert!(table.timed_out(now, Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn salts_differ() {
        assert_ne!(rand_u64(), rand_u64());
    }

    #[test]
    fn sequences_start_at_one() {
        let mut peer = Peer::new(PeerId(1), addr(1000), 0, Instant::now());
        assert_eq!(peer.take_sequence(), 1);
        assert_eq!(peer.take_sequence(), 2);
    }
}
