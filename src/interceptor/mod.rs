use std::collections::HashMap;

use crossbeam_channel::{Receiver, Sender, unbounded};

mod nfq_message;

pub use nfq_message::NfqMessage;

/// Opaque token for a packet parked outside the live path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

/// Hands a held packet back to the network path.
pub trait Reinjector: Send + Sync {
    fn reinject(&self, handle: PacketHandle, verdict: Verdict);
}

/// Reinjections are queued here and applied by whoever owns the queue
/// handle, keeping the interceptor single-threaded.
#[derive(Debug, Clone)]
pub struct ChannelReinjector {
    tx: Sender<(PacketHandle, Verdict)>,
}

impl ChannelReinjector {
    pub fn new() -> (Self, Receiver<(PacketHandle, Verdict)>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl Reinjector for ChannelReinjector {
    fn reinject(&self, handle: PacketHandle, verdict: Verdict) {
        if self.tx.send((handle, verdict)).is_err() {
            tracing::warn!(?handle, ?verdict, "reinjection channel closed");
        }
    }
}

/// The kernel side of interception: packets still owed a verdict.
pub trait PacketSource {
    type Packet;

    /// Next waiting packet, or `None` when nothing is pending right now.
    fn next_packet(&mut self) -> Option<Self::Packet>;

    fn issue(&mut self, packet: Self::Packet, verdict: Verdict);
}

/// Reads whatever is waiting in `source`, up to `limit` packets, and gives
/// each the same verdict. Returns how many were handled.
pub fn drain_backlog<S: PacketSource>(source: &mut S, verdict: Verdict, limit: usize) -> usize {
    let mut n = 0;
    while n < limit {
        let Some(packet) = source.next_packet() else {
            break;
        };
        source.issue(packet, verdict);
        n += 1;
    }
    n
}

// ==========================================
// Parking lot for held packets
// ==========================================
#[derive(Debug)]
pub struct ParkedPackets<M> {
    parked: HashMap<PacketHandle, M>,
    next: u64,
}

impl<M> Default for ParkedPackets<M> {
    fn default() -> Self {
        Self {
            parked: HashMap::new(),
            next: 1,
        }
    }
}

impl<M> ParkedPackets<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the packet off the live path; no verdict is issued until
    /// [`ParkedPackets::take`] gives it back.
    pub fn hold(&mut self, packet: M) -> PacketHandle {
        let handle = PacketHandle(self.next);
        self.next += 1;
        self.parked.insert(handle, packet);
        handle
    }

    pub fn take(&mut self, handle: PacketHandle) -> Option<M> {
        self.parked.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    /// Everything still parked, for shutdown.
    pub fn drain(&mut self) -> impl Iterator<Item = (PacketHandle, M)> + '_ {
        self.parked.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_and_take_round_trip_by_handle() {
        let mut parked = ParkedPackets::new();
        let a = parked.hold("a");
        let b = parked.hold("b");
        assert_ne!(a, b);
        assert_eq!(parked.len(), 2);

        assert_eq!(parked.take(b), Some("b"));
        assert_eq!(parked.take(b), None);
        assert_eq!(parked.take(a), Some("a"));
        assert!(parked.is_empty());
    }

    #[derive(Default)]
    struct Backlog {
        waiting: Vec<u32>,
        issued: Vec<(u32, Verdict)>,
    }

    impl PacketSource for Backlog {
        type Packet = u32;

        fn next_packet(&mut self) -> Option<u32> {
            (!self.waiting.is_empty()).then(|| self.waiting.remove(0))
        }

        fn issue(&mut self, packet: u32, verdict: Verdict) {
            self.issued.push((packet, verdict));
        }
    }

    #[test]
    fn backlog_is_drained_with_one_verdict() {
        let mut src = Backlog {
            waiting: vec![4, 5, 6],
            ..Default::default()
        };
        assert_eq!(drain_backlog(&mut src, Verdict::Accept, 100), 3);
        assert_eq!(
            src.issued,
            vec![(4, Verdict::Accept), (5, Verdict::Accept), (6, Verdict::Accept)]
        );
        assert_eq!(drain_backlog(&mut src, Verdict::Accept, 100), 0);
    }

    #[test]
    fn backlog_drain_stops_at_limit() {
        let mut src = Backlog {
            waiting: vec![1, 2, 3],
            ..Default::default()
        };
        assert_eq!(drain_backlog(&mut src, Verdict::Drop, 2), 2);
        assert_eq!(src.waiting, vec![3]);
    }

    #[test]
    fn channel_reinjector_delivers_in_order() {
        let (tx, rx) = ChannelReinjector::new();
        tx.reinject(PacketHandle(1), Verdict::Accept);
        tx.reinject(PacketHandle(2), Verdict::Drop);
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            got,
            vec![
                (PacketHandle(1), Verdict::Accept),
                (PacketHandle(2), Verdict::Drop)
            ]
        );
    }
}
