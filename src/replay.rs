//! One replay run: the schedule, the gate consulted per packet, the clock
//! offset and the hold queue, shared between the interception path, the
//! control channel and the releaser.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::clock::ClockCalibrator;
use crate::config::TeardownPolicy;
use crate::error::Result;
use crate::gate::{Decision, FlowControlGate};
use crate::hold_queue::HoldQueue;
use crate::interceptor::{PacketHandle, Reinjector};
use crate::ip_header::{FingerprintOrder, Ipv4Header};
use crate::schedule::{ScheduleRecord, ScheduleStore};
use crate::stats::ReplayStats;

#[derive(Debug)]
pub struct ReplayContext {
    target: Ipv4Addr,
    fingerprint_order: FingerprintOrder,
    store: ScheduleStore,
    gate: Mutex<FlowControlGate>,
    calibrator: ClockCalibrator,
    queue: HoldQueue,
    /// Bumped on every start so the releaser rewinds its own cursor.
    epoch: AtomicU64,
    stats: ReplayStats,
}

impl ReplayContext {
    pub fn new(target: Ipv4Addr, fingerprint_order: FingerprintOrder) -> Self {
        Self {
            target,
            fingerprint_order,
            store: ScheduleStore::new(),
            gate: Mutex::new(FlowControlGate::new()),
            calibrator: ClockCalibrator::default(),
            queue: HoldQueue::new(),
            epoch: AtomicU64::new(0),
            stats: ReplayStats::default(),
        }
    }

    fn gate(&self) -> MutexGuard<'_, FlowControlGate> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn target(&self) -> Ipv4Addr {
        self.target
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    pub fn queue(&self) -> &HoldQueue {
        &self.queue
    }

    pub fn calibrator(&self) -> &ClockCalibrator {
        &self.calibrator
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.gate().is_active()
    }

    pub fn load_record(&self, record: ScheduleRecord) -> Result<()> {
        self.store.append(record)
    }

    /// Rewinds both cursors and opens the gate. Loaded records are kept.
    pub fn start(&self) {
        {
            let mut gate = self.gate();
            gate.activate();
            self.calibrator.reset();
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }

        let mut count = 0;
        for r in self.store.iterate() {
            debug!(
                id = r.id,
                time = r.release_time,
                size = r.size,
                priority = r.priority,
                "schedule record"
            );
            count += 1;
        }
        info!("{count} received, flow control open");
    }

    /// Closes the gate; later packets pass untouched.
    pub fn stop_interception(&self) {
        self.gate().deactivate();
    }

    /// Gate decision for a packet already known to be headed to the target.
    pub fn classify(&self, fingerprint: u32, now_ms: i64) -> Decision {
        let decision = self
            .gate()
            .classify(fingerprint, &self.store, &self.calibrator, now_ms);
        match decision {
            Decision::Accept => self.stats.record_passed(),
            Decision::Drop => self.stats.record_dropped(),
            Decision::Hold { .. } => {}
        }
        decision
    }

    /// Entry point for a raw IPv4 packet. Anything not headed to the target
    /// is accepted without touching the gate.
    pub fn admit(&self, payload: &[u8], now_ms: i64) -> Decision {
        match Ipv4Header::parse(payload) {
            Some(hdr) if hdr.dst == self.target => {
                debug!(src = %hdr.src, dst = %hdr.dst, "intercepted");
                self.classify(hdr.fingerprint(self.fingerprint_order), now_ms)
            }
            _ => Decision::Accept,
        }
    }

    /// Records a packet the interceptor has parked after a `Hold` decision.
    pub fn hold(&self, handle: PacketHandle, fingerprint: u32, now_ms: i64) -> Result<u64> {
        let order = self.queue.push_tail(handle, fingerprint, now_ms)?;
        self.stats.record_held();
        debug!(?handle, order, "held");
        Ok(order)
    }

    /// Hands every still-held packet back with the policy's verdict.
    /// Calling it again finds an empty queue and does nothing.
    pub fn teardown(&self, reinjector: &dyn Reinjector, policy: TeardownPolicy) -> usize {
        let remaining = self.queue.flush();
        let n = remaining.len();
        for entry in remaining {
            reinjector.reinject(entry.handle, policy.verdict());
        }
        if n > 0 {
            self.stats.record_flushed(n as u64);
            info!(count = n, ?policy, "released held packets at teardown");
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{ChannelReinjector, Verdict};
    use crate::ip_header::build_packet;
    use crate::schedule::record;

    const TARGET: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 101);

    fn context(records: &[(u32, u64)]) -> ReplayContext {
        let ctx = ReplayContext::new(TARGET, FingerprintOrder::Network);
        for &(id, t) in records {
            ctx.load_record(record(id, t)).unwrap();
        }
        ctx
    }

    #[test]
    fn other_destinations_bypass_the_gate() {
        let ctx = context(&[(1, 100)]);
        ctx.start();
        let pkt = build_packet(Ipv4Addr::new(8, 8, 8, 8), 1);
        assert_eq!(ctx.admit(&pkt, 0), Decision::Accept);
        assert!(ctx.is_active());
        assert_eq!(ctx.admit(b"not ip", 0), Decision::Accept);
    }

    #[test]
    fn inactive_context_accepts_and_leaves_queue_alone() {
        let ctx = context(&[(1, 100)]);
        for fp in [1, 2, 3] {
            assert_eq!(ctx.admit(&build_packet(TARGET, fp), 0), Decision::Accept);
        }
        assert!(ctx.queue().is_empty());
        assert_eq!(ctx.stats().snapshot().passed, 3);
    }

    #[test]
    fn hold_decision_then_park() {
        let ctx = context(&[(0xBEEF, 100), (2, 150)]);
        ctx.start();
        let d = ctx.admit(&build_packet(TARGET, 0xBEEF), 5_000);
        assert_eq!(
            d,
            Decision::Hold {
                fingerprint: 0xBEEF,
                release_time: 100
            }
        );
        assert_eq!(ctx.hold(PacketHandle(1), 0xBEEF, 5_000).unwrap(), 0);
        assert_eq!(ctx.queue().len(), 1);
        assert_eq!(ctx.calibrator().offset(), 100 - 5_000);
    }

    #[test]
    fn start_rewinds_and_recalibrates_without_clearing() {
        let ctx = context(&[(1, 100), (2, 150)]);
        ctx.start();
        let first_epoch = ctx.epoch();
        ctx.classify(1, 1_000);
        ctx.classify(2, 1_050);
        assert!(!ctx.is_active());

        ctx.start();
        assert!(ctx.epoch() > first_epoch);
        assert_eq!(ctx.store().len(), 2);
        assert!(matches!(ctx.classify(1, 9_000), Decision::Hold { .. }));
        assert_eq!(ctx.calibrator().offset(), 100 - 9_000);
    }

    #[test]
    fn huge_release_time_does_not_break_calibration() {
        let ctx = context(&[(1, u64::MAX), (2, 150)]);
        ctx.start();
        assert!(matches!(ctx.classify(1, 1_000_000), Decision::Hold { .. }));
        assert_eq!(ctx.calibrator().offset(), i64::MAX - 1_000_000);
        assert!(matches!(ctx.classify(2, 1_000_001), Decision::Hold { .. }));
        assert_eq!(ctx.calibrator().deadline(150), 150 - (i64::MAX - 1_000_000));
    }

    #[test]
    fn teardown_is_idempotent() {
        let ctx = context(&[(1, 100), (2, 150)]);
        ctx.start();
        ctx.hold(PacketHandle(7), 1, 0).unwrap();
        ctx.hold(PacketHandle(8), 2, 0).unwrap();

        let (reinjector, rx) = ChannelReinjector::new();
        assert_eq!(ctx.teardown(&reinjector, TeardownPolicy::Accept), 2);
        assert_eq!(ctx.teardown(&reinjector, TeardownPolicy::Accept), 0);

        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            got,
            vec![
                (PacketHandle(7), Verdict::Accept),
                (PacketHandle(8), Verdict::Accept)
            ]
        );
        assert_eq!(ctx.stats().snapshot().backlog(), 0);
    }
}
