use tracing::{debug, info, warn};

use crate::clock::{ClockCalibrator, trace_ms};
use crate::schedule::{Cursor, Lookup, ScheduleStore};

/// Outcome for one intercepted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    /// Park the packet; the matched record decides when it goes out.
    Hold { fingerprint: u32, release_time: u64 },
    Drop,
}

// ==========================================
// Flow-control gate
// ==========================================
#[derive(Debug, Default)]
pub struct FlowControlGate {
    active: bool,
    cursor: Cursor,
    queued: u64,
}

impl FlowControlGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Opens a new activation window from the top of the schedule.
    pub fn activate(&mut self) {
        self.active = true;
        self.cursor = Cursor::Start;
        self.queued = 0;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn classify(
        &mut self,
        fingerprint: u32,
        store: &ScheduleStore,
        calibrator: &ClockCalibrator,
        now_ms: i64,
    ) -> Decision {
        if !self.active {
            return Decision::Accept;
        }

        // 1. forward-only match from the current cursor
        let (index, record) = match store.find_after(self.cursor, fingerprint) {
            Lookup::Found { index, record } => (index, record),
            Lookup::NotFound => {
                warn!(
                    fingerprint = format_args!("{fingerprint:#06x}"),
                    cursor = ?self.cursor,
                    "packet has no matching schedule record, dropping"
                );
                return Decision::Drop;
            }
        };
        self.cursor = Cursor::At(index);

        // 2. schedule exhausted once the last record is consumed
        if store.is_last(self.cursor) {
            self.active = false;
            info!(matched = index + 1, "schedule exhausted, flow control closed");
        }

        // 3. first packet of the window pins the clock offset
        self.queued += 1;
        if self.queued == 1 {
            let offset = calibrator.calibrate_once(trace_ms(record.release_time), now_ms);
            info!(offset_ms = offset, "clock calibrated");
        }

        debug!(
            fingerprint = format_args!("{fingerprint:#06x}"),
            index,
            release_time = record.release_time,
            "queue"
        );
        Decision::Hold {
            fingerprint,
            release_time: record.release_time,
        }
    }
}
