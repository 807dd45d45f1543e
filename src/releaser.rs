use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::ReleaserConfig;
use crate::hold_queue::Due;
use crate::interceptor::{Reinjector, Verdict};
use crate::replay::ReplayContext;
use crate::schedule::{Cursor, Lookup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOutcome {
    pub released: usize,
    pub sleep: Duration,
}

// ==========================================
// Releaser: drains due entries, then sleeps until the next deadline
// ==========================================
pub struct Releaser<C, R> {
    ctx: Arc<ReplayContext>,
    clock: C,
    reinjector: R,
    config: ReleaserConfig,
    /// Replay cursor, owned by this task alone.
    cursor: Cursor,
    epoch: u64,
    /// Enqueue order of the entry last reported as unmatched.
    stalled_on: Option<u64>,
}

impl<C: Clock, R: Reinjector> Releaser<C, R> {
    pub fn new(ctx: Arc<ReplayContext>, clock: C, reinjector: R, config: ReleaserConfig) -> Self {
        let epoch = ctx.epoch();
        Self {
            ctx,
            clock,
            reinjector,
            config,
            cursor: Cursor::Start,
            epoch,
            stalled_on: None,
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// One drain pass over the hold queue.
    pub fn drain_pass(&mut self) -> PassOutcome {
        let epoch = self.ctx.epoch();
        if epoch != self.epoch {
            self.epoch = epoch;
            self.cursor = Cursor::Start;
            self.stalled_on = None;
        }

        let now = self.clock.now_ms();
        let max_hold = self.config.max_hold.map(|d| d.as_millis() as i64);
        let store = self.ctx.store();
        let calibrator = self.ctx.calibrator();
        let mut cursor = self.cursor;
        let mut stalled_on = self.stalled_on;

        let drain = self.ctx.queue().scan_and_remove_due(|entry| {
            let expired = max_hold.is_some_and(|max| now - entry.held_at_ms >= max);
            match store.find_after(cursor, entry.fingerprint) {
                Lookup::Found { index, record } => {
                    let deadline = calibrator.deadline(record.release_time);
                    debug!(
                        fingerprint = format_args!("{:#06x}", entry.fingerprint),
                        now,
                        offset = calibrator.offset(),
                        tfc = record.release_time,
                        deadline,
                        "dequeue check"
                    );
                    if now >= deadline || expired {
                        if now < deadline {
                            warn!(order = entry.enqueue_order, "held past max_hold, releasing early");
                        }
                        cursor = Cursor::At(index);
                        Due::Release
                    } else {
                        Due::Wait(deadline)
                    }
                }
                Lookup::NotFound if expired => {
                    warn!(
                        fingerprint = format_args!("{:#06x}", entry.fingerprint),
                        "unmatched entry held past max_hold, releasing"
                    );
                    Due::Release
                }
                Lookup::NotFound => {
                    if stalled_on != Some(entry.enqueue_order) {
                        warn!(
                            fingerprint = format_args!("{:#06x}", entry.fingerprint),
                            cursor = ?cursor,
                            "cannot find a matched schedule record for held packet"
                        );
                        stalled_on = Some(entry.enqueue_order);
                    }
                    Due::Halt
                }
            }
        });
        self.cursor = cursor;
        self.stalled_on = stalled_on;

        let released = drain.released.len();
        for entry in drain.released {
            debug!(order = entry.enqueue_order, handle = ?entry.handle, "reinject");
            self.reinjector.reinject(entry.handle, Verdict::Accept);
        }
        if released > 0 {
            self.ctx.stats().record_released(released as u64);
        }

        let sleep = match drain.next_deadline {
            Some(deadline) => {
                Duration::from_millis(deadline.saturating_sub(now).max(0) as u64)
            }
            None => self.config.idle_sleep,
        };
        PassOutcome {
            released,
            sleep: sleep.min(self.config.max_sleep),
        }
    }

    /// Loops until `stop` is raised. Wakes early whenever something is
    /// enqueued.
    pub fn run(mut self, stop: Arc<AtomicBool>) {
        let wake = self.ctx.queue().wake_receiver();
        info!("releaser started");
        while !stop.load(Ordering::Acquire) {
            let pass = self.drain_pass();
            if stop.load(Ordering::Acquire) {
                break;
            }
            match wake.recv_timeout(pass.sleep) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("releaser stopped");
    }
}

/// Owns the releaser thread. Dropping it stops the thread.
pub struct ReleaserHandle {
    ctx: Arc<ReplayContext>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReleaserHandle {
    pub fn spawn<C, R>(
        ctx: Arc<ReplayContext>,
        clock: C,
        reinjector: R,
        config: ReleaserConfig,
    ) -> io::Result<Self>
    where
        C: Clock + 'static,
        R: Reinjector + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let releaser = Releaser::new(ctx.clone(), clock, reinjector, config);
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name("replay-releaser".into())
            .spawn(move || releaser.run(stop_flag))?;
        Ok(Self {
            ctx,
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the thread and waits for it. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.ctx.queue().wake();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("releaser thread panicked");
            }
        }
    }
}

impl Drop for ReleaserHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
