use crate::config::JitterPrng;
use rand::rngs::SmallRng;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::time::Duration;
use tokio::time::Instant;

/// RFC 3539 §3.4.1: each watchdog deadline is offset by up to this much
/// in either direction.
pub(crate) const WATCHDOG_JITTER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerAction {
    None,
    /// Send a DWR and start expecting a DWA.
    SendDwr,
    /// No CER/CEA completed the handshake within one watchdog interval.
    DisconnectNoCer,
    /// An outstanding DWR went unanswered for one watchdog interval.
    DisconnectNoDw,
    /// No application traffic within the idle timeout.
    DisconnectIdle,
}

/// The watchdog jitter source. `Secure` is seeded from OS entropy;
/// `Bogus` is the documented non-cryptographic fallback.
enum JitterSource {
    Secure(StdRng),
    Bogus(SmallRng),
}

impl JitterSource {
    fn new(prng: JitterPrng) -> Self {
        match prng {
            JitterPrng::Secure => JitterSource::Secure(StdRng::from_entropy()),
            JitterPrng::Bogus => JitterSource::Bogus(SmallRng::from_entropy()),
        }
    }

    /// A uniformly distributed offset in ±[`WATCHDOG_JITTER`].
    fn next_offset(&mut self) -> i64 {
        let bound = WATCHDOG_JITTER.as_millis() as i64;
        match self {
            JitterSource::Secure(rng) => rng.gen_range(-bound..=bound),
            JitterSource::Bogus(rng) => rng.gen_range(-bound..=bound),
        }
    }
}

/// Per-connection timer state driving the capabilities-exchange cutoff,
/// the jittered device watchdog, and idle expiry.
///
/// The owner passes `now` explicitly; the driver loop samples the clock
/// once per iteration and the tests feed synthetic instants.
pub(crate) struct ConnectionTimers {
    watchdog_interval: Duration,
    idle_timeout: Duration,
    last_activity: Instant,
    last_real_activity: Instant,
    last_dwr_sent: Option<Instant>,
    dwa_outstanding: bool,
    next_dwr_deadline: Instant,
    jitter: JitterSource,
}

impl ConnectionTimers {
    pub(crate) fn new(
        watchdog_interval: Duration,
        idle_timeout: Duration,
        prng: JitterPrng,
        now: Instant,
    ) -> Self {
        let mut jitter = JitterSource::new(prng);
        let next_dwr_deadline = jittered(now, watchdog_interval, jitter.next_offset());
        ConnectionTimers {
            watchdog_interval,
            idle_timeout,
            last_activity: now,
            last_real_activity: now,
            last_dwr_sent: None,
            dwa_outstanding: false,
            next_dwr_deadline,
            jitter,
        }
    }

    /// Any frame arrived. Receiving traffic restarts the watchdog, so a
    /// busy connection sends no DWRs at all (RFC 3539 §3.4.1).
    pub(crate) fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
        if !self.dwa_outstanding {
            self.reschedule_dwr(now);
        }
    }

    /// A non-base frame arrived; also keeps the idle timer alive.
    pub(crate) fn record_real_activity(&mut self, now: Instant) {
        self.record_activity(now);
        self.last_real_activity = now;
    }

    pub(crate) fn record_dwr_sent(&mut self, now: Instant) {
        self.dwa_outstanding = true;
        self.last_dwr_sent = Some(now);
    }

    pub(crate) fn record_dwa(&mut self, now: Instant) {
        self.dwa_outstanding = false;
        self.reschedule_dwr(now);
    }

    pub(crate) fn dwa_outstanding(&self) -> bool {
        self.dwa_outstanding
    }

    /// Called on the transition to ready so the first DWR is scheduled
    /// one jittered interval after the capabilities exchange.
    pub(crate) fn enter_ready(&mut self, now: Instant) {
        self.reschedule_dwr(now);
    }

    fn reschedule_dwr(&mut self, now: Instant) {
        let offset = self.jitter.next_offset();
        self.next_dwr_deadline = jittered(now, self.watchdog_interval, offset);
    }

    /// The wall-time of the next event the driver loop must wake for.
    pub(crate) fn next_timeout(&self, ready: bool) -> Instant {
        let liveness = if !ready {
            self.last_activity + self.watchdog_interval
        } else if self.dwa_outstanding {
            self.last_dwr_sent.unwrap_or(self.last_activity) + self.watchdog_interval
        } else {
            self.next_dwr_deadline
        };
        let idle = self.last_real_activity + self.idle_timeout;
        liveness.min(idle)
    }

    pub(crate) fn action(&self, ready: bool, now: Instant) -> TimerAction {
        if !ready {
            if now.saturating_duration_since(self.last_activity) >= self.watchdog_interval {
                return TimerAction::DisconnectNoCer;
            }
            return TimerAction::None;
        }
        if now.saturating_duration_since(self.last_real_activity) >= self.idle_timeout {
            return TimerAction::DisconnectIdle;
        }
        if self.dwa_outstanding {
            let sent = self.last_dwr_sent.unwrap_or(self.last_activity);
            if now.saturating_duration_since(sent) >= self.watchdog_interval {
                return TimerAction::DisconnectNoDw;
            }
            return TimerAction::None;
        }
        if now >= self.next_dwr_deadline {
            return TimerAction::SendDwr;
        }
        TimerAction::None
    }
}

fn jittered(now: Instant, interval: Duration, offset_ms: i64) -> Instant {
    let base = now + interval;
    if offset_ms >= 0 {
        base + Duration::from_millis(offset_ms as u64)
    } else {
        base - Duration::from_millis(offset_ms.unsigned_abs())
    }
}
