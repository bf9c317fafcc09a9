/// What the keep-alive timer wants done at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Due {
    Nothing,
    Ping,
    /// A PINGREQ went unanswered for a whole interval.
    Dead,
}

pub(crate) struct KeepAlive {
    interval_ms: u64,
    last_send: u64,
    ping_sent_at: Option<u64>,
}

impl KeepAlive {
    /// An interval of zero disables the timer.
    pub(crate) fn new(interval_ms: u64, now: u64) -> Self {
        Self {
            interval_ms,
            last_send: now,
            ping_sent_at: None,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.interval_ms != 0
    }

    pub(crate) fn on_send(&mut self, now: u64) {
        self.last_send = now;
    }

    /// Any inbound packet proves the link is alive.
    pub(crate) fn on_receive(&mut self) {
        self.ping_sent_at = None;
    }

    pub(crate) fn on_ping_sent(&mut self, now: u64) {
        self.last_send = now;
        self.ping_sent_at = Some(now);
    }

    pub(crate) fn poll(&self, now: u64) -> Due {
        if !self.enabled() {
            return Due::Nothing;
        }

        match self.ping_sent_at {
            Some(sent) if now.saturating_sub(sent) >= self.interval_ms => Due::Dead,
            Some(_) => Due::Nothing,
            None if now.saturating_sub(self.last_send) >= self.interval_ms => Due::Ping,
            None => Due::Nothing,
        }
    }

    /// Instant at which [`KeepAlive::poll`] next has something to report.
    pub(crate) fn deadline(&self) -> Option<u64> {
        if !self.enabled() {
            return None;
        }

        let from = self.ping_sent_at.unwrap_or(self.last_send);
        Some(from.saturating_add(self.interval_ms))
    }
}
