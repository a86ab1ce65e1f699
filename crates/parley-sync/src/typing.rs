use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;

/// Idle time after the last keystroke before typing is considered stopped.
pub const TYPING_IDLE_MS: i64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

/// Turns a stream of local keystrokes into start/stop signals for one
/// conversation.
pub struct TypingDebouncer {
    clock: Arc<dyn Clock>,
    idle: Duration,
    last_keystroke: Option<DateTime<Utc>>,
}

impl TypingDebouncer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_idle(clock, Duration::milliseconds(TYPING_IDLE_MS))
    }

    pub fn with_idle(clock: Arc<dyn Clock>, idle: Duration) -> Self {
        Self {
            clock,
            idle,
            last_keystroke: None,
        }
    }

    /// `Start` on the first keystroke of a burst, nothing after that.
    pub fn keystroke(&mut self) -> Option<TypingSignal> {
        let first = self.last_keystroke.is_none();
        self.last_keystroke = Some(self.clock.now());
        first.then_some(TypingSignal::Start)
    }

    /// `Stop` once the burst has been idle long enough.
    pub fn poll(&mut self) -> Option<TypingSignal> {
        let last = self.last_keystroke?;
        if self.clock.now() - last >= self.idle {
            self.last_keystroke = None;
            return Some(TypingSignal::Stop);
        }
        None
    }

    /// The message went out; typing is over regardless of the timer.
    pub fn sent(&mut self) -> Option<TypingSignal> {
        self.last_keystroke.take().map(|_| TypingSignal::Stop)
    }

    /// When [`Self::poll`] will next report `Stop`, if typing.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.last_keystroke.map(|t| t + self.idle)
    }

    pub fn is_typing(&self) -> bool {
        self.last_keystroke.is_some()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;

    fn debouncer() -> (TypingDebouncer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(0, 0).unwrap()));
        (TypingDebouncer::new(clock.clone()), clock)
    }

    #[test]
    fn burst_starts_once_and_stops_after_idle() {
        let (mut typing, clock) = debouncer();

        assert_eq!(typing.keystroke(), Some(TypingSignal::Start));
        clock.advance(Duration::milliseconds(1_500));
        assert_eq!(typing.keystroke(), None);
        clock.advance(Duration::milliseconds(1_999));
        assert_eq!(typing.poll(), None);
        clock.advance(Duration::milliseconds(1));
        assert_eq!(typing.poll(), Some(TypingSignal::Stop));
        assert_eq!(typing.poll(), None);

        assert_eq!(typing.keystroke(), Some(TypingSignal::Start));
    }

    #[test]
    fn sending_stops_immediately() {
        let (mut typing, _) = debouncer();
        assert_eq!(typing.sent(), None);
        typing.keystroke();
        assert!(typing.deadline().is_some());
        assert_eq!(typing.sent(), Some(TypingSignal::Stop));
        assert!(!typing.is_typing());
    }
}
