use std::time::Duration;

use tokio::time::Instant;

/// Local typing indicator with a single quiet deadline.
///
/// Every method returns the state to broadcast, if any. Only transitions
/// are broadcast: repeated `update(true)` calls just push the deadline out.
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl TypingDebouncer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn update(&mut self, is_typing: bool, now: Instant) -> Option<bool> {
        if is_typing {
            let was_typing = self.deadline.replace(now + self.timeout).is_some();
            (!was_typing).then_some(true)
        } else {
            self.deadline.take().map(|_| false)
        }
    }

    pub fn poll_expired(&mut self, now: Instant) -> Option<bool> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                Some(false)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(3000);

    #[test]
    fn test_redundant_updates_suppressed() {
        let mut typing = TypingDebouncer::new(TIMEOUT);
        let t0 = Instant::now();

        assert_eq!(typing.update(true, t0), Some(true));
        assert_eq!(typing.update(true, t0 + Duration::from_millis(500)), None);
        assert_eq!(typing.update(true, t0 + Duration::from_millis(900)), None);
        assert_eq!(typing.deadline(), Some(t0 + Duration::from_millis(3900)));
    }

    #[test]
    fn test_expiry_broadcasts_false_once() {
        let mut typing = TypingDebouncer::new(TIMEOUT);
        let t0 = Instant::now();
        typing.update(true, t0);

        assert_eq!(typing.poll_expired(t0 + Duration::from_millis(2999)), None);
        assert_eq!(typing.poll_expired(t0 + TIMEOUT), Some(false));
        assert_eq!(typing.poll_expired(t0 + TIMEOUT * 2), None);
        assert!(!typing.is_typing());
    }

    #[test]
    fn test_stop_only_when_typing() {
        let mut typing = TypingDebouncer::new(TIMEOUT);
        let t0 = Instant::now();

        assert_eq!(typing.update(false, t0), None);
        typing.update(true, t0);
        assert_eq!(typing.update(false, t0), Some(false));
        assert!(typing.deadline().is_none());
        assert_eq!(typing.update(true, t0), Some(true));
    }
}
