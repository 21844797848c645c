//! Reconnection policy

use std::time::Duration;

use crate::signalling::CLOSE_GOING_AWAY;

/// Delay before an automatic reconnect
pub const RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Inputs to the close decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseContext {
    pub code: u16,
    pub force_reconnect: bool,
    pub enable_auto_reconnect: bool,
    pub max_attempts: u32,
    pub attempt: u32,
    pub locally_closed: bool,
}

/// Outcome of a signalling close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseDecision {
    pub will_retry: bool,
}

impl CloseDecision {
    /// The host may offer a manual reconnect only when nothing is scheduled
    pub fn allow_manual_reconnect(&self) -> bool {
        !self.will_retry
    }
}

impl CloseContext {
    /// Whether another attempt is allowed at all
    pub fn reconnect_enabled(&self) -> bool {
        self.force_reconnect
            || (self.enable_auto_reconnect
                && self.max_attempts > 0
                && self.attempt < self.max_attempts)
    }

    /// 1001 (going away) and local closes never retry
    pub fn decide(&self) -> CloseDecision {
        CloseDecision {
            will_retry: self.reconnect_enabled()
                && self.code != CLOSE_GOING_AWAY
                && !self.locally_closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signalling::CLOSE_NORMAL;

    fn ctx(attempt: u32) -> CloseContext {
        CloseContext {
            code: 1006,
            force_reconnect: false,
            enable_auto_reconnect: true,
            max_attempts: 3,
            attempt,
            locally_closed: false,
        }
    }

    #[test]
    fn test_attempts_are_bounded() {
        assert!(ctx(0).decide().will_retry);
        assert!(ctx(2).decide().will_retry);
        assert!(!ctx(3).decide().will_retry);
        assert!(ctx(3).decide().allow_manual_reconnect());
    }

    #[test]
    fn test_zero_budget_never_retries() {
        let context = CloseContext {
            max_attempts: 0,
            ..ctx(0)
        };
        assert!(!context.decide().will_retry);
    }

    #[test]
    fn test_going_away_is_terminal() {
        let context = CloseContext {
            code: CLOSE_GOING_AWAY,
            force_reconnect: true,
            ..ctx(0)
        };
        assert!(context.reconnect_enabled());
        assert!(!context.decide().will_retry);
    }

    #[test]
    fn test_forced_reconnect_ignores_budget() {
        let context = CloseContext {
            code: CLOSE_NORMAL,
            force_reconnect: true,
            enable_auto_reconnect: false,
            ..ctx(10)
        };
        assert!(context.decide().will_retry);

        let local = CloseContext {
            locally_closed: true,
            ..context
        };
        assert!(!local.decide().will_retry);
    }
}
