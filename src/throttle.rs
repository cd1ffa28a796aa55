//! Human-activity-based throttling policy.
//!
//! When someone is using the machine, the build gives back some cores; once
//! the machine has been idle past the inactivity period, the full thread
//! count is restored.  Activity detection is platform-specific; where no
//! probe exists the policy is a no-op.

/// Seconds since the last detected human input, or None when the platform
/// offers no signal (in which case throttling never engages).
pub fn time_since_last_human_activity() -> Option<f64> {
    None
}

#[derive(Debug, PartialEq, Eq)]
pub enum ThrottleAction {
    None,
    /// Reduce to this many jobs and announce it.
    Clamp(usize),
    /// Restore to this many jobs and announce it.
    Restore(usize),
}

/// Decides what to do with the dynamic job limit given the current idle time.
///
/// `configured` is the operator-chosen throttled amount; 0 means auto (60% of
/// the thread count, at least one job).
pub fn evaluate(
    throttled: bool,
    idle_seconds: Option<f64>,
    inactivity_period: u64,
    thread_count: usize,
    configured: usize,
) -> ThrottleAction {
    let idle = match idle_seconds {
        Some(t) => t,
        None => return ThrottleAction::None,
    };
    let period = inactivity_period as f64;

    if !throttled {
        if idle >= period {
            return ThrottleAction::None;
        }
        // Skip the first moments of activity so an imminent manual abort
        // doesn't race a throttling message.
        if idle < 1.0 {
            return ThrottleAction::None;
        }
        let jobs = if configured == 0 {
            std::cmp::max(1, thread_count * 6 / 10)
        } else {
            configured
        };
        return ThrottleAction::Clamp(jobs);
    }

    if idle < period {
        return ThrottleAction::None;
    }
    ThrottleAction::Restore(thread_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_signal_no_op() {
        assert_eq!(evaluate(false, None, 30, 8, 0), ThrottleAction::None);
        assert_eq!(evaluate(true, None, 30, 8, 0), ThrottleAction::None);
    }

    #[test]
    fn recent_activity_clamps() {
        assert_eq!(evaluate(false, Some(5.0), 30, 8, 0), ThrottleAction::Clamp(4));
        assert_eq!(evaluate(false, Some(5.0), 30, 8, 2), ThrottleAction::Clamp(2));
        // 60% of one thread still leaves one job.
        assert_eq!(evaluate(false, Some(5.0), 30, 1, 0), ThrottleAction::Clamp(1));
    }

    #[test]
    fn fresh_activity_grace_period() {
        assert_eq!(evaluate(false, Some(0.5), 30, 8, 0), ThrottleAction::None);
    }

    #[test]
    fn long_idle_restores() {
        assert_eq!(evaluate(true, Some(31.0), 30, 8, 0), ThrottleAction::Restore(8));
        assert_eq!(evaluate(true, Some(5.0), 30, 8, 0), ThrottleAction::None);
    }

    #[test]
    fn idle_machine_stays_unthrottled() {
        assert_eq!(evaluate(false, Some(300.0), 30, 8, 0), ThrottleAction::None);
    }
}
