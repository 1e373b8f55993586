//! Crash-loop accounting for the supervising loop.
//!
//! Only rapid successive exits exhaust the budget: a run that stays up for at
//! least `window` zeroes the counter before its own exit is counted.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub delay: Duration,
    pub window: Duration,
}

impl RestartPolicy {
    pub fn from_config(cfg: &crate::config::SupervisorConfig) -> Self {
        Self {
            max_restarts: cfg.max_restarts,
            delay: cfg.restart_delay,
            window: cfg.restart_window,
        }
    }
}

/// What the loop does after a child exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Sleep `delay`, then launch again. `attempt` is the counter after this exit.
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted; the supervisor must exit non-zero.
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct RestartCounter {
    policy: RestartPolicy,
    count: u32,
    window_start: Instant,
}

impl RestartCounter {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            count: 0,
            window_start: Instant::now(),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    /// Account for one exit after `uptime` and decide what happens next.
    pub fn record_exit(&mut self, uptime: Duration) -> Decision {
        if uptime >= self.policy.window {
            if self.count > 0 {
                tracing::info!(
                    uptime_secs = uptime.as_secs(),
                    previous = self.count,
                    "run outlived restart window; counter reset"
                );
            }
            self.count = 0;
            self.window_start = Instant::now();
        }
        self.count += 1;

        if self.count >= self.policy.max_restarts {
            Decision::GiveUp {
                attempts: self.count,
            }
        } else {
            Decision::Retry {
                attempt: self.count,
                delay: self.policy.delay,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            delay: Duration::from_secs(5),
            window: Duration::from_secs(300),
        }
    }

    #[test]
    fn gives_up_after_exactly_max_rapid_exits() {
        for max in 1..=12 {
            let mut counter = RestartCounter::new(policy(max));
            for attempt in 1..max {
                assert_eq!(
                    counter.record_exit(Duration::from_secs(1)),
                    Decision::Retry {
                        attempt,
                        delay: Duration::from_secs(5)
                    }
                );
            }
            assert_eq!(
                counter.record_exit(Duration::from_secs(1)),
                Decision::GiveUp { attempts: max }
            );
        }
    }

    #[test]
    fn healthy_run_resets_counter() {
        let mut counter = RestartCounter::new(policy(3));
        counter.record_exit(Duration::from_secs(10));
        counter.record_exit(Duration::from_secs(10));
        assert_eq!(counter.count(), 2);

        let decision = counter.record_exit(Duration::from_secs(300));
        assert_eq!(counter.count(), 1);
        assert!(matches!(decision, Decision::Retry { attempt: 1, .. }));

        counter.record_exit(Duration::from_secs(1));
        assert!(matches!(
            counter.record_exit(Duration::from_secs(1)),
            Decision::GiveUp { attempts: 3 }
        ));
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let mut counter = RestartCounter::new(policy(10));
        counter.record_exit(Duration::ZERO);
        counter.record_exit(Duration::from_millis(299_999));
        assert_eq!(counter.count(), 2);
        counter.record_exit(Duration::from_secs(300));
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn reset_moves_window_start() {
        let mut counter = RestartCounter::new(policy(10));
        let before = counter.window_start();
        std::thread::sleep(Duration::from_millis(5));
        counter.record_exit(Duration::from_secs(1));
        assert_eq!(counter.window_start(), before);
        counter.record_exit(Duration::from_secs(600));
        assert!(counter.window_start() > before);
    }
}
