//! The severity state machine.
//!
//! Consumes gated trigger events and decides when a level change is real
//! enough to announce. Escalations below Critical are not trusted on the
//! first event: they are parked as a pending level and re-evaluated at the
//! next settle point of the event loop, so a more urgent event arriving in
//! the same scheduling pass wins. Critical is always confirmed immediately.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::level::{self, Level};
use crate::meminfo::AVAILABLE_MEM_RATIO;

/// Minimum time between repeated announcements of the same level.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(15);

/// Where confirmed decisions go: the outward broadcast, and the kernel OOM
/// killer for the worst one.
#[async_trait]
pub trait Actuator {
    async fn announce(&mut self, level: Level) -> anyhow::Result<()>;
    async fn trigger_oom(&mut self) -> anyhow::Result<()>;
}

pub struct Monitor<A> {
    pub(crate) actuator: A,
    trigger_kernel_oom: bool,

    current: Option<Level>,
    pending: Option<Level>,
    last_trigger: [Option<Instant>; 3],
    deferred: bool,
}

impl<A: Actuator + Send> Monitor<A> {
    pub fn new(actuator: A, trigger_kernel_oom: bool) -> Self {
        Self {
            actuator,
            trigger_kernel_oom,
            current: None,
            pending: None,
            last_trigger: [None; 3],
            deferred: false,
        }
    }

    pub fn current_level(&self) -> Option<Level> {
        self.current
    }

    /// True when a deferred decision is waiting for the next settle point.
    pub fn deferral_pending(&self) -> bool {
        self.deferred
    }

    /// Handles one kernel trigger event for `level`. `ratio` is the
    /// available-memory reading, `None` when it could not be read.
    pub async fn handle_trigger(&mut self, level: Level, ratio: Option<f64>, now: Instant) {
        log::debug!("received memory pressure event for {}", level.as_str());

        let ratio = match ratio {
            Some(ratio) => ratio,
            None => {
                // can't tell whether memory is really short; a missed signal
                // is safer than a spurious OOM kill
                log::warn!(
                    "available memory unreadable, ignoring {} event",
                    level.as_str()
                );
                return;
            }
        };
        if ratio >= AVAILABLE_MEM_RATIO {
            log::debug!(
                "available memory is at {}%, not sending {} signal",
                (ratio * 100.0) as i32,
                level.as_str()
            );
            return;
        }

        if self.defer(level, now) {
            return;
        }

        match self.last_trigger[level.index()] {
            Some(last) if now.duration_since(last) <= RECOVERY_INTERVAL => {
                log::debug!(
                    "{} fired within the recovery interval, suppressing",
                    level.as_str()
                );
            }
            _ => {
                if self.emit(level).await {
                    self.last_trigger[level.index()] = Some(now);
                }
            }
        }
    }

    /// Parks `level` for confirmation at the next settle point. Returns
    /// false when the event must be handled directly instead: Critical, or a
    /// level at or below the one already confirmed (which also disarms any
    /// deferral still waiting, since it no longer reflects reality).
    fn defer(&mut self, level: Level, now: Instant) -> bool {
        if Some(level) <= self.current || level == Level::Critical {
            log::debug!(
                "not deferring state change, next state is {} (current state: {})",
                level.as_str(),
                level::name(self.current)
            );
            self.deferred = false;
            return false;
        }

        self.pending = Some(level);
        self.last_trigger[level.index()] = Some(now);
        self.deferred = true;

        log::debug!("switching to state {} shortly", level.as_str());
        true
    }

    /// The deferred re-evaluation. Runs once per armed deferral, strictly
    /// after every trigger event of the same scheduling pass.
    pub async fn run_deferred(&mut self) {
        self.deferred = false;
        let Some(next) = self.pending else {
            return;
        };

        if Some(next) < self.current {
            log::debug!(
                "not emitting deferred signal for {}, current state is {}",
                next.as_str(),
                level::name(self.current)
            );
            return;
        }

        self.emit(next).await;
    }

    /// Announces `level` and, for Critical, drives the kernel OOM killer.
    /// Returns false when the OOM request failed.
    async fn emit(&mut self, level: Level) -> bool {
        if let Err(e) = self.actuator.announce(level).await {
            log::warn!("failed to announce {} level: {}", level.as_str(), e);
        }
        self.current = Some(level);
        self.pending = None;

        if level == Level::Critical {
            if self.trigger_kernel_oom {
                if let Err(e) = self.actuator.trigger_oom().await {
                    log::warn!("failed to trigger OOM: {}", e);
                    return false;
                }
            } else {
                log::debug!("would trigger OOM, but disabled in configuration");
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        announced: Vec<Level>,
        oom_requests: usize,
        fail_announce: bool,
        fail_oom: bool,
    }

    #[async_trait]
    impl Actuator for Recorder {
        async fn announce(&mut self, level: Level) -> anyhow::Result<()> {
            if self.fail_announce {
                anyhow::bail!("bus is down")
            }
            self.announced.push(level);
            Ok(())
        }

        async fn trigger_oom(&mut self) -> anyhow::Result<()> {
            self.oom_requests += 1;
            if self.fail_oom {
                anyhow::bail!("no sysrq for you")
            }
            Ok(())
        }
    }

    fn monitor(trigger_kernel_oom: bool) -> Monitor<Recorder> {
        Monitor::new(Recorder::default(), trigger_kernel_oom)
    }

    #[test]
    fn low_is_deferred_then_confirmed() {
        smol::future::block_on(async {
            let mut m = monitor(true);
            let t0 = Instant::now();

            m.handle_trigger(Level::Low, Some(0.3), t0).await;
            assert!(m.actuator.announced.is_empty());
            assert!(m.deferral_pending());
            assert_eq!(m.current_level(), None);

            m.run_deferred().await;
            assert_eq!(m.actuator.announced, vec![Level::Low]);
            assert_eq!(m.current_level(), Some(Level::Low));
            assert!(!m.deferral_pending());
        });
    }

    #[test]
    fn plentiful_memory_vetoes_everything() {
        smol::future::block_on(async {
            let mut m = monitor(true);
            let t0 = Instant::now();

            m.handle_trigger(Level::Low, Some(0.5), t0).await;
            m.handle_trigger(Level::Critical, Some(0.9), t0).await;
            assert!(m.actuator.announced.is_empty());
            assert_eq!(m.actuator.oom_requests, 0);
            assert_eq!(m.current_level(), None);
            assert!(!m.deferral_pending());
        });
    }

    #[test]
    fn unreadable_gate_suppresses() {
        smol::future::block_on(async {
            let mut m = monitor(true);
            m.handle_trigger(Level::Critical, None, Instant::now()).await;
            assert!(m.actuator.announced.is_empty());
            assert_eq!(m.current_level(), None);
        });
    }

    #[test]
    fn critical_is_never_deferred() {
        smol::future::block_on(async {
            let mut m = monitor(true);
            m.handle_trigger(Level::Critical, Some(0.1), Instant::now())
                .await;
            assert_eq!(m.actuator.announced, vec![Level::Critical]);
            assert_eq!(m.actuator.oom_requests, 1);
            assert!(!m.deferral_pending());
        });
    }

    #[test]
    fn oom_disabled_in_configuration() {
        smol::future::block_on(async {
            let mut m = monitor(false);
            m.handle_trigger(Level::Critical, Some(0.1), Instant::now())
                .await;
            assert_eq!(m.actuator.announced, vec![Level::Critical]);
            assert_eq!(m.actuator.oom_requests, 0);
        });
    }

    #[test]
    fn recovery_interval_suppresses_repeats() {
        smol::future::block_on(async {
            let mut m = monitor(true);
            let t0 = Instant::now();

            m.handle_trigger(Level::Low, Some(0.3), t0).await;
            m.run_deferred().await;
            assert_eq!(m.actuator.announced, vec![Level::Low]);

            // 2s later: within the recovery interval, suppressed
            m.handle_trigger(Level::Low, Some(0.3), t0 + Duration::from_secs(2))
                .await;
            assert_eq!(m.actuator.announced, vec![Level::Low]);

            // 16s after the stamp: fires again
            m.handle_trigger(Level::Low, Some(0.3), t0 + Duration::from_secs(16))
                .await;
            assert_eq!(m.actuator.announced, vec![Level::Low, Level::Low]);
        });
    }

    #[test]
    fn recovery_intervals_are_per_level() {
        smol::future::block_on(async {
            let mut m = monitor(false);
            let t0 = Instant::now();

            m.handle_trigger(Level::Critical, Some(0.1), t0).await;

            // medium 1s later is below critical, so it takes the direct
            // path; its own stamp is unset, so it fires
            m.handle_trigger(Level::Medium, Some(0.1), t0 + Duration::from_secs(1))
                .await;
            assert_eq!(m.actuator.announced, vec![Level::Critical, Level::Medium]);
        });
    }

    #[test]
    fn deferred_medium_is_superseded_by_critical() {
        smol::future::block_on(async {
            let mut m = monitor(true);
            let t0 = Instant::now();

            m.handle_trigger(Level::Medium, Some(0.2), t0).await;
            assert!(m.deferral_pending());

            // critical arrives before the settle point
            m.handle_trigger(Level::Critical, Some(0.2), t0).await;
            assert_eq!(m.actuator.announced, vec![Level::Critical]);
            assert!(!m.deferral_pending());

            // even if the settle point ran anyway, medium must not surface
            m.run_deferred().await;
            assert_eq!(m.actuator.announced, vec![Level::Critical]);
        });
    }

    #[test]
    fn reconfirming_lower_level_disarms_deferral() {
        smol::future::block_on(async {
            let mut m = monitor(true);
            let t0 = Instant::now();

            m.handle_trigger(Level::Low, Some(0.3), t0).await;
            m.run_deferred().await;
            assert_eq!(m.current_level(), Some(Level::Low));

            // medium parks a deferral...
            m.handle_trigger(Level::Medium, Some(0.3), t0 + Duration::from_secs(1))
                .await;
            assert!(m.deferral_pending());

            // ...but a low re-confirmation disarms it before the settle point
            m.handle_trigger(Level::Low, Some(0.3), t0 + Duration::from_secs(2))
                .await;
            assert!(!m.deferral_pending());
            assert_eq!(m.actuator.announced, vec![Level::Low]);
        });
    }

    #[test]
    fn lower_level_rearms_after_recovery() {
        smol::future::block_on(async {
            let mut m = monitor(false);
            let t0 = Instant::now();

            m.handle_trigger(Level::Critical, Some(0.1), t0).await;
            assert_eq!(m.current_level(), Some(Level::Critical));

            // a fresh low trigger much later re-arms the state downwards,
            // through a real emission
            m.handle_trigger(Level::Low, Some(0.3), t0 + Duration::from_secs(20))
                .await;
            assert_eq!(m.current_level(), Some(Level::Low));
            assert_eq!(m.actuator.announced, vec![Level::Critical, Level::Low]);
        });
    }

    #[test]
    fn announce_failure_does_not_roll_back() {
        smol::future::block_on(async {
            let mut m = monitor(false);
            m.actuator.fail_announce = true;
            m.handle_trigger(Level::Critical, Some(0.1), Instant::now())
                .await;
            assert_eq!(m.current_level(), Some(Level::Critical));
        });
    }

    #[test]
    fn failed_oom_request_lets_critical_refire() {
        smol::future::block_on(async {
            let mut m = monitor(true);
            m.actuator.fail_oom = true;
            let t0 = Instant::now();

            m.handle_trigger(Level::Critical, Some(0.1), t0).await;
            // the stamp was not recorded, so the next critical is not
            // swallowed by the recovery interval
            m.handle_trigger(Level::Critical, Some(0.1), t0 + Duration::from_secs(1))
                .await;
            assert_eq!(
                m.actuator.announced,
                vec![Level::Critical, Level::Critical]
            );
            assert_eq!(m.actuator.oom_requests, 2);
        });
    }

    #[test]
    fn successful_oom_request_is_rate_limited() {
        smol::future::block_on(async {
            let mut m = monitor(true);
            let t0 = Instant::now();

            m.handle_trigger(Level::Critical, Some(0.1), t0).await;
            m.handle_trigger(Level::Critical, Some(0.1), t0 + Duration::from_secs(1))
                .await;
            assert_eq!(m.actuator.announced, vec![Level::Critical]);
            assert_eq!(m.actuator.oom_requests, 1);
        });
    }
}
