//! Daily sync schedule with pause/resume and on-demand triggers.
//!
//! ```text
//! STOPPED --run--> RUNNING <--pause/resume--> PAUSED
//!    ^                |                          |
//!    +----shutdown----+--------------------------+
//! ```
//!
//! The next fire time is always recomputed from the wall clock, never from
//! "time since the last run", so a restart picks up the schedule as is. At
//! most one pass is in flight: ticks and `trigger()` share the same guard.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tally_common::error::{TallyError, TallyResult};
use tally_config::get_var_or;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::engine::{PassReport, SyncPass};

/// Fixed local times of day in one timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    times: Vec<NaiveTime>,
    tz: Tz,
}

impl Schedule {
    pub fn new(mut times: Vec<NaiveTime>, tz: Tz) -> TallyResult<Self> {
        if times.is_empty() {
            return Err(TallyError::Config(
                "schedule needs at least one time of day".to_string(),
            ));
        }
        times.sort();
        times.dedup();
        Ok(Self { times, tz })
    }

    /// Parse `"06:00,12:00,18:00"` and an IANA timezone name.
    pub fn parse(times: &str, tz: &str) -> TallyResult<Self> {
        let times = times
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                NaiveTime::parse_from_str(s, "%H:%M")
                    .map_err(|e| TallyError::Config(format!("invalid sync time {s:?}: {e}")))
            })
            .collect::<TallyResult<Vec<_>>>()?;
        let tz: Tz = tz
            .trim()
            .parse()
            .map_err(|e| TallyError::Config(format!("invalid timezone {tz:?}: {e}")))?;
        Self::new(times, tz)
    }

    pub fn from_env() -> TallyResult<Self> {
        Self::parse(
            &get_var_or("SYNC_TIMES", "06:00,12:00,18:00"),
            &get_var_or("SYNC_TIMEZONE", "UTC"),
        )
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// The first fire time strictly after `now`.
    ///
    /// A local time that falls in a DST gap does not exist that day and is
    /// skipped; an ambiguous one fires at its earlier instant.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.with_timezone(&self.tz).date_naive();
        (0..=2u64)
            .filter_map(|offset| today.checked_add_days(Days::new(offset)))
            .flat_map(|day| self.times.iter().map(move |t| day.and_time(*t)))
            .filter_map(|local| self.tz.from_local_datetime(&local).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            .filter(|dt| *dt > now)
            .min()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started { started_at: DateTime<Utc> },
    /// A pass was already running; nothing new was started.
    InFlight { running_since: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub running_since: Option<DateTime<Utc>>,
    pub last_report: Option<PassReport>,
}

#[derive(Debug)]
struct Inner {
    state: SchedulerState,
    next_fire_at: Option<DateTime<Utc>>,
    last_report: Option<PassReport>,
}

pub struct Scheduler {
    engine: Arc<dyn SyncPass>,
    schedule: Schedule,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    /// `Some(start)` while a pass is in flight.
    in_flight: watch::Sender<Option<DateTime<Utc>>>,
}

/// Clears the in-flight slot even if the pass task panics.
struct PassGuard(Arc<Scheduler>);

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.0.in_flight.send_replace(None);
    }
}

impl Scheduler {
    pub fn new(engine: Arc<dyn SyncPass>, schedule: Schedule, clock: Arc<dyn Clock>) -> Self {
        let (in_flight, _rx) = watch::channel(None);
        Self {
            engine,
            schedule,
            clock,
            inner: Mutex::new(Inner {
                state: SchedulerState::Stopped,
                next_fire_at: None,
                last_report: None,
            }),
            in_flight,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> SchedulerStatus {
        let running_since = *self.in_flight.borrow();
        let inner = self.lock();
        SchedulerStatus {
            state: inner.state,
            next_fire_at: inner.next_fire_at,
            running: running_since.is_some(),
            running_since,
            last_report: inner.last_report.clone(),
        }
    }

    /// Start a pass now unless one is already running. Returns immediately;
    /// the pass runs on its own task.
    pub fn trigger(self: &Arc<Self>) -> TriggerOutcome {
        let now = self.clock.now();
        let mut running_since = None;
        let claimed = self.in_flight.send_if_modified(|slot| match *slot {
            Some(since) => {
                running_since = Some(since);
                false
            }
            None => {
                *slot = Some(now);
                true
            }
        });

        if !claimed {
            let running_since = running_since.unwrap_or(now);
            tracing::info!(%running_since, "sync pass already in flight");
            return TriggerOutcome::InFlight { running_since };
        }

        let guard = PassGuard(Arc::clone(self));
        tokio::spawn(async move {
            let scheduler = Arc::clone(&guard.0);
            let report = scheduler.engine.run_pass().await;
            scheduler.lock().last_report = Some(report);
            drop(guard);
        });
        tracing::info!(started_at = %now, "sync pass started");
        TriggerOutcome::Started { started_at: now }
    }

    /// Stop reacting to fire times. An in-flight pass is not cancelled.
    pub fn pause(&self) -> SchedulerState {
        let mut inner = self.lock();
        if inner.state == SchedulerState::Running {
            inner.state = SchedulerState::Paused;
            tracing::info!("scheduler paused");
        }
        inner.state
    }

    pub fn resume(&self) -> SchedulerState {
        let mut inner = self.lock();
        if inner.state == SchedulerState::Paused {
            inner.state = SchedulerState::Running;
            tracing::info!("scheduler resumed");
        }
        inner.state
    }

    /// Wait until no pass is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(Option::is_none).await;
    }

    /// Drive the schedule until `shutdown` flips or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        {
            let mut inner = self.lock();
            if inner.state == SchedulerState::Stopped {
                inner.state = SchedulerState::Running;
            }
        }
        tracing::info!(
            times = ?self.schedule.times,
            tz = %self.schedule.tz,
            "scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = self.clock.now();
            let Some(next) = self.schedule.next_after(now) else {
                tracing::error!("no upcoming fire time, stopping scheduler");
                break;
            };
            self.lock().next_fire_at = Some(next);
            tracing::debug!(next_fire_at = %next, "waiting for next fire time");

            tokio::select! {
                _ = self.clock.sleep_until(next) => {
                    if self.lock().state == SchedulerState::Paused {
                        tracing::info!(fire_time = %next, "scheduler paused, skipping fire time");
                        continue;
                    }
                    self.trigger();
                }
                _ = shutdown.changed() => break,
            }
        }

        let mut inner = self.lock();
        inner.state = SchedulerState::Stopped;
        inner.next_fire_at = None;
        tracing::info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::ResourceOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Counts passes; each pass waits for a permit so tests control its length.
    struct FakePass {
        runs: AtomicUsize,
        release: Semaphore,
    }

    impl FakePass {
        fn new(open: bool) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                release: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SyncPass for FakePass {
        async fn run_pass(&self) -> PassReport {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
            let now = Utc::now();
            PassReport {
                started_at: now,
                finished_at: now,
                outcomes: Vec::<ResourceOutcome>::new(),
            }
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn next_after_is_strictly_later() {
        let schedule = Schedule::parse("18:00, 06:00,12:00", "UTC").unwrap();
        assert_eq!(
            schedule.next_after(utc(2026, 3, 1, 5, 0)),
            Some(utc(2026, 3, 1, 6, 0))
        );
        assert_eq!(
            schedule.next_after(utc(2026, 3, 1, 6, 0)),
            Some(utc(2026, 3, 1, 12, 0))
        );
        assert_eq!(
            schedule.next_after(utc(2026, 3, 1, 18, 30)),
            Some(utc(2026, 3, 2, 6, 0))
        );
    }

    #[test]
    fn next_after_follows_the_configured_timezone() {
        let schedule = Schedule::parse("06:00", "America/Los_Angeles").unwrap();
        // 06:00 PST is 14:00 UTC.
        assert_eq!(
            schedule.next_after(utc(2026, 1, 15, 12, 0)),
            Some(utc(2026, 1, 15, 14, 0))
        );
    }

    #[test]
    fn dst_gap_time_is_skipped_that_day() {
        // 2026-03-08 02:30 does not exist in Los Angeles.
        let schedule = Schedule::parse("02:30", "America/Los_Angeles").unwrap();
        let next = schedule.next_after(utc(2026, 3, 8, 9, 0)).unwrap();
        // 02:30 PDT on 03-09 is 09:30 UTC.
        assert_eq!(next, utc(2026, 3, 9, 9, 30));
    }

    #[test]
    fn ambiguous_time_fires_at_earliest_instant() {
        // 2026-11-01 01:30 happens twice in Los Angeles; the PDT one is 08:30 UTC.
        let schedule = Schedule::parse("01:30", "America/Los_Angeles").unwrap();
        assert_eq!(
            schedule.next_after(utc(2026, 11, 1, 7, 0)),
            Some(utc(2026, 11, 1, 8, 30))
        );
    }

    #[test]
    fn invalid_schedule_is_a_config_error() {
        assert!(Schedule::parse("6 o'clock", "UTC").is_err());
        assert!(Schedule::parse("06:00", "Mars/Olympus").is_err());
        assert!(Schedule::parse(" , ", "UTC").is_err());
    }

    #[tokio::test]
    async fn trigger_while_running_reports_in_flight_pass() {
        let clock = ManualClock::new(utc(2026, 3, 1, 9, 0));
        let pass = FakePass::new(false);
        let scheduler = Arc::new(Scheduler::new(
            pass.clone(),
            Schedule::parse("06:00", "UTC").unwrap(),
            Arc::new(clock.clone()),
        ));

        let first = scheduler.trigger();
        assert_eq!(
            first,
            TriggerOutcome::Started {
                started_at: utc(2026, 3, 1, 9, 0)
            }
        );
        clock.advance(chrono::Duration::minutes(1));
        let second = scheduler.trigger();
        assert_eq!(
            second,
            TriggerOutcome::InFlight {
                running_since: utc(2026, 3, 1, 9, 0)
            }
        );
        assert!(scheduler.status().running);

        pass.release.add_permits(1);
        scheduler.wait_idle().await;
        assert_eq!(pass.runs(), 1);

        let status = scheduler.status();
        assert!(!status.running);
        assert!(status.last_report.is_some());
        assert_eq!(status.state, SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn fires_at_schedule_and_skips_while_paused() {
        let clock = ManualClock::new(utc(2026, 3, 1, 5, 59));
        let pass = FakePass::new(true);
        let scheduler = Arc::new(Scheduler::new(
            pass.clone(),
            Schedule::parse("06:00,12:00,18:00", "UTC").unwrap(),
            Arc::new(clock.clone()),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(shutdown_rx));

        eventually(|| scheduler.status().next_fire_at == Some(utc(2026, 3, 1, 6, 0))).await;
        assert_eq!(scheduler.status().state, SchedulerState::Running);

        clock.advance(chrono::Duration::minutes(1));
        eventually(|| pass.runs() == 1).await;
        eventually(|| scheduler.status().next_fire_at == Some(utc(2026, 3, 1, 12, 0))).await;

        assert_eq!(scheduler.pause(), SchedulerState::Paused);
        clock.set(utc(2026, 3, 1, 12, 0));
        eventually(|| scheduler.status().next_fire_at == Some(utc(2026, 3, 1, 18, 0))).await;
        assert_eq!(pass.runs(), 1);

        // Manual trigger still works while paused.
        assert!(matches!(scheduler.trigger(), TriggerOutcome::Started { .. }));
        scheduler.wait_idle().await;
        assert_eq!(pass.runs(), 2);

        assert_eq!(scheduler.resume(), SchedulerState::Running);
        clock.set(utc(2026, 3, 1, 18, 0));
        eventually(|| pass.runs() == 3).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        let status = scheduler.status();
        assert_eq!(status.state, SchedulerState::Stopped);
        assert_eq!(status.next_fire_at, None);
    }

    #[tokio::test]
    async fn pause_and_resume_are_noops_when_stopped() {
        let scheduler = Scheduler::new(
            FakePass::new(true),
            Schedule::parse("06:00", "UTC").unwrap(),
            Arc::new(ManualClock::new(Utc::now())),
        );
        assert_eq!(scheduler.pause(), SchedulerState::Stopped);
        assert_eq!(scheduler.resume(), SchedulerState::Stopped);
    }
}
