//! The background loop that expires alarms and hands pending ones to display
//! groups.
//!
//! A cycle never holds both registry locks: it sweeps the alarm registry,
//! releases it, talks to the display registry, then comes back to the alarm
//! registry to record what was assigned.

use std::{
    sync::{atomic::AtomicBool, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{DateTime, Local};

use crate::{
    alarm::AlarmSummary,
    communication::{NotificationKind, Notifier},
    display::DisplayRegistry,
    error::{fatal, AlarmError},
    pause,
    registry::AlarmRegistry,
};

/// Counts from one monitor cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub expired: usize,
    /// expired alarms left for the next cycle because the batch was full
    pub deferred: usize,
    pub assigned: usize,
    /// alarms that found no display group with room
    pub waiting: usize,
    pub reassigned: usize,
}

#[derive(Debug)]
pub struct Monitor {
    alarms: Arc<AlarmRegistry>,
    displays: Arc<DisplayRegistry>,
    notifier: Notifier,
    period: Duration,
    batch_cap: usize,
    shutdown: Arc<AtomicBool>,
}

impl Monitor {
    #[must_use]
    pub const fn new(
        alarms: Arc<AlarmRegistry>,
        displays: Arc<DisplayRegistry>,
        notifier: Notifier,
        period: Duration,
        batch_cap: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            alarms,
            displays,
            notifier,
            period,
            batch_cap,
            shutdown,
        }
    }

    /// Starts the monitor on its own thread. It runs until the shutdown flag is raised.
    ///
    /// # Errors
    ///
    /// [`AlarmError::Spawn`] if the thread can't be created.
    pub fn spawn(self) -> Result<JoinHandle<()>, AlarmError> {
        thread::Builder::new()
            .name("alarm-monitor".to_string())
            .spawn(move || self.run())
            .map_err(AlarmError::Spawn)
    }

    fn run(&self) {
        log::info!("alarm monitor started, polling every {:?}", self.period);
        while !self.shutdown.load(std::sync::atomic::Ordering::Relaxed) {
            match self.cycle(Local::now()) {
                Ok(report) if report != CycleReport::default() => log::debug!("{report:?}"),
                Ok(_) => {}
                Err(err) => fatal("alarm monitor", &err),
            }
            pause(self.period, &self.shutdown);
        }
        log::info!("alarm monitor stopped");
    }

    /// One pass: expire, assign, commit assignments, reconcile.
    ///
    /// # Errors
    ///
    /// Only fatal errors escape: a poisoned lock or a worker that can't be started.
    pub fn cycle(&self, now: DateTime<Local>) -> Result<CycleReport, AlarmError> {
        let sweep = self.alarms.lock()?.sweep(now, self.batch_cap);
        let mut report = CycleReport {
            expired: sweep.expired.len(),
            deferred: sweep.deferred,
            ..CycleReport::default()
        };
        if sweep.deferred > 0 {
            log::warn!(
                "{} expired alarms deferred to the next cycle",
                sweep.deferred
            );
        }

        let placed = self.assign_pending(sweep.unassigned, &mut report)?;
        self.commit(placed)?;

        for record in sweep.expired {
            log::info!("alarm {} expired", record.id);
            self.notifier
                .emit(NotificationKind::Expired, Some(&record.summary()), None);
        }

        let reconciled = self.displays.reconcile()?;
        report.reassigned = reconciled.moved.len();
        if !reconciled.stranded.is_empty() {
            self.alarms.lock()?.mark_unassigned(&reconciled.stranded);
        }
        Ok(report)
    }

    /// Hands pending alarms to display groups. Returns the ones that were placed.
    pub(crate) fn assign_pending(
        &self,
        pending: Vec<AlarmSummary>,
        report: &mut CycleReport,
    ) -> Result<Vec<AlarmSummary>, AlarmError> {
        let mut placed = Vec::with_capacity(pending.len());
        for alarm in pending {
            match self.displays.assign(alarm.clone()) {
                Ok(_) => placed.push(alarm),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log::warn!("alarm {} waits for a display group: {err}", alarm.id);
                    report.waiting += 1;
                }
            }
        }
        report.assigned = placed.len();
        Ok(placed)
    }

    /// Records placements in the alarm registry, then repairs slots that went
    /// out of date while the alarm lock was released.
    pub(crate) fn commit(&self, placed: Vec<AlarmSummary>) -> Result<(), AlarmError> {
        let commit = self.alarms.lock()?.mark_assigned(placed);
        // cancelled while we were assigning; the canceller already reported it
        for orphan in commit.orphans {
            self.displays.withdraw(orphan.serial)?;
        }
        let mut dropped = Vec::new();
        for current in commit.stale {
            if !self.displays.refresh(&current)? {
                dropped.push(current);
            }
        }
        if !dropped.is_empty() {
            self.alarms.lock()?.mark_unassigned(&dropped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::{
        alarm::Category,
        display::{DisplaySettings, Tick},
    };

    type Parts = (
        Monitor,
        Arc<AlarmRegistry>,
        Arc<DisplayRegistry>,
        Arc<AtomicBool>,
    );

    fn monitor(capacity: usize) -> Parts {
        monitor_with(capacity, Notifier::silent())
    }

    fn monitor_with(capacity: usize, notifier: Notifier) -> Parts {
        let shutdown = Arc::new(AtomicBool::new(false));
        let alarms = Arc::new(AlarmRegistry::new());
        let displays = DisplayRegistry::new(
            DisplaySettings {
                capacity,
                period: Duration::from_secs(600),
            },
            notifier.clone(),
            Arc::clone(&shutdown),
        );
        let monitor = Monitor::new(
            Arc::clone(&alarms),
            Arc::clone(&displays),
            notifier,
            Duration::from_secs(600),
            4,
            Arc::clone(&shutdown),
        );
        (monitor, alarms, displays, shutdown)
    }

    fn stop(displays: &DisplayRegistry, shutdown: &AtomicBool) {
        shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        displays.join_workers();
    }

    fn insert(
        alarms: &AlarmRegistry,
        id: i64,
        category: &str,
        interval: u32,
        now: DateTime<Local>,
    ) {
        let _ = alarms
            .lock()
            .unwrap()
            .insert(id, Category::new(category).unwrap(), interval, "msg", now);
    }

    #[test]
    fn assigns_pending_alarms_and_marks_them() {
        let (monitor, alarms, displays, shutdown) = monitor(10);
        let now = Local::now();
        for id in 1..=3 {
            insert(&alarms, id, "AA", 60, now);
        }
        let report = monitor.cycle(now).unwrap();
        assert_eq!(report.assigned, 3);
        assert!(alarms.snapshot().unwrap().iter().all(|r| r.assigned));
        assert_eq!(displays.group_count().unwrap(), 2);

        // nothing new to do on the next pass
        assert_eq!(monitor.cycle(now).unwrap(), CycleReport::default());
        stop(&displays, &shutdown);
    }

    #[test]
    fn expired_alarms_leave_the_registry() {
        let (monitor, alarms, displays, shutdown) = monitor(10);
        let now = Local::now();
        insert(&alarms, 1, "AA", 5, now);
        monitor.cycle(now).unwrap();

        let later = now + ChronoDuration::seconds(6);
        let report = monitor.cycle(later).unwrap();
        assert_eq!(report.expired, 1);
        assert!(alarms.snapshot().unwrap().is_empty());
        stop(&displays, &shutdown);
    }

    #[test]
    fn full_display_registry_leaves_alarms_waiting() {
        let (monitor, alarms, displays, shutdown) = monitor(1);
        let now = Local::now();
        insert(&alarms, 1, "A", 60, now);
        insert(&alarms, 2, "B", 60, now);

        let report = monitor.cycle(now).unwrap();
        assert_eq!(report.assigned, 1);
        assert_eq!(report.waiting, 1);
        let waiting = alarms.lock().unwrap().find(2).cloned().unwrap();
        assert!(!waiting.assigned);

        // still waiting, and retried every cycle
        assert_eq!(monitor.cycle(now).unwrap().waiting, 1);
        stop(&displays, &shutdown);
    }

    #[test]
    fn expiry_batches_are_capped() {
        let (monitor, alarms, displays, shutdown) = monitor(10);
        let now = Local::now();
        for id in 0..6 {
            insert(&alarms, id, "A", 0, now);
        }
        let report = monitor.cycle(now).unwrap();
        assert_eq!(report.expired, 4);
        assert_eq!(report.deferred, 2);
        assert_eq!(monitor.cycle(now).unwrap().expired, 2);
        stop(&displays, &shutdown);
    }

    #[test]
    fn change_between_sweep_and_assign_reaches_the_slot() {
        let (monitor, alarms, displays, shutdown) = monitor(10);
        let now = Local::now();
        insert(&alarms, 1, "AA", 600, now);
        let sweep = alarms.lock().unwrap().sweep(now, 4);

        // the change lands while the monitor holds only its copy
        let later = now + ChronoDuration::seconds(60);
        let (current, _) = alarms
            .lock()
            .unwrap()
            .change(1, 1200, "new", Some(later))
            .unwrap();
        assert!(!displays.refresh(&current.summary()).unwrap());

        let mut report = CycleReport::default();
        let placed = monitor.assign_pending(sweep.unassigned, &mut report).unwrap();
        monitor.commit(placed).unwrap();

        let group = displays.snapshot().unwrap().remove(0);
        assert_eq!(group.alarms, vec![current.summary()]);
        assert!(alarms.lock().unwrap().find(1).unwrap().assigned);
        // past the old expiry the group still holds it
        let past_old_expiry = now + ChronoDuration::seconds(700);
        assert_eq!(displays.tick(group.id, past_old_expiry).unwrap(), Tick::Active);
        stop(&displays, &shutdown);
    }

    #[test]
    fn stale_placement_without_a_slot_is_handed_out_again() {
        let (monitor, alarms, displays, shutdown) = monitor(10);
        let now = Local::now();
        insert(&alarms, 1, "AA", 600, now);
        let sweep = alarms.lock().unwrap().sweep(now, 4);
        let _ = alarms.lock().unwrap().change(1, 900, "new", None).unwrap();

        let mut report = CycleReport::default();
        let placed = monitor.assign_pending(sweep.unassigned, &mut report).unwrap();
        let serial = placed[0].serial;
        displays.withdraw(serial).unwrap();
        monitor.commit(placed).unwrap();
        assert!(!alarms.lock().unwrap().find(1).unwrap().assigned);

        // the next pass places the current fields
        assert_eq!(monitor.cycle(now).unwrap().assigned, 1);
        let held = displays.snapshot().unwrap();
        let held: Vec<_> = held.iter().flat_map(|g| g.alarms.iter()).collect();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].message, "new");
        stop(&displays, &shutdown);
    }

    #[test]
    fn cancelled_placements_are_withdrawn_quietly() {
        let (notifier, rx) = Notifier::channel();
        let (monitor, alarms, displays, shutdown) = monitor_with(10, notifier);
        let now = Local::now();
        insert(&alarms, 1, "AA", 600, now);
        let sweep = alarms.lock().unwrap().sweep(now, 4);
        alarms.lock().unwrap().cancel(1).unwrap();

        let mut report = CycleReport::default();
        let placed = monitor.assign_pending(sweep.unassigned, &mut report).unwrap();
        monitor.commit(placed).unwrap();

        assert!(displays.snapshot().unwrap()[0].alarms.is_empty());
        assert!(!rx
            .try_iter()
            .any(|n| n.kind == NotificationKind::Cancelled));
        stop(&displays, &shutdown);
    }
}
