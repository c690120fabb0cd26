#![warn(clippy::pedantic, clippy::nursery, clippy::cargo)]
#![deny(clippy::use_self, rust_2018_idioms)]
#![allow(clippy::multiple_crate_versions, clippy::module_name_repetitions)]

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Local;

use alarm::{AlarmId, AlarmRecord, Category, MessageFit};
use communication::{NotificationKind, Notifier};
use config::{ChangePolicy, Config};
use display::{DisplayRegistry, DisplaySettings, GroupSnapshot};
use error::AlarmError;
use monitor::Monitor;
use registry::AlarmRegistry;

pub mod alarm;
pub mod command;
pub mod communication;
pub mod config;
pub mod display;
pub mod error;
pub mod lock_order;
pub mod monitor;
pub mod registry;

/// Everything a listing shows: the registry in id order, then the display groups.
#[derive(Debug, Clone)]
pub struct AlarmListing {
    pub alarms: Vec<AlarmRecord>,
    pub groups: Vec<GroupSnapshot>,
}

impl AlarmListing {
    #[must_use]
    pub fn mentions(&self, id: AlarmId) -> bool {
        self.alarms.iter().any(|alarm| alarm.id == id)
            || self
                .groups
                .iter()
                .any(|group| group.alarms.iter().any(|alarm| alarm.id == id))
    }
}

/// The running alarm service: the two registries, the monitor thread and the
/// display workers it starts.
#[derive(Debug)]
pub struct AlarmSystem {
    alarms: Arc<AlarmRegistry>,
    displays: Arc<DisplayRegistry>,
    notifier: Notifier,
    change_policy: ChangePolicy,
    shutdown: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl AlarmSystem {
    /// Builds the registries and starts the monitor.
    ///
    /// # Errors
    ///
    /// Fails on a config [`Config::validate`] rejects, or if the monitor
    /// thread can't be started.
    pub fn start(config: &Config, notifier: Notifier) -> Result<Self, AlarmError> {
        let (mut system, monitor) = Self::build(config, notifier)?;
        system.monitor = Some(monitor.spawn()?);
        Ok(system)
    }

    /// Builds the registries and hands back the monitor without starting it,
    /// so callers can drive [`Monitor::cycle`] themselves.
    ///
    /// # Errors
    ///
    /// Fails on a config [`Config::validate`] rejects.
    pub fn build(config: &Config, notifier: Notifier) -> Result<(Self, Monitor), AlarmError> {
        config.validate()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let alarms = Arc::new(AlarmRegistry::new());
        let displays = DisplayRegistry::new(
            DisplaySettings {
                capacity: config.max_groups,
                period: config.display_period(),
            },
            notifier.clone(),
            Arc::clone(&shutdown),
        );
        let monitor = Monitor::new(
            Arc::clone(&alarms),
            Arc::clone(&displays),
            notifier.clone(),
            config.monitor_period(),
            config.expired_batch,
            Arc::clone(&shutdown),
        );
        let system = Self {
            alarms,
            displays,
            notifier,
            change_policy: config.change_policy,
            shutdown,
            monitor: None,
        };
        Ok((system, monitor))
    }

    /// Adds an alarm; the monitor hands it to a display group on its next pass.
    ///
    /// # Errors
    ///
    /// Fails on an invalid category or a poisoned lock.
    pub fn start_alarm(
        &self,
        id: AlarmId,
        category: &str,
        interval: u32,
        message: &str,
    ) -> Result<MessageFit, AlarmError> {
        let category = Category::new(category)?;
        let (summary, fit) = self
            .alarms
            .lock()?
            .insert(id, category, interval, message, Local::now());
        log::info!("alarm {id} inserted, expires {}", summary.expiry);
        self.notifier
            .emit(NotificationKind::Inserted, Some(&summary), None);
        Ok(fit)
    }

    /// # Errors
    ///
    /// [`AlarmError::NotFound`] if no alarm has `id`.
    pub fn change_alarm(
        &self,
        id: AlarmId,
        interval: u32,
        message: &str,
    ) -> Result<MessageFit, AlarmError> {
        let restart_at = match self.change_policy {
            ChangePolicy::Cosmetic => None,
            ChangePolicy::Restart => Some(Local::now()),
        };
        let (record, fit) = self
            .alarms
            .lock()?
            .change(id, interval, message, restart_at)?;
        let summary = record.summary();
        log::info!("alarm {id} changed to {interval}s");
        self.notifier
            .emit(NotificationKind::Changed, Some(&summary), None);

        if !self.displays.refresh(&summary)? && record.assigned {
            // its group already dropped it; let the monitor hand it out again
            self.alarms.lock()?.mark_unassigned(&[summary]);
        }
        Ok(fit)
    }

    /// Removes the alarm and stops any display group from announcing it.
    ///
    /// # Errors
    ///
    /// [`AlarmError::NotFound`] if no alarm has `id`.
    pub fn cancel_alarm(&self, id: AlarmId) -> Result<(), AlarmError> {
        let record = self.alarms.lock()?.cancel(id)?;
        log::info!("alarm {id} cancelled");
        if self.displays.unassign(record.serial())?.is_none() {
            self.notifier
                .emit(NotificationKind::Cancelled, Some(&record.summary()), None);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if either lock is poisoned.
    pub fn list_alarms(&self) -> Result<AlarmListing, AlarmError> {
        let alarms = self.alarms.snapshot()?;
        let groups = self.displays.snapshot()?;
        Ok(AlarmListing { alarms, groups })
    }

    #[must_use]
    pub fn displays(&self) -> &Arc<DisplayRegistry> {
        &self.displays
    }

    /// Stops the monitor and every display worker, waiting for them to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                log::warn!("alarm monitor panicked");
            }
        }
        self.displays.join_workers();
        log::info!("alarm system stopped");
    }
}

impl Drop for AlarmSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleeps for `period`, waking early once `shutdown` is raised.
pub(crate) fn pause(period: Duration, shutdown: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(50);
    let deadline = Instant::now() + period;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(SLICE));
    }
}
