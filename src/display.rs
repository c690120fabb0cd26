//! Display groups: capacity-two workers that keep re-announcing the alarms of
//! one category, plus the registry that hands alarms out to them.
//!
//! A group and its worker thread live and die together. The worker only ever
//! touches the display registry lock, and it checks for emptiness and retires
//! its group within the same lock acquisition, so an assignment can never land
//! in a group that is about to disappear.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::{
    alarm::{AlarmSummary, Category, Serial},
    communication::{NotificationKind, Notifier},
    error::{fatal, AlarmError},
    lock_order::{LockName, LockToken},
    pause,
};

pub type GroupId = u64;

pub const SLOTS_PER_GROUP: usize = 2;

#[derive(Debug)]
pub struct DisplayGroup {
    id: GroupId,
    category: Category,
    slots: [Option<AlarmSummary>; SLOTS_PER_GROUP],
    worker: Option<JoinHandle<()>>,
}

impl DisplayGroup {
    fn new(id: GroupId, category: Category, worker: Option<JoinHandle<()>>) -> Self {
        Self {
            id,
            category,
            slots: [None, None],
            worker,
        }
    }

    #[must_use]
    pub const fn id(&self) -> GroupId {
        self.id
    }

    #[must_use]
    pub const fn category(&self) -> &Category {
        &self.category
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn alarms(&self) -> impl Iterator<Item = &AlarmSummary> {
        self.slots.iter().flatten()
    }

    fn has_room(&self) -> bool {
        self.active_count() < SLOTS_PER_GROUP
    }

    fn place(&mut self, alarm: AlarmSummary) -> bool {
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(alarm);
                true
            }
            None => false,
        }
    }

    fn take(&mut self, serial: Serial) -> Option<AlarmSummary> {
        self.slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|alarm| alarm.serial == serial))
            .and_then(Option::take)
    }
}

/// What a listing shows of one display group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    pub id: GroupId,
    pub category: Category,
    pub alarms: Vec<AlarmSummary>,
}

impl From<&DisplayGroup> for GroupSnapshot {
    fn from(group: &DisplayGroup) -> Self {
        Self {
            id: group.id,
            category: group.category.clone(),
            alarms: group.alarms().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DisplaySettings {
    /// most groups (and worker threads) alive at once
    pub capacity: usize,
    pub period: Duration,
}

/// Result of one worker cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Active,
    Retired,
    /// the group was already gone
    Gone,
}

/// Alarms pulled out of groups whose category no longer matched them.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub moved: Vec<AlarmSummary>,
    /// evicted but no group had room; they need to be handed out again
    pub stranded: Vec<AlarmSummary>,
}

#[derive(Debug, Default)]
struct DisplayState {
    groups: Vec<DisplayGroup>,
    last_group_id: GroupId,
}

impl DisplayState {
    fn position(&self, id: GroupId) -> Option<usize> {
        self.groups.iter().position(|group| group.id == id)
    }
}

#[derive(Debug)]
pub struct DisplayRegistry {
    state: Mutex<DisplayState>,
    settings: DisplaySettings,
    notifier: Notifier,
    shutdown: Arc<AtomicBool>,
}

#[derive(Debug)]
struct DisplayGuard<'a> {
    state: MutexGuard<'a, DisplayState>,
    _token: LockToken,
}

impl DisplayRegistry {
    #[must_use]
    pub fn new(
        settings: DisplaySettings,
        notifier: Notifier,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DisplayState::default()),
            settings,
            notifier,
            shutdown,
        })
    }

    fn lock(&self) -> Result<DisplayGuard<'_>, AlarmError> {
        let token = LockToken::acquire(LockName::Displays);
        let state = self
            .state
            .lock()
            .map_err(|_| AlarmError::LockPoisoned(LockName::Displays))?;
        Ok(DisplayGuard {
            state,
            _token: token,
        })
    }

    /// Places `alarm` in the first group of its category with a free slot,
    /// starting a new group if none has room.
    ///
    /// # Errors
    ///
    /// [`AlarmError::CapacityExhausted`] if a new group is needed but the
    /// registry is full; fatal errors if the lock is poisoned or the worker
    /// thread can't be started.
    pub fn assign(self: &Arc<Self>, alarm: AlarmSummary) -> Result<GroupId, AlarmError> {
        let mut guard = self.lock()?;
        self.assign_locked(&mut guard.state, alarm, NotificationKind::Assigned)
    }

    fn assign_locked(
        self: &Arc<Self>,
        state: &mut DisplayState,
        alarm: AlarmSummary,
        kind: NotificationKind,
    ) -> Result<GroupId, AlarmError> {
        if let Some(group) = state
            .groups
            .iter_mut()
            .find(|group| group.category == alarm.category && group.has_room())
        {
            self.notifier.emit(kind, Some(&alarm), Some(group.id));
            group.place(alarm);
            return Ok(group.id);
        }

        if state.groups.len() >= self.settings.capacity {
            return Err(AlarmError::CapacityExhausted {
                category: alarm.category,
                capacity: self.settings.capacity,
            });
        }

        let additional = state
            .groups
            .iter()
            .any(|group| group.category == alarm.category);
        state.last_group_id += 1;
        let id = state.last_group_id;
        let worker = self.spawn_worker(id)?;
        let mut group = DisplayGroup::new(id, alarm.category.clone(), Some(worker));
        log::info!(
            "created {} display group {id} for category {}",
            if additional { "additional" } else { "first" },
            alarm.category
        );
        self.notifier.emit(
            NotificationKind::GroupCreated { additional },
            Some(&alarm),
            Some(id),
        );
        self.notifier.emit(kind, Some(&alarm), Some(id));
        // filled before the lock is released, so the worker never sees it empty
        group.place(alarm);
        state.groups.push(group);
        Ok(id)
    }

    fn spawn_worker(self: &Arc<Self>, id: GroupId) -> Result<JoinHandle<()>, AlarmError> {
        let displays = Arc::clone(self);
        thread::Builder::new()
            .name(format!("display-{id}"))
            .spawn(move || displays.run_worker(id))
            .map_err(AlarmError::Spawn)
    }

    fn run_worker(&self, id: GroupId) {
        log::debug!("display group {id} worker started");
        loop {
            pause(self.settings.period, &self.shutdown);
            match self.tick(id, Local::now()) {
                Ok(Tick::Active) => {}
                Ok(Tick::Retired | Tick::Gone) => break,
                Err(err) => fatal(&format!("display group {id}"), &err),
            }
        }
        log::debug!("display group {id} worker exiting");
    }

    /// One worker cycle for group `id`: drop expired alarms, announce the rest,
    /// and retire the group if it is empty or the system is shutting down.
    ///
    /// # Errors
    ///
    /// Fails if the lock is poisoned.
    pub fn tick(&self, id: GroupId, now: DateTime<Local>) -> Result<Tick, AlarmError> {
        let mut guard = self.lock()?;
        let state = &mut guard.state;
        let Some(index) = state.position(id) else {
            return Ok(Tick::Gone);
        };
        let shutting_down = self.shutdown.load(Ordering::Relaxed);
        let group = &mut state.groups[index];
        for slot in &mut group.slots {
            if slot.as_ref().is_some_and(|alarm| alarm.is_expired(now)) {
                if let Some(alarm) = slot.take() {
                    self.notifier
                        .emit(NotificationKind::Stopped, Some(&alarm), Some(id));
                }
            } else if let Some(alarm) = slot.as_ref() {
                if !shutting_down {
                    self.notifier
                        .emit(NotificationKind::Announced, Some(alarm), Some(id));
                }
            }
        }

        if group.active_count() == 0 || shutting_down {
            // retire under the same acquisition that saw the group empty
            let group = state.groups.remove(index);
            log::info!(
                "display group {id} ({}) terminated with {} alarms",
                group.category,
                group.active_count()
            );
            self.notifier
                .emit(NotificationKind::GroupTerminated, None, Some(id));
            return Ok(Tick::Retired);
        }
        Ok(Tick::Active)
    }

    /// Clears whichever slot holds `serial` and reports the cancellation.
    /// Returns the group it was in.
    ///
    /// # Errors
    ///
    /// Fails if the lock is poisoned.
    pub fn unassign(&self, serial: Serial) -> Result<Option<GroupId>, AlarmError> {
        let taken = self.take_slot(serial)?;
        if let Some((group, alarm)) = &taken {
            self.notifier
                .emit(NotificationKind::Cancelled, Some(alarm), Some(*group));
        }
        Ok(taken.map(|(group, _)| group))
    }

    /// Like [`unassign`](Self::unassign), without a notification. For slots
    /// whose alarm was already reported as cancelled.
    ///
    /// # Errors
    ///
    /// Fails if the lock is poisoned.
    pub fn withdraw(&self, serial: Serial) -> Result<Option<GroupId>, AlarmError> {
        Ok(self.take_slot(serial)?.map(|(group, _)| group))
    }

    fn take_slot(&self, serial: Serial) -> Result<Option<(GroupId, AlarmSummary)>, AlarmError> {
        let mut guard = self.lock()?;
        Ok(guard
            .state
            .groups
            .iter_mut()
            .find_map(|group| group.take(serial).map(|alarm| (group.id, alarm))))
    }

    /// Pushes changed alarm fields into the slot holding it, if any. A slot
    /// already holding a newer revision is left alone.
    ///
    /// # Errors
    ///
    /// Fails if the lock is poisoned.
    pub fn refresh(&self, alarm: &AlarmSummary) -> Result<bool, AlarmError> {
        let mut guard = self.lock()?;
        let slot = guard
            .state
            .groups
            .iter_mut()
            .flat_map(|group| group.slots.iter_mut().flatten())
            .find(|held| held.serial == alarm.serial);
        Ok(slot
            .map(|held| {
                if alarm.revision >= held.revision {
                    *held = alarm.clone();
                }
            })
            .is_some())
    }

    /// Moves alarms out of groups whose category no longer matches theirs.
    ///
    /// # Errors
    ///
    /// Fails on a poisoned lock or if a worker can't be started.
    pub fn reconcile(self: &Arc<Self>) -> Result<Reconciled, AlarmError> {
        let mut guard = self.lock()?;
        let state = &mut guard.state;
        let mut evicted = Vec::new();
        for group in &mut state.groups {
            for slot in &mut group.slots {
                if slot
                    .as_ref()
                    .is_some_and(|alarm| alarm.category != group.category)
                {
                    evicted.extend(slot.take());
                }
            }
        }

        let mut reconciled = Reconciled::default();
        for alarm in evicted {
            match self.assign_locked(state, alarm.clone(), NotificationKind::Reassigned) {
                Ok(_) => reconciled.moved.push(alarm),
                Err(err @ AlarmError::CapacityExhausted { .. }) => {
                    log::warn!("{err}");
                    reconciled.stranded.push(alarm);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(reconciled)
    }

    /// # Errors
    ///
    /// Fails if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<GroupSnapshot>, AlarmError> {
        Ok(self
            .lock()?
            .state
            .groups
            .iter()
            .map(GroupSnapshot::from)
            .collect())
    }

    /// # Errors
    ///
    /// Fails if the lock is poisoned.
    pub fn group_count(&self) -> Result<usize, AlarmError> {
        Ok(self.lock()?.state.groups.len())
    }

    /// Waits for every worker still running. Call after raising the shutdown flag.
    pub fn join_workers(&self) {
        let handles: Vec<_> = match self.lock() {
            Ok(mut guard) => guard
                .state
                .groups
                .iter_mut()
                .filter_map(|group| group.worker.take())
                .collect(),
            Err(err) => {
                log::error!("couldn't collect display workers: {err}");
                return;
            }
        };
        for handle in handles {
            if handle.join().is_err() {
                log::warn!("a display worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use std::sync::mpsc::Receiver;

    use super::*;
    use crate::communication::Notification;

    fn alarm(serial: Serial, category: &str, secs: i64) -> AlarmSummary {
        AlarmSummary {
            serial,
            revision: 0,
            id: serial as i64,
            category: Category::new(category).unwrap(),
            interval: 60,
            expiry: Local::now() + ChronoDuration::seconds(secs),
            message: format!("alarm {serial}"),
        }
    }

    fn registry(capacity: usize) -> (Arc<DisplayRegistry>, Receiver<Notification>) {
        let (notifier, rx) = Notifier::channel();
        let settings = DisplaySettings {
            capacity,
            // long enough that the workers never tick on their own during a test
            period: Duration::from_secs(600),
        };
        (
            DisplayRegistry::new(settings, notifier, Arc::new(AtomicBool::new(false))),
            rx,
        )
    }

    fn stop(displays: &DisplayRegistry) {
        displays.shutdown.store(true, Ordering::Relaxed);
        displays.join_workers();
    }

    #[test]
    fn fills_groups_two_at_a_time() {
        let (displays, rx) = registry(10);
        let first = displays.assign(alarm(1, "AA", 60)).unwrap();
        assert_eq!(displays.assign(alarm(2, "AA", 60)).unwrap(), first);
        let second = displays.assign(alarm(3, "AA", 60)).unwrap();
        assert_ne!(first, second);

        let groups = displays.snapshot().unwrap();
        assert_eq!(groups.len(), 2);
        let ids: Vec<Vec<_>> = groups
            .iter()
            .map(|g| g.alarms.iter().map(|a| a.serial).collect())
            .collect();
        assert_eq!(ids, vec![vec![1, 2], vec![3]]);

        let kinds: Vec<_> = rx.try_iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::GroupCreated { additional: false },
                NotificationKind::Assigned,
                NotificationKind::Assigned,
                NotificationKind::GroupCreated { additional: true },
                NotificationKind::Assigned,
            ]
        );
        stop(&displays);
    }

    #[test]
    fn categories_get_their_own_groups() {
        let (displays, _rx) = registry(10);
        let a = displays.assign(alarm(1, "A", 60)).unwrap();
        let b = displays.assign(alarm(2, "B", 60)).unwrap();
        assert_ne!(a, b);
        assert_eq!(displays.group_count().unwrap(), 2);
        stop(&displays);
    }

    #[test]
    fn full_registry_refuses_new_groups() {
        let (displays, _rx) = registry(1);
        displays.assign(alarm(1, "A", 60)).unwrap();
        let err = displays.assign(alarm(2, "B", 60)).unwrap_err();
        assert!(matches!(
            err,
            AlarmError::CapacityExhausted { capacity: 1, .. }
        ));
        // the existing group still has room for its own category
        displays.assign(alarm(3, "A", 60)).unwrap();
        assert_eq!(displays.group_count().unwrap(), 1);
        stop(&displays);
    }

    #[test]
    fn unassign_clears_the_slot() {
        let (displays, rx) = registry(10);
        let group = displays.assign(alarm(1, "A", 60)).unwrap();
        displays.assign(alarm(2, "A", 60)).unwrap();
        assert_eq!(displays.unassign(1).unwrap(), Some(group));
        assert_eq!(displays.unassign(1).unwrap(), None);

        let groups = displays.snapshot().unwrap();
        assert_eq!(groups[0].alarms.len(), 1);
        assert_eq!(groups[0].alarms[0].serial, 2);
        assert!(rx
            .try_iter()
            .any(|n| n.kind == NotificationKind::Cancelled));
        stop(&displays);
    }

    #[test]
    fn tick_announces_then_retires_when_empty() {
        let (displays, rx) = registry(10);
        let group = displays.assign(alarm(1, "A", 60)).unwrap();
        rx.try_iter().for_each(drop);

        assert_eq!(displays.tick(group, Local::now()).unwrap(), Tick::Active);
        assert_eq!(rx.try_recv().unwrap().kind, NotificationKind::Announced);

        let later = Local::now() + ChronoDuration::seconds(120);
        assert_eq!(displays.tick(group, later).unwrap(), Tick::Retired);
        let kinds: Vec<_> = rx.try_iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![NotificationKind::Stopped, NotificationKind::GroupTerminated]
        );
        assert_eq!(displays.group_count().unwrap(), 0);
        assert_eq!(displays.tick(group, later).unwrap(), Tick::Gone);
        stop(&displays);
    }

    #[test]
    fn withdraw_clears_the_slot_quietly() {
        let (displays, rx) = registry(10);
        let group = displays.assign(alarm(1, "A", 60)).unwrap();
        rx.try_iter().for_each(drop);
        assert_eq!(displays.withdraw(1).unwrap(), Some(group));
        assert_eq!(displays.withdraw(1).unwrap(), None);
        assert!(displays.snapshot().unwrap()[0].alarms.is_empty());
        assert!(rx.try_iter().next().is_none());
        stop(&displays);
    }

    #[test]
    fn refresh_never_goes_back_a_revision() {
        let (displays, _rx) = registry(10);
        let mut newer = alarm(1, "A", 60);
        newer.revision = 2;
        newer.message = "newer".to_string();
        displays.assign(newer).unwrap();

        let mut older = alarm(1, "A", 60);
        older.revision = 1;
        older.message = "older".to_string();
        assert!(displays.refresh(&older).unwrap());
        assert_eq!(displays.snapshot().unwrap()[0].alarms[0].message, "newer");
        stop(&displays);
    }

    #[test]
    fn refresh_updates_held_copy() {
        let (displays, _rx) = registry(10);
        let mut held = alarm(1, "A", 60);
        displays.assign(held.clone()).unwrap();
        held.message = "changed".to_string();
        assert!(displays.refresh(&held).unwrap());
        assert!(!displays.refresh(&alarm(9, "A", 60)).unwrap());
        assert_eq!(displays.snapshot().unwrap()[0].alarms[0].message, "changed");
        stop(&displays);
    }

    #[test]
    fn reconcile_moves_mismatched_alarms() {
        let (displays, _rx) = registry(10);
        let group = displays.assign(alarm(1, "A", 60)).unwrap();
        {
            let mut guard = displays.lock().unwrap();
            let slot = guard.state.groups[0].slots[0].as_mut().unwrap();
            slot.category = Category::new("B").unwrap();
        }
        let reconciled = displays.reconcile().unwrap();
        assert_eq!(reconciled.moved.len(), 1);
        assert!(reconciled.stranded.is_empty());

        let groups = displays.snapshot().unwrap();
        let old = groups.iter().find(|g| g.id == group).unwrap();
        assert!(old.alarms.is_empty());
        let new = groups.iter().find(|g| g.id != group).unwrap();
        assert_eq!(new.category.as_str(), "B");
        assert_eq!(new.alarms[0].serial, 1);
        stop(&displays);
    }

    #[test]
    fn active_count_matches_occupied_slots() {
        let mut group = DisplayGroup::new(1, Category::new("A").unwrap(), None);
        assert_eq!(group.active_count(), 0);
        assert!(group.place(alarm(1, "A", 60)));
        assert!(group.place(alarm(2, "A", 60)));
        assert!(!group.place(alarm(3, "A", 60)));
        assert_eq!(group.active_count(), 2);
        assert!(group.take(1).is_some());
        assert_eq!(group.active_count(), 1);
        assert!(group.has_room());
    }
}
