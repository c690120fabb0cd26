//! The shared, lock-guarded collection of active alarms.
//!
//! Every read or write goes through an [`AlarmRegistryGuard`], so the lock is
//! held for exactly as long as the guard lives and traversals can't outlive it.

use std::{
    cmp::Reverse,
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Local};

use crate::{
    alarm::{
        expiry_after, fit_message, AlarmId, AlarmRecord, AlarmSummary, Category, MessageFit,
        Serial,
    },
    error::AlarmError,
    lock_order::{LockName, LockToken},
};

/// Records sort by id, and among duplicate ids the newest insert comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RecordKey {
    id: AlarmId,
    newest_first: Reverse<Serial>,
}

impl RecordKey {
    const fn new(id: AlarmId, serial: Serial) -> Self {
        Self {
            id,
            newest_first: Reverse(serial),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    records: BTreeMap<RecordKey, AlarmRecord>,
    last_serial: Serial,
}

#[derive(Debug, Default)]
pub struct AlarmRegistry {
    state: Mutex<RegistryState>,
}

/// Exclusive access to the registry; the lock is released on drop.
#[derive(Debug)]
pub struct AlarmRegistryGuard<'a> {
    // declared first so the mutex unlocks before the token clears
    state: MutexGuard<'a, RegistryState>,
    _token: LockToken,
}

/// What [`AlarmRegistryGuard::mark_assigned`] found when committing placements.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Commit {
    /// placed, but removed from the registry in the meantime
    pub orphans: Vec<AlarmSummary>,
    /// placed from an older copy; these are the current fields
    pub stale: Vec<AlarmSummary>,
}

/// Outcome of one monitor pass over the registry.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Records detached because their expiry passed, at most the batch cap.
    pub expired: Vec<AlarmRecord>,
    /// Pending records that no display group holds yet.
    pub unassigned: Vec<AlarmSummary>,
    /// Expired records left in place because the batch was full.
    pub deferred: usize,
}

impl AlarmRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Fails with [`AlarmError::LockPoisoned`] if another thread panicked while holding the lock.
    pub fn lock(&self) -> Result<AlarmRegistryGuard<'_>, AlarmError> {
        let token = LockToken::acquire(LockName::Alarms);
        let state = self
            .state
            .lock()
            .map_err(|_| AlarmError::LockPoisoned(LockName::Alarms))?;
        Ok(AlarmRegistryGuard {
            state,
            _token: token,
        })
    }

    /// Clones every record in id order.
    ///
    /// # Errors
    ///
    /// Fails if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<AlarmRecord>, AlarmError> {
        Ok(self.lock()?.iter().cloned().collect())
    }
}

impl AlarmRegistryGuard<'_> {
    pub fn insert(
        &mut self,
        id: AlarmId,
        category: Category,
        interval: u32,
        message: &str,
        now: DateTime<Local>,
    ) -> (AlarmSummary, MessageFit) {
        let (message, fit) = fit_message(message);
        self.state.last_serial += 1;
        let serial = self.state.last_serial;
        let record = AlarmRecord::new(serial, id, category, interval, message, now);
        let summary = record.summary();
        self.state.records.insert(RecordKey::new(id, serial), record);
        (summary, fit)
    }

    /// Updates interval and message of the first record with `id`. The expiry
    /// is reset only when `restart_at` is given.
    ///
    /// # Errors
    ///
    /// Fails with [`AlarmError::NotFound`] if no record has `id`.
    pub fn change(
        &mut self,
        id: AlarmId,
        interval: u32,
        message: &str,
        restart_at: Option<DateTime<Local>>,
    ) -> Result<(AlarmRecord, MessageFit), AlarmError> {
        let key = self.first_key(id).ok_or(AlarmError::NotFound(id))?;
        let (message, fit) = fit_message(message);
        let record = self
            .state
            .records
            .get_mut(&key)
            .ok_or(AlarmError::NotFound(id))?;
        record.revision = record.revision.wrapping_add(1);
        record.interval = interval;
        record.message = message;
        if let Some(now) = restart_at {
            record.expiry = expiry_after(now, interval);
        }
        Ok((record.clone(), fit))
    }

    /// Detaches the first record with `id` and hands it to the caller.
    ///
    /// # Errors
    ///
    /// Fails with [`AlarmError::NotFound`] if no record has `id`.
    pub fn cancel(&mut self, id: AlarmId) -> Result<AlarmRecord, AlarmError> {
        let key = self.first_key(id).ok_or(AlarmError::NotFound(id))?;
        self.state
            .records
            .remove(&key)
            .ok_or(AlarmError::NotFound(id))
    }

    /// Single pass that detaches up to `batch_cap` expired records and
    /// collects the pending ones still waiting for a display group.
    pub fn sweep(&mut self, now: DateTime<Local>, batch_cap: usize) -> Sweep {
        let mut sweep = Sweep::default();
        let mut expired_keys = Vec::with_capacity(batch_cap.min(self.state.records.len()));
        for (key, record) in &self.state.records {
            if record.is_expired(now) {
                if expired_keys.len() < batch_cap {
                    expired_keys.push(*key);
                } else {
                    sweep.deferred += 1;
                }
            } else if !record.assigned {
                sweep.unassigned.push(record.summary());
            }
        }
        sweep.expired = expired_keys
            .iter()
            .filter_map(|key| self.state.records.remove(key))
            .collect();
        sweep
    }

    /// Flags the given alarms as held by a display group, sorting out the
    /// ones that went away or changed after the sweep copied them.
    pub fn mark_assigned(&mut self, alarms: Vec<AlarmSummary>) -> Commit {
        let mut commit = Commit::default();
        for alarm in alarms {
            match self
                .state
                .records
                .get_mut(&RecordKey::new(alarm.id, alarm.serial))
            {
                Some(record) => {
                    record.assigned = true;
                    if record.revision != alarm.revision {
                        commit.stale.push(record.summary());
                    }
                }
                None => commit.orphans.push(alarm),
            }
        }
        commit
    }

    /// Clears the assigned flag so the monitor hands the alarms out again.
    pub fn mark_unassigned(&mut self, alarms: &[AlarmSummary]) {
        for alarm in alarms {
            if let Some(record) = self
                .state
                .records
                .get_mut(&RecordKey::new(alarm.id, alarm.serial))
            {
                record.assigned = false;
            }
        }
    }

    #[must_use]
    pub fn find(&self, id: AlarmId) -> Option<&AlarmRecord> {
        self.first_key(id).and_then(|key| self.state.records.get(&key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlarmRecord> {
        self.state.records.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.records.is_empty()
    }

    fn first_key(&self, id: AlarmId) -> Option<RecordKey> {
        self.state
            .records
            .range(RecordKey::new(id, Serial::MAX)..=RecordKey::new(id, 0))
            .next()
            .map(|(key, _)| *key)
    }
}
