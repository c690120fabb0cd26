use std::fmt;

use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};

use crate::error::AlarmError;

pub type AlarmId = i64;

/// Registry-assigned identity, unique even when callers reuse an [`AlarmId`].
pub type Serial = u64;

/// Longest message kept, in characters.
pub const MAX_MESSAGE_LEN: usize = 127;

/// Short code that decides which display groups may serve an alarm.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Category(String);

impl Category {
    /// # Errors
    ///
    /// Fails if `code` is empty, longer than two characters or contains whitespace.
    pub fn new(code: &str) -> Result<Self, AlarmError> {
        let len = code.chars().count();
        if len == 0 || len > 2 || code.chars().any(char::is_whitespace) {
            return Err(AlarmError::InvalidCategory(code.to_string()));
        }
        Ok(Self(code.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a message had to be shortened to fit [`MAX_MESSAGE_LEN`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFit {
    Intact,
    Truncated { dropped: usize },
}

impl MessageFit {
    #[must_use]
    pub const fn is_truncated(self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}

pub(crate) fn fit_message(message: &str) -> (String, MessageFit) {
    let len = message.chars().count();
    if len <= MAX_MESSAGE_LEN {
        return (message.to_string(), MessageFit::Intact);
    }
    log::warn!("message truncated to {MAX_MESSAGE_LEN} characters");
    (
        message.chars().take(MAX_MESSAGE_LEN).collect(),
        MessageFit::Truncated {
            dropped: len - MAX_MESSAGE_LEN,
        },
    )
}

/// An alarm as owned by the [`AlarmRegistry`](crate::registry::AlarmRegistry).
#[derive(Debug, Clone)]
pub struct AlarmRecord {
    pub(crate) serial: Serial,
    /// bumped by every change, so stale copies can be told apart
    pub revision: u32,
    pub id: AlarmId,
    pub category: Category,
    pub interval: u32,
    pub expiry: DateTime<Local>,
    pub message: String,
    pub assigned: bool,
}

impl AlarmRecord {
    pub(crate) fn new(
        serial: Serial,
        id: AlarmId,
        category: Category,
        interval: u32,
        message: String,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            serial,
            revision: 0,
            id,
            category,
            interval,
            expiry: expiry_after(now, interval),
            message,
            assigned: false,
        }
    }

    #[must_use]
    pub const fn serial(&self) -> Serial {
        self.serial
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Local>) -> bool {
        self.expiry <= now
    }

    #[must_use]
    pub fn summary(&self) -> AlarmSummary {
        AlarmSummary::from(self)
    }
}

pub(crate) fn expiry_after(now: DateTime<Local>, interval: u32) -> DateTime<Local> {
    now + Duration::seconds(i64::from(interval))
}

/// Copy of an alarm's fields, used by display slots, listings and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmSummary {
    pub serial: Serial,
    pub revision: u32,
    pub id: AlarmId,
    pub category: Category,
    pub interval: u32,
    pub expiry: DateTime<Local>,
    pub message: String,
}

impl AlarmSummary {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Local>) -> bool {
        self.expiry <= now
    }
}

impl From<&AlarmRecord> for AlarmSummary {
    fn from(record: &AlarmRecord) -> Self {
        Self {
            serial: record.serial,
            revision: record.revision,
            id: record.id,
            category: record.category.clone(),
            interval: record.interval,
            expiry: record.expiry,
            message: record.message.clone(),
        }
    }
}

impl fmt::Display for AlarmSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Alarm({}) {} {}s \"{}\"",
            self.id, self.category, self.interval, self.message
        )
    }
}
