use std::{fmt, sync::mpsc};

use chrono::{DateTime, Local};

use crate::{alarm::AlarmSummary, display::GroupId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Inserted,
    Changed,
    Cancelled,
    /// the monitor removed the alarm from the registry
    Expired,
    Assigned,
    /// moved to another group because its category no longer matched
    Reassigned,
    GroupCreated { additional: bool },
    GroupTerminated,
    /// periodic "still active" line from a display group
    Announced,
    /// a display group noticed the expiry and stopped printing
    Stopped,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub alarm: Option<AlarmSummary>,
    pub group: Option<GroupId>,
    pub at: DateTime<Local>,
}

impl Notification {
    #[must_use]
    pub fn new(
        kind: NotificationKind,
        alarm: Option<AlarmSummary>,
        group: Option<GroupId>,
    ) -> Self {
        Self {
            kind,
            alarm,
            group,
            at: Local::now(),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.at.format("%H:%M:%S"))?;
        let group = self.group.unwrap_or_default();
        match (&self.alarm, self.kind) {
            (Some(alarm), NotificationKind::Inserted) => write!(f, "{alarm} inserted"),
            (Some(alarm), NotificationKind::Changed) => write!(f, "{alarm} changed"),
            (Some(alarm), NotificationKind::Cancelled) => write!(f, "{alarm} cancelled"),
            (Some(alarm), NotificationKind::Expired) => write!(f, "{alarm} expired"),
            (Some(alarm), NotificationKind::Assigned) => {
                write!(f, "{alarm} assigned to display group {group}")
            }
            (Some(alarm), NotificationKind::Reassigned) => {
                write!(f, "{alarm} reassigned to display group {group}")
            }
            (Some(alarm), NotificationKind::Announced) => {
                write!(f, "{alarm} still active in display group {group}")
            }
            (Some(alarm), NotificationKind::Stopped) => {
                write!(f, "{alarm} expired, display group {group} stopped printing it")
            }
            (alarm, NotificationKind::GroupCreated { additional }) => {
                let which = if additional { "additional" } else { "first" };
                write!(f, "created {which} display group {group}")?;
                if let Some(alarm) = alarm {
                    write!(f, " for category {}", alarm.category)?;
                }
                Ok(())
            }
            (_, NotificationKind::GroupTerminated) => {
                write!(f, "display group {group} terminated")
            }
            (None, kind) => write!(f, "{kind:?}"),
        }
    }
}

/// Fans notifications out to the log and, if attached, a channel receiver.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    sender: Option<mpsc::Sender<Notification>>,
}

impl Notifier {
    /// A notifier that only logs.
    #[must_use]
    pub const fn silent() -> Self {
        Self { sender: None }
    }

    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        (Self { sender: Some(tx) }, rx)
    }

    pub fn emit(
        &self,
        kind: NotificationKind,
        alarm: Option<&AlarmSummary>,
        group: Option<GroupId>,
    ) {
        let notification = Notification::new(kind, alarm.cloned(), group);
        log::debug!("{notification}");
        if let Some(sender) = &self.sender {
            // nobody listening anymore is fine
            let _ = sender.send(notification);
        }
    }
}
