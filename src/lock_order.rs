//! Debug-build checker for the rule that no thread ever holds the alarm
//! registry lock and the display registry lock at the same time.

use std::{cell::Cell, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockName {
    Alarms,
    Displays,
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Alarms => "alarm registry",
            Self::Displays => "display registry",
        })
    }
}

thread_local! {
    static HELD: Cell<Option<LockName>> = const { Cell::new(None) };
}

/// Marks a registry lock as held by the current thread until dropped.
///
/// Take the token *before* locking the mutex so a nesting violation panics
/// without leaving a poisoned lock behind.
#[derive(Debug)]
pub struct LockToken {
    previous: Option<LockName>,
}

impl LockToken {
    /// # Panics
    ///
    /// In debug builds, panics if the current thread already holds a tracked lock.
    #[must_use]
    pub fn acquire(name: LockName) -> Self {
        let previous = HELD.with(Cell::get);
        #[cfg(debug_assertions)]
        if let Some(held) = previous {
            panic!("lock nesting: acquiring {name} lock while holding {held} lock");
        }
        HELD.with(|h| h.set(Some(name)));
        Self { previous }
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        HELD.with(|h| h.set(self.previous));
    }
}

#[cfg(test)]
fn held() -> Option<LockName> {
    HELD.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_acquisition_is_allowed() {
        {
            let _alarms = LockToken::acquire(LockName::Alarms);
            assert_eq!(held(), Some(LockName::Alarms));
        }
        assert_eq!(held(), None);
        let _displays = LockToken::acquire(LockName::Displays);
        assert_eq!(held(), Some(LockName::Displays));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock nesting")]
    fn nested_acquisition_panics() {
        let _alarms = LockToken::acquire(LockName::Alarms);
        let _displays = LockToken::acquire(LockName::Displays);
    }

    #[test]
    fn tokens_are_per_thread() {
        let _alarms = LockToken::acquire(LockName::Alarms);
        std::thread::spawn(|| {
            assert_eq!(held(), None);
            let _displays = LockToken::acquire(LockName::Displays);
        })
        .join()
        .unwrap();
    }
}
