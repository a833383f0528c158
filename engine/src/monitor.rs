//! Debounced online/offline state machine.
//!
//! The host feeds raw reachability observations (probe results, OS
//! connectivity events). Going offline takes effect at once; going online
//! only after reachability has held for the debounce window, so a flaky
//! connection does not trigger a drain on every blip.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Default hold time before an online transition is reported.
pub const DEFAULT_ONLINE_DEBOUNCE_MS: u64 = 1500;

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transition {
    WentOnline,
    WentOffline,
}

#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    online: bool,
    debounce: u64,
    /// When reachability was first seen again while offline
    reachable_since: Option<Timestamp>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_ONLINE_DEBOUNCE_MS)
    }
}

impl NetworkMonitor {
    /// A monitor that starts offline.
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            online: false,
            debounce: debounce_ms,
            reachable_since: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Feed one reachability observation.
    pub fn observe(&mut self, reachable: bool, now: Timestamp) -> Option<Transition> {
        if !reachable {
            self.reachable_since = None;
            if self.online {
                self.online = false;
                return Some(Transition::WentOffline);
            }
            return None;
        }

        if self.online {
            return None;
        }
        self.reachable_since.get_or_insert(now);
        self.poll(now)
    }

    /// Report the online transition once the debounce window has elapsed.
    pub fn poll(&mut self, now: Timestamp) -> Option<Transition> {
        match self.reachable_since {
            Some(since) if !self.online && now.saturating_sub(since) >= self.debounce => {
                self.online = true;
                self.reachable_since = None;
                Some(Transition::WentOnline)
            }
            _ => None,
        }
    }

    /// When a pending online transition will be reported.
    pub fn online_due_at(&self) -> Option<Timestamp> {
        self.reachable_since.map(|since| since + self.debounce)
    }
}
