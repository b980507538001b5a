//! Repository status: the state machine the UI layer observes.
//!
//! A status is either settled (`{"status": ...}`) or busy
//! (`{"busy": {"operation": ...}}`); the two arms stay distinguishable
//! by their discriminant field. Subscribers are notified only when the
//! status actually changed.

use std::sync::Mutex;

use crossbeam::channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SettledState {
    Ready,
    Ahead,
    Behind,
    Diverged,
    InvalidWorkingCopy,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusyOperation {
    Initializing,
    Creating,
    Cloning,
    Pulling,
    Pushing,
    Committing,
    CheckingLocalChanges,
}

/// Network transfer progress, in objects.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub loaded: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyState {
    pub operation: BusyOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<TransferProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_password: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_error: Option<String>,
}

impl BusyState {
    pub fn new(operation: BusyOperation) -> Self {
        BusyState {
            operation,
            progress: None,
            awaiting_password: None,
            network_error: None,
        }
    }
}

/// The repo status union. Serialized shape keeps the `status`/`busy`
/// discriminant stable for consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RepoStatus {
    Settled { status: SettledState },
    Busy { busy: BusyState },
}

impl RepoStatus {
    pub fn settled(state: SettledState) -> Self {
        RepoStatus::Settled { status: state }
    }

    pub fn busy(operation: BusyOperation) -> Self {
        RepoStatus::Busy {
            busy: BusyState::new(operation),
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, RepoStatus::Busy { .. })
    }

    /// Whether a blocking operation is waiting for credentials.
    pub fn is_awaiting_credentials(&self) -> bool {
        matches!(
            self,
            RepoStatus::Busy { busy } if busy.awaiting_password == Some(true)
        )
    }
}

/// Shared, observable status for one working copy.
///
/// Mutated only by the sync and changeset engines; observed by any number
/// of subscribers. The deep-equality gate suppresses redundant churn.
pub struct StatusCell {
    current: Mutex<RepoStatus>,
    subscribers: Mutex<Vec<Sender<RepoStatus>>>,
}

impl StatusCell {
    pub fn new(initial: RepoStatus) -> Self {
        StatusCell {
            current: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> RepoStatus {
        self.current.lock().expect("status lock poisoned").clone()
    }

    /// Replace the status. Subscribers are notified only on actual change;
    /// returns whether a notification went out.
    pub fn set(&self, status: RepoStatus) -> bool {
        {
            let mut current = self.current.lock().expect("status lock poisoned");
            if *current == status {
                return false;
            }
            *current = status.clone();
        }
        debug!(?status, "repo status changed");
        let mut subscribers = self.subscribers.lock().expect("status lock poisoned");
        subscribers.retain(|tx| tx.send(status.clone()).is_ok());
        true
    }

    /// Mutate the current busy state in place (progress, auth flags).
    /// No-op when the status is not busy.
    pub fn update_busy(&self, f: impl FnOnce(&mut BusyState)) -> bool {
        let mut status = self.get();
        if let RepoStatus::Busy { busy } = &mut status {
            f(busy);
            self.set(status)
        } else {
            false
        }
    }

    pub fn subscribe(&self) -> Receiver<RepoStatus> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .expect("status lock poisoned")
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_shape_keeps_discriminants() {
        let settled = RepoStatus::settled(SettledState::Ready);
        assert_eq!(
            serde_json::to_string(&settled).unwrap(),
            r#"{"status":"ready"}"#
        );

        let busy = RepoStatus::busy(BusyOperation::Cloning);
        assert_eq!(
            serde_json::to_string(&busy).unwrap(),
            r#"{"busy":{"operation":"cloning"}}"#
        );

        let back: RepoStatus =
            serde_json::from_str(r#"{"status":"invalid-working-copy"}"#).unwrap();
        assert_eq!(back, RepoStatus::settled(SettledState::InvalidWorkingCopy));
    }

    #[test]
    fn subscribers_notified_only_on_change() {
        let cell = StatusCell::new(RepoStatus::settled(SettledState::Ready));
        let rx = cell.subscribe();

        assert!(!cell.set(RepoStatus::settled(SettledState::Ready)));
        assert!(rx.try_recv().is_err());

        assert!(cell.set(RepoStatus::busy(BusyOperation::Pulling)));
        assert_eq!(rx.try_recv().unwrap(), RepoStatus::busy(BusyOperation::Pulling));
    }

    #[test]
    fn awaiting_credentials_detection() {
        let mut busy = BusyState::new(BusyOperation::Pulling);
        busy.awaiting_password = Some(true);
        let status = RepoStatus::Busy { busy };
        assert!(status.is_awaiting_credentials());
        assert!(!RepoStatus::settled(SettledState::Ready).is_awaiting_credentials());
    }

    #[test]
    fn update_busy_touches_only_busy_states() {
        let cell = StatusCell::new(RepoStatus::busy(BusyOperation::Pulling));
        assert!(cell.update_busy(|busy| {
            busy.progress = Some(TransferProgress {
                loaded: 1,
                total: 10,
            });
        }));

        let cell = StatusCell::new(RepoStatus::settled(SettledState::Ready));
        assert!(!cell.update_busy(|busy| busy.awaiting_password = Some(true)));
    }
}
