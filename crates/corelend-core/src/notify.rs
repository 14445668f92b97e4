//! Operator notifications.
//!
//! Components emit [`Notification`]s on mode transitions, recovery
//! attempts, and suppression. Delivery is pluggable through [`Notifier`];
//! the daemon uses [`LogNotifier`], which routes everything through
//! `tracing`.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A structured event for whoever is watching the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    pub severity: Severity,
    /// Deliver to every administrator, not just the ones subscribed.
    pub broadcast: bool,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Info,
            broadcast: false,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Warning,
            broadcast: false,
        }
    }

    /// Critical notifications always broadcast.
    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Critical,
            broadcast: true,
        }
    }
}

/// Sink for notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        let Notification {
            message,
            severity,
            broadcast,
        } = notification;
        match severity {
            Severity::Info => info!(broadcast, "{message}"),
            Severity::Warning => warn!(broadcast, "{message}"),
            Severity::Critical => error!(broadcast, "{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_broadcasts() {
        let n = Notification::critical("worker needs attention");
        assert!(n.broadcast);
        assert_eq!(n.severity, Severity::Critical);
        assert!(!Notification::info("ok").broadcast);
    }
}
