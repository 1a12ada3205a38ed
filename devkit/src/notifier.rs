/*!
Recording notifier, for assertions on what the operator would have seen
*/

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use twinsync_agent::notify::{Notifier, Severity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub subject: String,
    pub message: String,
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn with_severity(&self, severity: Severity) -> Vec<Notification> {
        self.sent().into_iter().filter(|n| n.severity == severity).collect()
    }

    /// Notifications whose subject contains `subject`
    pub fn find(&self, subject: &str) -> Vec<Notification> {
        self.sent().into_iter().filter(|n| n.subject.contains(subject)).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, severity: Severity, subject: &str, message: &str) {
        log::info!("[NOTIFY:{}] {}: {}", severity.as_str(), subject, message);
        self.sent.lock().unwrap().push(Notification {
            severity,
            subject: subject.to_string(),
            message: message.to_string(),
        });
    }
}
