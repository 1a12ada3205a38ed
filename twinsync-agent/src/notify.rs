//! Severity-tagged notifications
//!
//! Side channel for the operator (e.g. the NAS web UI notifier). Delivery is
//! fire-and-forget: a failing notifier is logged and never affects the run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::execution::{CommandSpec, SharedExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Warning,
    Alert,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Alert => "alert",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, subject: &str, message: &str);
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Writes notifications to the log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, severity: Severity, subject: &str, message: &str) {
        match severity {
            Severity::Normal => info!("[notify] {}: {}", subject, message),
            Severity::Warning => warn!("[notify] {}: {}", subject, message),
            Severity::Alert => error!("[notify] {}: {}", subject, message),
        }
    }
}

/// Runs a configured command template, e.g.
/// `notify -i {severity} -s {subject} -d {message}`
pub struct CommandNotifier {
    executor: SharedExecutor,
    template: Vec<String>,
}

impl CommandNotifier {
    pub fn new(executor: SharedExecutor, template: &str) -> anyhow::Result<Self> {
        let template = shell_words::split(template)?;
        if template.is_empty() {
            anyhow::bail!("Empty notify command");
        }
        Ok(Self { executor, template })
    }

    /// Placeholders are substituted per word, after splitting, so values
    /// with spaces stay a single argument
    pub fn render(&self, severity: Severity, subject: &str, message: &str) -> CommandSpec {
        let words: Vec<String> = self
            .template
            .iter()
            .map(|w| {
                w.replace("{severity}", severity.as_str())
                    .replace("{subject}", subject)
                    .replace("{message}", message)
            })
            .collect();
        CommandSpec::new(words[0].clone(), words[1..].to_vec())
            .with_timeout(std::time::Duration::from_secs(30))
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, severity: Severity, subject: &str, message: &str) {
        LogNotifier.notify(severity, subject, message).await;

        let command = self.render(severity, subject, message);
        match self.executor.run(&command).await {
            Ok(result) if result.success => {}
            Ok(result) => warn!("Notifier command failed: {}", result.describe_failure()),
            Err(e) => warn!("Notifier command failed to run: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::SystemExecutor;

    #[test]
    fn test_render_keeps_values_as_single_arguments() {
        let notifier = CommandNotifier::new(
            Arc::new(SystemExecutor),
            "/usr/local/bin/notify -i {severity} -s 'twinsync: {subject}' -d {message}",
        )
        .unwrap();

        let command = notifier.render(Severity::Alert, "Sync failed", "pair 2 exit code 23");
        assert_eq!(command.program, "/usr/local/bin/notify");
        assert_eq!(
            command.args,
            vec!["-i", "alert", "-s", "twinsync: Sync failed", "-d", "pair 2 exit code 23"]
        );
    }

    #[test]
    fn test_empty_template_is_rejected() {
        assert!(CommandNotifier::new(Arc::new(SystemExecutor), "").is_err());
    }
}
