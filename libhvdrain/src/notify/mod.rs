use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::log::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Somewhere to tell operators what a run is doing: console, chat, mail.
#[async_trait]
pub trait Notifier: std::fmt::Debug + Send + Sync {
    async fn notify(&self, message: &str, severity: Severity, channel: Option<&str>) -> Result<()>;
}

/// Deliver a notification, logging instead of failing when the sink errors.
/// Notification trouble never stops a run.
pub async fn notify_quietly(notifier: &dyn Notifier, message: &str, severity: Severity) {
    if let Err(err) = notifier.notify(message, severity, None).await {
        warn!("notification failed ({}): {:#}", severity, err);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, message: &str, severity: Severity, _channel: Option<&str>) -> Result<()> {
        match severity {
            Severity::Info => info!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Critical => error!("{}", message),
        }
        println!("[{}] {}", severity, message);
        Ok(())
    }
}

/// Fans a notification out to every configured sink. Each sink is tried even
/// when an earlier one fails; the first failure is reported.
#[derive(Debug, Clone, Default)]
pub struct Notifiers {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Notifier for Notifiers {
    async fn notify(&self, message: &str, severity: Severity, channel: Option<&str>) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(err) = sink.notify(message, severity, channel).await {
                debug!("notifier {:?} failed: {}", sink, err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
