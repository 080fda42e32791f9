// Front-end hooks
//
// What the engine needs from whoever presents it: notifications, a status
// line, and occasionally a question.

use crate::types::NotificationSeverity;
use async_trait::async_trait;
use tracing::{error, info, warn};

#[async_trait]
pub trait UserInterface: Send + Sync {
    fn notify_user(&self, title: &str, message: &str, severity: NotificationSeverity);

    fn notify_background_work_status(&self, message: &str);

    /// Returns the index of the chosen entry, `None` if dismissed.
    async fn ask_user(&self, title: &str, message: &str, choices: &[String]) -> Option<usize>;
}

/// Controller lifecycle callbacks.
pub trait TeamDebuggerListener: Send + Sync {
    fn team_debugger_started(&self) {}
    fn team_debugger_restart_requested(&self) {}
    fn team_debugger_quit(&self) {}
}

/// Writes everything to the log and never answers questions.
#[derive(Debug, Default)]
pub struct LoggingUserInterface;

#[async_trait]
impl UserInterface for LoggingUserInterface {
    fn notify_user(&self, title: &str, message: &str, severity: NotificationSeverity) {
        match severity {
            NotificationSeverity::Info => info!("{}: {}", title, message),
            NotificationSeverity::Warning => warn!("{}: {}", title, message),
            NotificationSeverity::Error => error!("{}: {}", title, message),
        }
    }

    fn notify_background_work_status(&self, message: &str) {
        info!("Status: {}", message);
    }

    async fn ask_user(&self, title: &str, message: &str, _choices: &[String]) -> Option<usize> {
        info!("Question not answered: {}: {}", title, message);
        None
    }
}

#[derive(Debug, Default)]
pub struct NoOpTeamDebuggerListener;

impl TeamDebuggerListener for NoOpTeamDebuggerListener {}
