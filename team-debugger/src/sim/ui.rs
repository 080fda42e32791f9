// Recording user interface
//
// Remembers every notification and question and answers questions from a
// scripted queue.

use crate::types::NotificationSeverity;
use crate::user_interface::UserInterface;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Default)]
pub struct RecordingUserInterface {
    answers: Mutex<VecDeque<Option<usize>>>,
    notifications: Mutex<Vec<(String, String)>>,
    statuses: Mutex<Vec<String>>,
    questions: Mutex<Vec<String>>,
}

impl RecordingUserInterface {
    /// Leaves every question unanswered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers questions in order; once the script runs out, questions go
    /// unanswered.
    pub fn with_answers(answers: Vec<Option<usize>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            ..Self::default()
        }
    }

    /// (title, message) pairs
    pub fn notifications(&self) -> Vec<(String, String)> {
        self.notifications.lock().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().clone()
    }

    /// Titles of the questions asked so far
    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().clone()
    }
}

#[async_trait]
impl UserInterface for RecordingUserInterface {
    fn notify_user(&self, title: &str, message: &str, severity: NotificationSeverity) {
        debug!("{:?} notification: {}: {}", severity, title, message);
        self.notifications
            .lock()
            .push((title.to_string(), message.to_string()));
    }

    fn notify_background_work_status(&self, message: &str) {
        self.statuses.lock().push(message.to_string());
    }

    async fn ask_user(&self, title: &str, message: &str, choices: &[String]) -> Option<usize> {
        self.questions.lock().push(title.to_string());
        let answer = self.answers.lock().pop_front().flatten();
        debug!("Asked '{}' ({}), choices {:?}: {:?}", title, message, choices, answer);
        answer.filter(|index| *index < choices.len())
    }
}
