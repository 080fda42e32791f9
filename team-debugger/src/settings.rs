// Team settings
//
// Breakpoint descriptors and signal dispositions that survive a restart.
// Storage is up to the SettingsManager.

use crate::breakpoint::{UserBreakpoint, UserBreakpointLocation};
use crate::error::DebuggerResult;
use crate::types::{SignalDisposition, TargetAddr};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointSetting {
    pub location: Option<UserBreakpointLocation>,
    pub address: Option<TargetAddr>,
    pub enabled: bool,
    pub hidden: bool,
    pub condition: Option<String>,
}

impl BreakpointSetting {
    pub fn from_user_breakpoint(user_breakpoint: &UserBreakpoint) -> Self {
        Self {
            location: user_breakpoint.location().cloned(),
            address: user_breakpoint.address(),
            enabled: user_breakpoint.is_enabled(),
            hidden: user_breakpoint.is_hidden(),
            condition: user_breakpoint.condition(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamSettings {
    pub team_name: String,
    pub breakpoints: Vec<BreakpointSetting>,
    pub default_signal_disposition: SignalDisposition,
    pub signal_dispositions: BTreeMap<i32, SignalDisposition>,
}

pub trait SettingsManager: Send + Sync {
    fn load_team_settings(&self, team_name: &str) -> Option<TeamSettings>;

    fn save_team_settings(&self, settings: &TeamSettings) -> DebuggerResult<()>;
}

#[derive(Debug, Default)]
pub struct NoOpSettingsManager;

impl SettingsManager for NoOpSettingsManager {
    fn load_team_settings(&self, _team_name: &str) -> Option<TeamSettings> {
        None
    }

    fn save_team_settings(&self, _settings: &TeamSettings) -> DebuggerResult<()> {
        Ok(())
    }
}

/// Keeps settings as JSON documents in memory, keyed by team name.
#[derive(Debug, Default)]
pub struct MemorySettingsManager {
    documents: Mutex<HashMap<String, String>>,
}

impl MemorySettingsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, team_name: &str) -> Option<String> {
        self.documents.lock().get(team_name).cloned()
    }
}

impl SettingsManager for MemorySettingsManager {
    fn load_team_settings(&self, team_name: &str) -> Option<TeamSettings> {
        let documents = self.documents.lock();
        let text = documents.get(team_name)?;
        match serde_json::from_str(text) {
            Ok(settings) => Some(settings),
            Err(e) => {
                tracing::warn!("Discarding unreadable settings for {}: {}", team_name, e);
                None
            }
        }
    }

    fn save_team_settings(&self, settings: &TeamSettings) -> DebuggerResult<()> {
        let text = serde_json::to_string_pretty(settings)?;
        self.documents
            .lock()
            .insert(settings.team_name.clone(), text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_info::{FunctionId, SourceLocation};

    #[test]
    fn test_memory_settings_round_trip() {
        let manager = MemorySettingsManager::new();
        assert!(manager.load_team_settings("demo").is_none());

        let mut settings = TeamSettings {
            team_name: "demo".to_string(),
            ..Default::default()
        };
        settings.breakpoints.push(BreakpointSetting {
            location: Some(UserBreakpointLocation {
                function_id: FunctionId {
                    source_file: Some("demo.c".to_string()),
                    name: "main".to_string(),
                },
                source_file: Some("demo.c".to_string()),
                source_location: SourceLocation::new(3),
                relative_address: 6,
            }),
            address: None,
            enabled: true,
            hidden: false,
            condition: Some("r0 > 2".to_string()),
        });
        settings
            .signal_dispositions
            .insert(2, SignalDisposition::Ignore);

        manager.save_team_settings(&settings).unwrap();
        assert!(manager.document("demo").unwrap().contains("\"main\""));
        assert_eq!(manager.load_team_settings("demo"), Some(settings));
    }
}
