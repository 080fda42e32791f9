// Debugger configuration
//
// Tunables for the engine. Loaded from JSON, every field optional.

use crate::error::DebuggerResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Size of the job worker pool
    pub max_concurrent_jobs: usize,
    pub max_stack_frames: usize,
    /// Stop a freshly launched or exec'ed team at `main`
    pub stop_in_main: bool,
    pub kill_team_on_quit: bool,
    /// Upper bound for debugger-call messages and console output reads
    pub max_debug_string_length: usize,
    /// A breakpoint condition that takes longer than this stops the thread
    pub condition_timeout_ms: u64,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            max_stack_frames: 64,
            stop_in_main: true,
            kill_team_on_quit: false,
            max_debug_string_length: 1024,
            condition_timeout_ms: 5000,
        }
    }
}

impl DebuggerConfig {
    pub fn load(path: impl AsRef<Path>) -> DebuggerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> DebuggerResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn condition_timeout(&self) -> Duration {
        Duration::from_millis(self.condition_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = DebuggerConfig::from_json(r#"{"max_concurrent_jobs": 1, "stop_in_main": false}"#).unwrap();
        assert_eq!(config.max_concurrent_jobs, 1);
        assert!(!config.stop_in_main);
        assert_eq!(config.max_stack_frames, 64);
        assert_eq!(config.condition_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(DebuggerConfig::from_json("{not json").is_err());
    }
}
