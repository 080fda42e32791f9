// Watchpoint manager
//
// Same discipline as breakpoints: bookkeeping under the team lock, target
// I/O serialized under the install lock.

use crate::error::{DebuggerError, DebuggerResult};
use crate::interface::DebuggerInterface;
use crate::team::Team;
use crate::types::{TargetAddr, WatchpointType};
use crate::watchpoint::Watchpoint;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct WatchpointManager {
    team: Arc<Team>,
    interface: Arc<dyn DebuggerInterface>,
    install_lock: Mutex<()>,
}

impl WatchpointManager {
    pub fn new(team: Arc<Team>, interface: Arc<dyn DebuggerInterface>) -> Self {
        Self {
            team,
            interface,
            install_lock: Mutex::new(()),
        }
    }

    /// Adds or updates the watchpoint at `address`. A different type or
    /// length replaces the existing one.
    pub async fn install_watchpoint(
        &self,
        address: TargetAddr,
        watch_type: WatchpointType,
        length: usize,
        enabled: bool,
    ) -> DebuggerResult<()> {
        if length == 0 {
            return Err(DebuggerError::InvalidState("zero-length watchpoint".to_string()));
        }
        let _guard = self.install_lock.lock().await;

        let replaced = self.team.with(|t| match t.watchpoint_at(address).map(|w| (w.watch_type(), w.length())) {
            Some(existing) if existing == (watch_type, length) => {
                if let Some(w) = t.watchpoint_at_mut(address) {
                    w.set_enabled(enabled);
                }
                t.notify_watchpoint_changed(address);
                false
            }
            Some(_) => true,
            None => {
                let mut watchpoint = Watchpoint::new(address, watch_type, length);
                watchpoint.set_enabled(enabled);
                t.add_watchpoint(watchpoint);
                false
            }
        });

        if replaced {
            self.uninstall_locked(address).await?;
            self.team.with(|t| {
                let mut watchpoint = Watchpoint::new(address, watch_type, length);
                watchpoint.set_enabled(enabled);
                t.add_watchpoint(watchpoint);
            });
        }
        self.update_installation(address).await
    }

    pub async fn uninstall_watchpoint(&self, address: TargetAddr) -> DebuggerResult<()> {
        let _guard = self.install_lock.lock().await;
        self.uninstall_locked(address).await
    }

    async fn uninstall_locked(&self, address: TargetAddr) -> DebuggerResult<()> {
        let installed = self.team.with(|t| {
            let Some(watchpoint) = t.watchpoint_at_mut(address) else {
                return None;
            };
            watchpoint.set_enabled(false);
            Some(watchpoint.is_installed())
        });
        let result = match installed {
            None => return Ok(()),
            Some(true) => self.interface.uninstall_watchpoint(address).await,
            Some(false) => Ok(()),
        };
        match &result {
            Ok(()) => {
                self.team.with(|t| t.remove_watchpoint(address));
            }
            Err(e) => {
                // Still armed on the target; keep it so a retry can clear it.
                warn!("Failed to uninstall watchpoint at {:#x}: {}", address, e);
                self.team.with(|t| t.notify_watchpoint_changed(address));
            }
        }
        result
    }

    async fn update_installation(&self, address: TargetAddr) -> DebuggerResult<()> {
        let Some((should, installed, watch_type, length)) = self.team.read(|t| {
            t.watchpoint_at(address)
                .map(|w| (w.should_be_installed(), w.is_installed(), w.watch_type(), w.length()))
        }) else {
            return Ok(());
        };

        let result = if should && !installed {
            self.interface
                .install_watchpoint(address, watch_type, length)
                .await
                .map(|()| true)
        } else if !should && installed {
            self.interface.uninstall_watchpoint(address).await.map(|()| false)
        } else {
            return Ok(());
        };

        match result {
            Ok(now_installed) => {
                debug!(
                    "Watchpoint at {:#x} {}",
                    address,
                    if now_installed { "installed" } else { "uninstalled" }
                );
                self.team.with(|t| {
                    if let Some(w) = t.watchpoint_at_mut(address) {
                        w.set_installed(now_installed);
                    }
                    t.notify_watchpoint_changed(address);
                });
                Ok(())
            }
            Err(e) => {
                warn!("Failed to update watchpoint at {:#x}: {}", address, e);
                if !should {
                    self.team.with(|t| {
                        if let Some(w) = t.watchpoint_at_mut(address) {
                            w.set_installed(false);
                        }
                    });
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ProgramBuilder, SimulatedTarget};

    fn setup() -> (Arc<Team>, Arc<SimulatedTarget>, WatchpointManager) {
        let mut builder = ProgramBuilder::new("wp", 0x1000);
        builder.function("main").line(1).ret();
        let target = SimulatedTarget::launch(builder.build().unwrap());
        let team = Arc::new(Team::new(1, "wp"));
        let manager = WatchpointManager::new(team.clone(), target.clone());
        (team, target, manager)
    }

    #[tokio::test]
    async fn test_install_toggle_and_remove() {
        let (team, target, manager) = setup();
        manager
            .install_watchpoint(0x2000, WatchpointType::Write, 4, true)
            .await
            .unwrap();
        assert!(team.read(|t| t.watchpoint_at(0x2000).unwrap().is_installed()));
        assert!(target.watchpoint_installed(0x2000));

        manager
            .install_watchpoint(0x2000, WatchpointType::Write, 4, false)
            .await
            .unwrap();
        assert!(!team.read(|t| t.watchpoint_at(0x2000).unwrap().is_installed()));
        assert!(!target.watchpoint_installed(0x2000));

        manager
            .install_watchpoint(0x2000, WatchpointType::ReadWrite, 8, true)
            .await
            .unwrap();
        let watch_type = team.read(|t| t.watchpoint_at(0x2000).unwrap().watch_type());
        assert_eq!(watch_type, WatchpointType::ReadWrite);

        manager.uninstall_watchpoint(0x2000).await.unwrap();
        assert!(team.read(|t| t.watchpoint_at(0x2000).is_none()));
        assert!(!target.watchpoint_installed(0x2000));
    }

    #[tokio::test]
    async fn test_failed_uninstall_keeps_watchpoint() {
        let (team, target, manager) = setup();
        manager
            .install_watchpoint(0x2000, WatchpointType::Write, 8, true)
            .await
            .unwrap();

        target.fail_watchpoint_uninstall(0x2000, true);
        assert!(manager.uninstall_watchpoint(0x2000).await.is_err());
        let (enabled, installed) = team.read(|t| {
            let w = t.watchpoint_at(0x2000).unwrap();
            (w.is_enabled(), w.is_installed())
        });
        assert!(!enabled);
        assert!(installed);
        assert!(target.watchpoint_installed(0x2000));

        target.fail_watchpoint_uninstall(0x2000, false);
        manager.uninstall_watchpoint(0x2000).await.unwrap();
        assert!(team.read(|t| t.watchpoint_at(0x2000).is_none()));
        assert!(!target.watchpoint_installed(0x2000));
    }
}
