// Breakpoint manager
//
// Maps user breakpoints and temporary client breakpoints onto physical
// breakpoints and keeps the target's installations in line with them.
//
// Installation changes are serialized by the install lock. The team lock is
// only held for bookkeeping and never across target I/O.

use crate::breakpoint::{BreakpointClientId, UserBreakpoint};
use crate::error::DebuggerResult;
use crate::interface::DebuggerInterface;
use crate::team::{Team, TeamInner};
use crate::types::{ImageId, TargetAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

enum InstallStep {
    Install,
    Uninstall,
    Done,
}

pub struct BreakpointManager {
    team: Arc<Team>,
    interface: Arc<dyn DebuggerInterface>,
    install_lock: Mutex<()>,
}

impl BreakpointManager {
    pub fn new(team: Arc<Team>, interface: Arc<dyn DebuggerInterface>) -> Self {
        Self {
            team,
            interface,
            install_lock: Mutex::new(()),
        }
    }

    /// Adds `user_breakpoint` to the team, or updates its enabled state if it
    /// is already there. Installation failures are reported but the user
    /// breakpoint keeps the requested state.
    pub async fn install_user_breakpoint(
        &self,
        user_breakpoint: &Arc<UserBreakpoint>,
        enabled: bool,
    ) -> DebuggerResult<()> {
        let _guard = self.install_lock.lock().await;

        let addresses = if user_breakpoint.is_valid() {
            if user_breakpoint.is_enabled() == enabled {
                return Ok(());
            }
            user_breakpoint.set_enabled(enabled);
            self.team.with(|t| {
                let addresses: Vec<_> = user_breakpoint.instances().iter().map(|i| i.address()).collect();
                for address in &addresses {
                    t.notify_breakpoint_changed(*address);
                }
                t.notify_user_breakpoint_changed(user_breakpoint);
                addresses
            })
        } else {
            user_breakpoint.set_enabled(enabled);
            self.team.with(|t| {
                t.add_user_breakpoint(user_breakpoint.clone());
                user_breakpoint.set_valid(true);
                let addresses = instantiate(t, user_breakpoint, None);
                t.notify_user_breakpoint_changed(user_breakpoint);
                addresses
            })
        };

        debug!(
            "User breakpoint {} {} at {} address(es)",
            user_breakpoint.id(),
            if enabled { "enabled" } else { "disabled" },
            addresses.len()
        );
        self.update_installations(&addresses).await
    }

    pub async fn uninstall_user_breakpoint(&self, user_breakpoint: &Arc<UserBreakpoint>) -> DebuggerResult<()> {
        let _guard = self.install_lock.lock().await;
        if !user_breakpoint.is_valid() {
            return Ok(());
        }

        let addresses = self.team.with(|t| {
            t.remove_user_breakpoint(user_breakpoint);
            user_breakpoint.set_valid(false);
            let mut addresses = Vec::new();
            for instance in user_breakpoint.take_instances() {
                let address = instance.address();
                if let Some(breakpoint) = t.breakpoint_at_mut(address) {
                    breakpoint.remove_user_breakpoint(&instance);
                }
                t.notify_breakpoint_changed(address);
                addresses.push(address);
            }
            t.notify_user_breakpoint_changed(user_breakpoint);
            addresses
        });

        self.update_installations(&addresses).await
    }

    /// Traps `address` on behalf of an internal client. On failure the
    /// client is not registered.
    pub async fn install_temporary_breakpoint(
        &self,
        address: TargetAddr,
        client: BreakpointClientId,
    ) -> DebuggerResult<()> {
        let _guard = self.install_lock.lock().await;
        self.team.with(|t| {
            t.ensure_breakpoint(address).add_client(client);
            t.notify_breakpoint_changed(address);
        });

        if let Err(e) = self.update_installation(address).await {
            self.team.with(|t| {
                if let Some(breakpoint) = t.breakpoint_at_mut(address) {
                    breakpoint.remove_client(client);
                }
            });
            if let Err(cleanup) = self.update_installation(address).await {
                debug!("Cleanup of breakpoint {:#x} failed: {}", address, cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn uninstall_temporary_breakpoint(
        &self,
        address: TargetAddr,
        client: BreakpointClientId,
    ) -> DebuggerResult<()> {
        let _guard = self.install_lock.lock().await;
        let removed = self.team.with(|t| {
            t.breakpoint_at_mut(address)
                .map(|breakpoint| breakpoint.remove_client(client))
                .unwrap_or(false)
        });
        if !removed {
            return Ok(());
        }
        self.update_installation(address).await
    }

    /// Instantiates the team's user breakpoints in a freshly loaded image.
    pub async fn update_image_breakpoints(&self, image_id: ImageId) -> DebuggerResult<()> {
        let _guard = self.install_lock.lock().await;
        let addresses = self.team.with(|t| {
            let user_breakpoints: Vec<_> = t.user_breakpoints().to_vec();
            let mut addresses = Vec::new();
            for user_breakpoint in user_breakpoints.iter().filter(|ub| ub.is_valid()) {
                let added = instantiate(t, user_breakpoint, Some(image_id));
                if !added.is_empty() {
                    t.notify_user_breakpoint_changed(user_breakpoint);
                }
                addresses.extend(added);
            }
            addresses
        });
        self.update_installations(&addresses).await
    }

    /// Detaches every owner from the breakpoints inside the image and
    /// uninstalls them.
    pub async fn remove_image_breakpoints(&self, image_id: ImageId) -> DebuggerResult<()> {
        let _guard = self.install_lock.lock().await;
        let addresses = self.team.with(|t| {
            let addresses: Vec<_> = t
                .breakpoints()
                .filter(|b| b.image_id() == Some(image_id))
                .map(|b| b.address())
                .collect();
            for address in &addresses {
                let Some(breakpoint) = t.breakpoint_at_mut(*address) else {
                    continue;
                };
                for instance in breakpoint.user_breakpoints().to_vec() {
                    if let Some(user_breakpoint) = instance.user_breakpoint() {
                        user_breakpoint.remove_instance(*address);
                    }
                    breakpoint.remove_user_breakpoint(&instance);
                }
                for client in breakpoint.clients().to_vec() {
                    breakpoint.remove_client(client);
                }
                t.notify_breakpoint_changed(*address);
            }
            addresses
        });
        self.update_installations(&addresses).await
    }

    async fn update_installations(&self, addresses: &[TargetAddr]) -> DebuggerResult<()> {
        let mut result = Ok(());
        for address in addresses {
            if let Err(e) = self.update_installation(*address).await {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Brings the physical state at `address` in line with its owners.
    /// Must be called with the install lock held.
    async fn update_installation(&self, address: TargetAddr) -> DebuggerResult<()> {
        loop {
            let step = self.team.with(|t| {
                let Some((should, installed, unused)) = t
                    .breakpoint_at(address)
                    .map(|b| (b.should_be_installed(), b.is_installed(), b.is_unused()))
                else {
                    return InstallStep::Done;
                };
                match (should, installed) {
                    (true, false) => InstallStep::Install,
                    (false, true) => InstallStep::Uninstall,
                    _ => {
                        if unused {
                            t.remove_breakpoint(address);
                        }
                        InstallStep::Done
                    }
                }
            });

            match step {
                InstallStep::Done => return Ok(()),
                InstallStep::Install => {
                    if let Err(e) = self.interface.install_breakpoint(address).await {
                        warn!("Failed to install breakpoint at {:#x}: {}", address, e);
                        return Err(e);
                    }
                    debug!("Installed breakpoint at {:#x}", address);
                    self.set_installed(address, true);
                }
                InstallStep::Uninstall => {
                    let result = self.interface.uninstall_breakpoint(address).await;
                    self.set_installed(address, false);
                    if let Err(e) = result {
                        warn!("Failed to uninstall breakpoint at {:#x}: {}", address, e);
                        self.team.with(|t| {
                            if t.breakpoint_at(address).is_some_and(|b| b.is_unused()) {
                                t.remove_breakpoint(address);
                            }
                        });
                        return Err(e);
                    }
                    debug!("Uninstalled breakpoint at {:#x}", address);
                }
            }
        }
    }

    fn set_installed(&self, address: TargetAddr, installed: bool) {
        self.team.with(|t| {
            if let Some(breakpoint) = t.breakpoint_at_mut(address) {
                breakpoint.set_installed(installed);
            }
            t.notify_breakpoint_changed(address);
        });
    }
}

/// Creates the missing instances of `user_breakpoint`, optionally only
/// within one image, and attaches them to their breakpoints.
fn instantiate(t: &mut TeamInner, user_breakpoint: &Arc<UserBreakpoint>, image_id: Option<ImageId>) -> Vec<TargetAddr> {
    let mut candidates = Vec::new();
    match user_breakpoint.location() {
        None => candidates.extend(user_breakpoint.address()),
        Some(location) => {
            for function in t.debug_info().function_instances(&location.function_id) {
                if let Some(address) = user_breakpoint
                    .address()
                    .filter(|a| function.address_range.contains(*a))
                {
                    candidates.push(address);
                    continue;
                }
                let address = match function.statement_at_source_location(location.source_location) {
                    Some(statement) => statement.covering_address_range().start,
                    None if location.relative_address < function.address_range.size => {
                        function.address() + location.relative_address
                    }
                    None => continue,
                };
                candidates.push(address);
            }
        }
    }

    let mut added = Vec::new();
    for address in candidates {
        if let Some(image_id) = image_id {
            if t.image_by_address(address).map(|i| i.id()) != Some(image_id) {
                continue;
            }
        }
        if user_breakpoint.instance_at(address).is_some() {
            continue;
        }
        let instance = user_breakpoint.add_instance(address);
        t.ensure_breakpoint(address).add_user_breakpoint(instance);
        t.notify_breakpoint_changed(address);
        added.push(address);
    }
    added
}
