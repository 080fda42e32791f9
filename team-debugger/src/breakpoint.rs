// Breakpoints
//
// A Breakpoint is the physical side, keyed by address. It collects the user
// breakpoint instances and internal clients that want the address trapped,
// so there is one installation per address no matter how many owners.

use crate::debug_info::{FunctionId, SourceLocation};
use crate::types::{ImageId, TargetAddr};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Opaque owner of a temporary breakpoint (e.g. a stepping thread).
pub type BreakpointClientId = u64;

static NEXT_USER_BREAKPOINT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBreakpointLocation {
    pub function_id: FunctionId,
    pub source_file: Option<String>,
    pub source_location: SourceLocation,
    /// Offset from the function start, used when line info is missing
    pub relative_address: TargetAddr,
}

/// A logical, user visible breakpoint. Either bound to a function location,
/// and then instantiated once per function instance, or to a raw address.
#[derive(Debug)]
pub struct UserBreakpoint {
    id: u64,
    location: Option<UserBreakpointLocation>,
    address: Option<TargetAddr>,
    enabled: AtomicBool,
    valid: AtomicBool,
    hidden: AtomicBool,
    condition: Mutex<Option<String>>,
    instances: Mutex<Vec<Arc<UserBreakpointInstance>>>,
}

impl UserBreakpoint {
    pub fn new(location: UserBreakpointLocation) -> Arc<Self> {
        Arc::new(Self::with_parts(Some(location), None))
    }

    /// A location breakpoint set at a specific address. The function
    /// instance containing `address` is trapped there, other instances at
    /// the location's statement.
    pub fn new_at(location: UserBreakpointLocation, address: TargetAddr) -> Arc<Self> {
        Arc::new(Self::with_parts(Some(location), Some(address)))
    }

    pub fn at_address(address: TargetAddr) -> Arc<Self> {
        Arc::new(Self::with_parts(None, Some(address)))
    }

    fn with_parts(location: Option<UserBreakpointLocation>, address: Option<TargetAddr>) -> Self {
        Self {
            id: NEXT_USER_BREAKPOINT_ID.fetch_add(1, Ordering::SeqCst),
            location,
            address,
            enabled: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            hidden: AtomicBool::new(false),
            condition: Mutex::new(None),
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn location(&self) -> Option<&UserBreakpointLocation> {
        self.location.as_ref()
    }

    /// Raw address for breakpoints set without function info.
    pub fn address(&self) -> Option<TargetAddr> {
        self.address
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Valid while registered with the team.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::SeqCst);
    }

    pub fn condition(&self) -> Option<String> {
        self.condition.lock().clone()
    }

    pub fn has_condition(&self) -> bool {
        self.condition.lock().is_some()
    }

    pub fn set_condition(&self, condition: Option<String>) {
        *self.condition.lock() = condition.filter(|c| !c.trim().is_empty());
    }

    pub fn instances(&self) -> Vec<Arc<UserBreakpointInstance>> {
        self.instances.lock().clone()
    }

    pub fn instance_at(&self, address: TargetAddr) -> Option<Arc<UserBreakpointInstance>> {
        self.instances
            .lock()
            .iter()
            .find(|i| i.address == address)
            .cloned()
    }

    pub(crate) fn add_instance(self: &Arc<Self>, address: TargetAddr) -> Arc<UserBreakpointInstance> {
        let instance = Arc::new(UserBreakpointInstance {
            user_breakpoint: Arc::downgrade(self),
            address,
        });
        self.instances.lock().push(instance.clone());
        instance
    }

    pub(crate) fn remove_instance(&self, address: TargetAddr) -> Option<Arc<UserBreakpointInstance>> {
        let mut instances = self.instances.lock();
        let index = instances.iter().position(|i| i.address == address)?;
        Some(instances.remove(index))
    }

    pub(crate) fn take_instances(&self) -> Vec<Arc<UserBreakpointInstance>> {
        std::mem::take(&mut *self.instances.lock())
    }
}

/// One physical address of a user breakpoint.
#[derive(Debug)]
pub struct UserBreakpointInstance {
    user_breakpoint: Weak<UserBreakpoint>,
    address: TargetAddr,
}

impl UserBreakpointInstance {
    pub fn user_breakpoint(&self) -> Option<Arc<UserBreakpoint>> {
        self.user_breakpoint.upgrade()
    }

    pub fn address(&self) -> TargetAddr {
        self.address
    }

    pub fn is_enabled(&self) -> bool {
        self.user_breakpoint
            .upgrade()
            .map(|ub| ub.is_enabled())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    address: TargetAddr,
    image_id: Option<ImageId>,
    user_instances: Vec<Arc<UserBreakpointInstance>>,
    clients: Vec<BreakpointClientId>,
    installed: bool,
}

impl Breakpoint {
    pub fn new(address: TargetAddr, image_id: Option<ImageId>) -> Self {
        Self {
            address,
            image_id,
            user_instances: Vec::new(),
            clients: Vec::new(),
            installed: false,
        }
    }

    pub fn address(&self) -> TargetAddr {
        self.address
    }

    pub fn image_id(&self) -> Option<ImageId> {
        self.image_id
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub(crate) fn set_installed(&mut self, installed: bool) {
        self.installed = installed;
    }

    pub fn should_be_installed(&self) -> bool {
        self.has_enabled_user_breakpoint() || !self.clients.is_empty()
    }

    pub fn has_enabled_user_breakpoint(&self) -> bool {
        self.user_instances.iter().any(|i| i.is_enabled())
    }

    /// Unused breakpoints must be uninstalled and dropped from the team.
    pub fn is_unused(&self) -> bool {
        self.user_instances.is_empty() && self.clients.is_empty()
    }

    pub fn user_breakpoints(&self) -> &[Arc<UserBreakpointInstance>] {
        &self.user_instances
    }

    pub fn enabled_user_breakpoints(&self) -> impl Iterator<Item = Arc<UserBreakpoint>> + '_ {
        self.user_instances
            .iter()
            .filter_map(|i| i.user_breakpoint())
            .filter(|ub| ub.is_enabled())
    }

    pub fn add_user_breakpoint(&mut self, instance: Arc<UserBreakpointInstance>) {
        if !self.user_instances.iter().any(|i| Arc::ptr_eq(i, &instance)) {
            self.user_instances.push(instance);
        }
    }

    pub fn remove_user_breakpoint(&mut self, instance: &Arc<UserBreakpointInstance>) -> bool {
        let before = self.user_instances.len();
        self.user_instances.retain(|i| !Arc::ptr_eq(i, instance));
        before != self.user_instances.len()
    }

    pub fn clients(&self) -> &[BreakpointClientId] {
        &self.clients
    }

    pub fn add_client(&mut self, client: BreakpointClientId) {
        if !self.clients.contains(&client) {
            self.clients.push(client);
        }
    }

    pub fn remove_client(&mut self, client: BreakpointClientId) -> bool {
        let before = self.clients.len();
        self.clients.retain(|c| *c != client);
        before != self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_user_breakpoint_not_installed() {
        let user_breakpoint = UserBreakpoint::at_address(0x1000);
        user_breakpoint.set_enabled(false);
        let instance = user_breakpoint.add_instance(0x1000);

        let mut breakpoint = Breakpoint::new(0x1000, Some(1));
        breakpoint.add_user_breakpoint(instance);

        assert!(!breakpoint.has_enabled_user_breakpoint());
        assert!(!breakpoint.should_be_installed());
        assert!(!breakpoint.is_unused());

        user_breakpoint.set_enabled(true);
        assert!(breakpoint.has_enabled_user_breakpoint());
        assert!(breakpoint.should_be_installed());
    }

    #[test]
    fn test_clients_keep_breakpoint_alive() {
        let mut breakpoint = Breakpoint::new(0x2000, None);
        assert!(breakpoint.is_unused());

        breakpoint.add_client(1);
        breakpoint.add_client(1);
        breakpoint.add_client(2);
        assert_eq!(breakpoint.clients().len(), 2);
        assert!(breakpoint.should_be_installed());

        assert!(breakpoint.remove_client(1));
        assert!(!breakpoint.remove_client(1));
        assert!(breakpoint.should_be_installed());
        assert!(breakpoint.remove_client(2));
        assert!(breakpoint.is_unused());
    }

    #[test]
    fn test_dropped_user_breakpoint_counts_as_disabled() {
        let user_breakpoint = UserBreakpoint::at_address(0x3000);
        user_breakpoint.set_enabled(true);
        let instance = user_breakpoint.add_instance(0x3000);
        drop(user_breakpoint);

        assert!(instance.user_breakpoint().is_none());
        assert!(!instance.is_enabled());
    }

    #[test]
    fn test_blank_condition_is_cleared() {
        let user_breakpoint = UserBreakpoint::at_address(0x3000);
        user_breakpoint.set_condition(Some("r0 == 1".to_string()));
        assert!(user_breakpoint.has_condition());
        user_breakpoint.set_condition(Some("  ".to_string()));
        assert!(!user_breakpoint.has_condition());
    }
}
