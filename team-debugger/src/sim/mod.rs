// Simulated debuggee
//
// A tiny byte-code machine that implements the target interfaces in-process,
// so the engine can be driven end to end without an OS debug API.

mod arch;
mod isa;
mod language;
mod program;
mod target;
mod ui;

pub use arch::SimArchitecture;
pub use isa::{Instruction, SYS_RAISE, SYS_SET_SIGNAL_HANDLER, SYS_WRITE};
pub use language::SimLanguage;
pub use program::{Program, ProgramBuilder};
pub use target::{SimDebugInfoProvider, SimulatedTarget, SIM_TEAM_ID};
pub use ui::RecordingUserInterface;

use crate::settings::SettingsManager;
use crate::team_debugger::TeamDebuggerSetup;
use crate::user_interface::{NoOpTeamDebuggerListener, UserInterface};
use std::sync::Arc;

/// Wires a launched simulated team into a controller setup.
pub fn debugger_setup(
    target: &Arc<SimulatedTarget>,
    user_interface: Arc<dyn UserInterface>,
    settings: Arc<dyn SettingsManager>,
) -> TeamDebuggerSetup {
    TeamDebuggerSetup {
        interface: target.clone(),
        memory: target.clone(),
        debug_info_provider: Arc::new(SimDebugInfoProvider::new(target.clone())),
        user_interface,
        settings,
        listener: Arc::new(NoOpTeamDebuggerListener),
        launched: true,
    }
}
