// Team debugger engine
//
// Controls a live debuggee team through a narrow target interface:
// - Background job worker with per-key deduplication
// - Debuggee model (team, threads, images, breakpoints) with change events
// - Breakpoint and watchpoint installation
// - Per-thread stepping and breakpoint conditions
// - Value and memory resolution jobs

pub mod architecture;
pub mod breakpoint;
pub mod breakpoint_manager;
pub mod config;
pub mod cpu_state;
pub mod debug_info;
pub mod error;
pub mod eventloop;
pub mod events;
pub mod image;
pub mod interface;
pub mod jobs;
pub mod language;
pub mod memory_block;
pub mod settings;
pub mod sim;
pub mod stack_trace;
pub mod team;
pub mod team_debugger;
pub mod thread;
pub mod thread_handler;
pub mod types;
pub mod user_interface;
pub mod value;
pub mod watchpoint;
pub mod watchpoint_manager;
pub mod worker;

pub use config::DebuggerConfig;
pub use error::{DebuggerError, DebuggerResult};
pub use interface::{DebuggerInterface, TeamMemory};
pub use team::Team;
pub use team_debugger::{QuitOption, TeamDebugger, TeamDebuggerSetup};
pub use types::{TargetAddr, ThreadAction, ThreadId};
pub use worker::{Job, JobKey, JobType, Worker};
