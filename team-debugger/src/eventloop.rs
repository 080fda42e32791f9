// Debug event loop
//
// Blocks on the target's debug port and forwards every event to the
// controller's message queue

use crate::interface::DebuggerInterface;
use crate::team_debugger::ControllerMessage;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Handle to the listener task
#[derive(Debug)]
pub struct EventLoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EventLoopHandle {
    pub fn shut_down(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start the listener task
pub fn spawn_event_loop(
    interface: Arc<dyn DebuggerInterface>,
    controller_tx: mpsc::UnboundedSender<ControllerMessage>,
) -> EventLoopHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(event_loop_task(interface, controller_tx, shutdown_rx));
    EventLoopHandle { shutdown, task }
}

async fn event_loop_task(
    interface: Arc<dyn DebuggerInterface>,
    controller_tx: mpsc::UnboundedSender<ControllerMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Debug event listener started for team {}", interface.team_id());

    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|s| *s) => break,

            result = interface.next_debug_event() => {
                match result {
                    Ok(event) => {
                        debug!("Debug event: {} (thread {})", event.name(), event.thread);
                        if controller_tx.send(ControllerMessage::DebugEvent(event)).is_err() {
                            debug!("Controller gone, dropping debug events");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to read debug event: {}", e);
                        let _ = controller_tx.send(ControllerMessage::DebugPortClosed(e.to_string()));
                        break;
                    }
                }
            }
        }
    }

    info!("Debug event listener shutting down");
}
