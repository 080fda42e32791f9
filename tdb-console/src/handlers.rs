// Console request handlers
//
// Handles initialize, list tools, and debug tool execution

use crate::demo::demo_program;
use crate::protocol::*;
use crate::session::{DebugSession, SessionManager, StopOutcome};
use crate::tools;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use team_debugger::types::{ThreadState, WatchpointType};
use team_debugger::worker::JobWaitStatus;
use team_debugger::{DebuggerConfig, Job, QuitOption, TargetAddr, ThreadAction, ThreadId};
use tracing::{debug, info, warn};

const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Accepts `4096` as well as `"0x1000"`.
fn parse_address(value: Option<&Value>) -> Option<TargetAddr> {
    let value = value?;
    if let Some(address) = value.as_u64() {
        return Some(address);
    }
    let text = value.as_str()?.trim();
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn timeout_arg(args: &Value) -> Duration {
    Duration::from_millis(
        args.get("timeout_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_MS),
    )
}

pub struct RequestHandler {
    session_manager: SessionManager,
    config: DebuggerConfig,
}

impl RequestHandler {
    pub fn new(config: DebuggerConfig) -> Self {
        Self {
            session_manager: SessionManager::new(),
            config,
        }
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params),
            "tools/list" => self.handle_list_tools(),
            "tools/call" => self.handle_call_tool(request.params).await,
            _ => Err(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {}", request.method),
                data: None,
            }),
        };

        match result {
            Ok(value) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: Some(value),
                error: None,
            },
            Err(error) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: None,
                error: Some(error),
            },
        }
    }

    pub async fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/initialized" => {
                info!("Client initialized");
            }
            "notifications/cancelled" => {
                debug!("Request cancelled");
            }
            _ => {
                warn!("Unknown notification: {}", notification.method);
            }
        }
    }

    /// Quits whatever session is still open.
    pub async fn shut_down(&self) {
        if let Some(session) = self.session_manager.get_current_session().await {
            let option = if self.config.kill_team_on_quit {
                QuitOption::KillTeam
            } else {
                QuitOption::ResumeTeam
            };
            self.session_manager.close_session(&session.id, option).await;
        }
    }

    fn handle_initialize(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let _params: InitializeParams = serde_json::from_value(params.unwrap_or(json!({})))
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid initialize params: {}", e)))?;

        let result = InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {},
            },
            server_info: ServerInfo {
                name: "tdb-console".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "Team debugger console. Start with debug.launch, \
                then use debug.set_breakpoint, debug.continue, debug.get_stack, etc."
                    .to_string(),
            ),
        };

        serde_json::to_value(result).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
    }

    fn handle_list_tools(&self) -> Result<Value, JsonRpcError> {
        let result = ListToolsResult {
            tools: tools::get_tools(),
        };

        serde_json::to_value(result).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
    }

    async fn handle_call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let call_params: CallToolParams = serde_json::from_value(params.unwrap_or(json!({})))
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid tool call params: {}", e)))?;
        let args = call_params.arguments;

        let result = match call_params.name.as_str() {
            "debug.launch" => self.handle_launch(args).await,
            "debug.set_breakpoint" => self.handle_set_breakpoint(args).await,
            "debug.list_breakpoints" => self.handle_list_breakpoints(args).await,
            "debug.clear_breakpoint" => self.handle_clear_breakpoint(args).await,
            "debug.continue" => self.handle_thread_action(args, ThreadAction::Run).await,
            "debug.step_over" => self.handle_thread_action(args, ThreadAction::StepOver).await,
            "debug.step_into" => self.handle_thread_action(args, ThreadAction::StepInto).await,
            "debug.step_out" => self.handle_thread_action(args, ThreadAction::StepOut).await,
            "debug.pause" => self.handle_pause(args).await,
            "debug.get_stack" => self.handle_get_stack(args).await,
            "debug.list_threads" => self.handle_list_threads(args).await,
            "debug.evaluate" => self.handle_evaluate(args).await,
            "debug.inspect" => self.handle_inspect(args).await,
            "debug.set_watchpoint" => self.handle_set_watchpoint(args).await,
            "debug.report" => self.handle_report(args).await,
            "debug.disconnect" => self.handle_disconnect(args).await,
            _ => Err(format!("Unknown tool: {}", call_params.name)),
        };

        let call_result = match result {
            Ok(text) => CallToolResult {
                content: vec![ContentBlock::Text { text }],
                is_error: None,
            },
            Err(text) => CallToolResult {
                content: vec![ContentBlock::Text { text }],
                is_error: Some(true),
            },
        };
        serde_json::to_value(call_result).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
    }

    async fn session(&self) -> Result<Arc<DebugSession>, String> {
        self.session_manager
            .get_current_session()
            .await
            .ok_or_else(|| "No active debug session. Use debug.launch first.".to_string())
    }

    fn thread_arg(session: &DebugSession, args: &Value) -> Result<ThreadId, String> {
        match args.get("thread_id").and_then(|v| v.as_i64()) {
            Some(id) => Ok(id as ThreadId),
            None => session
                .main_thread()
                .ok_or_else(|| "Team has no threads left".to_string()),
        }
    }

    fn describe_stop(session: &DebugSession, thread: ThreadId) -> String {
        let Some(snapshot) = session.debugger.team().thread_snapshot(thread) else {
            return format!("Thread {} is gone", thread);
        };
        let location = snapshot
            .cpu_state()
            .map(|cpu| session.describe_address(cpu.instruction_pointer))
            .unwrap_or_else(|| "unknown location".to_string());
        let mut output = format!(
            "Thread {} stopped ({:?}) at {}",
            thread,
            snapshot.stopped_reason(),
            location
        );
        if !snapshot.stopped_reason_info().is_empty() {
            output.push_str(&format!("\n   {}", snapshot.stopped_reason_info()));
        }
        output
    }

    async fn handle_launch(&self, args: Value) -> Result<String, String> {
        let mut config = self.config.clone();
        if let Some(stop_in_main) = args.get("stop_in_main").and_then(|v| v.as_bool()) {
            config.stop_in_main = stop_in_main;
        }
        let program = demo_program().map_err(|e| format!("Failed to build demo program: {}", e))?;
        let session = self
            .session_manager
            .create_session(program, config)
            .await
            .map_err(|e| format!("Failed to launch: {}", e))?;

        let mut output = format!(
            "Launched {} (session: {})",
            session.debugger.team().name(),
            session.id
        );
        if let Some(thread) = session.main_thread() {
            if session.debugger.team().thread_state(thread) == Some(ThreadState::Stopped) {
                output.push_str(&format!("\n{}", Self::describe_stop(&session, thread)));
            }
        }
        Ok(output)
    }

    async fn handle_set_breakpoint(&self, args: Value) -> Result<String, String> {
        let session = self.session().await?;

        let address = match parse_address(args.get("address")) {
            Some(address) => address,
            None => {
                let function = args
                    .get("function")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "Missing 'address' or 'function' parameter".to_string())?;
                let line = args.get("line").and_then(|v| v.as_u64()).map(|l| l as u32);
                session.resolve_function(function, line).ok_or_else(|| match line {
                    Some(line) => format!("Line {} not found in function {}", line, function),
                    None => format!("Function not found: {}", function),
                })?
            }
        };
        let enabled = args.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true);

        let user_breakpoint = session
            .debugger
            .set_breakpoint(address, enabled)
            .await
            .map_err(|e| format!("Failed to set breakpoint: {}", e))?;
        if let Some(condition) = args.get("condition").and_then(|v| v.as_str()) {
            session
                .debugger
                .set_breakpoint_condition(&user_breakpoint, Some(condition.to_string()));
        }

        let mut output = format!(
            "Breakpoint {} set at {}",
            user_breakpoint.id(),
            session.describe_address(address)
        );
        if let Some(condition) = user_breakpoint.condition() {
            output.push_str(&format!("\n   Condition: {}", condition));
        }
        Ok(output)
    }

    async fn handle_list_breakpoints(&self, _args: Value) -> Result<String, String> {
        let session = self.session().await?;

        let breakpoints: Vec<_> = session
            .debugger
            .team()
            .read(|t| t.user_breakpoints().to_vec())
            .into_iter()
            .filter(|ub| !ub.is_hidden())
            .collect();
        if breakpoints.is_empty() {
            return Ok("No breakpoints set".to_string());
        }

        let mut output = format!("{} breakpoint(s):\n\n", breakpoints.len());
        for ub in &breakpoints {
            let location = ub
                .address()
                .map(|address| session.describe_address(address))
                .unwrap_or_else(|| "unresolved".to_string());
            output.push_str(&format!(
                "  {} [{}] {}\n",
                if ub.is_enabled() { "on " } else { "off" },
                ub.id(),
                location
            ));
            if let Some(condition) = ub.condition() {
                output.push_str(&format!("     Condition: {}\n", condition));
            }
        }
        Ok(output)
    }

    async fn handle_clear_breakpoint(&self, args: Value) -> Result<String, String> {
        let address = parse_address(args.get("address"))
            .ok_or_else(|| "Missing 'address' parameter".to_string())?;
        let session = self.session().await?;

        session
            .debugger
            .clear_breakpoint(address)
            .await
            .map_err(|e| format!("Failed to clear breakpoint: {}", e))?;
        Ok(format!("Breakpoint cleared at {}", session.describe_address(address)))
    }

    async fn handle_thread_action(&self, args: Value, action: ThreadAction) -> Result<String, String> {
        let session = self.session().await?;
        let thread = Self::thread_arg(&session, &args)?;

        let mut console = session.take_console_output().await;
        session
            .debugger
            .thread_action(thread, action, None)
            .await
            .map_err(|e| format!("Failed to {:?} thread {}: {}", action, thread, e))?;
        let outcome = session.wait_for_stop(thread, timeout_arg(&args)).await;
        console.extend(session.take_console_output().await);

        let mut output = match outcome {
            StopOutcome::Stopped => Self::describe_stop(&session, thread),
            StopOutcome::Exited => format!("Thread {} exited", thread),
            StopOutcome::StillRunning => format!("Thread {} is running", thread),
        };
        if !console.is_empty() {
            output.push_str("\n\nOutput:\n");
            output.push_str(&console.concat());
        }
        Ok(output)
    }

    async fn handle_pause(&self, args: Value) -> Result<String, String> {
        let session = self.session().await?;
        let thread = Self::thread_arg(&session, &args)?;
        if session.debugger.team().thread_state(thread) == Some(ThreadState::Stopped) {
            return Ok(Self::describe_stop(&session, thread));
        }
        self.handle_thread_action(args, ThreadAction::Stop).await
    }

    async fn handle_get_stack(&self, args: Value) -> Result<String, String> {
        let session = self.session().await?;
        let thread = Self::thread_arg(&session, &args)?;
        let max_frames = args.get("max_frames").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
        let include_registers = args
            .get("include_registers")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let trace = session
            .wait_for_stack_trace(thread, timeout_arg(&args))
            .await
            .ok_or_else(|| format!("Thread {} is not stopped or has no stack trace yet", thread))?;

        let mut output = format!("Stack for thread {} ({} frames):\n\n", thread, trace.count_frames());
        for (index, frame) in trace.frames().iter().take(max_frames).enumerate() {
            output.push_str(&format!(
                "  #{} {} (frame {:#x}, {:?})\n",
                index,
                session.describe_address(frame.instruction_pointer),
                frame.frame_address,
                frame.frame_type
            ));
        }
        if include_registers {
            if let Some(frame) = trace.frame_at(0) {
                let cpu = &frame.cpu_state;
                output.push_str(&format!(
                    "\nRegisters:\n  ip={:#x} sp={:#x} fp={:#x}\n",
                    cpu.instruction_pointer, cpu.stack_pointer, cpu.frame_pointer
                ));
                for (index, value) in cpu.registers.iter().enumerate() {
                    output.push_str(&format!("  r{}={:#x}\n", index, value));
                }
            }
        }
        Ok(output)
    }

    async fn handle_list_threads(&self, _args: Value) -> Result<String, String> {
        let session = self.session().await?;

        let threads: Vec<(ThreadId, String, ThreadState, Option<TargetAddr>)> =
            session.debugger.team().read(|t| {
                t.threads()
                    .map(|thread| {
                        (
                            thread.id(),
                            thread.name().to_string(),
                            thread.state(),
                            thread.cpu_state().map(|cpu| cpu.instruction_pointer),
                        )
                    })
                    .collect()
            });

        let mut output = format!("{} thread(s):\n\n", threads.len());
        for (id, name, state, ip) in threads {
            output.push_str(&format!("  Thread {} '{}': {:?}", id, name, state));
            if let Some(ip) = ip {
                output.push_str(&format!(" at {}", session.describe_address(ip)));
            }
            output.push('\n');
        }
        Ok(output)
    }

    async fn handle_evaluate(&self, args: Value) -> Result<String, String> {
        let expression = args
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "Missing 'expression' parameter".to_string())?;
        let session = self.session().await?;
        let thread = Self::thread_arg(&session, &args).ok();

        let job = session
            .debugger
            .evaluate_expression(expression, thread)
            .map_err(|e| format!("Cannot evaluate: {}", e))?;
        let status = session.debugger.worker().wait_for(job.key()).await;
        match job.take_result() {
            Some(Ok(result)) => Ok(format!("{} = {}", expression, result.describe())),
            Some(Err(e)) => Err(format!("{}: {}", expression, e)),
            None => Err(format!("Evaluation of '{}' ended: {:?}", expression, status)),
        }
    }

    async fn handle_inspect(&self, args: Value) -> Result<String, String> {
        let address = parse_address(args.get("address"))
            .ok_or_else(|| "Missing 'address' parameter".to_string())?;
        let length = args.get("length").and_then(|v| v.as_u64()).unwrap_or(32) as usize;
        let session = self.session().await?;

        let block = session
            .debugger
            .inspect_memory(address, None)
            .map_err(|e| format!("Failed to inspect memory: {}", e))?;
        let deadline = tokio::time::Instant::now() + timeout_arg(&args);
        let data = loop {
            if let Some(data) = block.data() {
                break data;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("Memory at {:#x} could not be read", address));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        let offset = (address - block.base_address()) as usize;
        let end = (offset + length).min(data.len());
        let mut output = String::new();
        for (row, chunk) in data[offset..end].chunks(16).enumerate() {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            let text: String = chunk
                .iter()
                .map(|b| if b.is_ascii_graphic() { *b as char } else { '.' })
                .collect();
            output.push_str(&format!(
                "{:#010x}  {:<47}  {}\n",
                address + (row * 16) as u64,
                bytes.join(" "),
                text
            ));
        }
        Ok(output)
    }

    async fn handle_set_watchpoint(&self, args: Value) -> Result<String, String> {
        let address = parse_address(args.get("address"))
            .ok_or_else(|| "Missing 'address' parameter".to_string())?;
        let watch_type: WatchpointType = serde_json::from_value(args.get("type").cloned().unwrap_or(json!("write")))
            .map_err(|e| format!("Invalid watchpoint type: {}", e))?;
        let length = args.get("length").and_then(|v| v.as_u64()).unwrap_or(8) as usize;
        let session = self.session().await?;

        session
            .debugger
            .set_watchpoint(address, watch_type, length, true)
            .await
            .map_err(|e| format!("Failed to set watchpoint: {}", e))?;
        Ok(format!(
            "Watchpoint set at {:#x} ({:?}, {} bytes)",
            address, watch_type, length
        ))
    }

    async fn handle_report(&self, args: Value) -> Result<String, String> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "Missing 'path' parameter".to_string())?;
        let session = self.session().await?;

        let key = session
            .debugger
            .generate_report(path)
            .map_err(|e| format!("Failed to start report: {}", e))?;
        match session.debugger.worker().wait_for(key).await {
            JobWaitStatus::Succeeded | JobWaitStatus::NotFound => Ok(format!("Report written to {}", path)),
            status => Err(format!("Report job ended: {:?}", status)),
        }
    }

    async fn handle_disconnect(&self, args: Value) -> Result<String, String> {
        let session = self.session().await?;
        let kill = args.get("kill").and_then(|v| v.as_bool()).unwrap_or(true);
        let option = if kill {
            QuitOption::KillTeam
        } else {
            QuitOption::ResumeTeam
        };

        if self.session_manager.close_session(&session.id, option).await {
            Ok(format!("Disconnected from debug session: {}", session.id))
        } else {
            Err(format!("Session {} did not quit", session.id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(response: &JsonRpcResponse) -> String {
        let result = response.result.as_ref().unwrap();
        result["content"][0]["text"].as_str().unwrap().to_string()
    }

    fn is_error(response: &JsonRpcResponse) -> bool {
        response.result.as_ref().unwrap()["isError"] == json!(true)
    }

    async fn call(handler: &RequestHandler, name: &str, arguments: Value) -> JsonRpcResponse {
        handler
            .handle_request(JsonRpcRequest {
                jsonrpc: "2.0".to_string(),
                id: json!(1),
                method: "tools/call".to_string(),
                params: Some(json!({ "name": name, "arguments": arguments })),
            })
            .await
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address(Some(&json!(4096))), Some(0x1000));
        assert_eq!(parse_address(Some(&json!("0x1000"))), Some(0x1000));
        assert_eq!(parse_address(Some(&json!("4096"))), Some(0x1000));
        assert_eq!(parse_address(Some(&json!("main"))), None);
        assert_eq!(parse_address(None), None);
    }

    #[tokio::test]
    async fn test_unknown_method_and_tool() {
        let handler = RequestHandler::new(DebuggerConfig::default());
        let response = handler
            .handle_request(JsonRpcRequest {
                jsonrpc: "2.0".to_string(),
                id: json!(3),
                method: "bogus".to_string(),
                params: None,
            })
            .await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);

        let response = call(&handler, "debug.get_stack", json!({})).await;
        assert!(is_error(&response));
        assert!(text(&response).contains("debug.launch"));
    }

    #[tokio::test]
    async fn test_breakpoint_continue_and_stack() {
        let handler = RequestHandler::new(DebuggerConfig::default());
        let launched = text(&call(&handler, "debug.launch", json!({})).await);
        assert!(launched.contains("/sim/demo"));
        assert!(launched.contains("main+0x0"));

        let response = call(&handler, "debug.set_breakpoint", json!({ "function": "tick", "line": 12 })).await;
        assert!(!is_error(&response), "{}", text(&response));
        assert!(text(&call(&handler, "debug.list_breakpoints", json!({})).await).contains("tick+"));

        let response = call(&handler, "debug.continue", json!({ "timeout_ms": 5000 })).await;
        let stopped = text(&response);
        assert!(stopped.contains("Breakpoint"), "{}", stopped);
        assert!(stopped.contains("demo.src:12"), "{}", stopped);
        assert!(stopped.contains("tick\n"), "{}", stopped);

        let stack = text(&call(&handler, "debug.get_stack", json!({ "timeout_ms": 5000 })).await);
        assert!(stack.contains("#0 tick+"), "{}", stack);
        assert!(stack.contains("#1 main+"), "{}", stack);

        let value = text(&call(&handler, "debug.evaluate", json!({ "expression": "r3 == 3" })).await);
        assert_eq!(value, "r3 == 3 = true");

        let response = call(&handler, "debug.disconnect", json!({ "kill": true })).await;
        assert!(!is_error(&response), "{}", text(&response));
    }
}
