// Debug tools schema definitions
//
// Console tools for driving a team debugger session

use crate::protocol::Tool;
use serde_json::{json, Value};

fn thread_only() -> Value {
    json!({
        "type": "object",
        "properties": {
            "thread_id": {
                "type": "integer",
                "description": "Thread ID (defaults to the main thread)"
            },
            "timeout_ms": {
                "type": "integer",
                "description": "How long to wait for the thread to stop",
                "default": 2000
            }
        }
    })
}

fn tool(name: &str, description: &str, input_schema: Value) -> Tool {
    Tool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

pub fn get_tools() -> Vec<Tool> {
    vec![
        tool(
            "debug.launch",
            "Launch the demo program on the simulated target and attach to it",
            json!({
                "type": "object",
                "properties": {
                    "stop_in_main": {
                        "type": "boolean",
                        "description": "Stop the main thread at main (overrides the config)"
                    }
                }
            }),
        ),
        tool(
            "debug.set_breakpoint",
            "Set a breakpoint at an address or at a function/line",
            json!({
                "type": "object",
                "properties": {
                    "address": {
                        "type": ["integer", "string"],
                        "description": "Code address (e.g. 4096 or '0x1000')"
                    },
                    "function": {
                        "type": "string",
                        "description": "Function name, used when no address is given"
                    },
                    "line": {
                        "type": "integer",
                        "description": "Source line inside the function"
                    },
                    "condition": {
                        "type": "string",
                        "description": "Only stop when this expression holds (e.g. 'r3 == 1')"
                    },
                    "enabled": {
                        "type": "boolean",
                        "default": true
                    }
                }
            }),
        ),
        tool(
            "debug.list_breakpoints",
            "List all user breakpoints",
            json!({
                "type": "object",
                "properties": {}
            }),
        ),
        tool(
            "debug.clear_breakpoint",
            "Clear the breakpoint at an address",
            json!({
                "type": "object",
                "properties": {
                    "address": {
                        "type": ["integer", "string"],
                        "description": "Breakpoint address from list_breakpoints"
                    }
                },
                "required": ["address"]
            }),
        ),
        tool("debug.continue", "Resume a stopped thread", thread_only()),
        tool("debug.step_over", "Step over the current statement", thread_only()),
        tool("debug.step_into", "Step into the call at the current statement", thread_only()),
        tool("debug.step_out", "Run until the current function returns", thread_only()),
        tool("debug.pause", "Stop a running thread", thread_only()),
        tool(
            "debug.get_stack",
            "Show the stack trace of a stopped thread",
            json!({
                "type": "object",
                "properties": {
                    "thread_id": {
                        "type": "integer",
                        "description": "Thread ID (defaults to the main thread)"
                    },
                    "max_frames": {
                        "type": "integer",
                        "default": 20
                    },
                    "include_registers": {
                        "type": "boolean",
                        "default": false
                    }
                }
            }),
        ),
        tool(
            "debug.list_threads",
            "List the team's threads and their states",
            json!({
                "type": "object",
                "properties": {}
            }),
        ),
        tool(
            "debug.evaluate",
            "Evaluate an expression in a thread's context",
            json!({
                "type": "object",
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "Expression (e.g. 'r0', 'sp > 0x1000')"
                    },
                    "thread_id": {
                        "type": "integer"
                    }
                },
                "required": ["expression"]
            }),
        ),
        tool(
            "debug.inspect",
            "Dump target memory",
            json!({
                "type": "object",
                "properties": {
                    "address": {
                        "type": ["integer", "string"]
                    },
                    "length": {
                        "type": "integer",
                        "default": 32
                    }
                },
                "required": ["address"]
            }),
        ),
        tool(
            "debug.set_watchpoint",
            "Stop when memory is read or written",
            json!({
                "type": "object",
                "properties": {
                    "address": {
                        "type": ["integer", "string"]
                    },
                    "type": {
                        "type": "string",
                        "enum": ["read", "write", "read_write"],
                        "default": "write"
                    },
                    "length": {
                        "type": "integer",
                        "default": 8
                    }
                },
                "required": ["address"]
            }),
        ),
        tool(
            "debug.report",
            "Write a debug report (images, threads, stacks) to a file",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string"
                    }
                },
                "required": ["path"]
            }),
        ),
        tool(
            "debug.disconnect",
            "End the debug session",
            json!({
                "type": "object",
                "properties": {
                    "kill": {
                        "type": "boolean",
                        "description": "Kill the team instead of letting it run",
                        "default": true
                    }
                }
            }),
        ),
    ]
}
