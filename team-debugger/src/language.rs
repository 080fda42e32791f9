// Source languages
//
// Expression evaluation is language specific and plugged in through this
// trait. The engine only consumes results.

use crate::architecture::Architecture;
use crate::cpu_state::CpuState;
use crate::error::DebuggerResult;
use crate::interface::TeamMemory;
use crate::stack_trace::StackFrame;
use crate::team::Team;
use crate::types::ThreadId;
use crate::value::{Value, ValueNodeId, ValueType};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionResult {
    Primitive(Value),
    ValueNode(ValueNodeId),
    Type(ValueType),
}

impl ExpressionResult {
    pub fn describe(&self) -> String {
        match self {
            ExpressionResult::Primitive(value) => value.to_string(),
            ExpressionResult::ValueNode(id) => format!("<value node {}>", id),
            ExpressionResult::Type(value_type) => value_type.name(),
        }
    }
}

/// Everything an evaluator may look at.
pub struct EvaluationContext {
    pub team: Arc<Team>,
    pub thread: Option<ThreadId>,
    pub cpu_state: Option<Arc<CpuState>>,
    pub frame: Option<StackFrame>,
    pub memory: Arc<dyn TeamMemory>,
    pub architecture: Arc<dyn Architecture>,
}

#[async_trait]
pub trait SourceLanguage: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate_expression(
        &self,
        expression: &str,
        context: &EvaluationContext,
    ) -> DebuggerResult<ExpressionResult>;
}
