// Expression evaluation job
//
// Used for breakpoint conditions and user evaluations. The result is kept on
// the job so the requester can pick it up after waiting.

use crate::error::{DebuggerError, DebuggerResult};
use crate::language::{EvaluationContext, ExpressionResult, SourceLanguage};
use crate::worker::{Job, JobContext, JobKey, JobType};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

static NEXT_EVALUATION: AtomicU64 = AtomicU64::new(1);

pub struct ExpressionEvaluationJob {
    key: JobKey,
    language: Arc<dyn SourceLanguage>,
    expression: String,
    context: EvaluationContext,
    publish: bool,
    result: Mutex<Option<DebuggerResult<ExpressionResult>>>,
}

impl ExpressionEvaluationJob {
    pub fn new(language: Arc<dyn SourceLanguage>, expression: impl Into<String>, context: EvaluationContext) -> Self {
        Self {
            key: JobKey::new(
                NEXT_EVALUATION.fetch_add(1, Ordering::SeqCst),
                JobType::EvaluateExpression,
            ),
            language,
            expression: expression.into(),
            context,
            publish: false,
            result: Mutex::new(None),
        }
    }

    /// Also report the outcome as a team event.
    pub fn publish_result(mut self) -> Self {
        self.publish = true;
        self
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Takes the evaluation outcome; `None` until the job has run.
    pub fn take_result(&self) -> Option<DebuggerResult<ExpressionResult>> {
        self.result.lock().take()
    }
}

#[async_trait]
impl Job for ExpressionEvaluationJob {
    fn key(&self) -> JobKey {
        self.key
    }

    fn description(&self) -> String {
        format!("Evaluating '{}'", self.expression)
    }

    async fn run(&self, ctx: &JobContext) -> DebuggerResult<()> {
        let result = self
            .language
            .evaluate_expression(&self.expression, &self.context)
            .await;
        ctx.check_aborted()?;
        debug!("'{}' evaluated to {:?}", self.expression, result);

        if self.publish {
            let published = match &result {
                Ok(value) => Ok(value.describe()),
                Err(e) => Err(e.to_string()),
            };
            let expression = self.expression.clone();
            self.context
                .team
                .with(|t| t.notify_expression_evaluated(expression, published));
        }

        let outcome = match &result {
            Ok(_) => Ok(()),
            Err(DebuggerError::Evaluation(message)) => Err(DebuggerError::Evaluation(message.clone())),
            Err(e) => Err(DebuggerError::Evaluation(e.to_string())),
        };
        *self.result.lock() = Some(result);
        outcome
    }
}
