// Sim expression language
//
// Just enough to write breakpoint conditions: `<term> [<op> <term>]` where a
// term is an integer literal, true/false, or a register of the context's
// CPU state. `type <term>` yields the term's type.

use crate::error::{DebuggerError, DebuggerResult};
use crate::language::{EvaluationContext, ExpressionResult, SourceLanguage};
use crate::value::{Value, ValueType};
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct SimLanguage;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Term {
    Integer(i64),
    Bool(bool),
}

impl Term {
    fn value(self) -> Value {
        match self {
            Term::Integer(value) => Value::Integer(value),
            Term::Bool(value) => Value::Bool(value),
        }
    }

    fn value_type(self) -> ValueType {
        match self {
            Term::Integer(_) => ValueType::Integer { size: 8, signed: true },
            Term::Bool(_) => ValueType::Bool,
        }
    }
}

fn parse_term(text: &str, context: &EvaluationContext) -> DebuggerResult<Term> {
    match text {
        "true" => return Ok(Term::Bool(true)),
        "false" => return Ok(Term::Bool(false)),
        _ => {}
    }

    let literal = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok().map(|v| v as i64),
        None => text.parse::<i64>().ok(),
    };
    if let Some(value) = literal {
        return Ok(Term::Integer(value));
    }

    let cpu_state = context.cpu_state.as_ref();
    let register = match text {
        "ip" => cpu_state.map(|cpu| cpu.instruction_pointer),
        "sp" => cpu_state.map(|cpu| cpu.stack_pointer),
        "fp" => cpu_state.map(|cpu| cpu.frame_pointer),
        name => match context.architecture.register_by_name(name) {
            Some(register) => cpu_state.and_then(|cpu| cpu.register(register.index)),
            None => return Err(DebuggerError::Evaluation(format!("unknown identifier '{}'", text))),
        },
    };
    register
        .map(|value| Term::Integer(value as i64))
        .ok_or_else(|| DebuggerError::Evaluation(format!("no CPU state to read '{}'", text)))
}

fn compare(lhs: Term, op: &str, rhs: Term) -> DebuggerResult<bool> {
    match (lhs, rhs) {
        (Term::Integer(a), Term::Integer(b)) => match op {
            "==" => Ok(a == b),
            "!=" => Ok(a != b),
            "<" => Ok(a < b),
            ">" => Ok(a > b),
            "<=" => Ok(a <= b),
            ">=" => Ok(a >= b),
            _ => Err(DebuggerError::Evaluation(format!("unknown operator '{}'", op))),
        },
        (Term::Bool(a), Term::Bool(b)) => match op {
            "==" => Ok(a == b),
            "!=" => Ok(a != b),
            _ => Err(DebuggerError::Evaluation(format!("'{}' needs integers", op))),
        },
        _ => Err(DebuggerError::Evaluation("operand types differ".to_string())),
    }
}

#[async_trait]
impl SourceLanguage for SimLanguage {
    fn name(&self) -> &str {
        "sim"
    }

    async fn evaluate_expression(
        &self,
        expression: &str,
        context: &EvaluationContext,
    ) -> DebuggerResult<ExpressionResult> {
        let tokens: Vec<&str> = expression.split_whitespace().collect();
        match tokens.as_slice() {
            ["type", term] => Ok(ExpressionResult::Type(parse_term(term, context)?.value_type())),
            [term] => Ok(ExpressionResult::Primitive(parse_term(term, context)?.value())),
            [lhs, op, rhs] => {
                let holds = compare(parse_term(lhs, context)?, op, parse_term(rhs, context)?)?;
                Ok(ExpressionResult::Primitive(Value::Bool(holds)))
            }
            _ => Err(DebuggerError::Evaluation(format!("cannot parse '{}'", expression))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_state::CpuState;
    use crate::sim::{ProgramBuilder, SimulatedTarget};
    use crate::team::Team;
    use std::sync::Arc;

    fn context(cpu_state: Option<CpuState>) -> EvaluationContext {
        let mut builder = ProgramBuilder::new("lang", 0x1000);
        builder.function("main").ret();
        let target = SimulatedTarget::launch(builder.build().unwrap());
        EvaluationContext {
            team: Arc::new(Team::new(1, "lang")),
            thread: None,
            cpu_state: cpu_state.map(Arc::new),
            frame: None,
            memory: target.clone(),
            architecture: target.architecture(),
        }
    }

    #[tokio::test]
    async fn test_register_comparisons() {
        let ctx = context(Some(CpuState::new(0x1000, 0x7000, 0x7010, vec![3, 0, 0, 0, 0, 0, 0, 0])));
        let lang = SimLanguage;
        let result = lang.evaluate_expression("r0 == 3", &ctx).await.unwrap();
        assert_eq!(result, ExpressionResult::Primitive(Value::Bool(true)));
        let result = lang.evaluate_expression("ip >= 0x2000", &ctx).await.unwrap();
        assert_eq!(result, ExpressionResult::Primitive(Value::Bool(false)));
        let result = lang.evaluate_expression("-4", &ctx).await.unwrap();
        assert_eq!(result, ExpressionResult::Primitive(Value::Integer(-4)));
        let result = lang.evaluate_expression("type r1", &ctx).await.unwrap();
        assert!(matches!(result, ExpressionResult::Type(ValueType::Integer { .. })));
    }

    #[tokio::test]
    async fn test_evaluation_errors() {
        let lang = SimLanguage;
        let ctx = context(None);
        assert!(lang.evaluate_expression("r0 == 1", &ctx).await.is_err());
        assert!(lang.evaluate_expression("bogus", &ctx).await.is_err());
        assert!(lang.evaluate_expression("1 ~ 2", &ctx).await.is_err());
        assert!(lang.evaluate_expression("true == 1", &ctx).await.is_err());
    }
}
