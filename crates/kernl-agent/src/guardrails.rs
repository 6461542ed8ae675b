use crate::KernlError;
use async_trait::async_trait;
use futures::future::join_all;
use kernl_llm::Item;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailPhase {
    Input,
    Output,
}

impl fmt::Display for GuardrailPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub tripwire_triggered: bool,
    #[serde(default)]
    pub output_info: Value,
}

impl GuardrailResult {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn tripwire(output_info: Value) -> Self {
        Self {
            tripwire_triggered: true,
            output_info,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GuardrailContext {
    pub thread_id: String,
    pub agent_id: String,
    pub context: Value,
}

/// Inspects the caller's input before the first model call of an execution.
#[async_trait]
pub trait InputGuardrail: Send + Sync {
    fn name(&self) -> &str;

    async fn check(
        &self,
        context: &GuardrailContext,
        input: &[Item],
    ) -> Result<GuardrailResult, KernlError>;
}

/// Inspects the final response before the thread reports success.
#[async_trait]
pub trait OutputGuardrail: Send + Sync {
    fn name(&self) -> &str;

    async fn check(
        &self,
        context: &GuardrailContext,
        output: &Value,
    ) -> Result<GuardrailResult, KernlError>;
}

pub type InputCheck = Arc<dyn Fn(&GuardrailContext, &[Item]) -> GuardrailResult + Send + Sync>;
pub type OutputCheck = Arc<dyn Fn(&GuardrailContext, &Value) -> GuardrailResult + Send + Sync>;

/// Guardrail backed by a synchronous closure.
pub struct FnInputGuardrail {
    name: String,
    check: InputCheck,
}

impl FnInputGuardrail {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&GuardrailContext, &[Item]) -> GuardrailResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }
}

#[async_trait]
impl InputGuardrail for FnInputGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(
        &self,
        context: &GuardrailContext,
        input: &[Item],
    ) -> Result<GuardrailResult, KernlError> {
        Ok((self.check)(context, input))
    }
}

pub struct FnOutputGuardrail {
    name: String,
    check: OutputCheck,
}

impl FnOutputGuardrail {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&GuardrailContext, &Value) -> GuardrailResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }
}

#[async_trait]
impl OutputGuardrail for FnOutputGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(
        &self,
        context: &GuardrailContext,
        output: &Value,
    ) -> Result<GuardrailResult, KernlError> {
        Ok((self.check)(context, output))
    }
}

/// Runs every guardrail concurrently. The first tripwire in declaration
/// order becomes the error, as does the first guardrail that fails outright.
pub async fn run_input_guardrails(
    guardrails: &[Arc<dyn InputGuardrail>],
    context: &GuardrailContext,
    input: &[Item],
) -> Result<Vec<GuardrailResult>, KernlError> {
    let results = join_all(
        guardrails
            .iter()
            .map(|guardrail| guardrail.check(context, input)),
    )
    .await;
    let names = guardrails.iter().map(|guardrail| guardrail.name());
    settle(GuardrailPhase::Input, context, names, results)
}

pub async fn run_output_guardrails(
    guardrails: &[Arc<dyn OutputGuardrail>],
    context: &GuardrailContext,
    output: &Value,
) -> Result<Vec<GuardrailResult>, KernlError> {
    let results = join_all(
        guardrails
            .iter()
            .map(|guardrail| guardrail.check(context, output)),
    )
    .await;
    let names = guardrails.iter().map(|guardrail| guardrail.name());
    settle(GuardrailPhase::Output, context, names, results)
}

fn settle<'a>(
    phase: GuardrailPhase,
    context: &GuardrailContext,
    names: impl Iterator<Item = &'a str>,
    results: Vec<Result<GuardrailResult, KernlError>>,
) -> Result<Vec<GuardrailResult>, KernlError> {
    let mut settled = Vec::with_capacity(results.len());
    for (name, result) in names.zip(results) {
        let result = result?;
        if result.tripwire_triggered {
            warn!(
                thread_id = %context.thread_id,
                agent = %context.agent_id,
                %phase,
                guardrail = name,
                "guardrail tripwire triggered"
            );
            return Err(KernlError::GuardrailTripwire {
                phase,
                guardrail: name.to_string(),
                output_info: result.output_info,
            });
        }
        settled.push(result);
    }
    Ok(settled)
}
