//! A command dispatcher for cloud control-plane APIs.
//!
//! Every operation of every loaded [`ServiceModel`] runs through the same
//! pipeline:
//!
//! ```text
//! bind -> build -> (dry run) -> confirm -> invoke (+ auto-iteration) -> project
//! ```
//!
//! There is no per-operation code; the model describes parameters, nesting,
//! wire binding, pagination and confirmation policy.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

pub mod binder;
pub mod builder;
pub mod cancel;
pub mod cli;
pub mod error;
pub mod gate;
pub mod logging;
pub mod model;
pub mod output;
pub mod projector;
pub mod transport;

pub use binder::{bind, BoundContext, RawInputs, RawValue};
pub use builder::{build, RequestEnvelope};
pub use cancel::{stop_on_ctrl_c, stop_pair, StopHandle, StopSignal};
pub use error::{Error, ModelError, Result, ServiceError, ValidationError};
pub use gate::{ConfirmationGate, Prompter, ScriptedPrompter, TerminalPrompter};
pub use model::{parse_service_model, Impact, ModelRegistry, OperationDescriptor, ServiceModel};
pub use output::OutputFormat;
pub use projector::{project, Selector};
pub use transport::{invoke, ClientConfig, HttpTransport, ServiceCall, Transport};

// =====================
// Exit codes
// =====================

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_SERVICE_ERROR: i32 = 1;
pub const EXIT_VALIDATION_ERROR: i32 = 2;
pub const EXIT_ABORTED: i32 = 3;
pub const EXIT_CANCELLED: i32 = 130;

/// How one invocation ended, short of an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The call succeeded; holds the projected result.
    Completed(Value),
    /// The user declined the confirmation prompt. Nothing was sent.
    Aborted,
    /// `--dry-run`: the request that would have been sent.
    DryRun(RequestEnvelope),
}

/// Per-invocation switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationOptions {
    pub force: bool,
    pub select: Option<String>,
    pub pass_thru: bool,
    pub auto_iterate: bool,
    pub dry_run: bool,
}

impl Default for InvocationOptions {
    fn default() -> Self {
        Self {
            force: false,
            select: None,
            pass_thru: false,
            auto_iterate: true,
            dry_run: false,
        }
    }
}

#[must_use]
pub fn exit_code(result: &Result<Outcome>) -> i32 {
    match result {
        Ok(Outcome::Completed(_) | Outcome::DryRun(_)) => EXIT_SUCCESS,
        Ok(Outcome::Aborted) => EXIT_ABORTED,
        Err(
            Error::Validation(_) | Error::Config(_) | Error::Model(ModelError::UnknownOperation(_)),
        ) => EXIT_VALIDATION_ERROR,
        Err(Error::Cancelled) => EXIT_CANCELLED,
        Err(_) => EXIT_SERVICE_ERROR,
    }
}

/// Runs operations of one service.
pub struct Engine<T, P> {
    model: Arc<ServiceModel>,
    transport: T,
    gate: ConfirmationGate<P>,
}

impl<T: Transport, P: Prompter> Engine<T, P> {
    pub fn new(model: Arc<ServiceModel>, transport: T, gate: ConfirmationGate<P>) -> Self {
        Self {
            model,
            transport,
            gate,
        }
    }

    #[must_use]
    pub fn model(&self) -> &ServiceModel {
        &self.model
    }

    /// Run `operation` end to end.
    ///
    /// Validation (selector, parameters) happens before anything else, so a
    /// bad invocation never prompts and never reaches the transport.
    pub async fn run(
        &self,
        operation: &str,
        inputs: &RawInputs,
        options: &InvocationOptions,
        stop: &mut StopSignal,
    ) -> Result<Outcome> {
        let model = self.model.as_ref();
        let op = model.operation(operation)?;
        let selector = Selector::resolve(op, options.select.as_deref(), options.pass_thru)?;
        let ctx = bind(model, op, inputs)?;
        let envelope = build(model, op, &ctx);

        if options.dry_run {
            tracing::info!(operation = %op.name, "dry run, request not sent");
            return Ok(Outcome::DryRun(envelope));
        }

        if !self.gate.check(op, &ctx, options.force)? {
            return Ok(Outcome::Aborted);
        }

        let response = self
            .call_all(op, envelope, options.auto_iterate, stop)
            .await?;
        Ok(Outcome::Completed(project(&selector, &response, &ctx, model, op)))
    }

    /// Invoke once, then keep following the output token of paginated
    /// operations and concatenate the pages' items.
    async fn call_all(
        &self,
        op: &OperationDescriptor,
        mut envelope: RequestEnvelope,
        auto_iterate: bool,
        stop: &mut StopSignal,
    ) -> Result<Value> {
        let first = self.call(op, &envelope, stop).await?;
        let Some(pagination) = &op.pagination else {
            return Ok(first);
        };
        // A caller-supplied token means the caller is paging by hand.
        if !auto_iterate || envelope.payload.contains_key(&pagination.input_token) {
            return Ok(first);
        }

        let mut merged = first;
        let mut seen = HashSet::new();
        let mut pages = 1_usize;
        while let Some(token) = next_token(&merged, &pagination.output_token) {
            if !seen.insert(token.clone()) {
                tracing::warn!(operation = %op.name, token = %token, "service repeated a page token, stopping");
                break;
            }
            envelope.set_top_level(&pagination.input_token, Value::String(token));
            let page = self.call(op, &envelope, stop).await?;
            pages += 1;

            let Some(acc) = merged.as_object_mut() else {
                break;
            };
            if let Some(Value::Array(items)) = page.get(&pagination.items) {
                match acc.get_mut(&pagination.items) {
                    Some(Value::Array(existing)) => existing.extend(items.iter().cloned()),
                    _ => {
                        acc.insert(pagination.items.clone(), Value::Array(items.clone()));
                    }
                }
            }
            match page.get(&pagination.output_token) {
                Some(t) => acc.insert(pagination.output_token.clone(), t.clone()),
                None => acc.remove(&pagination.output_token),
            };
        }
        if let Some(acc) = merged.as_object_mut() {
            acc.remove(&pagination.output_token);
        }
        tracing::debug!(operation = %op.name, pages, "auto-iteration finished");
        Ok(merged)
    }

    async fn call(
        &self,
        op: &OperationDescriptor,
        envelope: &RequestEnvelope,
        stop: &mut StopSignal,
    ) -> Result<Value> {
        let call = ServiceCall {
            service: self.model.as_ref(),
            operation: op,
            envelope,
        };
        invoke(&self.transport, &call, stop).await
    }
}

fn next_token(response: &Value, member: &str) -> Option<String> {
    match response.get(member) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Ok(Outcome::Completed(Value::Null))), EXIT_SUCCESS);
        assert_eq!(exit_code(&Ok(Outcome::Aborted)), EXIT_ABORTED);
        assert_eq!(exit_code(&Err(Error::Cancelled)), EXIT_CANCELLED);
        assert_eq!(
            exit_code(&Err(ValidationError::UnknownParameter("X".into()).into())),
            EXIT_VALIDATION_ERROR
        );
        let api = ServiceError::Api {
            status: 500,
            code: "InternalServerException".into(),
            message: "boom".into(),
            request_id: None,
        };
        assert_eq!(exit_code(&Err(api.into())), EXIT_SERVICE_ERROR);
    }

    #[test]
    fn test_invocation_options_default_auto_iterates() {
        let opts = InvocationOptions::default();
        assert!(opts.auto_iterate);
        assert!(!opts.force);
    }

    #[test]
    fn test_next_token() {
        let v = serde_json::json!({"nextToken": "abc", "empty": ""});
        assert_eq!(next_token(&v, "nextToken").as_deref(), Some("abc"));
        assert_eq!(next_token(&v, "empty"), None);
        assert_eq!(next_token(&v, "missing"), None);
    }
}
