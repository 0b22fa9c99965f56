//! Confirmation before mutating operations.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use crate::binder::BoundContext;
use crate::error::{Error, Result};
use crate::model::{Impact, OperationDescriptor};

/// Asks the user a yes/no question. Blocking.
pub trait Prompter: Send + Sync {
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Prompts on the controlling terminal. Without a terminal on stdin nobody
/// can answer, which counts as declining.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        if !std::io::stdin().is_terminal() {
            tracing::warn!("confirmation required but stdin is not a terminal; use --force to proceed");
            return Ok(false);
        }
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(|e| Error::Prompt(e.to_string()))
    }
}

/// Gives the same answer to every prompt and counts how often it was asked.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answer: bool,
    asked: AtomicUsize,
}

impl ScriptedPrompter {
    #[must_use]
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            asked: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&self, _prompt: &str) -> Result<bool> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}

impl<P: Prompter + ?Sized> Prompter for std::sync::Arc<P> {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        (**self).confirm(prompt)
    }
}

pub struct ConfirmationGate<P> {
    prompter: P,
    threshold: Impact,
}

impl<P: Prompter> ConfirmationGate<P> {
    /// Operations at or above `threshold` impact are confirmed.
    pub fn new(prompter: P, threshold: Impact) -> Self {
        Self {
            prompter,
            threshold,
        }
    }

    #[must_use]
    pub fn applies_to(&self, op: &OperationDescriptor) -> bool {
        op.mutating && op.impact != Impact::None && op.impact >= self.threshold
    }

    /// Returns whether to proceed. `force` skips the prompt entirely.
    pub fn confirm(&self, operation_label: &str, resource_text: &str, force: bool) -> Result<bool> {
        if force {
            return Ok(true);
        }
        let prompt = format!(
            "Performing the operation \"{operation_label}\" on target \"{resource_text}\". Continue?"
        );
        let proceed = self.prompter.confirm(&prompt)?;
        if !proceed {
            tracing::info!(operation = %operation_label, "operation declined");
        }
        Ok(proceed)
    }

    /// Gate `op` using the bound value of its resource parameter as the
    /// target text.
    pub fn check(&self, op: &OperationDescriptor, ctx: &BoundContext, force: bool) -> Result<bool> {
        if !self.applies_to(op) {
            return Ok(true);
        }
        self.confirm(&op.label(), &resource_text(op, ctx), force)
    }
}

fn resource_text(op: &OperationDescriptor, ctx: &BoundContext) -> String {
    op.resource_param
        .as_deref()
        .and_then(|name| op.find_parameter(name))
        .and_then(|p| ctx.get(&p.path))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}
