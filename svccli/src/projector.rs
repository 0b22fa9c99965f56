//! Choosing what part of a response to return.
//!
//! Selectors are resolved before any call is made, so a bad `--select`
//! expression never costs a round trip.

use serde_json::{Map, Value};

use crate::binder::BoundContext;
use crate::error::ValidationError;
use crate::model::{OperationDescriptor, ServiceModel, Shape};

/// What to return from a completed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// `*`: the whole response.
    Full,
    /// `^Name`: the bound value of an input parameter, by wire path once
    /// resolved.
    EchoInput(String),
    /// A dotted response member path, matched case-insensitively.
    Field(String),
}

impl Selector {
    pub fn parse(expr: &str) -> Result<Self, ValidationError> {
        let expr = expr.trim();
        let invalid = |reason: &str| ValidationError::InvalidSelector {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };
        if expr.is_empty() {
            return Err(invalid("selector is empty"));
        }
        if expr == "*" {
            return Ok(Selector::Full);
        }
        if let Some(name) = expr.strip_prefix('^') {
            if name.is_empty() {
                return Err(invalid("'^' must be followed by a parameter name"));
            }
            return Ok(Selector::EchoInput(name.to_string()));
        }
        if expr.split('.').any(str::is_empty) {
            return Err(invalid("empty path segment"));
        }
        Ok(Selector::Field(expr.to_string()))
    }

    /// Pick the selector for one invocation and check it against `op`.
    ///
    /// `--pass-thru` is the older spelling of `--select ^<PassThruParam>`;
    /// asking for both is rejected.
    pub fn resolve(
        op: &OperationDescriptor,
        select: Option<&str>,
        pass_thru: bool,
    ) -> Result<Self, ValidationError> {
        let selector = match (select, pass_thru) {
            (Some(_), true) => {
                return Err(ValidationError::ConflictingOptions(
                    "--select and --pass-thru cannot be used together".to_string(),
                ))
            }
            (Some(expr), false) => Selector::parse(expr)?,
            (None, true) => match &op.pass_thru {
                Some(param) => Selector::EchoInput(param.clone()),
                None => {
                    return Err(ValidationError::ConflictingOptions(format!(
                        "{} does not support --pass-thru",
                        op.command_name()
                    )))
                }
            },
            (None, false) => match &op.default_selector {
                Some(expr) => Selector::parse(expr)?,
                None => Selector::Full,
            },
        };

        match selector {
            Selector::EchoInput(name) => op
                .find_parameter(&name)
                .map(|p| Selector::EchoInput(p.path.clone()))
                .ok_or_else(|| ValidationError::InvalidSelector {
                    expr: format!("^{name}"),
                    reason: format!("{} has no parameter named {name}", op.command_name()),
                }),
            other => Ok(other),
        }
    }
}

/// Apply a resolved selector. Never fails: a missing field yields an empty
/// value of the declared type.
#[must_use]
pub fn project(
    selector: &Selector,
    response: &Value,
    ctx: &BoundContext,
    model: &ServiceModel,
    op: &OperationDescriptor,
) -> Value {
    match selector {
        Selector::Full => response.clone(),
        Selector::EchoInput(path) => ctx.get(path).cloned().unwrap_or(Value::Null),
        Selector::Field(path) => lookup(response, path)
            .cloned()
            .unwrap_or_else(|| empty_for(model, op, path)),
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, seg| {
        let obj = current.as_object()?;
        obj.get(seg).or_else(|| {
            obj.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(seg))
                .map(|(_, v)| v)
        })
    })
}

/// Walk the output shape along `path` to find what "nothing" looks like.
fn empty_for(model: &ServiceModel, op: &OperationDescriptor, path: &str) -> Value {
    let Some(mut shape_name) = op.output.clone() else {
        return Value::Null;
    };
    for seg in path.split('.') {
        let next = model
            .members(&shape_name)
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(seg))
            .map(|m| m.shape.clone());
        match next {
            Some(s) => shape_name = s,
            None => return Value::Null,
        }
    }
    match model.shape(&shape_name) {
        Some(Shape::List { .. }) => Value::Array(Vec::new()),
        Some(Shape::Map { .. }) => Value::Object(Map::new()),
        _ => Value::Null,
    }
}
