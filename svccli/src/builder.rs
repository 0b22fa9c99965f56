//! Assembling the nested request payload from a [`BoundContext`].

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::binder::BoundContext;
use crate::model::{OperationDescriptor, ServiceModel, Shape};

/// The request for one operation, shaped like the wire payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestEnvelope {
    pub operation: String,
    pub payload: Map<String, Value>,
}

impl RequestEnvelope {
    /// Look up a dot-delimited path in the payload.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.payload.get(segments.next()?)?;
        for seg in segments {
            current = current.as_object()?.get(seg)?;
        }
        Some(current)
    }

    pub fn set_top_level(&mut self, member: &str, value: Value) {
        self.payload.insert(member.to_string(), value);
    }
}

/// Build the request payload for `op`.
///
/// Nested groups are attached only when at least one of their fields was
/// bound, so "not specified" never reaches the wire as an empty object. An
/// idempotency token is generated when the operation declares one and the
/// caller did not supply it.
#[must_use]
pub fn build(model: &ServiceModel, op: &OperationDescriptor, ctx: &BoundContext) -> RequestEnvelope {
    let mut payload = op
        .input
        .as_deref()
        .and_then(|input| build_group(model, input, "", ctx))
        .unwrap_or_default();

    if let Some(token_member) = &op.idempotency_token {
        if !payload.contains_key(token_member) {
            let token = Uuid::new_v4().to_string();
            tracing::debug!(operation = %op.name, member = %token_member, "generated idempotency token");
            payload.insert(token_member.clone(), Value::String(token));
        }
    }

    RequestEnvelope {
        operation: op.name.clone(),
        payload,
    }
}

/// `None` means the group is absent: none of its leaves were set.
fn build_group(
    model: &ServiceModel,
    structure: &str,
    prefix: &str,
    ctx: &BoundContext,
) -> Option<Map<String, Value>> {
    let mut group = Map::new();
    for member in model.members(structure) {
        let path = if prefix.is_empty() {
            member.name.clone()
        } else {
            format!("{prefix}.{}", member.name)
        };
        if let Some(Shape::Structure { .. }) = model.shape(&member.shape) {
            if let Some(child) = build_group(model, &member.shape, &path, ctx) {
                group.insert(member.name.clone(), Value::Object(child));
            }
        } else if let Some(value) = ctx.get(&path) {
            group.insert(member.name.clone(), value.clone());
        }
    }
    if group.is_empty() {
        None
    } else {
        Some(group)
    }
}
