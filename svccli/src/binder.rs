//! Binding raw user input onto an operation's flattened parameters.

use std::collections::{BTreeMap, HashMap};

use chrono::DateTime;
use serde_json::{Map, Number, Value};

use crate::error::ValidationError;
use crate::model::{OperationDescriptor, ParameterDescriptor, ServiceModel, Shape, ValueKind};

/// A value as supplied by the user, before coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// A single command-line value.
    Text(String),
    /// A repeated command-line flag.
    List(Vec<String>),
    /// A value read from an input file.
    Json(Value),
}

/// Named raw inputs in the order they were supplied. Names may be canonical
/// parameter names or aliases, in any case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawInputs {
    entries: Vec<(String, RawValue)>,
}

impl RawInputs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: RawValue) {
        self.entries.push((name.into(), value));
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, RawValue::Text(value.into()));
        self
    }

    #[must_use]
    pub fn with_list<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(name, RawValue::List(values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inputs from a JSON/YAML document whose top level is an object keyed by
    /// parameter name.
    pub fn from_document(doc: &Value) -> Result<Self, ValidationError> {
        let Value::Object(map) = doc else {
            return Err(ValidationError::InvalidValue {
                param: "input file".to_string(),
                value: doc.to_string(),
                reason: "expected an object keyed by parameter name".to_string(),
            });
        };
        let mut inputs = Self::new();
        for (k, v) in map {
            inputs.push(k.clone(), RawValue::Json(v.clone()));
        }
        Ok(inputs)
    }

    /// Append `other`, keeping entries already present here when both name
    /// the same parameter. Used to let command-line flags override an input
    /// file.
    pub fn merge_under(&mut self, other: RawInputs, op: &OperationDescriptor) {
        for (name, value) in other.entries {
            let target = op.find_parameter(&name).map(|p| p.name.as_str());
            let shadowed = self.entries.iter().any(|(existing, _)| {
                existing.eq_ignore_ascii_case(&name)
                    || (target.is_some() && op.find_parameter(existing).map(|p| p.name.as_str()) == target)
            });
            if !shadowed {
                self.entries.push((name, value));
            }
        }
    }
}

/// Resolved values keyed by dot-delimited field path. Built fresh for each
/// invocation and owned by it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundContext {
    values: BTreeMap<String, Value>,
}

impl BoundContext {
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.values.contains_key(path)
    }

    /// True if any field below `group_path` has been set.
    #[must_use]
    pub fn is_group_populated(&self, group_path: &str) -> bool {
        let prefix = format!("{group_path}.");
        self.values
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn insert(&mut self, path: impl Into<String>, value: Value) {
        self.values.insert(path.into(), value);
    }
}

/// Map `inputs` onto the parameters of `op`, coercing and validating each
/// value and enforcing required fields.
pub fn bind(
    model: &ServiceModel,
    op: &OperationDescriptor,
    inputs: &RawInputs,
) -> Result<BoundContext, ValidationError> {
    let mut ctx = BoundContext::default();
    let mut supplied: HashMap<&str, &str> = HashMap::new();

    for (name, raw) in inputs.iter() {
        let param = op
            .find_parameter(name)
            .ok_or_else(|| ValidationError::UnknownParameter(name.to_string()))?;
        if matches!(raw, RawValue::Json(Value::Null)) {
            continue;
        }
        if supplied.insert(param.name.as_str(), name).is_some() {
            return Err(ValidationError::Duplicate(param.name.clone()));
        }
        let value = coerce(param, raw)?;
        ctx.insert(param.path.clone(), value);
    }

    if let Some(input) = &op.input {
        check_required(model, op, input, "", true, &ctx)?;
    }
    tracing::debug!(operation = %op.name, bound = ctx.len(), "bound parameters");
    Ok(ctx)
}

/// A required member is enforced when its enclosing group is required or
/// has been partly populated.
fn check_required(
    model: &ServiceModel,
    op: &OperationDescriptor,
    structure: &str,
    prefix: &str,
    enforce: bool,
    ctx: &BoundContext,
) -> Result<(), ValidationError> {
    for member in model.members(structure) {
        let path = if prefix.is_empty() {
            member.name.clone()
        } else {
            format!("{prefix}.{}", member.name)
        };
        if let Some(Shape::Structure { .. }) = model.shape(&member.shape) {
            let populated = ctx.is_group_populated(&path);
            if populated || (enforce && member.required) {
                check_required(model, op, &member.shape, &path, true, ctx)?;
            }
        } else if enforce && member.required && !ctx.contains(&path) {
            let param = op
                .parameter_by_path(&path)
                .map_or_else(|| path.clone(), |p| p.name.clone());
            return Err(ValidationError::MissingRequiredField { param, path });
        }
    }
    Ok(())
}

fn coerce(param: &ParameterDescriptor, raw: &RawValue) -> Result<Value, ValidationError> {
    let name = param.name.as_str();
    match (&param.kind, raw) {
        (ValueKind::List(inner), RawValue::Text(s)) => match parse_json_if(s, '[') {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| coerce_json(name, inner, v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            _ => Ok(Value::Array(vec![coerce_text(name, inner, s)?])),
        },
        (ValueKind::List(inner), RawValue::List(items)) => items
            .iter()
            .map(|s| coerce_text(name, inner, s))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        (ValueKind::Map(inner), RawValue::Text(s)) => {
            let mut out = Map::new();
            add_map_entries(name, inner, s, &mut out)?;
            Ok(Value::Object(out))
        }
        (ValueKind::Map(inner), RawValue::List(items)) => {
            let mut out = Map::new();
            for s in items {
                add_map_entries(name, inner, s, &mut out)?;
            }
            Ok(Value::Object(out))
        }
        (kind, RawValue::Text(s)) => coerce_text(name, kind, s),
        (kind, RawValue::List(items)) => match items.as_slice() {
            [single] => coerce_text(name, kind, single),
            _ => Err(invalid(name, &items.join(","), "expects a single value")),
        },
        (ValueKind::List(inner), RawValue::Json(v)) if !v.is_array() => {
            Ok(Value::Array(vec![coerce_json(name, inner, v)?]))
        }
        (kind, RawValue::Json(v)) => coerce_json(name, kind, v),
    }
}

fn parse_json_if(s: &str, opener: char) -> Option<Value> {
    if s.trim_start().starts_with(opener) {
        serde_json::from_str(s).ok()
    } else {
        None
    }
}

fn add_map_entries(
    name: &str,
    inner: &ValueKind,
    s: &str,
    out: &mut Map<String, Value>,
) -> Result<(), ValidationError> {
    if let Some(Value::Object(obj)) = parse_json_if(s, '{') {
        for (k, v) in &obj {
            out.insert(k.clone(), coerce_json(name, inner, v)?);
        }
        return Ok(());
    }
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| invalid(name, s, "expected key=value or a JSON object"))?;
    let key = k.trim();
    if key.is_empty() {
        return Err(invalid(name, s, "map key is empty"));
    }
    out.insert(key.to_string(), coerce_text(name, inner, v.trim())?);
    Ok(())
}

fn invalid(param: &str, value: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        param: param.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn coerce_text(param: &str, kind: &ValueKind, s: &str) -> Result<Value, ValidationError> {
    match kind {
        ValueKind::String => Ok(Value::String(s.to_string())),
        ValueKind::Integer => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid(param, s, "expected an integer")),
        ValueKind::Double => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid(param, s, "expected a number")),
        ValueKind::Boolean => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "$true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "$false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(invalid(param, s, "expected true or false")),
        },
        ValueKind::Timestamp => parse_timestamp(s).ok_or_else(|| {
            invalid(param, s, "expected an RFC 3339 timestamp or epoch seconds")
        }),
        ValueKind::Enum(values) => values
            .iter()
            .find(|v| v.eq_ignore_ascii_case(s.trim()))
            .map(|v| Value::String(v.clone()))
            .ok_or_else(|| ValidationError::InvalidEnumValue {
                param: param.to_string(),
                value: s.to_string(),
                allowed: values.clone(),
            }),
        ValueKind::List(_) | ValueKind::Map(_) | ValueKind::Json => {
            let v: Value =
                serde_json::from_str(s).map_err(|e| invalid(param, s, format!("invalid JSON: {e}")))?;
            coerce_json(param, kind, &v)
        }
    }
}

fn parse_timestamp(s: &str) -> Option<Value> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return Some(Value::from(secs));
    }
    let dt = DateTime::parse_from_rfc3339(s).ok()?;
    let millis = dt.timestamp_millis();
    if millis % 1000 == 0 {
        Some(Value::from(dt.timestamp()))
    } else {
        #[allow(clippy::cast_precision_loss)]
        let secs = millis as f64 / 1000.0;
        Number::from_f64(secs).map(Value::Number)
    }
}

fn coerce_json(param: &str, kind: &ValueKind, v: &Value) -> Result<Value, ValidationError> {
    match (kind, v) {
        (ValueKind::Json, _) => Ok(v.clone()),
        (ValueKind::List(inner), Value::Array(items)) => items
            .iter()
            .map(|item| coerce_json(param, inner, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        (ValueKind::Map(inner), Value::Object(obj)) => {
            let mut out = Map::new();
            for (k, item) in obj {
                out.insert(k.clone(), coerce_json(param, inner, item)?);
            }
            Ok(Value::Object(out))
        }
        (ValueKind::List(_) | ValueKind::Map(_), other) => Err(invalid(
            param,
            &other.to_string(),
            format!("expected a {}", kind.type_label()),
        )),
        (ValueKind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(v.clone()),
        (ValueKind::Double | ValueKind::Timestamp, Value::Number(_)) => Ok(v.clone()),
        (ValueKind::Boolean, Value::Bool(_)) => Ok(v.clone()),
        (ValueKind::String, Value::Number(_) | Value::Bool(_)) => Ok(Value::String(v.to_string())),
        (_, Value::String(s)) => coerce_text(param, kind, s),
        (_, other) => Err(invalid(
            param,
            &other.to_string(),
            format!("expected {}", kind.type_label()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_service_model;
    use crate::model::tests::CLUSTER_MODEL;

    fn model() -> ServiceModel {
        parse_service_model(CLUSTER_MODEL).unwrap()
    }

    fn base_inputs() -> RawInputs {
        RawInputs::new()
            .with("ClusterName", "test")
            .with("Size", "SMALL")
            .with("Scheduler_Type", "SLURM")
            .with("Scheduler_Version", "23.11")
    }

    // ==================== bind tests ====================

    #[test]
    fn test_bind_resolves_paths() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let ctx = bind(&model, op, &base_inputs()).unwrap();
        assert_eq!(ctx.get("clusterName"), Some(&Value::from("test")));
        assert_eq!(ctx.get("scheduler.type"), Some(&Value::from("SLURM")));
        assert_eq!(ctx.get("scheduler.version"), Some(&Value::from("23.11")));
        assert!(ctx.is_group_populated("scheduler"));
        assert!(!ctx.is_group_populated("networking"));
    }

    #[test]
    fn test_alias_equivalence() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let canonical = bind(&model, op, &base_inputs()).unwrap();
        let via_alias = RawInputs::new()
            .with("name", "test")
            .with("size", "SMALL")
            .with("SCHEDULER_TYPE", "SLURM")
            .with("Scheduler_Version", "23.11");
        assert_eq!(bind(&model, op, &via_alias).unwrap(), canonical);
    }

    #[test]
    fn test_missing_required_hard_fails() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let inputs = RawInputs::new()
            .with("ClusterName", "test")
            .with("Scheduler_Type", "SLURM")
            .with("Scheduler_Version", "23.11");
        let err = bind(&model, op, &inputs).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingRequiredField {
                param: "Size".to_string(),
                path: "size".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_nested_required_reports_flattened_name() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let inputs = RawInputs::new()
            .with("ClusterName", "test")
            .with("Size", "SMALL")
            .with("Scheduler_Type", "SLURM");
        let err = bind(&model, op, &inputs).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MissingRequiredField { ref param, ref path }
                if param == "Scheduler_Version" && path == "scheduler.version"
        ));
    }

    #[test]
    fn test_required_inside_optional_group_only_when_populated() {
        let yaml = CLUSTER_MODEL.replace(
            "{ name: scheduler, shape: SchedulerRequest, required: true }",
            "{ name: scheduler, shape: SchedulerRequest }",
        );
        let model = parse_service_model(&yaml).unwrap();
        let op = model.operation("CreateCluster").unwrap();

        let without_group = RawInputs::new().with("ClusterName", "x").with("Size", "LARGE");
        assert!(bind(&model, op, &without_group).is_ok());

        let partial = without_group.with("Scheduler_Version", "23.11");
        let err = bind(&model, op, &partial).unwrap_err();
        assert!(matches!(err, ValidationError::MissingRequiredField { ref param, .. } if param == "Scheduler_Type"));
    }

    #[test]
    fn test_invalid_enum_value() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let inputs = base_inputs().with("Tags", "a=b");
        let mut bad = RawInputs::new();
        for (k, v) in inputs.iter() {
            if k == "Size" {
                bad.push(k, RawValue::Text("HUGE".to_string()));
            } else {
                bad.push(k, v.clone());
            }
        }
        let err = bind(&model, op, &bad).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidEnumValue { ref value, .. } if value == "HUGE"));
    }

    #[test]
    fn test_enum_case_is_normalised() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let inputs = RawInputs::new()
            .with("ClusterName", "test")
            .with("Size", "small")
            .with("Scheduler_Type", "slurm")
            .with("Scheduler_Version", "23.11");
        let ctx = bind(&model, op, &inputs).unwrap();
        assert_eq!(ctx.get("size"), Some(&Value::from("SMALL")));
    }

    #[test]
    fn test_unknown_parameter() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let err = bind(&model, op, &base_inputs().with("Colour", "blue")).unwrap_err();
        assert_eq!(err, ValidationError::UnknownParameter("Colour".to_string()));
    }

    #[test]
    fn test_duplicate_via_alias() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let err = bind(&model, op, &base_inputs().with("Name", "other")).unwrap_err();
        assert_eq!(err, ValidationError::Duplicate("ClusterName".to_string()));
    }

    #[test]
    fn test_list_from_repeated_flag_and_json() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let inputs = base_inputs()
            .with_list("Networking_SubnetId", ["subnet-1", "subnet-2"])
            .with("Networking_SecurityGroupId", r#"["sg-1","sg-2"]"#);
        let ctx = bind(&model, op, &inputs).unwrap();
        assert_eq!(
            ctx.get("networking.subnetIds"),
            Some(&serde_json::json!(["subnet-1", "subnet-2"]))
        );
        assert_eq!(
            ctx.get("networking.securityGroupIds"),
            Some(&serde_json::json!(["sg-1", "sg-2"]))
        );
    }

    #[test]
    fn test_single_text_becomes_one_element_list() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let ctx = bind(&model, op, &base_inputs().with("Networking_SubnetId", "subnet-1")).unwrap();
        assert_eq!(ctx.get("networking.subnetIds"), Some(&serde_json::json!(["subnet-1"])));
    }

    #[test]
    fn test_map_from_pairs_and_json() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let ctx = bind(
            &model,
            op,
            &base_inputs().with_list("Tags", ["team=hpc", r#"{"env":"dev"}"#]),
        )
        .unwrap();
        assert_eq!(ctx.get("tags"), Some(&serde_json::json!({"team": "hpc", "env": "dev"})));
    }

    #[test]
    fn test_map_entry_without_equals_is_rejected() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let err = bind(&model, op, &base_inputs().with("Tags", "team")).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { ref param, .. } if param == "Tags"));
    }

    #[test]
    fn test_scalar_rejects_multiple_values() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let inputs = RawInputs::new()
            .with_list("ClusterName", ["a", "b"])
            .with("Size", "SMALL")
            .with("Scheduler_Type", "SLURM")
            .with("Scheduler_Version", "23.11");
        assert!(bind(&model, op, &inputs).is_err());
    }

    #[test]
    fn test_from_document_and_null_is_unset() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let doc = serde_json::json!({
            "ClusterName": "doc",
            "Size": "MEDIUM",
            "Scheduler_Type": "SLURM",
            "Scheduler_Version": 23.11,
            "Tags": {"a": "b"},
            "ClientToken": null
        });
        let inputs = RawInputs::from_document(&doc).unwrap();
        let ctx = bind(&model, op, &inputs).unwrap();
        assert_eq!(ctx.get("scheduler.version"), Some(&Value::from("23.11")));
        assert!(!ctx.contains("clientToken"));
    }

    #[test]
    fn test_from_document_rejects_non_object() {
        assert!(RawInputs::from_document(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_merge_under_prefers_existing() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let mut cli = RawInputs::new().with("Name", "from-cli");
        let file = RawInputs::new().with("ClusterName", "from-file").with("Size", "SMALL");
        cli.merge_under(file, op);
        assert_eq!(cli.len(), 2);
        assert!(cli.iter().any(|(k, v)| k == "Name" && *v == RawValue::Text("from-cli".to_string())));
    }

    #[test]
    fn test_bound_values_are_independent_of_inputs() {
        let model = model();
        let op = model.operation("CreateCluster").unwrap();
        let mut inputs = base_inputs().with_list("Networking_SubnetId", ["subnet-1"]);
        let ctx = bind(&model, op, &inputs).unwrap();
        inputs.push("Extra", RawValue::Text("x".to_string()));
        if let Some((_, RawValue::List(items))) = inputs.entries.iter_mut().find(|(k, _)| k == "Networking_SubnetId") {
            items.push("subnet-2".to_string());
        }
        assert_eq!(ctx.get("networking.subnetIds"), Some(&serde_json::json!(["subnet-1"])));
    }

    // ==================== coercion tests ====================

    #[test]
    fn test_coerce_integer_and_boolean() {
        assert_eq!(coerce_text("N", &ValueKind::Integer, " 42 ").unwrap(), Value::from(42));
        assert!(coerce_text("N", &ValueKind::Integer, "4.2").is_err());
        assert_eq!(coerce_text("B", &ValueKind::Boolean, "$true").unwrap(), Value::Bool(true));
        assert_eq!(coerce_text("B", &ValueKind::Boolean, "no").unwrap(), Value::Bool(false));
        assert!(coerce_text("B", &ValueKind::Boolean, "maybe").is_err());
    }

    #[test]
    fn test_coerce_timestamp() {
        assert_eq!(
            coerce_text("T", &ValueKind::Timestamp, "2024-01-01T00:00:00Z").unwrap(),
            Value::from(1_704_067_200)
        );
        assert_eq!(
            coerce_text("T", &ValueKind::Timestamp, "2024-01-01T00:00:00.500Z").unwrap(),
            serde_json::json!(1_704_067_200.5)
        );
        assert_eq!(coerce_text("T", &ValueKind::Timestamp, "17").unwrap(), Value::from(17));
        assert!(coerce_text("T", &ValueKind::Timestamp, "yesterday").is_err());
    }

    #[test]
    fn test_coerce_list_of_structures_from_json() {
        let kind = ValueKind::List(Box::new(ValueKind::Json));
        let param = ParameterDescriptor {
            name: "SlurmCustomSetting".to_string(),
            aliases: vec![],
            path: "slurmConfiguration.slurmCustomSettings".to_string(),
            kind,
            required: false,
            help: None,
        };
        let raw = RawValue::Text(r#"[{"parameterName":"MaxJobCount","parameterValue":"100"}]"#.to_string());
        let v = coerce(&param, &raw).unwrap();
        assert_eq!(v[0]["parameterName"], "MaxJobCount");

        let single = RawValue::Text(r#"{"parameterName":"A","parameterValue":"1"}"#.to_string());
        let v = coerce(&param, &single).unwrap();
        assert!(v.is_array());
        assert_eq!(v.as_array().unwrap().len(), 1);
    }
}
