//! Declarative service models.
//!
//! A service model lists the shapes (structures, enums, lists, maps and
//! primitives) and operations of one control-plane API. Everything the engine
//! does is driven by these descriptors: parameter names, coercion, nesting,
//! HTTP binding, pagination and confirmation policy.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

const PRIMITIVES: [(&str, Shape); 6] = [
    ("String", Shape::String),
    ("Integer", Shape::Integer),
    ("Long", Shape::Long),
    ("Double", Shape::Double),
    ("Boolean", Shape::Boolean),
    ("Timestamp", Shape::Timestamp),
];

pub(crate) static URI_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// `POST /` with an `X-Amz-Target` header naming the operation.
    Json,
    /// Method and uri template per operation; members bound to uri, query,
    /// header or body.
    RestJson,
}

/// How much damage an operation can do. Compared against the configured
/// confirmation threshold.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl std::str::FromStr for Impact {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Impact::None),
            "low" => Ok(Impact::Low),
            "medium" => Ok(Impact::Medium),
            "high" => Ok(Impact::High),
            other => Err(format!(
                "unknown impact level '{other}' (expected none, low, medium or high)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Shape {
    String,
    Integer,
    Long,
    Double,
    Boolean,
    Timestamp,
    Enum {
        values: Vec<String>,
    },
    List {
        member: String,
    },
    Map {
        value: String,
    },
    Structure {
        #[serde(default)]
        members: Vec<Member>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    #[default]
    Body,
    Uri,
    Query,
    Header,
}

/// A structure member (the model's field descriptor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Wire name.
    pub name: String,
    pub shape: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Overrides the derived parameter name.
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub location: Location,
    /// Query key or header name when it differs from `name`.
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub help: Option<String>,
}

impl Member {
    #[must_use]
    pub fn wire_location_name(&self) -> &str {
        self.location_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpBinding {
    pub method: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub input_token: String,
    pub output_token: String,
    /// Output member holding the page items.
    pub items: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub name: String,
    pub verb: String,
    pub noun: String,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub mutating: bool,
    #[serde(default)]
    pub impact: Impact,
    #[serde(default)]
    pub idempotency_token: Option<String>,
    #[serde(default)]
    pub default_selector: Option<String>,
    /// Parameter echoed by the legacy `--pass-thru` switch.
    #[serde(default)]
    pub pass_thru: Option<String>,
    /// Parameter whose value names the target in confirmation prompts.
    #[serde(default)]
    pub resource_param: Option<String>,
    #[serde(default)]
    pub http: Option<HttpBinding>,
    #[serde(default)]
    pub pagination: Option<Pagination>,

    #[serde(skip)]
    parameters: Vec<ParameterDescriptor>,
}

impl OperationDescriptor {
    /// `Verb-Noun`, the name users see in prompts and help.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}-{} ({})", self.verb, self.noun, self.name)
    }

    #[must_use]
    pub fn command_name(&self) -> String {
        format!("{}-{}", self.verb, self.noun)
    }

    /// Flattened parameters in declaration order.
    #[must_use]
    pub fn parameters(&self) -> &[ParameterDescriptor] {
        &self.parameters
    }

    /// Case-insensitive lookup by canonical name or alias.
    #[must_use]
    pub fn find_parameter(&self, name: &str) -> Option<&ParameterDescriptor> {
        self.parameters.iter().find(|p| p.matches(name))
    }

    #[must_use]
    pub fn parameter_by_path(&self, path: &str) -> Option<&ParameterDescriptor> {
        self.parameters.iter().find(|p| p.path == path)
    }
}

/// How a parameter's raw text is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Integer,
    Double,
    Boolean,
    Timestamp,
    Enum(Vec<String>),
    List(Box<ValueKind>),
    Map(Box<ValueKind>),
    /// Structures that cannot be flattened (inside lists or maps) are taken
    /// as JSON.
    Json,
}

impl ValueKind {
    #[must_use]
    pub fn is_collection(&self) -> bool {
        matches!(self, ValueKind::List(_) | ValueKind::Map(_))
    }

    #[must_use]
    pub fn type_label(&self) -> String {
        match self {
            ValueKind::String => "string".to_string(),
            ValueKind::Integer => "integer".to_string(),
            ValueKind::Double => "number".to_string(),
            ValueKind::Boolean => "bool".to_string(),
            ValueKind::Timestamp => "timestamp".to_string(),
            ValueKind::Enum(values) => values.join("|"),
            ValueKind::List(inner) => format!("list<{}>", inner.type_label()),
            ValueKind::Map(inner) => format!("map<{}>", inner.type_label()),
            ValueKind::Json => "json".to_string(),
        }
    }
}

/// A user-facing parameter, produced by flattening the input shape tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDescriptor {
    /// e.g. `Scheduler_Type`
    pub name: String,
    pub aliases: Vec<String>,
    /// Dot-delimited wire path, e.g. `scheduler.type`
    pub path: String,
    pub kind: ValueKind,
    /// Required along the whole chain of enclosing structures.
    pub required: bool,
    pub help: Option<String>,
}

impl ParameterDescriptor {
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceModel {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub protocol: Protocol,
    #[serde(default)]
    pub target_prefix: Option<String>,
    /// Endpoint template; `{region}` is substituted at call time.
    pub endpoint: String,
    #[serde(default)]
    pub shapes: BTreeMap<String, Shape>,
    #[serde(default)]
    pub operations: Vec<OperationDescriptor>,
}

impl ServiceModel {
    #[must_use]
    pub fn shape(&self, name: &str) -> Option<&Shape> {
        self.shapes.get(name)
    }

    /// Members of a structure shape; empty for anything else.
    #[must_use]
    pub fn members(&self, structure: &str) -> &[Member] {
        match self.shapes.get(structure) {
            Some(Shape::Structure { members }) => members,
            _ => &[],
        }
    }

    #[must_use]
    pub fn is_structure(&self, name: &str) -> bool {
        matches!(self.shapes.get(name), Some(Shape::Structure { .. }))
    }

    pub fn operation(&self, name: &str) -> Result<&OperationDescriptor, ModelError> {
        self.operations
            .iter()
            .find(|op| op.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ModelError::UnknownOperation(name.to_string()))
    }

    /// Find an operation by `Verb` and `Noun`, case-insensitively.
    #[must_use]
    pub fn find_command(&self, verb: &str, noun: &str) -> Option<&OperationDescriptor> {
        self.operations
            .iter()
            .find(|op| op.verb.eq_ignore_ascii_case(verb) && op.noun.eq_ignore_ascii_case(noun))
    }

    #[must_use]
    pub fn endpoint_for(&self, region: &str) -> String {
        self.endpoint.replace("{region}", region)
    }

    /// Resolve the interpretation of a (non-flattened) shape.
    #[must_use]
    pub fn value_kind(&self, shape_name: &str) -> ValueKind {
        match self.shapes.get(shape_name) {
            Some(Shape::String) | None => ValueKind::String,
            Some(Shape::Integer | Shape::Long) => ValueKind::Integer,
            Some(Shape::Double) => ValueKind::Double,
            Some(Shape::Boolean) => ValueKind::Boolean,
            Some(Shape::Timestamp) => ValueKind::Timestamp,
            Some(Shape::Enum { values }) => ValueKind::Enum(values.clone()),
            Some(Shape::List { member }) => ValueKind::List(Box::new(self.value_kind(member))),
            Some(Shape::Map { value }) => ValueKind::Map(Box::new(self.value_kind(value))),
            Some(Shape::Structure { .. }) => ValueKind::Json,
        }
    }

    fn invalid(&self, message: impl Into<String>) -> ModelError {
        ModelError::Invalid {
            service: self.id.clone(),
            message: message.into(),
        }
    }

    fn check_shape_ref(&self, owner: &str, shape: &str) -> Result<(), ModelError> {
        if self.shapes.contains_key(shape) {
            Ok(())
        } else {
            Err(self.invalid(format!("{owner} refers to unknown shape '{shape}'")))
        }
    }

    fn validate_shapes(&self) -> Result<(), ModelError> {
        for (name, shape) in &self.shapes {
            match shape {
                Shape::Enum { values } if values.is_empty() => {
                    return Err(self.invalid(format!("enum '{name}' has no values")));
                }
                Shape::List { member } => self.check_shape_ref(name, member)?,
                Shape::Map { value } => self.check_shape_ref(name, value)?,
                Shape::Structure { members } => {
                    let mut seen = HashSet::new();
                    for m in members {
                        if !seen.insert(m.name.as_str()) {
                            return Err(self.invalid(format!(
                                "structure '{name}' declares member '{}' twice",
                                m.name
                            )));
                        }
                        self.check_shape_ref(&format!("{name}.{}", m.name), &m.shape)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate_operation(&self, op: &OperationDescriptor) -> Result<(), ModelError> {
        for shape in [&op.input, &op.output].into_iter().flatten() {
            if !self.is_structure(shape) {
                return Err(self.invalid(format!(
                    "operation {} uses '{shape}' as input/output but it is not a structure",
                    op.name
                )));
            }
        }
        let input_members = op.input.as_deref().map(|i| self.members(i)).unwrap_or(&[]);
        let output_members = op.output.as_deref().map(|o| self.members(o)).unwrap_or(&[]);

        if let Some(token) = &op.idempotency_token {
            let ok = input_members
                .iter()
                .any(|m| &m.name == token && matches!(self.shape(&m.shape), Some(Shape::String)));
            if !ok {
                return Err(self.invalid(format!(
                    "operation {}: idempotency token '{token}' is not a string member of the input",
                    op.name
                )));
            }
        }

        if let Some(p) = &op.pagination {
            if !input_members.iter().any(|m| m.name == p.input_token) {
                return Err(self.invalid(format!(
                    "operation {}: pagination input token '{}' is not an input member",
                    op.name, p.input_token
                )));
            }
            if !output_members.iter().any(|m| m.name == p.output_token) {
                return Err(self.invalid(format!(
                    "operation {}: pagination output token '{}' is not an output member",
                    op.name, p.output_token
                )));
            }
            let items_is_list = output_members
                .iter()
                .any(|m| m.name == p.items && matches!(self.shape(&m.shape), Some(Shape::List { .. })));
            if !items_is_list {
                return Err(self.invalid(format!(
                    "operation {}: pagination items '{}' is not a list member of the output",
                    op.name, p.items
                )));
            }
        }

        match (self.protocol, &op.http) {
            (Protocol::RestJson, None) => {
                return Err(self.invalid(format!(
                    "operation {} needs an http binding for the rest-json protocol",
                    op.name
                )));
            }
            (_, Some(http)) => {
                if http::Method::from_bytes(http.method.to_ascii_uppercase().as_bytes()).is_err() {
                    return Err(self.invalid(format!(
                        "operation {}: invalid HTTP method '{}'",
                        op.name, http.method
                    )));
                }
                for caps in URI_LABEL_RE.captures_iter(&http.uri) {
                    let label = &caps[1];
                    let bound = input_members
                        .iter()
                        .any(|m| m.name == label && m.location == Location::Uri);
                    if !bound {
                        return Err(self.invalid(format!(
                            "operation {}: uri label '{{{label}}}' has no uri-bound input member",
                            op.name
                        )));
                    }
                }
            }
            (Protocol::Json, None) => {}
        }

        let mut names: HashMap<String, &str> = HashMap::new();
        for p in &op.parameters {
            for n in std::iter::once(&p.name).chain(p.aliases.iter()) {
                if let Some(prev) = names.insert(n.to_ascii_lowercase(), &p.name) {
                    return Err(self.invalid(format!(
                        "operation {}: parameter name '{n}' is used by both {prev} and {}",
                        op.name, p.name
                    )));
                }
            }
        }
        for (what, param) in [("pass_thru", &op.pass_thru), ("resource_param", &op.resource_param)] {
            if let Some(param) = param {
                if op.find_parameter(param).is_none() {
                    return Err(self.invalid(format!(
                        "operation {}: {what} names unknown parameter '{param}'",
                        op.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn flatten_into(
        &self,
        structure: &str,
        path_prefix: &str,
        param_prefix: &str,
        chain_required: bool,
        stack: &mut Vec<String>,
        out: &mut Vec<ParameterDescriptor>,
    ) -> Result<(), ModelError> {
        if stack.iter().any(|s| s == structure) {
            return Err(ModelError::RecursiveShape(structure.to_string()));
        }
        stack.push(structure.to_string());
        for member in self.members(structure) {
            let path = if path_prefix.is_empty() {
                member.name.clone()
            } else {
                format!("{path_prefix}.{}", member.name)
            };
            let name = member.param.clone().unwrap_or_else(|| {
                if param_prefix.is_empty() {
                    pascal_case(&member.name)
                } else {
                    format!("{param_prefix}_{}", pascal_case(&member.name))
                }
            });
            let required = chain_required && member.required;
            if self.is_structure(&member.shape) {
                self.flatten_into(&member.shape, &path, &name, required, stack, out)?;
            } else {
                out.push(ParameterDescriptor {
                    name,
                    aliases: member.aliases.clone(),
                    path,
                    kind: self.value_kind(&member.shape),
                    required,
                    help: member.help.clone(),
                });
            }
        }
        stack.pop();
        Ok(())
    }

    fn flatten(&self, op: &OperationDescriptor) -> Result<Vec<ParameterDescriptor>, ModelError> {
        let mut out = Vec::new();
        if let Some(input) = &op.input {
            self.flatten_into(input, "", "", true, &mut Vec::new(), &mut out)?;
        }
        Ok(out)
    }
}

/// `clusterName` -> `ClusterName`
#[must_use]
pub fn pascal_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Parse a service model from YAML (JSON is accepted too) and check it.
pub fn parse_service_model(text: &str) -> Result<ServiceModel, ModelError> {
    let mut model: ServiceModel = serde_yaml::from_str(text).map_err(|source| ModelError::Parse {
        id: peek_id(text).unwrap_or_else(|| "<unnamed>".to_string()),
        source,
    })?;
    for (name, shape) in PRIMITIVES {
        model.shapes.entry(name.to_string()).or_insert(shape);
    }
    model.validate_shapes()?;

    let mut seen = HashSet::new();
    for i in 0..model.operations.len() {
        let op = &model.operations[i];
        if !seen.insert(op.name.to_ascii_lowercase()) {
            return Err(model.invalid(format!("operation {} is declared twice", op.name)));
        }
        let params = model.flatten(op)?;
        model.operations[i].parameters = params;
        model.validate_operation(&model.operations[i])?;
    }
    tracing::debug!(
        service = %model.id,
        operations = model.operations.len(),
        shapes = model.shapes.len(),
        "loaded service model"
    );
    Ok(model)
}

fn peek_id(text: &str) -> Option<String> {
    let value: serde_yaml::Value = serde_yaml::from_str(text).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}

struct Entry {
    source: Cow<'static, str>,
    parsed: OnceCell<Arc<ServiceModel>>,
}

/// Known service models, parsed on first use and kept for the process.
#[derive(Default)]
pub struct ModelRegistry {
    entries: BTreeMap<String, Entry>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register model text compiled into the binary.
    pub fn register_embedded(&mut self, id: &str, text: &'static str) {
        self.insert_source(id, Cow::Borrowed(text));
    }

    /// Register model text read at runtime. A later registration under the
    /// same id replaces the earlier one.
    pub fn register_source(&mut self, id: &str, text: String) {
        self.insert_source(id, Cow::Owned(text));
    }

    /// Parse `text` now and register it under the id it declares.
    pub fn register_parsed(&mut self, text: String) -> Result<String, ModelError> {
        let model = parse_service_model(&text)?;
        let id = model.id.clone();
        let parsed = OnceCell::new();
        let _ = parsed.set(Arc::new(model));
        self.entries.insert(
            id.to_ascii_lowercase(),
            Entry {
                source: Cow::Owned(text),
                parsed,
            },
        );
        Ok(id)
    }

    fn insert_source(&mut self, id: &str, source: Cow<'static, str>) {
        self.entries.insert(
            id.to_ascii_lowercase(),
            Entry {
                source,
                parsed: OnceCell::new(),
            },
        );
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Return the model for `id`, parsing it on first use.
    pub fn load(&self, id: &str) -> Result<Arc<ServiceModel>, ModelError> {
        let entry = self
            .entries
            .get(&id.to_ascii_lowercase())
            .ok_or_else(|| ModelError::ModelNotFound(id.to_string()))?;
        entry
            .parsed
            .get_or_try_init(|| parse_service_model(&entry.source).map(Arc::new))
            .cloned()
    }

    pub fn load_all(&self) -> Result<Vec<Arc<ServiceModel>>, ModelError> {
        self.entries.keys().map(|id| self.load(id)).collect()
    }
}
