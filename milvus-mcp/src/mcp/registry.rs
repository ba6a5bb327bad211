//! Tool registry and dispatcher
//!
//! The registry is an explicit table from tool name to parameter schema and
//! handler, built once at startup. The dispatcher resolves an invocation,
//! validates its arguments, runs the handler and turns whatever happens into
//! a [`ToolResult`].

use super::format::{Output, ToolResult};
use super::protocol::ToolDefinition;
use super::validate::{validate, Args};
use crate::backend::Backend;
use crate::config::Limits;
use crate::error::{Error, Result};
use crate::search::QueryBuilder;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// Semantic type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    /// Integer clamped to `[1, max_limit]`
    Limit,
    /// List of numbers
    Vector,
    /// List of number lists
    VectorList,
    StringList,
    /// JSON object
    Mapping,
    /// Column mapping or list of row mappings
    Data,
}

impl ParamType {
    /// Name used in validation errors
    pub fn name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Limit => "positive integer",
            ParamType::Vector => "list of numbers",
            ParamType::VectorList => "list of number lists",
            ParamType::StringList => "list of strings",
            ParamType::Mapping => "mapping",
            ParamType::Data => "mapping of field to values or list of rows",
        }
    }

    /// JSON Schema fragment
    pub fn json_schema(&self) -> Value {
        match self {
            ParamType::String => json!({ "type": "string" }),
            ParamType::Integer => json!({ "type": "integer" }),
            ParamType::Number => json!({ "type": "number" }),
            ParamType::Boolean => json!({ "type": "boolean" }),
            ParamType::Limit => json!({ "type": "integer", "minimum": 1 }),
            ParamType::Vector => json!({ "type": "array", "items": { "type": "number" } }),
            ParamType::VectorList => json!({
                "type": "array",
                "items": { "type": "array", "items": { "type": "number" } }
            }),
            ParamType::StringList => json!({ "type": "array", "items": { "type": "string" } }),
            ParamType::Mapping => json!({ "type": "object" }),
            ParamType::Data => json!({
                "oneOf": [
                    { "type": "object" },
                    { "type": "array", "items": { "type": "object" } }
                ]
            }),
        }
    }
}

/// Declared tool parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: &'static str,
    /// Alternative argument names accepted from callers
    pub aliases: &'static [&'static str],
}

impl ParamSpec {
    /// A parameter the caller must supply
    pub fn required(name: &'static str, param_type: ParamType, description: &'static str) -> Self {
        Self {
            name,
            param_type,
            required: true,
            default: None,
            description,
            aliases: &[],
        }
    }

    /// A parameter the caller may omit
    pub fn optional(name: &'static str, param_type: ParamType, description: &'static str) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    /// Value substituted when omitted
    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    fn json_schema(&self) -> Value {
        let mut schema = self.param_type.json_schema();
        if let Value::Object(map) = &mut schema {
            map.insert("description".to_string(), json!(self.description));
            if let Some(default) = &self.default {
                map.insert("default".to_string(), default.clone());
            }
        }
        schema
    }
}

/// Tool name, description and ordered parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

impl ToolSpec {
    pub fn new(name: &'static str, description: &'static str, params: Vec<ParamSpec>) -> Self {
        Self {
            name,
            description,
            params,
        }
    }

    /// JSON Schema of the tool's arguments
    pub fn input_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| (p.name.to_string(), p.json_schema()))
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.to_string(),
            description: self.description.to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Shared capabilities handed to every handler
#[derive(Clone)]
pub struct ToolContext {
    pub backend: Arc<dyn Backend>,
    pub limits: Limits,
    pub builder: QueryBuilder,
}

impl ToolContext {
    pub fn new(backend: Arc<dyn Backend>, limits: Limits) -> Self {
        Self {
            backend,
            limits,
            builder: QueryBuilder::new(limits),
        }
    }
}

/// Tool implementation
pub type Handler = for<'a> fn(&'a ToolContext, Args) -> BoxFuture<'a, Result<Output>>;

/// Name -> (spec, handler) table
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<(ToolSpec, Handler)>,
    by_name: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool; names must be unique
    pub fn register(&mut self, spec: ToolSpec, handler: Handler) -> Result<()> {
        if self.by_name.contains_key(spec.name) {
            return Err(Error::Config(format!(
                "tool '{}' is already registered",
                spec.name
            )));
        }
        self.by_name.insert(spec.name, self.tools.len());
        self.tools.push((spec, handler));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<(&ToolSpec, Handler)> {
        self.by_name
            .get(name)
            .and_then(|i| self.tools.get(*i))
            .map(|(spec, handler)| (spec, *handler))
    }

    /// Tool definitions in registration order
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|(spec, _)| spec.definition()).collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|(spec, _)| spec.name).collect()
    }

    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter().map(|(spec, _)| spec)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// A decoded tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Map<String, Value>,
    /// Correlates the call with its response in logs
    pub call_id: Option<Value>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
            call_id: None,
        }
    }

    pub fn with_call_id(mut self, call_id: Option<Value>) -> Self {
        self.call_id = call_id;
        self
    }
}

/// Runs invocations against the registry
pub struct Dispatcher {
    registry: ToolRegistry,
    context: ToolContext,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, context: ToolContext) -> Self {
        Self { registry, context }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Validate, execute and format one invocation
    ///
    /// Never fails: unknown tools, invalid arguments, handler errors and
    /// handler panics all become error results.
    pub async fn dispatch(&self, invocation: ToolInvocation) -> ToolResult {
        let started = Instant::now();
        let call_id = invocation.call_id.clone().unwrap_or(Value::Null);

        let Some((spec, handler)) = self.registry.get(&invocation.name) else {
            tracing::warn!("[{}] Unknown tool '{}'", call_id, invocation.name);
            return ToolResult::failure(&Error::ToolNotFound(invocation.name));
        };

        let args = match validate(spec, invocation.arguments, &self.context.limits) {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!("[{}] {} rejected: {}", call_id, spec.name, e);
                return ToolResult::failure(&e);
            }
        };

        tracing::debug!("[{}] Calling {} on {}", call_id, spec.name, self.context.backend.name());
        let outcome = AssertUnwindSafe(handler(&self.context, args))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(output)) => match output.into_payload() {
                Ok(payload) => ToolResult::success(payload),
                Err(e) => ToolResult::failure(&e),
            },
            Ok(Err(e)) => {
                tracing::warn!("[{}] {} failed: {}", call_id, spec.name, e);
                ToolResult::failure(&e)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("[{}] {} panicked: {}", call_id, spec.name, message);
                ToolResult::internal(format!("tool '{}' panicked: {}", spec.name, message))
            }
        };

        tracing::debug!(
            "[{}] {} finished in {:?} (success: {})",
            call_id,
            spec.name,
            started.elapsed(),
            result.success
        );
        result
    }
}
