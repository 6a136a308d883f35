use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use schemars::schema::{InstanceType, RootSchema, Schema, SingleOrVec};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};

use crate::{ToolError, ToolSpec, Value};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Enum { values: Vec<String> },
    Any,
}

impl ParameterKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParameterKind::String => value.is_string(),
            ParameterKind::Integer => value.is_i64() || value.is_u64(),
            ParameterKind::Number => value.is_number(),
            ParameterKind::Boolean => value.is_boolean(),
            ParameterKind::Array => value.is_array(),
            ParameterKind::Object => value.is_object(),
            ParameterKind::Enum { values } => value
                .as_str()
                .map(|v| values.iter().any(|allowed| allowed == v))
                .unwrap_or(false),
            ParameterKind::Any => true,
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            ParameterKind::String => json!({ "type": "string" }),
            ParameterKind::Integer => json!({ "type": "integer" }),
            ParameterKind::Number => json!({ "type": "number" }),
            ParameterKind::Boolean => json!({ "type": "boolean" }),
            ParameterKind::Array => json!({ "type": "array" }),
            ParameterKind::Object => json!({ "type": "object" }),
            ParameterKind::Enum { values } => json!({ "type": "string", "enum": values }),
            ParameterKind::Any => json!({}),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub kind: ParameterKind,
    #[serde(default)]
    pub description: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn required(
        name: impl Into<String>,
        kind: ParameterKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        kind: ParameterKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: false,
        }
    }
}

/// Declared shape of a tool: its name and the arguments it accepts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Checks decoded arguments against the declared parameters. Unknown
    /// arguments are tolerated; missing required ones and kind mismatches are
    /// not.
    pub fn validate_args(&self, args: &Value) -> Result<(), ToolError> {
        let object = match args {
            Value::Object(object) => object,
            Value::Null if self.parameters.iter().all(|p| !p.required) => return Ok(()),
            other => {
                return Err(ToolError::InvalidArgs(format!(
                    "expected a JSON object for '{}', got {other}",
                    self.name
                )))
            }
        };

        for parameter in &self.parameters {
            match object.get(&parameter.name) {
                None | Some(Value::Null) if parameter.required => {
                    return Err(ToolError::InvalidArgs(format!(
                        "missing required argument '{}'",
                        parameter.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) if !parameter.kind.accepts(value) => {
                    return Err(ToolError::InvalidArgs(format!(
                        "argument '{}' does not match declared kind {:?}",
                        parameter.name, parameter.kind
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Same argument names, kinds and required flags.
    pub fn same_shape(&self, other: &ToolDescriptor) -> bool {
        if self.parameters.len() != other.parameters.len() {
            return false;
        }
        self.parameters.iter().all(|parameter| {
            other.parameters.iter().any(|candidate| {
                candidate.name == parameter.name
                    && candidate.kind == parameter.kind
                    && candidate.required == parameter.required
            })
        })
    }

    pub fn to_spec(&self) -> ToolSpec {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for parameter in &self.parameters {
            let mut schema = parameter.kind.json_schema();
            if !parameter.description.is_empty() {
                if let Value::Object(map) = &mut schema {
                    map.insert(
                        "description".to_string(),
                        Value::String(parameter.description.clone()),
                    );
                }
            }
            properties.insert(parameter.name.clone(), schema);
            if parameter.required {
                required.push(Value::String(parameter.name.clone()));
            }
        }
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    /// Derives the parameter list from a schemars root schema of an arguments
    /// struct.
    pub fn from_schema(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: &RootSchema,
    ) -> Self {
        let mut descriptor = Self::new(name, description);
        let Some(object) = schema.schema.object.as_ref() else {
            return descriptor;
        };
        for (field, field_schema) in &object.properties {
            let (kind, description) = match field_schema {
                Schema::Object(obj) => {
                    let kind = if let Some(values) = &obj.enum_values {
                        ParameterKind::Enum {
                            values: values
                                .iter()
                                .filter_map(|v| v.as_str().map(str::to_string))
                                .collect(),
                        }
                    } else if obj.reference.is_some() {
                        ParameterKind::Object
                    } else {
                        kind_of(obj.instance_type.as_ref())
                    };
                    let description = obj
                        .metadata
                        .as_ref()
                        .and_then(|m| m.description.clone())
                        .unwrap_or_default();
                    (kind, description)
                }
                Schema::Bool(_) => (ParameterKind::Any, String::new()),
            };
            descriptor.parameters.push(ToolParameter {
                name: field.clone(),
                kind,
                description,
                required: object.required.contains(field),
            });
        }
        descriptor
    }
}

fn kind_of(instance: Option<&SingleOrVec<InstanceType>>) -> ParameterKind {
    let single = match instance {
        Some(SingleOrVec::Single(kind)) => Some(**kind),
        Some(SingleOrVec::Vec(kinds)) => kinds
            .iter()
            .copied()
            .find(|kind| *kind != InstanceType::Null),
        None => None,
    };
    match single {
        Some(InstanceType::String) => ParameterKind::String,
        Some(InstanceType::Integer) => ParameterKind::Integer,
        Some(InstanceType::Number) => ParameterKind::Number,
        Some(InstanceType::Boolean) => ParameterKind::Boolean,
        Some(InstanceType::Array) => ParameterKind::Array,
        Some(InstanceType::Object) => ParameterKind::Object,
        Some(InstanceType::Null) | None => ParameterKind::Any,
    }
}

/// Renders a tool result as the text stored in the conversation.
pub fn encode_result(value: &Value) -> Result<String, ToolError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        other => serde_json::to_string(other).map_err(|err| ToolError::Encoding(err.to_string())),
    }
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn execute(&self, args: Value) -> Result<Value, ToolError>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }
}

type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

/// A tool assembled from a descriptor and a closure.
///
/// ```rust
/// use trellis_core::{FunctionTool, ParameterKind, ToolParameter};
///
/// let echo = FunctionTool::builder("echo", "Echoes the text argument")
///     .parameter(ToolParameter::required("text", ParameterKind::String, "text to echo"))
///     .handler(|args| async move { Ok(args["text"].clone()) });
/// assert_eq!(echo.descriptor_ref().parameters.len(), 1);
/// ```
#[derive(Clone)]
pub struct FunctionTool {
    descriptor: ToolDescriptor,
    handler: ToolHandler,
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl FunctionTool {
    pub fn builder(name: impl Into<String>, description: impl Into<String>) -> FunctionToolBuilder {
        FunctionToolBuilder {
            descriptor: ToolDescriptor::new(name, description),
        }
    }

    pub fn descriptor_ref(&self) -> &ToolDescriptor {
        &self.descriptor
    }
}

pub struct FunctionToolBuilder {
    descriptor: ToolDescriptor,
}

impl FunctionToolBuilder {
    pub fn parameter(mut self, parameter: ToolParameter) -> Self {
        self.descriptor.parameters.push(parameter);
        self
    }

    pub fn handler<F, Fut>(self, handler: F) -> FunctionTool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        FunctionTool {
            descriptor: self.descriptor,
            handler: Arc::new(move |args| handler(args).boxed()),
        }
    }
}

#[async_trait::async_trait]
impl Tool for FunctionTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        (self.handler)(args).await
    }
}

/// Statically typed tool whose descriptor comes from the arguments' schema.
#[async_trait::async_trait]
pub trait TypedTool: Send + Sync + 'static {
    type Args: DeserializeOwned + JsonSchema + Send;
    type Output: Serialize + Send;

    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    async fn run(&self, args: Self::Args) -> Result<Self::Output, ToolError>;
}

pub struct TypedToolAdapter<T> {
    tool: T,
    descriptor: ToolDescriptor,
}

impl<T: TypedTool> TypedToolAdapter<T> {
    pub fn new(tool: T) -> Self {
        let schema = schemars::schema_for!(T::Args);
        Self {
            tool,
            descriptor: ToolDescriptor::from_schema(T::NAME, T::DESCRIPTION, &schema),
        }
    }
}

#[async_trait::async_trait]
impl<T: TypedTool> Tool for TypedToolAdapter<T> {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let typed = serde_json::from_value::<T::Args>(args)
            .map_err(|err| ToolError::InvalidArgs(err.to_string()))?;
        let output = self.tool.run(typed).await?;
        serde_json::to_value(output).map_err(|err| ToolError::Encoding(err.to_string()))
    }
}
