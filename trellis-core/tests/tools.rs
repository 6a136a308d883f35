use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use trellis_core::{
    encode_result, FunctionTool, ParameterKind, Tool, ToolDescriptor, ToolError, ToolParameter,
    ToolRegistry, TrellisError, TypedTool, TypedToolAdapter,
};

fn echo() -> FunctionTool {
    FunctionTool::builder("echo", "Echoes text")
        .parameter(ToolParameter::required(
            "text",
            ParameterKind::String,
            "text to echo",
        ))
        .parameter(ToolParameter::optional(
            "times",
            ParameterKind::Integer,
            "repeat count",
        ))
        .handler(|args| async move { Ok(args["text"].clone()) })
}

#[derive(Deserialize, JsonSchema)]
struct AddArgs {
    /// left operand
    a: i64,
    b: i64,
    label: Option<String>,
}

struct Add;

#[async_trait::async_trait]
impl TypedTool for Add {
    type Args = AddArgs;
    type Output = i64;

    const NAME: &'static str = "add";
    const DESCRIPTION: &'static str = "Adds two integers";

    async fn run(&self, args: AddArgs) -> Result<i64, ToolError> {
        let _ = args.label;
        Ok(args.a + args.b)
    }
}

#[test]
fn validation_rejects_missing_and_mistyped_arguments() {
    let tool = echo();
    let descriptor = tool.descriptor();
    assert!(descriptor.validate_args(&json!({"text": "hi"})).is_ok());
    assert!(descriptor
        .validate_args(&json!({"text": "hi", "extra": true}))
        .is_ok());

    let missing = descriptor.validate_args(&json!({"times": 2})).unwrap_err();
    assert!(missing.is_validation());

    let mistyped = descriptor.validate_args(&json!({"text": 3})).unwrap_err();
    assert!(mistyped.to_string().contains("text"));

    assert!(descriptor.validate_args(&json!("hi")).is_err());
}

#[test]
fn enum_parameters_only_accept_listed_values() {
    let descriptor = ToolDescriptor::new("mode", "sets mode").with_parameter(
        ToolParameter::required(
            "mode",
            ParameterKind::Enum {
                values: vec!["fast".to_string(), "slow".to_string()],
            },
            "",
        ),
    );
    assert!(descriptor.validate_args(&json!({"mode": "fast"})).is_ok());
    assert!(descriptor.validate_args(&json!({"mode": "medium"})).is_err());
}

#[test]
fn spec_lists_required_parameters() {
    let spec = echo().descriptor().to_spec();
    assert_eq!(spec.name, "echo");
    assert_eq!(spec.parameters["required"], json!(["text"]));
    assert_eq!(spec.parameters["properties"]["times"]["type"], "integer");
}

#[tokio::test]
async fn function_tool_runs_its_handler() {
    let out = echo().execute(json!({"text": "hey"})).await.expect("run");
    assert_eq!(out, json!("hey"));
}

#[tokio::test]
async fn typed_tool_derives_descriptor_from_schema() {
    let tool = TypedToolAdapter::new(Add);
    let descriptor = tool.descriptor();
    assert_eq!(descriptor.name, "add");

    let a = descriptor
        .parameters
        .iter()
        .find(|p| p.name == "a")
        .expect("a");
    assert_eq!(a.kind, ParameterKind::Integer);
    assert!(a.required);
    assert_eq!(a.description, "left operand");

    let label = descriptor
        .parameters
        .iter()
        .find(|p| p.name == "label")
        .expect("label");
    assert!(!label.required);
    assert_eq!(label.kind, ParameterKind::String);

    let out = tool.execute(json!({"a": 2, "b": 3})).await.expect("add");
    assert_eq!(out, json!(5));

    let err = tool.execute(json!({"a": "two"})).await.unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn same_shape_ignores_order_and_descriptions() {
    let forward = ToolDescriptor::new("create", "")
        .with_parameter(ToolParameter::required("id", ParameterKind::String, "x"))
        .with_parameter(ToolParameter::optional("n", ParameterKind::Integer, ""));
    let inverse = ToolDescriptor::new("delete", "")
        .with_parameter(ToolParameter::optional("n", ParameterKind::Integer, "y"))
        .with_parameter(ToolParameter::required("id", ParameterKind::String, ""));
    assert!(forward.same_shape(&inverse));

    let other = ToolDescriptor::new("delete", "")
        .with_parameter(ToolParameter::required("id", ParameterKind::Integer, ""));
    assert!(!forward.same_shape(&other));
}

#[test]
fn results_encode_strings_verbatim() {
    assert_eq!(encode_result(&json!("plain")).unwrap(), "plain");
    assert_eq!(encode_result(&json!({"k": 1})).unwrap(), r#"{"k":1}"#);
}

#[test]
fn registry_rejects_duplicates_and_builds_subsets() {
    let duplicate = ToolRegistry::builder()
        .register(echo())
        .register(echo())
        .build();
    assert!(matches!(duplicate, Err(TrellisError::DuplicateTool(name)) if name == "echo"));

    let registry = ToolRegistry::builder()
        .register(echo())
        .register(TypedToolAdapter::new(Add))
        .build()
        .expect("registry");
    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["echo", "add"]);
    assert_eq!(registry.specs().len(), 2);

    let scoped = registry.subset(&["add"]).expect("subset");
    assert!(scoped.contains("add"));
    assert!(!scoped.contains("echo"));

    assert!(matches!(
        registry.subset(&["missing"]),
        Err(TrellisError::UnknownTool(_))
    ));
}
