use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use trio_types::{FileMap, ToolResult, ToolSchema};

pub const CREATE_OR_UPDATE_FILES: &str = "create_or_update_files";
pub const READ_FILES: &str = "read_files";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },
}

impl ToolError {
    fn invalid(tool: &str, reason: impl Into<String>) -> Self {
        ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}

/// Tools are pure functions of their arguments and the current file map.
/// Writes are reported through `ToolResult::state_files` and merged by the caller.
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    fn execute(&self, args: &Value, files: &FileMap) -> Result<ToolResult, ToolError>;
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, Arc<dyn Tool>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        map.insert(CREATE_OR_UPDATE_FILES.to_string(), Arc::new(CreateOrUpdateFilesTool));
        map.insert(READ_FILES.to_string(), Arc::new(ReadFilesTool));
        Self {
            tools: Arc::new(map),
        }
    }

    pub fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self.tools.values().map(|t| t.schema()).collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn execute(
        &self,
        name: &str,
        args: &Value,
        files: &FileMap,
    ) -> Result<ToolResult, ToolError> {
        let Some(tool) = self.tools.get(normalize_tool_name(name).as_str()) else {
            return Err(ToolError::UnknownTool(name.to_string()));
        };
        // Some models send the argument object as a JSON-encoded string.
        if let Value::String(raw) = args {
            if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                return tool.execute(&parsed, files);
            }
        }
        tool.execute(args, files)
    }
}

fn normalize_tool_name(name: &str) -> String {
    name.trim().to_lowercase().replace('-', "_")
}

#[derive(Debug, Clone)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    path: String,
    content: String,
}

struct CreateOrUpdateFilesTool;

impl Tool for CreateOrUpdateFilesTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: CREATE_OR_UPDATE_FILES.to_string(),
            description: "Create or update multiple project files. Each entry holds a \
                          relative path and the full file content."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "files": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "path": {"type": "string", "description": "Path relative to the project root"},
                                "content": {"type": "string", "description": "Full file content"}
                            },
                            "required": ["path", "content"]
                        }
                    }
                },
                "required": ["files"]
            }),
        }
    }

    fn execute(&self, args: &Value, _files: &FileMap) -> Result<ToolResult, ToolError> {
        let Some(entries) = args.get("files").and_then(|v| v.as_array()) else {
            return Err(ToolError::invalid(
                CREATE_OR_UPDATE_FILES,
                "`files` must be an array of {path, content} objects",
            ));
        };

        let mut state_files = FileMap::new();
        let mut files_created: Vec<String> = Vec::new();
        for (idx, entry) in entries.iter().enumerate() {
            let file = FileEntry::deserialize(entry).map_err(|err| {
                ToolError::invalid(CREATE_OR_UPDATE_FILES, format!("files[{idx}]: {err}"))
            })?;
            if !files_created.contains(&file.path) {
                files_created.push(file.path.clone());
            }
            state_files.insert(file.path, file.content);
        }

        let count = files_created.len();
        tracing::info!(count, files = ?files_created, "created or updated files");
        Ok(ToolResult {
            output: format!(
                "Successfully created {count} files: {}",
                files_created.join(", ")
            ),
            metadata: json!({
                "success": true,
                "files_created": files_created,
                "count": count,
            }),
            state_files,
        })
    }
}

struct ReadFilesTool;

impl Tool for ReadFilesTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: READ_FILES.to_string(),
            description: "Read the content of existing project files.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "files": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Paths relative to the project root"
                    }
                },
                "required": ["files"]
            }),
        }
    }

    fn execute(&self, args: &Value, files: &FileMap) -> Result<ToolResult, ToolError> {
        let requested = args
            .get("files")
            .and_then(|v| v.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default();

        // One entry per requested item; non-string items can never exist.
        let entries = requested
            .iter()
            .map(|item| {
                let content = item.as_str().and_then(|path| files.get(path));
                let path = match item.as_str() {
                    Some(path) => path.to_string(),
                    None => item.to_string(),
                };
                json!({
                    "path": path,
                    "content": content,
                    "exists": content.is_some(),
                })
            })
            .collect::<Vec<_>>();

        let output = Value::Array(entries);
        Ok(ToolResult {
            output: output.to_string(),
            metadata: output,
            state_files: FileMap::new(),
        })
    }
}
