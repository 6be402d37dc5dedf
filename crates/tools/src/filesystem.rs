//! Filesystem tools: read, write and list.
//!
//! Handlers touch only the path they are given. Policy (deny lists, allow
//! lists, approval) is enforced before they run, by the permission engine.

use async_trait::async_trait;
use meshtalk_core::error::ToolError;
use meshtalk_core::tool::{ToolCategory, ToolContext, ToolHandler, ToolSpec};
use serde::Deserialize;

use crate::parse_args;

/// Read a UTF-8 text file.
pub struct ReadFileTool;

#[derive(Deserialize)]
struct ReadArgs {
    path: String,
}

impl ReadFileTool {
    pub const NAME: &'static str = "read_file";

    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            Self::NAME,
            "Read the contents of a text file at the given path.",
            ToolCategory::Filesystem,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "The file path to read (relative to the working directory or absolute)"
                    }
                },
                "required": ["path"]
            }),
        )
        .requiring_approval()
    }
}

#[async_trait]
impl ToolHandler for ReadFileTool {
    async fn call(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: ReadArgs = parse_args(arguments)?;
        let path = ctx.resolve(&args.path)?;

        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::failed(Self::NAME, format!("{}: {e}", path.display())))
    }
}

/// Write (or append to) a file, creating parent directories as needed.
pub struct WriteFileTool;

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
    #[serde(default)]
    append: bool,
}

impl WriteFileTool {
    pub const NAME: &'static str = "write_file";

    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            Self::NAME,
            "Write content to a file. Creates the file and parent directories if they don't exist; \
             overwrites unless append is true.",
            ToolCategory::Filesystem,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "The file path to write to"
                    },
                    "content": {
                        "type": "string",
                        "description": "The content to write"
                    },
                    "append": {
                        "type": "boolean",
                        "description": "Append instead of overwriting (default false)",
                        "default": false
                    }
                },
                "required": ["path", "content"]
            }),
        )
        .requiring_approval()
    }
}

#[async_trait]
impl ToolHandler for WriteFileTool {
    async fn call(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: WriteArgs = parse_args(arguments)?;
        let path = ctx.resolve(&args.path)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::failed(Self::NAME, format!("create {}: {e}", parent.display())))?;
        }

        let result = if args.append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| ToolError::failed(Self::NAME, format!("{}: {e}", path.display())))?;
            file.write_all(args.content.as_bytes()).await
        } else {
            tokio::fs::write(&path, args.content.as_bytes()).await
        };
        result.map_err(|e| ToolError::failed(Self::NAME, format!("{}: {e}", path.display())))?;

        tracing::debug!(path = %path.display(), bytes = args.content.len(), "Wrote file");
        let verb = if args.append { "Appended" } else { "Wrote" };
        Ok(format!("{verb} {} bytes to {}", args.content.len(), path.display()))
    }
}

/// List the entries of a directory, directories first.
pub struct ListDirectoryTool;

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default = "current_dir")]
    path: String,
}

fn current_dir() -> String {
    ".".into()
}

impl ListDirectoryTool {
    pub const NAME: &'static str = "list_directory";

    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            Self::NAME,
            "List the files and subdirectories of a directory. Directories are suffixed with '/'.",
            ToolCategory::Filesystem,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory to list (default: the working directory)"
                    }
                }
            }),
        )
    }
}

#[async_trait]
impl ToolHandler for ListDirectoryTool {
    async fn call(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: ListArgs = parse_args(arguments)?;
        let path = ctx.resolve(&args.path)?;

        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| ToolError::failed(Self::NAME, format!("{}: {e}", path.display())))?;

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::failed(Self::NAME, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                dirs.push(format!("{name}/"));
            } else {
                files.push(name);
            }
        }
        dirs.sort();
        files.sort();

        if dirs.is_empty() && files.is_empty() {
            return Ok(format!("{} is empty", path.display()));
        }
        Ok(dirs.into_iter().chain(files).collect::<Vec<_>>().join("\n"))
    }
}
