//! Built-in tool implementations for meshtalk.
//!
//! Tools give the model the ability to interact with the world, one family
//! per category: read/write/list files, run shell commands, search and
//! fetch from the web, call services on the mesh, and inspect the system.

pub mod filesystem;
pub mod mesh;
pub mod shell;
pub mod system;
pub mod web;

use std::sync::Arc;
use std::time::Duration;

use meshtalk_config::ToolsConfig;
use meshtalk_core::error::ToolError;
use meshtalk_core::tool::ToolCatalog;
use serde::de::DeserializeOwned;

pub use filesystem::{ListDirectoryTool, ReadFileTool, WriteFileTool};
pub use mesh::{MeshCallTool, MeshListServicesTool, MeshService};
pub use shell::ExecuteCommandTool;
pub use system::SystemInfoTool;
pub use web::{FetchUrlTool, WebSearchTool};

/// Decode handler arguments into a typed struct.
pub(crate) fn parse_args<T: DeserializeOwned>(arguments: serde_json::Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Register every built-in tool into `catalog`.
///
/// Families are registered in a fixed order so the model sees a stable
/// tool list: filesystem, process, web, mesh, system.
pub fn register_builtin_tools(catalog: &ToolCatalog, config: &ToolsConfig) {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(concat!("meshtalk/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        });

    catalog.register(ReadFileTool::spec(), Arc::new(ReadFileTool));
    catalog.register(WriteFileTool::spec(), Arc::new(WriteFileTool));
    catalog.register(ListDirectoryTool::spec(), Arc::new(ListDirectoryTool));

    catalog.register(ExecuteCommandTool::spec(), Arc::new(ExecuteCommandTool));

    catalog.register(
        WebSearchTool::spec(),
        Arc::new(WebSearchTool::new(client.clone(), &config.web_search_url)),
    );
    catalog.register(
        FetchUrlTool::spec(),
        Arc::new(FetchUrlTool::new(client.clone(), config.max_output_bytes)),
    );

    catalog.register(
        MeshListServicesTool::spec(),
        Arc::new(MeshListServicesTool::new(client.clone(), &config.mesh_url)),
    );
    catalog.register(
        MeshCallTool::spec(),
        Arc::new(MeshCallTool::new(client, &config.mesh_url)),
    );

    catalog.register(SystemInfoTool::spec(), Arc::new(SystemInfoTool));

    tracing::debug!(count = catalog.len(), "Registered built-in tools");
}

/// A catalog holding every built-in tool.
pub fn default_catalog(config: &ToolsConfig) -> ToolCatalog {
    let catalog = ToolCatalog::new();
    register_builtin_tools(&catalog, config);
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtalk_core::tool::ToolCategory;

    #[test]
    fn registers_all_families_in_order() {
        let catalog = default_catalog(&ToolsConfig::default());
        let names: Vec<_> = catalog.all().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "read_file",
                "write_file",
                "list_directory",
                "execute_command",
                "web_search",
                "fetch_url",
                "mesh_list_services",
                "mesh_call",
                "system_info",
            ]
        );

        let groups = catalog.by_category();
        assert_eq!(groups[&ToolCategory::Filesystem].len(), 3);
        assert_eq!(groups[&ToolCategory::Process].len(), 1);
        assert_eq!(groups[&ToolCategory::Web].len(), 2);
        assert_eq!(groups[&ToolCategory::Mesh].len(), 2);
        assert_eq!(groups[&ToolCategory::System].len(), 1);
    }

    #[test]
    fn side_effecting_tools_require_approval() {
        let catalog = default_catalog(&ToolsConfig::default());
        for name in ["read_file", "write_file", "execute_command", "mesh_call"] {
            assert!(catalog.get(name).unwrap().spec.requires_approval, "{name}");
        }
        assert!(!catalog.get("system_info").unwrap().spec.requires_approval);
    }

    #[test]
    fn every_schema_is_an_object() {
        for def in default_catalog(&ToolsConfig::default()).definitions() {
            assert_eq!(def.parameters["type"], "object", "{}", def.name);
        }
    }
}
