//! `meshtalk tools`: List the tool catalog by category.

use std::io::Write;

use meshtalk_config::AppConfig;
use meshtalk_core::tool::ToolCatalog;
use meshtalk_security::PermissionEngine;

pub fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = meshtalk_tools::default_catalog(&config.tools);
    let permissions = PermissionEngine::from_config(&config.permissions, std::env::current_dir()?);
    let mut stdout = std::io::stdout().lock();
    write_listing(&mut stdout, &catalog, &permissions, config.tools.enabled)?;
    Ok(())
}

fn write_listing(
    out: &mut impl Write,
    catalog: &ToolCatalog,
    permissions: &PermissionEngine,
    enabled: bool,
) -> std::io::Result<()> {
    writeln!(out, "🧰 Tools ({})", catalog.len())?;
    if !enabled {
        writeln!(out, "   (tool use is disabled in config; the model will not see these)")?;
    }
    for (category, specs) in catalog.by_category() {
        writeln!(out)?;
        writeln!(out, "  {category}")?;
        for spec in specs {
            // Level before any argument-specific refinement.
            let level = permissions.check(&spec, &serde_json::json!({}));
            writeln!(out, "    {:<20} [{level}]  {}", spec.name, spec.description)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtalk_config::{PermissionsConfig, ToolsConfig};
    use meshtalk_core::PermissionLevel;

    fn listing(permissions: PermissionsConfig) -> String {
        let catalog = meshtalk_tools::default_catalog(&ToolsConfig::default());
        let engine = PermissionEngine::from_config(&permissions, "/tmp");
        let mut buf = Vec::new();
        write_listing(&mut buf, &catalog, &engine, true).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn grouped_by_category_with_levels() {
        let out = listing(PermissionsConfig::default());
        let headers: Vec<&str> = out
            .lines()
            .filter(|l| l.starts_with("  ") && !l.starts_with("   "))
            .map(str::trim)
            .collect();
        assert_eq!(headers, vec!["filesystem", "process", "web", "mesh", "system"]);
        assert!(out.lines().any(|l| l.contains("read_file") && l.contains("[ask]")));
    }

    #[test]
    fn overrides_show_up() {
        let mut permissions = PermissionsConfig {
            default_requires_approval: false,
            ..PermissionsConfig::default()
        };
        permissions
            .tools
            .insert("web_search".into(), PermissionLevel::Deny);
        let out = listing(permissions);
        assert!(out.lines().any(|l| l.contains("web_search") && l.contains("[deny]")));
        assert!(out.lines().any(|l| l.contains("system_info") && l.contains("[allow]")));
    }
}
