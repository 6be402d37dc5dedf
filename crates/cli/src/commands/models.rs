//! `meshtalk models`: List the models the configured provider offers.

use meshtalk_config::AppConfig;

pub async fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let provider = meshtalk_providers::build_provider(config)?;

    if !provider.health_check().await.unwrap_or(false) {
        eprintln!("  ⚠️  {} did not answer its health check", provider.name());
    }

    let models = provider.list_models().await?;
    println!("🤖 Models from {} ({})", provider.name(), config.provider.effective_base_url());
    if models.is_empty() {
        println!("   (none reported)");
    }
    for model in &models {
        let marker = if config.model.as_deref() == Some(model.as_str()) {
            "*"
        } else {
            " "
        };
        println!("  {marker} {model}");
    }
    Ok(())
}
