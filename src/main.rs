use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt};

use bookgen::config::Config;
use bookgen::server::{AppState, create_router};
use bookgen::services::accounts::{AccountService, AccountSettings, JsonUserStore};
use bookgen::services::generator::{BookGenerator, GeneratorSettings};
use bookgen::services::llm::LLMClient;
use bookgen::services::manifest::RunStore;
use bookgen::services::progress::ProgressRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let llm_client = LLMClient::new(&config.llm).context("failed to build LLM client")?;
    if !llm_client.has_api_key() {
        tracing::warn!("no LLM API key configured; generation requests will fail");
    }

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("cannot create {}", config.output_dir.display()))?;
    let store = RunStore::new(&config.output_dir);
    let generator = BookGenerator::new(
        Arc::new(llm_client),
        store,
        GeneratorSettings::from_config(&config),
    );

    let users = JsonUserStore::open(&config.users_file)
        .with_context(|| format!("cannot open {}", config.users_file.display()))?;
    let accounts = AccountService::new(
        users,
        AccountSettings {
            admin_email: config.admin_email.clone(),
            require_subscription: config.require_subscription,
            app_url: config.app_url.clone(),
        },
    );

    let app_state = AppState {
        generator,
        accounts: Arc::new(accounts),
        progress: ProgressRegistry::new(),
        default_chapters: config.default_chapters,
        target_words: config.target_words,
    };

    let app = create_router(app_state);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(
        output = %config.output_dir.display(),
        model = %config.llm.model,
        "Listening on {}",
        listener.local_addr()?
    );
    axum::serve(listener, app).await?;

    Ok(())
}
