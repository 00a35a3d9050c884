use std::sync::Arc;

use pgspot_operator::actions::AnsibleActionRunner;
use pgspot_operator::provider_manager::ProviderManager;
use pgspot_operator::vault::VaultDecryptor;
use pgspot_operator::{Cmdb, Reconciler, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();
    std::fs::create_dir_all(&settings.config_dir)?;
    if let Some(parent) = settings.cmdb_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let cmdb = Cmdb::connect(&settings.cmdb_url()).await?;
    tracing::info!("✅ [cmdb] ready at {}", settings.cmdb_path.display());

    let actions = Arc::new(AnsibleActionRunner::new(
        settings.action_executable.clone(),
        settings.actions_dir.clone(),
        settings.work_dir(),
        settings.action_timeout,
    ));
    let teardown = settings.teardown;
    let mut reconciler = Reconciler::new(settings, cmdb, Arc::new(ProviderManager), actions)
        .with_vault(VaultDecryptor::default());

    if teardown {
        return reconciler.teardown_once().await;
    }

    let shutdown = reconciler.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("[reconcile] interrupt received, stopping after the current step");
            shutdown.trigger();
        }
    });

    reconciler.run().await
}
