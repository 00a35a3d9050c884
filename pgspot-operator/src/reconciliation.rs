//! The tick loop: desired state (manifest) vs recorded/observed state.

use anyhow::{Context, Result};
use pgspot_common::diff::section_changed;
use pgspot_common::manifest::is_valid_instance_name;
use pgspot_common::{diff_manifests, InstanceManifest, ManifestSnapshot, Vm};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::actions::{ActionRequest, ActionRunner, ActionTarget, INSTANCE_SETUP};
use crate::cmdb::Cmdb;
use crate::config::Settings;
use crate::provider_manager::{credentials_from_manifest, ProviderFactory};
use crate::provisioning::ProvisioningTimeouts;
use crate::teardown::destroy;
use crate::vault::VaultDecryptor;
use crate::vm::VmManager;

pub const POSTGRES_PORT: u16 = 5432;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Work was done this tick.
    Continue,
    NoOp,
    UserExit,
    Error(String),
}

/// Cooperative stop signal shared with the signal handler.
#[derive(Default)]
pub struct Shutdown {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Connection string handed to the setup action; the action may replace it.
pub fn default_connstr(manifest: &InstanceManifest, vm: &Vm) -> String {
    let user = manifest.postgres.admin_user.as_deref().unwrap_or("postgres");
    let db = manifest.postgres.app_db_name.as_deref().unwrap_or("postgres");
    let auth = match manifest.postgres.admin_password.as_deref() {
        Some(pw) if !pw.is_empty() => format!("{}:{}", user, pw),
        _ => user.to_string(),
    };
    format!("postgresql://{}@{}:{}/{}", auth, vm.connect_address(), POSTGRES_PORT, db)
}

fn applied_at(snapshot: &ManifestSnapshot) -> chrono::DateTime<chrono::Utc> {
    snapshot.setup_finished_on.unwrap_or(snapshot.created_on)
}

pub struct Reconciler {
    settings: Settings,
    cmdb: Cmdb,
    providers: Arc<dyn ProviderFactory>,
    actions: Arc<dyn ActionRunner>,
    vault: VaultDecryptor,
    timeouts: ProvisioningTimeouts,
    first_tick: bool,
    shutdown: Arc<Shutdown>,
}

impl Reconciler {
    pub fn new(settings: Settings, cmdb: Cmdb, providers: Arc<dyn ProviderFactory>, actions: Arc<dyn ActionRunner>) -> Self {
        Self {
            settings,
            cmdb,
            providers,
            actions,
            vault: VaultDecryptor::default(),
            timeouts: ProvisioningTimeouts::default(),
            first_tick: true,
            shutdown: Arc::new(Shutdown::default()),
        }
    }

    pub fn with_timeouts(mut self, timeouts: ProvisioningTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_vault(mut self, vault: VaultDecryptor) -> Self {
        self.vault = vault;
        self
    }

    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    pub fn cmdb(&self) -> &Cmdb {
        &self.cmdb
    }

    /// One reconciliation pass. Never fails: errors come back as `TickOutcome::Error`.
    ///
    /// The first-tick window (destroying an expired, never registered
    /// instance) stays open until a tick gets through without error.
    pub async fn tick(&mut self) -> TickOutcome {
        match self.try_tick().await {
            Ok(outcome) => {
                self.first_tick = false;
                outcome
            }
            Err(e) => TickOutcome::Error(format!("{:#}", e)),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            "🔁 [reconcile] loop started, interval {}s",
            self.settings.main_loop_interval.as_secs()
        );
        let shutdown = self.shutdown.clone();
        loop {
            match self.tick().await {
                TickOutcome::Continue => tracing::info!("[reconcile] tick done"),
                TickOutcome::NoOp => tracing::debug!("[reconcile] nothing to do"),
                TickOutcome::UserExit => {
                    tracing::info!("[reconcile] exit requested");
                    return Ok(());
                }
                TickOutcome::Error(e) => tracing::error!("❌ [reconcile] tick failed: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.main_loop_interval) => {}
                _ = shutdown.wait() => {
                    tracing::info!("[reconcile] exit requested");
                    return Ok(());
                }
            }
        }
    }

    fn load_manifest(&self) -> Result<Option<InstanceManifest>> {
        if let Some(raw) = self.settings.manifest_inline.as_deref().filter(|s| !s.trim().is_empty()) {
            return Ok(Some(InstanceManifest::from_yaml_str(raw).context("inline manifest")?));
        }
        match self.settings.manifest_path.as_deref() {
            Some(path) if path.exists() => Ok(Some(InstanceManifest::from_yaml_file(path)?)),
            Some(path) => {
                tracing::debug!("[reconcile] manifest {} does not exist", path.display());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Defaults that depend on the environment rather than on the manifest alone.
    fn fill_engine_defaults(&self, manifest: &mut InstanceManifest) {
        manifest.fill_defaults();
        if manifest.vault_password_file.as_deref().map_or(true, |p| p.trim().is_empty()) {
            if let Some(pw) = &self.settings.vault_password_file {
                manifest.vault_password_file = Some(pw.display().to_string());
            }
        }
        for key_path in manifest.os.ssh_pub_key_paths.clone() {
            let path = expand_home(&key_path);
            match std::fs::read_to_string(&path) {
                Ok(key) => {
                    let key = key.trim().to_string();
                    if !key.is_empty() && !manifest.os.ssh_pub_keys.contains(&key) {
                        manifest.os.ssh_pub_keys.push(key);
                    }
                }
                Err(e) => tracing::warn!(
                    "[reconcile] {}: cannot read ssh key {}: {}",
                    manifest.instance_name,
                    path.display(),
                    e
                ),
            }
        }
    }

    /// Manifest ready for use: defaults filled, validated. `None` means no-op.
    fn prepare_manifest(&self) -> Result<Option<InstanceManifest>> {
        let Some(mut manifest) = self.load_manifest()? else {
            return Ok(None);
        };
        if !is_valid_instance_name(&manifest.instance_name) {
            tracing::warn!("[reconcile] manifest has no valid instance_name ('{}')", manifest.instance_name);
            return Ok(None);
        }
        self.fill_engine_defaults(&mut manifest);
        manifest.validate()?;
        Ok(Some(manifest))
    }

    async fn try_tick(&mut self) -> Result<TickOutcome> {
        let Some(mut manifest) = self.prepare_manifest()? else {
            return Ok(TickOutcome::NoOp);
        };
        let name = manifest.instance_name.clone();
        if self.cmdb.is_ignored(&name).await? {
            tracing::debug!("[reconcile] {} is on the ignore list", name);
            return Ok(TickOutcome::NoOp);
        }

        let mut effective = manifest.clone();
        self.vault.decrypt_manifest(&mut effective).await?;

        let credentials = credentials_from_manifest(&effective);
        let provider = self.providers.get_provider(&effective.cloud, &credentials)?;

        let existing = self.cmdb.get_instance(&manifest.cloud, &name).await?;
        if effective.is_expired() {
            let destroy_now = match &existing {
                None => self.first_tick,
                Some(inst) => {
                    let applied_expired = match self.cmdb.last_applied_snapshot(inst.id).await? {
                        Some(snap) => snap.parse_manifest()?.is_expired_at(applied_at(&snap)),
                        None => false,
                    };
                    self.first_tick || !applied_expired
                }
            };
            if destroy_now {
                tracing::warn!("⏰ [reconcile] {} expired, destroying", name);
                destroy(
                    provider.as_ref(),
                    &self.cmdb,
                    self.actions.as_ref(),
                    &effective,
                    existing.as_ref().map(|i| i.id),
                    self.timeouts,
                )
                .await?;
            } else {
                tracing::debug!("[reconcile] {} expired, nothing to do", name);
            }
            return Ok(TickOutcome::NoOp);
        }

        let instance = self.cmdb.register_instance(&manifest).await?;
        let (snapshot_id, new_snapshot) = self.cmdb.store_manifest_snapshot(instance.id, &manifest).await?;
        if new_snapshot {
            tracing::info!("📝 [reconcile] {}: manifest changed, snapshot {}", name, snapshot_id);
        }
        manifest.instance_uuid = Some(instance.id);
        manifest.manifest_snapshot_id = Some(snapshot_id);
        effective.instance_uuid = Some(instance.id);
        effective.manifest_snapshot_id = Some(snapshot_id);

        if self.shutdown.is_triggered() {
            return Ok(TickOutcome::UserExit);
        }

        let applied = self.cmdb.last_applied_snapshot(instance.id).await?;
        let diff = match &applied {
            Some(snap) => Some(diff_manifests(&snap.parse_manifest()?, &manifest)),
            None => None,
        };
        let vm_changed = diff.as_ref().map_or(false, |d| section_changed(d, "vm"));

        let outcome = VmManager::new(provider.as_ref(), &self.cmdb, self.timeouts, self.settings.dry_run)
            .ensure_vm(&instance, &effective, vm_changed)
            .await?;
        let Some(vm) = outcome.vm else {
            return Ok(TickOutcome::NoOp);
        };

        if outcome.created && !self.settings.vm_boot_grace.is_zero() {
            tracing::info!(
                "[reconcile] {}: waiting {}s for {} to boot",
                name,
                self.settings.vm_boot_grace.as_secs(),
                vm.provider_id
            );
            tokio::select! {
                _ = tokio::time::sleep(self.settings.vm_boot_grace) => {}
                _ = self.shutdown.wait() => return Ok(TickOutcome::UserExit),
            }
        }
        if self.shutdown.is_triggered() {
            return Ok(TickOutcome::UserExit);
        }

        let latest_completed = self
            .cmdb
            .latest_snapshot(instance.id)
            .await?
            .map_or(false, |s| s.setup_finished_on.is_some());
        let changed_keys = diff.as_ref().map(|d| d.len());
        let needs_setup = outcome.created || !latest_completed || changed_keys.map_or(true, |n| n > 0);
        if !needs_setup {
            return Ok(TickOutcome::NoOp);
        }
        tracing::info!(
            "[reconcile] {}: setup needed (vm created: {}, changed keys: {})",
            name,
            outcome.created,
            changed_keys.map_or_else(|| "all".to_string(), |n| n.to_string())
        );

        self.run_setup(&effective, &vm).await?;
        self.cmdb.mark_snapshot_completed(snapshot_id).await?;
        Ok(TickOutcome::Continue)
    }

    async fn run_setup(&self, manifest: &InstanceManifest, vm: &Vm) -> Result<()> {
        let name = manifest.instance_name.as_str();
        if !self.actions.has_action(INSTANCE_SETUP) {
            tracing::warn!("[reconcile] {}: no {} action available, skipping", name, INSTANCE_SETUP);
            return Ok(());
        }

        let mut overrides = BTreeMap::new();
        overrides.insert("connstr".to_string(), default_connstr(manifest, vm));
        overrides.insert("vm_address".to_string(), vm.connect_address().to_string());
        overrides.insert("vm_ip_private".to_string(), vm.ip_private.clone());
        overrides.insert("vm_login_user".to_string(), vm.login_user.clone());
        overrides.insert("vm_provider_id".to_string(), vm.provider_id.clone());
        overrides.insert("instance_uuid".to_string(), vm.instance_id.to_string());

        let req = ActionRequest {
            action: INSTANCE_SETUP.to_string(),
            instance_name: name.to_string(),
            manifest: manifest.clone(),
            target: ActionTarget::Host {
                address: vm.connect_address().to_string(),
                login_user: vm.login_user.clone(),
            },
            overrides,
        };
        let outputs = self.actions.run(&req).await?;

        if let (Some(path), Some(connstr)) = (manifest.connstr_output_path.as_deref(), outputs.get("connstr")) {
            write_connstr(&expand_home(path), connstr)?;
            tracing::info!("[reconcile] {}: connection string written to {}", name, path);
        }
        Ok(())
    }

    /// Destroy the manifest's instance and put its name on the ignore list.
    pub async fn teardown_once(&mut self) -> Result<()> {
        let mut manifest = self
            .prepare_manifest()?
            .ok_or_else(|| anyhow::anyhow!("no valid manifest to tear down"))?;
        self.vault.decrypt_manifest(&mut manifest).await?;
        let provider = self
            .providers
            .get_provider(&manifest.cloud, &credentials_from_manifest(&manifest))?;
        let existing = self.cmdb.get_instance(&manifest.cloud, &manifest.instance_name).await?;
        destroy(
            provider.as_ref(),
            &self.cmdb,
            self.actions.as_ref(),
            &manifest,
            existing.map(|i| i.id),
            self.timeouts,
        )
        .await?;
        self.cmdb.add_ignored_instance(&manifest.instance_name).await?;
        tracing::info!("[reconcile] {} added to the ignore list", manifest.instance_name);
        Ok(())
    }
}

fn write_connstr(path: &Path, connstr: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", connstr)).with_context(|| format!("write {}", path.display()))
}
