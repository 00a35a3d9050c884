use anyhow::Result;
use async_trait::async_trait;
use pgspot_operator::actions::{ActionRequest, ActionRunner, ActionTarget, INSTANCE_SETUP, INSTANCE_TEARDOWN};
use pgspot_operator::provider_manager::ProviderFactory;
use pgspot_operator::provisioning::ProvisioningTimeouts;
use pgspot_operator::{Cmdb, Reconciler, Settings, TickOutcome};
use pgspot_providers::mock::MockProvider;
use pgspot_providers::{CloudProvider, InstanceTypeInfo, ProviderCredentials, VmInfo, VmState};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct MockFactory {
    provider: Arc<MockProvider>,
    seen: Mutex<Vec<ProviderCredentials>>,
    failures_left: Mutex<u32>,
}

impl ProviderFactory for MockFactory {
    fn get_provider(&self, _cloud: &str, credentials: &ProviderCredentials) -> Result<Arc<dyn CloudProvider>> {
        self.seen.lock().unwrap().push(credentials.clone());
        let mut failures = self.failures_left.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            anyhow::bail!("credentials endpoint timed out");
        }
        let provider: Arc<dyn CloudProvider> = self.provider.clone();
        Ok(provider)
    }
}

#[derive(Default)]
struct RecordingActions {
    runs: Mutex<Vec<ActionRequest>>,
}

impl RecordingActions {
    fn count(&self, action: &str) -> usize {
        self.runs.lock().unwrap().iter().filter(|r| r.action == action).count()
    }
}

#[async_trait]
impl ActionRunner for RecordingActions {
    fn has_action(&self, _action: &str) -> bool {
        true
    }

    async fn run(&self, req: &ActionRequest) -> Result<BTreeMap<String, String>> {
        self.runs.lock().unwrap().push(req.clone());
        Ok(req.overrides.clone())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    manifest_path: PathBuf,
    provider: Arc<MockProvider>,
    factory: Arc<MockFactory>,
    actions: Arc<RecordingActions>,
    reconciler: Reconciler,
}

fn sku(name: &str, vcpu: u32, ram_gb: u64) -> InstanceTypeInfo {
    InstanceTypeInfo {
        sku: name.into(),
        arch: "arm64".into(),
        vcpu,
        ram_mb: ram_gb * 1024,
        instance_storage_gb: 0,
        instance_storage_class: None,
        burstable: false,
    }
}

const MANIFEST: &str = "\
cloud: aws
region: eu-north-1
instance_name: pg1
aws:
  access_key_id: AKIATEST
  secret_access_key: secret
vm:
  cpu_min: 2
  storage_min: 20
postgres:
  admin_user: app
";

async fn harness(manifest: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let manifest_path = dir.path().join("manifest.yml");
    std::fs::write(&manifest_path, manifest).unwrap();

    let provider = Arc::new(MockProvider::new());
    provider.add_instance_type("eu-north-1", sku("m6g.large", 2, 8));
    provider.add_instance_type("eu-north-1", sku("r6g.large", 2, 16));
    provider.add_spot_price("eu-north-1", "m6g.large", "eu-north-1a", 0.02);
    provider.add_spot_price("eu-north-1", "r6g.large", "eu-north-1a", 0.03);

    let factory = Arc::new(MockFactory {
        provider: provider.clone(),
        seen: Mutex::new(Vec::new()),
        failures_left: Mutex::new(0),
    });
    let actions = Arc::new(RecordingActions::default());
    let settings = Settings {
        manifest_path: Some(manifest_path.clone()),
        config_dir: dir.path().to_path_buf(),
        cmdb_path: dir.path().join("cmdb.db"),
        vm_boot_grace: Duration::ZERO,
        ..Settings::default()
    };
    let timeouts = ProvisioningTimeouts {
        running: Duration::from_millis(500),
        volume_available: Duration::from_millis(500),
        volume_attached: Duration::from_millis(500),
        nic_available: Duration::from_millis(500),
        poll: Duration::from_millis(5),
    };
    let cmdb = Cmdb::in_memory().await.unwrap();
    let reconciler = Reconciler::new(settings, cmdb, factory.clone(), actions.clone()).with_timeouts(timeouts);

    Harness {
        _dir: dir,
        manifest_path,
        provider,
        factory,
        actions,
        reconciler,
    }
}

fn rewrite(path: &Path, manifest: &str) {
    std::fs::write(path, manifest).unwrap();
}

#[tokio::test]
async fn provisions_once_then_idles() {
    let mut h = harness(MANIFEST).await;

    assert_eq!(h.reconciler.tick().await, TickOutcome::Continue);
    assert_eq!(h.provider.launch_attempts().len(), 1);
    assert_eq!(h.actions.count(INSTANCE_SETUP), 1);

    let runs = h.actions.runs.lock().unwrap().clone();
    let vm = h.provider.live_vms().pop().unwrap();
    assert_eq!(
        runs[0].target,
        ActionTarget::Host {
            address: vm.ip_public.clone().unwrap(),
            login_user: "admin".into(),
        }
    );
    assert!(runs[0].overrides["connstr"].starts_with("postgresql://app@"));

    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);
    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);
    assert_eq!(h.provider.launch_attempts().len(), 1);
    assert_eq!(h.actions.count(INSTANCE_SETUP), 1);
}

#[tokio::test]
async fn manifest_change_reruns_setup_without_relaunch() {
    let mut h = harness(MANIFEST).await;
    assert_eq!(h.reconciler.tick().await, TickOutcome::Continue);

    rewrite(&h.manifest_path, &format!("{}  extensions: [pg_stat_statements]\n", MANIFEST));
    assert_eq!(h.reconciler.tick().await, TickOutcome::Continue);
    assert_eq!(h.actions.count(INSTANCE_SETUP), 2);
    assert_eq!(h.provider.launch_attempts().len(), 1);

    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);
}

#[tokio::test]
async fn expired_on_first_tick_destroys_once_and_never_provisions() {
    let mut h = harness(&format!("{}expiration_date: '2000-01-01'\n", MANIFEST)).await;

    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);
    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);
    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);

    assert!(h.provider.launch_attempts().is_empty());
    assert_eq!(h.actions.count(INSTANCE_TEARDOWN), 1);
    assert_eq!(h.actions.count(INSTANCE_SETUP), 0);
    assert!(h.reconciler.cmdb().get_instance("aws", "pg1").await.unwrap().is_none());
}

#[tokio::test]
async fn expiring_a_running_instance_destroys_it() {
    let mut h = harness(MANIFEST).await;
    assert_eq!(h.reconciler.tick().await, TickOutcome::Continue);
    let id = h.reconciler.cmdb().get_instance("aws", "pg1").await.unwrap().unwrap().id;

    rewrite(&h.manifest_path, &format!("{}expiration_date: now\n", MANIFEST));
    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);
    assert!(h.provider.live_vms().is_empty());
    assert!(h.provider.volumes().is_empty());
    assert!(h.provider.floating_ips().is_empty());
    assert_eq!(h.reconciler.cmdb().count_active_vms(id).await.unwrap(), 0);

    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);
    assert_eq!(h.actions.count(INSTANCE_TEARDOWN), 1);
}

#[tokio::test]
async fn reclaimed_vm_is_recreated_with_the_same_volume() {
    let mut h = harness(MANIFEST).await;
    assert_eq!(h.reconciler.tick().await, TickOutcome::Continue);
    let id = h.reconciler.cmdb().get_instance("aws", "pg1").await.unwrap().unwrap().id;
    let old = h.reconciler.cmdb().active_vm(id).await.unwrap().unwrap();

    h.provider.reclaim_vm(&old.provider_id);
    assert_eq!(h.reconciler.tick().await, TickOutcome::Continue);

    let new = h.reconciler.cmdb().active_vm(id).await.unwrap().unwrap();
    assert_ne!(new.provider_id, old.provider_id);
    assert_eq!(new.volume_id, old.volume_id);
    assert_eq!(new.ip_public, old.ip_public);
    assert_eq!(h.reconciler.cmdb().count_active_vms(id).await.unwrap(), 1);
    assert_eq!(h.actions.count(INSTANCE_SETUP), 2);
}

#[tokio::test]
async fn capacity_shortage_falls_back_to_next_sku() {
    let mut h = harness(MANIFEST).await;
    h.provider.exhaust_capacity("m6g.large");

    assert_eq!(h.reconciler.tick().await, TickOutcome::Continue);
    let skus: Vec<String> = h.provider.launch_attempts().into_iter().map(|(s, _)| s).collect();
    assert_eq!(skus, vec!["m6g.large".to_string(), "r6g.large".to_string()]);
    assert_eq!(h.provider.live_vms()[0].sku, "r6g.large");
}

#[tokio::test]
async fn failures_are_reported_and_retried_next_tick() {
    let mut h = harness(MANIFEST).await;
    h.provider.exhaust_capacity("m6g.large");
    h.provider.exhaust_capacity("r6g.large");

    match h.reconciler.tick().await {
        TickOutcome::Error(e) => assert!(e.contains("failed to launch"), "{}", e),
        other => panic!("expected an error, got {:?}", other),
    }
    assert!(h.actions.runs.lock().unwrap().is_empty());

    // Capacity is back: fresh SKU in the catalog.
    h.provider.add_instance_type("eu-north-1", sku("c7g.large", 2, 4));
    h.provider.add_spot_price("eu-north-1", "c7g.large", "eu-north-1a", 0.025);
    assert_eq!(h.reconciler.tick().await, TickOutcome::Continue);
}

#[tokio::test]
async fn credentials_are_passed_on_every_tick() {
    let mut h = harness(MANIFEST).await;
    h.reconciler.tick().await;
    h.reconciler.tick().await;

    let seen = h.factory.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    for creds in seen {
        assert_eq!(creds.access_key_id.as_deref(), Some("AKIATEST"));
        assert_eq!(creds.secret_access_key.as_deref(), Some("secret"));
    }
}

#[tokio::test]
async fn teardown_destroys_and_ignores_the_instance() {
    let mut h = harness(MANIFEST).await;
    assert_eq!(h.reconciler.tick().await, TickOutcome::Continue);

    h.reconciler.teardown_once().await.unwrap();
    assert!(h.provider.live_vms().is_empty());
    assert!(h.provider.volumes().is_empty());
    assert!(h.reconciler.cmdb().is_ignored("pg1").await.unwrap());

    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);
    assert_eq!(h.provider.launch_attempts().len(), 1);
}

#[tokio::test]
async fn missing_or_nameless_manifest_is_a_noop() {
    let mut h = harness("region: eu-north-1\ninstance_name: ''\n").await;
    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);

    std::fs::remove_file(&h.manifest_path).unwrap();
    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);
    assert!(h.factory.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn connection_string_is_written_after_setup() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out").join("pg1.connstr");
    let mut h = harness(&format!("{}connstr_output_path: {}\n", MANIFEST, out.display())).await;

    assert_eq!(h.reconciler.tick().await, TickOutcome::Continue);
    let written = std::fs::read_to_string(&out).unwrap();
    assert!(written.starts_with("postgresql://app@"));
    assert!(written.trim_end().ends_with(":5432/postgres"));
}

#[tokio::test]
async fn shutdown_before_the_vm_step_exits_the_tick() {
    let mut h = harness(MANIFEST).await;
    h.reconciler.shutdown_handle().trigger();
    assert_eq!(h.reconciler.tick().await, TickOutcome::UserExit);
    assert!(h.provider.launch_attempts().is_empty());
}

#[tokio::test]
async fn expired_destroy_is_retried_after_a_failed_first_tick() {
    let mut h = harness(&format!("{}expiration_date: '2000-01-01'\n", MANIFEST)).await;
    let mut tags = pgspot_providers::Tags::new();
    tags.insert(pgspot_common::INSTANCE_ID_TAG.into(), "pg1".into());
    h.provider.insert_running_vm(VmInfo {
        provider_id: "i-left".into(),
        sku: "m6g.large".into(),
        region: "eu-north-1".into(),
        availability_zone: "eu-north-1a".into(),
        state: VmState::Running,
        ip_private: Some("10.0.0.7".into()),
        ip_public: None,
        tags,
        launched_at: None,
    });
    *h.factory.failures_left.lock().unwrap() = 1;

    match h.reconciler.tick().await {
        TickOutcome::Error(e) => assert!(e.contains("timed out"), "{}", e),
        other => panic!("expected an error, got {:?}", other),
    }
    assert_eq!(h.provider.live_vms().len(), 1);

    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);
    assert!(h.provider.live_vms().is_empty());
    assert_eq!(h.provider.terminated_vms(), vec!["i-left".to_string()]);
    assert_eq!(h.actions.count(INSTANCE_TEARDOWN), 1);

    assert_eq!(h.reconciler.tick().await, TickOutcome::NoOp);
    assert_eq!(h.actions.count(INSTANCE_TEARDOWN), 1);
}
