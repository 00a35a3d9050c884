//! Ensure exactly one running VM exists for a logical instance.

use anyhow::Result;
use pgspot_common::{Instance, InstanceManifest, StorageType, Vm, INSTANCE_ID_TAG};
use pgspot_providers::{CloudProvider, VmInfo, VmState};

use crate::cmdb::Cmdb;
use crate::provisioning::{Provisioner, ProvisioningTimeouts};
use crate::resolver::{self, matches_constraints, HardwareConstraints};
use crate::selection::{order_for_launch, SelectionStrategy};

#[derive(Debug, Clone)]
pub struct VmOutcome {
    /// `None` only in dry-run mode.
    pub vm: Option<Vm>,
    /// The VM was launched (or adopted) during this call.
    pub created: bool,
}

pub struct VmManager<'a> {
    provider: &'a dyn CloudProvider,
    cmdb: &'a Cmdb,
    timeouts: ProvisioningTimeouts,
    dry_run: bool,
}

impl<'a> VmManager<'a> {
    pub fn new(provider: &'a dyn CloudProvider, cmdb: &'a Cmdb, timeouts: ProvisioningTimeouts, dry_run: bool) -> Self {
        Self {
            provider,
            cmdb,
            timeouts,
            dry_run,
        }
    }

    /// `vm_section_changed`: the manifest's `vm` section differs from the
    /// last applied snapshot, so the running SKU is re-checked against it.
    pub async fn ensure_vm(
        &self,
        instance: &Instance,
        manifest: &InstanceManifest,
        vm_section_changed: bool,
    ) -> Result<VmOutcome> {
        let name = manifest.instance_name.as_str();
        let region = manifest.region.as_str();

        let mut live: Vec<VmInfo> = self
            .provider
            .list_vms_by_tag(region, INSTANCE_ID_TAG, name)
            .await?
            .into_iter()
            .filter(|vm| !vm.state.is_gone())
            .collect();
        let active = self.cmdb.active_vm(instance.id).await?;

        if let Some(active) = active {
            match live.iter().position(|vm| vm.provider_id == active.provider_id) {
                Some(idx) => {
                    let current = live.remove(idx);
                    self.terminate_extra(region, name, &live).await;

                    if vm_section_changed && !self.sku_still_fits(region, &current.sku, manifest).await? {
                        if self.dry_run {
                            tracing::info!(
                                "[vm] {}: dry run, {} ({}) no longer fits, would recreate",
                                name,
                                current.provider_id,
                                current.sku
                            );
                            return Ok(VmOutcome { vm: None, created: false });
                        }
                        tracing::warn!(
                            "[vm] {}: {} ({}) no longer matches the hardware constraints, recreating",
                            name,
                            current.provider_id,
                            current.sku
                        );
                        self.provider.terminate_vm(region, &current.provider_id).await?;
                        self.cmdb.mark_vms_deleted(instance.id).await?;
                        return self.create(instance, manifest).await;
                    }

                    tracing::debug!(
                        "[vm] {}: {} ({} in {}) is {}",
                        name,
                        current.provider_id,
                        current.sku,
                        current.availability_zone,
                        current.state
                    );
                    return Ok(VmOutcome {
                        vm: Some(active),
                        created: false,
                    });
                }
                None => {
                    tracing::warn!(
                        "⚠️ [vm] {}: {} ({} in {}) is gone, probably reclaimed",
                        name,
                        active.provider_id,
                        active.sku,
                        active.availability_zone
                    );
                    if !self.dry_run {
                        self.cmdb.mark_vms_deleted(instance.id).await?;
                    }
                }
            }
        }

        if !live.is_empty() {
            // Prefer a running VM for adoption.
            live.sort_by_key(|vm| vm.state != VmState::Running);
            let orphan = live.remove(0);
            let fits = !vm_section_changed || self.sku_still_fits(region, &orphan.sku, manifest).await?;
            if self.dry_run {
                tracing::info!("[vm] {}: dry run, found untracked vm {}", name, orphan.provider_id);
                return Ok(VmOutcome { vm: None, created: false });
            }
            self.terminate_extra(region, name, &live).await;
            if fits {
                tracing::info!(
                    "[vm] {}: adopting untracked vm {} ({} in {})",
                    name,
                    orphan.provider_id,
                    orphan.sku,
                    orphan.availability_zone
                );
                let vm = Provisioner::new(self.provider, self.cmdb, manifest, instance.id, self.timeouts)
                    .adopt(orphan)
                    .await?;
                return Ok(VmOutcome {
                    vm: Some(vm),
                    created: true,
                });
            }
            tracing::warn!("[vm] {}: untracked vm {} does not fit, terminating", name, orphan.provider_id);
            self.provider.terminate_vm(region, &orphan.provider_id).await?;
        }

        self.create(instance, manifest).await
    }

    async fn create(&self, instance: &Instance, manifest: &InstanceManifest) -> Result<VmOutcome> {
        let name = manifest.instance_name.as_str();
        let constraints = HardwareConstraints::from(&manifest.vm);
        let pinned_az = self.pinned_availability_zone(manifest).await?;
        let regions = vec![manifest.region.clone()];

        let candidates = resolver::resolve(self.provider, &regions, &constraints, pinned_az.as_deref()).await?;
        let strategy = SelectionStrategy::from_name(&manifest.vm.instance_selection_strategy);
        let ordered = order_for_launch(strategy, &candidates)?;

        if let Some(first) = ordered.first() {
            tracing::info!(
                "[vm] {}: '{}' picked {} in {} at {:.5}/h (~{:.2}/month), {} fallback(s)",
                name,
                strategy.name(),
                first.info.sku,
                first.availability_zone,
                first.price_spot,
                first.monthly_spot(),
                ordered.len() - 1
            );
        }
        if self.dry_run {
            tracing::info!("[vm] {}: dry run, not launching", name);
            return Ok(VmOutcome { vm: None, created: false });
        }

        let vm = Provisioner::new(self.provider, self.cmdb, manifest, instance.id, self.timeouts)
            .provision(&ordered)
            .await?;
        Ok(VmOutcome {
            vm: Some(vm),
            created: true,
        })
    }

    /// AZ to resolve in. An existing data volume or floating NIC pins the
    /// instance to its AZ; a manifest AZ that disagrees with it is an error.
    async fn pinned_availability_zone(&self, manifest: &InstanceManifest) -> Result<Option<String>> {
        let region = manifest.region.as_str();
        let name = manifest.instance_name.as_str();
        let wanted = manifest.availability_zone.as_deref().map(str::trim).filter(|az| !az.is_empty());

        if manifest.vm.storage_type == StorageType::Network {
            let volumes = self.provider.list_volumes_by_tag(region, INSTANCE_ID_TAG, name).await?;
            if let Some(v) = volumes.first() {
                if let Some(az) = wanted.filter(|az| *az != v.availability_zone) {
                    anyhow::bail!(
                        "data volume {} of {} lives in {} but the manifest asks for {}; move the volume or change availability_zone",
                        v.volume_id,
                        name,
                        v.availability_zone,
                        az
                    );
                }
                tracing::info!("[vm] {}: pinned to {} by volume {}", name, v.availability_zone, v.volume_id);
                return Ok(Some(v.availability_zone.clone()));
            }
        }
        if manifest.vm.floating_ips {
            let nics = self
                .provider
                .list_network_interfaces_by_tag(region, INSTANCE_ID_TAG, name)
                .await?;
            if let Some(n) = nics.first() {
                if let Some(az) = wanted.filter(|az| *az != n.availability_zone) {
                    anyhow::bail!(
                        "network interface {} of {} lives in {} but the manifest asks for {}",
                        n.nic_id,
                        name,
                        n.availability_zone,
                        az
                    );
                }
                tracing::info!("[vm] {}: pinned to {} by network interface {}", name, n.availability_zone, n.nic_id);
                return Ok(Some(n.availability_zone.clone()));
            }
        }
        Ok(wanted.map(str::to_string))
    }

    async fn sku_still_fits(&self, region: &str, sku: &str, manifest: &InstanceManifest) -> Result<bool> {
        match self.provider.describe_instance_type(region, sku).await? {
            Some(info) => Ok(matches_constraints(&info, &HardwareConstraints::from(&manifest.vm))),
            None => {
                tracing::warn!("[vm] {}: SKU {} unknown in {}, keeping it", manifest.instance_name, sku, region);
                Ok(true)
            }
        }
    }

    async fn terminate_extra(&self, region: &str, name: &str, extra: &[VmInfo]) {
        for vm in extra {
            if self.dry_run {
                tracing::info!("[vm] {}: dry run, would terminate extra vm {}", name, vm.provider_id);
                continue;
            }
            tracing::warn!("[vm] {}: terminating extra vm {} ({})", name, vm.provider_id, vm.sku);
            if let Err(e) = self.provider.terminate_vm(region, &vm.provider_id).await {
                tracing::error!("[vm] {}: terminate {} failed: {:#}", name, vm.provider_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgspot_providers::mock::MockProvider;
    use pgspot_providers::{InstanceTypeInfo, VolumeInfo};
    use std::time::Duration;

    fn fast() -> ProvisioningTimeouts {
        ProvisioningTimeouts {
            running: Duration::from_millis(200),
            volume_available: Duration::from_millis(200),
            volume_attached: Duration::from_millis(200),
            nic_available: Duration::from_millis(200),
            poll: Duration::from_millis(5),
        }
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

    fn provider() -> MockProvider {
        let p = MockProvider::new();
        p.add_instance_type("eu-north-1", sku("m6g.large", 2, 8));
        p.add_instance_type("eu-north-1", sku("m6g.xlarge", 4, 16));
        p.add_spot_price("eu-north-1", "m6g.large", "eu-north-1a", 0.03);
        p.add_spot_price("eu-north-1", "m6g.large", "eu-north-1b", 0.02);
        p.add_spot_price("eu-north-1", "m6g.xlarge", "eu-north-1a", 0.05);
        p.add_spot_price("eu-north-1", "m6g.xlarge", "eu-north-1b", 0.06);
        p
    }

    fn manifest(cpu_min: u32) -> InstanceManifest {
        let mut m = InstanceManifest::from_yaml_str(&format!(
            "region: eu-north-1\ninstance_name: pg1\nvm:\n  cpu_min: {}\n",
            cpu_min
        ))
        .unwrap();
        m.fill_defaults();
        m
    }

    #[tokio::test]
    async fn creates_then_reuses() {
        let p = provider();
        let cmdb = Cmdb::in_memory().await.unwrap();
        let m = manifest(2);
        let inst = cmdb.register_instance(&m).await.unwrap();
        let mgr = VmManager::new(&p, &cmdb, fast(), false);

        let first = mgr.ensure_vm(&inst, &m, false).await.unwrap();
        assert!(first.created);
        let vm = first.vm.unwrap();
        assert_eq!(vm.sku, "m6g.large");
        assert_eq!(vm.availability_zone, "eu-north-1b");

        let second = mgr.ensure_vm(&inst, &m, false).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.vm.unwrap().provider_id, vm.provider_id);
        assert_eq!(p.launch_attempts().len(), 1);
    }

    #[tokio::test]
    async fn reclaimed_vm_is_replaced_in_the_volume_zone() {
        let p = provider();
        let cmdb = Cmdb::in_memory().await.unwrap();
        let m = manifest(2);
        let inst = cmdb.register_instance(&m).await.unwrap();
        let mgr = VmManager::new(&p, &cmdb, fast(), false);

        let old = mgr.ensure_vm(&inst, &m, false).await.unwrap().vm.unwrap();
        p.reclaim_vm(&old.provider_id);
        // Zone b is now the most expensive; the volume still pins us there.
        p.add_spot_price("eu-north-1", "m6g.large", "eu-north-1b", 0.5);

        let new = mgr.ensure_vm(&inst, &m, false).await.unwrap();
        assert!(new.created);
        let new = new.vm.unwrap();
        assert_ne!(new.provider_id, old.provider_id);
        assert_eq!(new.availability_zone, "eu-north-1b");
        assert_eq!(new.volume_id, old.volume_id);
        assert_eq!(cmdb.count_active_vms(inst.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn hardware_change_recreates_only_when_sku_no_longer_fits() {
        let p = provider();
        let cmdb = Cmdb::in_memory().await.unwrap();
        let m = manifest(2);
        let inst = cmdb.register_instance(&m).await.unwrap();
        let mgr = VmManager::new(&p, &cmdb, fast(), false);
        let old = mgr.ensure_vm(&inst, &m, false).await.unwrap().vm.unwrap();

        // Still fits: cpu_min lowered.
        let kept = mgr.ensure_vm(&inst, &manifest(1), true).await.unwrap();
        assert!(!kept.created);

        let bigger = manifest(4);
        let out = mgr.ensure_vm(&inst, &bigger, true).await.unwrap();
        assert!(out.created);
        let vm = out.vm.unwrap();
        assert_eq!(vm.sku, "m6g.xlarge");
        // Volume pins the new VM into the old zone.
        assert_eq!(vm.availability_zone, old.availability_zone);
        assert!(p.terminated_vms().contains(&old.provider_id));
        assert_eq!(cmdb.count_active_vms(inst.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn untracked_vms_are_adopted_and_extras_terminated() {
        let p = provider();
        let cmdb = Cmdb::in_memory().await.unwrap();
        let m = manifest(2);
        let inst = cmdb.register_instance(&m).await.unwrap();

        for id in ["i-a", "i-b"] {
            p.insert_running_vm(VmInfo {
                provider_id: id.into(),
                sku: "m6g.large".into(),
                region: "eu-north-1".into(),
                availability_zone: "eu-north-1a".into(),
                state: VmState::Running,
                ip_private: Some("10.0.0.5".into()),
                ip_public: None,
                tags: m.resource_tags(),
                launched_at: None,
            });
        }

        let out = VmManager::new(&p, &cmdb, fast(), false)
            .ensure_vm(&inst, &m, false)
            .await
            .unwrap();
        assert!(out.created);
        assert_eq!(out.vm.unwrap().provider_id, "i-a");
        assert_eq!(p.terminated_vms(), vec!["i-b".to_string()]);
        assert!(p.launch_attempts().is_empty());
    }

    #[tokio::test]
    async fn dry_run_launches_nothing() {
        let p = provider();
        let cmdb = Cmdb::in_memory().await.unwrap();
        let m = manifest(2);
        let inst = cmdb.register_instance(&m).await.unwrap();

        let out = VmManager::new(&p, &cmdb, fast(), true)
            .ensure_vm(&inst, &m, false)
            .await
            .unwrap();
        assert!(out.vm.is_none());
        assert!(!out.created);
        assert!(p.launch_attempts().is_empty());
        assert!(p.volumes().is_empty());
    }

    #[tokio::test]
    async fn unsatisfiable_constraints_fail_the_call() {
        let p = provider();
        let cmdb = Cmdb::in_memory().await.unwrap();
        let m = manifest(64);
        let inst = cmdb.register_instance(&m).await.unwrap();

        let err = VmManager::new(&p, &cmdb, fast(), false)
            .ensure_vm(&inst, &m, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no SKUs match"));
    }

    fn data_volume(az: &str) -> VolumeInfo {
        VolumeInfo {
            volume_id: "vol-data".into(),
            availability_zone: az.into(),
            size_gb: 20,
            volume_type: "gp3".into(),
            state: "available".into(),
            attached_to: None,
            attachment_state: None,
        }
    }

    #[tokio::test]
    async fn existing_volume_zone_wins_over_cheaper_zones() {
        let p = provider();
        let cmdb = Cmdb::in_memory().await.unwrap();
        let m = manifest(2);
        let inst = cmdb.register_instance(&m).await.unwrap();
        p.insert_volume(data_volume("eu-north-1a"), m.resource_tags());

        let vm = VmManager::new(&p, &cmdb, fast(), false)
            .ensure_vm(&inst, &m, false)
            .await
            .unwrap()
            .vm
            .unwrap();
        assert_eq!(vm.availability_zone, "eu-north-1a");
        assert_eq!(vm.volume_id.as_deref(), Some("vol-data"));
        assert_eq!(p.volumes().len(), 1);
    }

    #[tokio::test]
    async fn manifest_zone_conflicting_with_volume_is_refused() {
        let p = provider();
        let cmdb = Cmdb::in_memory().await.unwrap();
        let mut m = manifest(2);
        m.availability_zone = Some("eu-north-1b".into());
        let inst = cmdb.register_instance(&m).await.unwrap();
        p.insert_volume(data_volume("eu-north-1a"), m.resource_tags());

        let err = VmManager::new(&p, &cmdb, fast(), false)
            .ensure_vm(&inst, &m, false)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("vol-data"), "{}", msg);
        assert!(msg.contains("eu-north-1a"), "{}", msg);
        assert!(p.launch_attempts().is_empty());
        let volumes = p.volumes();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].volume_id, "vol-data");
    }
}
