//! VM provisioning state machine.
//!
//! `no-vm -> launch-attempted -> running -> volume-attached -> ip-assigned -> finalized`,
//! with `no-capacity-exhausted` when every candidate failed to launch. Every
//! wait is bounded by `ProvisioningTimeouts`; hitting one is an error.

use anyhow::{Context, Result};
use pgspot_common::{InstanceManifest, ProvisionedVm, StorageType, Vm, INSTANCE_ID_TAG};
use pgspot_providers::{
    is_capacity_error, CloudProvider, FloatingIpInfo, IpTarget, LaunchRequest, NetworkInterfaceInfo,
    NetworkInterfaceRequest, VmInfo, VmState, VolumeInfo, VolumeRequest,
};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::cmdb::Cmdb;
use crate::resolver::Candidate;

pub const DATA_VOLUME_DEVICE: &str = "/dev/sdf";
pub const DEFAULT_VOLUME_SIZE_GB: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningTimeouts {
    pub running: Duration,
    pub volume_available: Duration,
    pub volume_attached: Duration,
    pub nic_available: Duration,
    pub poll: Duration,
}

impl Default for ProvisioningTimeouts {
    fn default() -> Self {
        Self {
            running: Duration::from_secs(300),
            volume_available: Duration::from_secs(300),
            volume_attached: Duration::from_secs(120),
            nic_available: Duration::from_secs(120),
            poll: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    NoVm,
    LaunchAttempted,
    Running,
    VolumeAttached,
    IpAssigned,
    Finalized,
    NoCapacityExhausted,
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProvisioningState::NoVm => "no-vm",
            ProvisioningState::LaunchAttempted => "launch-attempted",
            ProvisioningState::Running => "running",
            ProvisioningState::VolumeAttached => "volume-attached",
            ProvisioningState::IpAssigned => "ip-assigned",
            ProvisioningState::Finalized => "finalized",
            ProvisioningState::NoCapacityExhausted => "no-capacity-exhausted",
        })
    }
}

/// Poll `check` until it yields a value or `timeout` elapses.
pub async fn wait_for<T, F, Fut>(what: &str, timeout: Duration, poll: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            anyhow::bail!("timed out after {}s waiting for {}", timeout.as_secs(), what);
        }
        sleep(poll).await;
    }
}

pub fn build_cloud_init(ssh_pub_keys: &[String]) -> String {
    let mut cloud = String::new();
    cloud.push_str("#cloud-config\n");
    let keys: Vec<&str> = ssh_pub_keys
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect();
    if !keys.is_empty() {
        cloud.push_str("ssh_authorized_keys:\n");
        for key in keys {
            cloud.push_str(&format!("  - {}\n", key));
        }
    }
    cloud
}

pub struct Provisioner<'a> {
    provider: &'a dyn CloudProvider,
    cmdb: &'a Cmdb,
    manifest: &'a InstanceManifest,
    instance_id: Uuid,
    timeouts: ProvisioningTimeouts,
    state: ProvisioningState,
    history: Vec<ProvisioningState>,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        provider: &'a dyn CloudProvider,
        cmdb: &'a Cmdb,
        manifest: &'a InstanceManifest,
        instance_id: Uuid,
        timeouts: ProvisioningTimeouts,
    ) -> Self {
        Self {
            provider,
            cmdb,
            manifest,
            instance_id,
            timeouts,
            state: ProvisioningState::NoVm,
            history: vec![ProvisioningState::NoVm],
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Every state visited, in order.
    pub fn history(&self) -> &[ProvisioningState] {
        &self.history
    }

    fn transition(&mut self, to: ProvisioningState, detail: &str) {
        tracing::info!(
            "🔄 [provisioning] {}: {} -> {} ({})",
            self.manifest.instance_name,
            self.state,
            to,
            detail
        );
        self.state = to;
        self.history.push(to);
    }

    fn name(&self) -> &str {
        &self.manifest.instance_name
    }

    /// Try candidates in order until one launches, then bring it to `finalized`.
    pub async fn provision(&mut self, candidates: &[Candidate]) -> Result<Vm> {
        if candidates.is_empty() {
            self.transition(ProvisioningState::NoCapacityExhausted, "no candidates");
            anyhow::bail!("no candidate SKUs for {}", self.name());
        }

        let user_data = build_cloud_init(&self.manifest.os.ssh_pub_keys);
        let volume_zones = self.data_volume_zones(&self.manifest.region).await?;
        for cand in candidates {
            if !volume_zones.is_empty() && !volume_zones.contains(&cand.availability_zone) {
                tracing::warn!(
                    "[provisioning] {}: skipping {} in {}, data volume lives in {}",
                    self.name(),
                    cand.info.sku,
                    cand.availability_zone,
                    volume_zones.join(", ")
                );
                continue;
            }
            let nic = if self.manifest.vm.floating_ips {
                match self.ensure_nic(&cand.region, &cand.availability_zone).await? {
                    Some(nic) => Some(nic),
                    None => {
                        tracing::warn!(
                            "[provisioning] {}: skipping {} in {}, floating NIC lives in another AZ",
                            self.name(),
                            cand.info.sku,
                            cand.availability_zone
                        );
                        continue;
                    }
                }
            } else {
                None
            };

            self.transition(
                ProvisioningState::LaunchAttempted,
                &format!("{} in {} at {:.5}/h", cand.info.sku, cand.availability_zone, cand.price_spot),
            );

            let image_id = match self.provider.resolve_boot_image(&cand.region, &cand.info.arch).await {
                Ok(image) => image,
                Err(e) => {
                    tracing::error!(
                        "[provisioning] {}: no boot image for {} ({}) in {}: {:#}",
                        self.name(),
                        cand.info.sku,
                        cand.info.arch,
                        cand.region,
                        e
                    );
                    continue;
                }
            };

            let req = LaunchRequest {
                region: cand.region.clone(),
                availability_zone: cand.availability_zone.clone(),
                sku: cand.info.sku.clone(),
                image_id,
                max_price: self.manifest.vm.max_price,
                user_data: Some(user_data.clone()),
                assign_public_ip: self.manifest.vm.assign_public_ip,
                network_interface_id: nic.as_ref().map(|n| n.nic_id.clone()),
                subnet_id: self.manifest.aws.subnet_id.clone(),
                security_group_ids: self.manifest.aws.security_group_ids.clone(),
                key_pair_name: self.manifest.aws.key_pair_name.clone(),
                tags: self.manifest.resource_tags(),
            };

            match self.provider.launch_vm(&req).await {
                Ok(vm) => {
                    tracing::info!(
                        "🚀 [provisioning] {}: launched {} ({} in {})",
                        self.name(),
                        vm.provider_id,
                        cand.info.sku,
                        cand.availability_zone
                    );
                    return self.complete(vm, Some(cand), nic.as_ref()).await;
                }
                Err(e) if is_capacity_error(&e) => {
                    tracing::warn!(
                        "[provisioning] {}: no spot capacity for {} in {}, trying next candidate",
                        self.name(),
                        cand.info.sku,
                        cand.availability_zone
                    );
                }
                Err(e) => {
                    tracing::error!(
                        "[provisioning] {}: launch of {} in {} ({}) failed: {:#}",
                        self.name(),
                        cand.info.sku,
                        cand.availability_zone,
                        self.manifest.cloud,
                        e
                    );
                }
            }
        }

        self.transition(
            ProvisioningState::NoCapacityExhausted,
            &format!("{} candidate(s) tried", candidates.len()),
        );
        anyhow::bail!(
            "all {} candidate SKU(s) failed to launch for {} in {}",
            candidates.len(),
            self.name(),
            self.manifest.region
        )
    }

    /// Zones of the tagged data volumes. Empty for local storage.
    async fn data_volume_zones(&self, region: &str) -> Result<Vec<String>> {
        if self.manifest.vm.storage_type != StorageType::Network {
            return Ok(Vec::new());
        }
        let mut zones: Vec<String> = self
            .provider
            .list_volumes_by_tag(region, INSTANCE_ID_TAG, self.name())
            .await?
            .into_iter()
            .map(|v| v.availability_zone)
            .collect();
        zones.sort();
        zones.dedup();
        Ok(zones)
    }

    /// Take over a VM that carries our tag but is unknown to the CMDB.
    pub async fn adopt(&mut self, vm: VmInfo) -> Result<Vm> {
        let nic = if self.manifest.vm.floating_ips {
            self.provider
                .list_network_interfaces_by_tag(&vm.region, INSTANCE_ID_TAG, &self.manifest.instance_name)
                .await?
                .into_iter()
                .find(|n| n.attached_to.as_deref() == Some(vm.provider_id.as_str()))
        } else {
            None
        };
        self.transition(ProvisioningState::LaunchAttempted, &format!("adopting {}", vm.provider_id));
        self.complete(vm, None, nic.as_ref()).await
    }

    async fn complete(&mut self, vm: VmInfo, cand: Option<&Candidate>, nic: Option<&NetworkInterfaceInfo>) -> Result<Vm> {
        let running = match self.wait_running(&vm.region, &vm.provider_id).await {
            Ok(running) => running,
            Err(e) => {
                tracing::error!(
                    "[provisioning] {}: {} never reached running, terminating it",
                    self.name(),
                    vm.provider_id
                );
                if let Err(te) = self.provider.terminate_vm(&vm.region, &vm.provider_id).await {
                    tracing::warn!("[provisioning] terminate {} failed: {:#}", vm.provider_id, te);
                }
                return Err(e);
            }
        };
        self.transition(ProvisioningState::Running, &running.provider_id);

        let volume_id = if self.manifest.vm.storage_type == StorageType::Network {
            let volume_id = self.ensure_volume(&running).await?;
            self.transition(ProvisioningState::VolumeAttached, &volume_id);
            Some(volume_id)
        } else {
            None
        };

        let floating_ip = if self.manifest.vm.assign_public_ip {
            let target = match nic {
                Some(n) => IpTarget::NetworkInterface(n.nic_id.clone()),
                None => IpTarget::Vm(running.provider_id.clone()),
            };
            let ip = self.ensure_floating_ip(&running.region, &target).await?;
            self.transition(ProvisioningState::IpAssigned, &ip.public_ip);
            Some(ip.public_ip)
        } else {
            None
        };

        let current = self
            .provider
            .describe_vm(&running.region, &running.provider_id)
            .await?
            .unwrap_or(running);

        let info = match cand {
            Some(c) => Some(c.info.clone()),
            None => self
                .provider
                .describe_instance_type(&current.region, &current.sku)
                .await
                .unwrap_or_default(),
        };

        let provisioned = ProvisionedVm {
            provider_id: current.provider_id.clone(),
            cloud: self.manifest.cloud.clone(),
            region: current.region.clone(),
            availability_zone: current.availability_zone.clone(),
            sku: current.sku.clone(),
            price_spot: cand.map(|c| c.price_spot),
            price_ondemand: cand.and_then(|c| c.price_ondemand),
            cpu: info.as_ref().map(|i| i64::from(i.vcpu)),
            ram_mb: info.as_ref().map(|i| i.ram_mb as i64),
            instance_storage_gb: info.as_ref().map(|i| i.instance_storage_gb as i64),
            login_user: self.provider.login_user().to_string(),
            ip_private: current.ip_private.clone().unwrap_or_default(),
            // describe_vm may still report the auto-assigned address.
            ip_public: floating_ip.or_else(|| current.ip_public.clone()),
            volume_id,
        };
        let row = self
            .cmdb
            .finalize_provisioning(self.instance_id, &provisioned)
            .await
            .context("finalize provisioning")?;
        self.transition(ProvisioningState::Finalized, &row.provider_id);
        Ok(row)
    }

    async fn wait_running(&self, region: &str, vm_id: &str) -> Result<VmInfo> {
        let provider = self.provider;
        wait_for(
            &format!("vm {} to be running", vm_id),
            self.timeouts.running,
            self.timeouts.poll,
            move || async move {
                match provider.describe_vm(region, vm_id).await? {
                    Some(vm) if vm.state == VmState::Running => Ok(Some(vm)),
                    Some(vm) if vm.state.is_gone() => {
                        anyhow::bail!("vm {} went {} while booting", vm_id, vm.state)
                    }
                    _ => Ok(None),
                }
            },
        )
        .await
    }

    async fn wait_volume<P>(&self, region: &str, volume_id: &str, what: &str, timeout: Duration, pred: P) -> Result<VolumeInfo>
    where
        P: Fn(&VolumeInfo) -> bool + Copy,
    {
        let provider = self.provider;
        wait_for(
            &format!("volume {} {}", volume_id, what),
            timeout,
            self.timeouts.poll,
            move || async move {
                match provider.describe_volume(region, volume_id).await? {
                    Some(v) if pred(&v) => Ok(Some(v)),
                    Some(_) => Ok(None),
                    None => anyhow::bail!("volume {} disappeared", volume_id),
                }
            },
        )
        .await
    }

    /// Find-or-create the tagged data volume and make sure it is attached to `vm`.
    async fn ensure_volume(&self, vm: &VmInfo) -> Result<String> {
        let tagged = self
            .provider
            .list_volumes_by_tag(&vm.region, INSTANCE_ID_TAG, self.name())
            .await?;
        if tagged.len() > 1 {
            tracing::warn!(
                "[provisioning] {}: {} tagged volumes found, using one in {}",
                self.name(),
                tagged.len(),
                vm.availability_zone
            );
        }

        if let Some(v) = tagged.iter().find(|v| v.is_attached_to(&vm.provider_id)) {
            tracing::info!("[provisioning] {}: volume {} already attached", self.name(), v.volume_id);
            return Ok(v.volume_id.clone());
        }

        let existing_zones: Vec<String> = tagged.iter().map(|v| v.availability_zone.clone()).collect();
        let volume = match tagged.into_iter().find(|v| v.availability_zone == vm.availability_zone) {
            Some(existing) => {
                tracing::info!(
                    "[provisioning] {}: reusing volume {} ({})",
                    self.name(),
                    existing.volume_id,
                    existing.state
                );
                existing
            }
            None if !existing_zones.is_empty() => {
                anyhow::bail!(
                    "vm {} is in {} but the data volume of {} lives in {}",
                    vm.provider_id,
                    vm.availability_zone,
                    self.name(),
                    existing_zones.join(", ")
                );
            }
            None => {
                let req = VolumeRequest {
                    region: vm.region.clone(),
                    availability_zone: vm.availability_zone.clone(),
                    size_gb: self.manifest.vm.storage_min.unwrap_or(DEFAULT_VOLUME_SIZE_GB),
                    volume_type: self.manifest.vm.volume_type.clone(),
                    iops: self.manifest.vm.volume_iops,
                    throughput: self.manifest.vm.volume_throughput,
                    tags: self.manifest.resource_tags(),
                };
                let created = self.provider.create_volume(&req).await?;
                tracing::info!(
                    "💾 [provisioning] {}: created volume {} ({} GB {}) in {}",
                    self.name(),
                    created.volume_id,
                    req.size_gb,
                    req.volume_type,
                    req.availability_zone
                );
                created
            }
        };

        self.attach_volume(vm, &volume).await?;
        Ok(volume.volume_id)
    }

    async fn attach_volume(&self, vm: &VmInfo, volume: &VolumeInfo) -> Result<()> {
        let current = self
            .provider
            .describe_volume(&vm.region, &volume.volume_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("volume {} disappeared", volume.volume_id))?;
        if current.is_attached_to(&vm.provider_id) {
            return Ok(());
        }

        if current.state != "available" {
            self.wait_volume(
                &vm.region,
                &volume.volume_id,
                "to become available",
                self.timeouts.volume_available,
                |v| v.state == "available",
            )
            .await?;
        }

        self.provider
            .attach_volume(&vm.region, &volume.volume_id, &vm.provider_id, DATA_VOLUME_DEVICE)
            .await?;

        let vm_id = vm.provider_id.as_str();
        self.wait_volume(
            &vm.region,
            &volume.volume_id,
            "to attach",
            self.timeouts.volume_attached,
            move |v| v.is_attached_to(vm_id),
        )
        .await?;
        Ok(())
    }

    /// Tagged floating NIC usable in `az`. `None` when the existing NIC lives
    /// in another AZ.
    async fn ensure_nic(&self, region: &str, az: &str) -> Result<Option<NetworkInterfaceInfo>> {
        let nics = self
            .provider
            .list_network_interfaces_by_tag(region, INSTANCE_ID_TAG, self.name())
            .await?;

        let nic = match nics.iter().find(|n| n.availability_zone == az) {
            Some(n) => n.clone(),
            None if !nics.is_empty() => return Ok(None),
            None => {
                let created = self
                    .provider
                    .create_network_interface(&NetworkInterfaceRequest {
                        region: region.to_string(),
                        availability_zone: az.to_string(),
                        subnet_id: self.manifest.aws.subnet_id.clone(),
                        security_group_ids: self.manifest.aws.security_group_ids.clone(),
                        tags: self.manifest.resource_tags(),
                    })
                    .await?;
                tracing::info!("[provisioning] {}: created network interface {} in {}", self.name(), created.nic_id, az);
                created
            }
        };

        if nic.status == "available" {
            return Ok(Some(nic));
        }
        let provider = self.provider;
        let nic_id = nic.nic_id.as_str();
        let ready = wait_for(
            &format!("network interface {} to become available", nic_id),
            self.timeouts.nic_available,
            self.timeouts.poll,
            move || async move {
                match provider.describe_network_interface(region, nic_id).await? {
                    Some(n) if n.status == "available" => Ok(Some(n)),
                    Some(_) => Ok(None),
                    None => anyhow::bail!("network interface {} disappeared", nic_id),
                }
            },
        )
        .await?;
        Ok(Some(ready))
    }

    async fn ensure_floating_ip(&self, region: &str, target: &IpTarget) -> Result<FloatingIpInfo> {
        let tagged = self
            .provider
            .list_floating_ips_by_tag(region, INSTANCE_ID_TAG, self.name())
            .await?;
        let ip = match tagged.into_iter().next() {
            Some(ip) => ip,
            None => {
                let ip = self
                    .provider
                    .allocate_floating_ip(region, &self.manifest.resource_tags())
                    .await?;
                tracing::info!("[provisioning] {}: allocated floating ip {}", self.name(), ip.public_ip);
                ip
            }
        };

        let associated = match target {
            IpTarget::Vm(id) => ip.vm_id.as_deref() == Some(id.as_str()),
            IpTarget::NetworkInterface(id) => ip.network_interface_id.as_deref() == Some(id.as_str()),
        };
        if !associated {
            self.provider
                .associate_floating_ip(region, &ip.allocation_id, target)
                .await?;
        }
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgspot_common::StorageSpeedClass;
    use pgspot_providers::mock::MockProvider;
    use pgspot_providers::{InstanceTypeInfo, Tags};

    fn fast() -> ProvisioningTimeouts {
        ProvisioningTimeouts {
            running: Duration::from_millis(200),
            volume_available: Duration::from_millis(200),
            volume_attached: Duration::from_millis(200),
            nic_available: Duration::from_millis(200),
            poll: Duration::from_millis(5),
        }
    }

    fn manifest(extra: &str) -> InstanceManifest {
        let mut m = InstanceManifest::from_yaml_str(&format!(
            "region: eu-north-1\ninstance_name: pg1\nvm:\n  cpu_min: 2\n  storage_min: 20\n{}",
            extra
        ))
        .unwrap();
        m.fill_defaults();
        m
    }

    fn candidate(sku: &str, az: &str, price: f64) -> Candidate {
        Candidate {
            info: InstanceTypeInfo {
                sku: sku.into(),
                arch: "arm64".into(),
                vcpu: 2,
                ram_mb: 8192,
                instance_storage_gb: 0,
                instance_storage_class: None,
                burstable: false,
            },
            region: "eu-north-1".into(),
            availability_zone: az.into(),
            price_spot: price,
            price_ondemand: None,
            eviction_rate_group: None,
        }
    }

    async fn setup(m: &InstanceManifest) -> (Cmdb, Uuid) {
        let cmdb = Cmdb::in_memory().await.unwrap();
        let inst = cmdb.register_instance(m).await.unwrap();
        (cmdb, inst.id)
    }

    #[test]
    fn cloud_init_lists_keys() {
        let ci = build_cloud_init(&["ssh-ed25519 AAA a@b".into(), " ".into()]);
        assert!(ci.starts_with("#cloud-config\n"));
        assert!(ci.contains("  - ssh-ed25519 AAA a@b\n"));
        assert_eq!(build_cloud_init(&[]), "#cloud-config\n");
    }

    #[tokio::test]
    async fn capacity_failure_advances_to_next_candidate() {
        let m = manifest("");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();
        p.exhaust_capacity("m6gd.large");
        p.set_boot_polls(2);

        let mut prov = Provisioner::new(&p, &cmdb, &m, id, fast());
        let vm = prov
            .provision(&[candidate("m6gd.large", "eu-north-1a", 0.02), candidate("r6gd.large", "eu-north-1b", 0.03)])
            .await
            .unwrap();

        assert_eq!(vm.sku, "r6gd.large");
        assert_eq!(vm.login_user, "admin");
        assert!(vm.volume_id.is_some());
        assert!(vm.ip_public.is_some());
        assert_eq!(p.launch_attempts().len(), 2);
        assert_eq!(prov.state(), ProvisioningState::Finalized);
        assert_eq!(
            prov.history(),
            &[
                ProvisioningState::NoVm,
                ProvisioningState::LaunchAttempted,
                ProvisioningState::LaunchAttempted,
                ProvisioningState::Running,
                ProvisioningState::VolumeAttached,
                ProvisioningState::IpAssigned,
                ProvisioningState::Finalized,
            ]
        );
    }

    #[tokio::test]
    async fn all_candidates_failing_is_terminal() {
        let m = manifest("");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();
        p.exhaust_capacity("m6gd.large");
        p.fail_launches_of("r6gd.large");

        let mut prov = Provisioner::new(&p, &cmdb, &m, id, fast());
        let err = prov
            .provision(&[candidate("m6gd.large", "eu-north-1a", 0.02), candidate("r6gd.large", "eu-north-1a", 0.03)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to launch"));
        assert_eq!(prov.state(), ProvisioningState::NoCapacityExhausted);
        assert!(cmdb.active_vm(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn boot_timeout_is_a_failure_and_terminates_the_vm() {
        let m = manifest("");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();
        p.set_boot_polls(10_000);

        let mut prov = Provisioner::new(&p, &cmdb, &m, id, fast());
        let err = prov
            .provision(&[candidate("m6gd.large", "eu-north-1a", 0.02)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(p.terminated_vms().len(), 1);
        assert!(p.live_vms().is_empty());
    }

    #[tokio::test]
    async fn existing_detached_volume_is_reattached() {
        let m = manifest("");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();
        p.insert_volume(
            VolumeInfo {
                volume_id: "vol-old".into(),
                availability_zone: "eu-north-1a".into(),
                size_gb: 20,
                volume_type: "gp3".into(),
                state: "available".into(),
                attached_to: None,
                attachment_state: None,
            },
            m.resource_tags(),
        );

        let mut prov = Provisioner::new(&p, &cmdb, &m, id, fast());
        let vm = prov
            .provision(&[candidate("m6gd.large", "eu-north-1a", 0.02)])
            .await
            .unwrap();
        assert_eq!(vm.volume_id.as_deref(), Some("vol-old"));
        assert_eq!(p.volumes().len(), 1);
        assert!(p.volumes()[0].is_attached_to(&vm.provider_id));
    }

    #[tokio::test]
    async fn floating_ip_is_reused_across_recreation() {
        let m = manifest("");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();

        let first = Provisioner::new(&p, &cmdb, &m, id, fast())
            .provision(&[candidate("m6gd.large", "eu-north-1a", 0.02)])
            .await
            .unwrap();
        p.reclaim_vm(&first.provider_id);
        let second = Provisioner::new(&p, &cmdb, &m, id, fast())
            .provision(&[candidate("m6gd.large", "eu-north-1a", 0.02)])
            .await
            .unwrap();

        assert_ne!(first.provider_id, second.provider_id);
        assert_eq!(first.ip_public, second.ip_public);
        assert_eq!(first.volume_id, second.volume_id);
        assert_eq!(p.floating_ips().len(), 1);
        assert_eq!(cmdb.count_active_vms(id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn floating_nic_mode_launches_on_the_nic() {
        let m = manifest("  floating_ips: true\n");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();

        let vm = Provisioner::new(&p, &cmdb, &m, id, fast())
            .provision(&[candidate("m6gd.large", "eu-north-1a", 0.02)])
            .await
            .unwrap();

        let nics = p.network_interfaces();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].attached_to.as_deref(), Some(vm.provider_id.as_str()));
        assert_eq!(vm.ip_private, nics[0].ip_private.clone().unwrap());
        let ips = p.floating_ips();
        assert_eq!(ips[0].network_interface_id.as_deref(), Some(nics[0].nic_id.as_str()));
        assert_eq!(vm.ip_public.as_deref(), Some(ips[0].public_ip.as_str()));
    }

    #[tokio::test]
    async fn local_storage_skips_volume_and_private_only_skips_ip() {
        let m = manifest("  storage_type: local\n  assign_public_ip: false\n");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();

        let mut prov = Provisioner::new(&p, &cmdb, &m, id, fast());
        let vm = prov
            .provision(&[candidate("m6gd.large", "eu-north-1a", 0.02)])
            .await
            .unwrap();
        assert!(vm.volume_id.is_none());
        assert!(vm.ip_public.is_none());
        assert!(p.volumes().is_empty());
        assert!(!prov.history().contains(&ProvisioningState::VolumeAttached));
        assert!(!prov.history().contains(&ProvisioningState::IpAssigned));
    }

    #[tokio::test]
    async fn adopted_vm_is_finalized_without_launch() {
        let m = manifest("");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();
        p.add_instance_type(
            "eu-north-1",
            InstanceTypeInfo {
                sku: "m6gd.large".into(),
                arch: "arm64".into(),
                vcpu: 2,
                ram_mb: 8192,
                instance_storage_gb: 118,
                instance_storage_class: Some(StorageSpeedClass::Nvme),
                burstable: false,
            },
        );
        let mut tags = Tags::new();
        tags.insert(INSTANCE_ID_TAG.into(), "pg1".into());
        let orphan = VmInfo {
            provider_id: "i-orphan".into(),
            sku: "m6gd.large".into(),
            region: "eu-north-1".into(),
            availability_zone: "eu-north-1a".into(),
            state: VmState::Running,
            ip_private: Some("10.0.0.99".into()),
            ip_public: None,
            tags,
            launched_at: None,
        };
        p.insert_running_vm(orphan.clone());

        let vm = Provisioner::new(&p, &cmdb, &m, id, fast()).adopt(orphan).await.unwrap();
        assert_eq!(vm.provider_id, "i-orphan");
        assert_eq!(vm.cpu, Some(2));
        assert!(vm.price_spot.is_none());
        assert!(p.launch_attempts().is_empty());
    }

    #[tokio::test]
    async fn volume_that_never_becomes_available_fails_unfinalized() {
        let m = manifest("");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();
        p.set_new_volume_state("creating");

        let mut prov = Provisioner::new(&p, &cmdb, &m, id, fast());
        let err = prov
            .provision(&[candidate("m6gd.large", "eu-north-1a", 0.02)])
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("timed out"), "{}", msg);
        assert!(msg.contains("to become available"), "{}", msg);
        assert_eq!(prov.state(), ProvisioningState::Running);
        assert!(cmdb.active_vm(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attachment_stuck_attaching_fails_unfinalized() {
        let m = manifest("");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();
        p.stall_attachments();

        let mut prov = Provisioner::new(&p, &cmdb, &m, id, fast());
        let err = prov
            .provision(&[candidate("m6gd.large", "eu-north-1a", 0.02)])
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("timed out"), "{}", msg);
        assert!(msg.contains("to attach"), "{}", msg);
        assert!(!prov.history().contains(&ProvisioningState::VolumeAttached));
        assert!(cmdb.active_vm(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn volume_in_another_zone_is_never_duplicated() {
        let m = manifest("");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();
        p.insert_volume(
            VolumeInfo {
                volume_id: "vol-data".into(),
                availability_zone: "eu-north-1a".into(),
                size_gb: 20,
                volume_type: "gp3".into(),
                state: "available".into(),
                attached_to: None,
                attachment_state: None,
            },
            m.resource_tags(),
        );

        let mut prov = Provisioner::new(&p, &cmdb, &m, id, fast());
        let err = prov
            .provision(&[candidate("m6gd.large", "eu-north-1b", 0.01)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to launch"));
        assert!(p.launch_attempts().is_empty());
        assert_eq!(p.volumes().len(), 1);

        let vm = Provisioner::new(&p, &cmdb, &m, id, fast())
            .provision(&[
                candidate("m6gd.large", "eu-north-1b", 0.01),
                candidate("m6gd.large", "eu-north-1a", 0.02),
            ])
            .await
            .unwrap();
        assert_eq!(vm.availability_zone, "eu-north-1a");
        assert_eq!(vm.volume_id.as_deref(), Some("vol-data"));
        assert_eq!(p.volumes().len(), 1);
    }

    #[tokio::test]
    async fn recorded_public_ip_is_the_floating_one() {
        let m = manifest("");
        let (cmdb, id) = setup(&m).await;
        let p = MockProvider::new();
        p.lag_ip_refresh();

        let vm = Provisioner::new(&p, &cmdb, &m, id, fast())
            .provision(&[candidate("m6gd.large", "eu-north-1a", 0.02)])
            .await
            .unwrap();
        let described = p.describe_vm("eu-north-1", &vm.provider_id).await.unwrap().unwrap();
        let floating = p.floating_ips()[0].public_ip.clone();
        assert_ne!(described.ip_public.as_deref(), Some(floating.as_str()));
        assert_eq!(vm.ip_public.as_deref(), Some(floating.as_str()));
        let row = cmdb.active_vm(id).await.unwrap().unwrap();
        assert_eq!(row.ip_public.as_deref(), Some(floating.as_str()));
    }
}
