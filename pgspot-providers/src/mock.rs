//! In-memory provider used by tests and local dry runs.
//!
//! Resources live in a `Mutex` guarded map. VMs become `running` after
//! `boot_polls` describe calls and `terminated` after `shutdown_polls`,
//! volumes attach immediately, NICs are created `available`. Capacity,
//! region and attachment failures are configurable knobs.

use crate::{inventory::*, CapacityExhausted, CloudProvider};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    catalog: HashMap<String, Vec<InstanceTypeInfo>>,
    prices: HashMap<String, Vec<SpotPricePoint>>,
    ondemand: HashMap<String, f64>,
    eviction_groups: HashMap<String, u8>,

    vms: BTreeMap<String, (VmInfo, u32)>,
    volumes: BTreeMap<String, (VolumeInfo, Tags)>,
    ips: BTreeMap<String, (FloatingIpInfo, Tags)>,
    nics: BTreeMap<String, (NetworkInterfaceInfo, Tags)>,

    exhausted_skus: HashSet<String>,
    failing_skus: HashSet<String>,
    failing_regions: HashSet<String>,
    boot_polls: u32,
    shutdown_polls: u32,
    new_volume_state: Option<String>,
    stall_attachments: bool,
    lag_ip_refresh: bool,

    launch_attempts: Vec<(String, String)>,
    terminated: Vec<String>,
    deleted_volumes: Vec<String>,
    released_ips: Vec<String>,
    seq: u64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{}-mock{:04}", prefix, self.seq)
    }
}

pub struct MockProvider {
    state: Mutex<MockState>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    // --- seeding -----------------------------------------------------------

    pub fn add_instance_type(&self, region: &str, info: InstanceTypeInfo) {
        self.with_state(|s| s.catalog.entry(region.to_string()).or_default().push(info));
    }

    pub fn add_spot_price(&self, region: &str, sku: &str, availability_zone: &str, price: f64) {
        self.with_state(|s| {
            s.prices.entry(region.to_string()).or_default().push(SpotPricePoint {
                sku: sku.to_string(),
                availability_zone: availability_zone.to_string(),
                price,
                timestamp: Some(Utc::now()),
            })
        });
    }

    pub fn set_ondemand_price(&self, sku: &str, price: f64) {
        self.with_state(|s| s.ondemand.insert(sku.to_string(), price));
    }

    pub fn set_eviction_group(&self, sku: &str, group: u8) {
        self.with_state(|s| s.eviction_groups.insert(sku.to_string(), group));
    }

    /// Launches of this SKU fail with `CapacityExhausted`.
    pub fn exhaust_capacity(&self, sku: &str) {
        self.with_state(|s| s.exhausted_skus.insert(sku.to_string()));
    }

    /// Launches of this SKU fail with a generic error.
    pub fn fail_launches_of(&self, sku: &str) {
        self.with_state(|s| s.failing_skus.insert(sku.to_string()));
    }

    /// Catalog calls for this region fail.
    pub fn fail_region(&self, region: &str) {
        self.with_state(|s| s.failing_regions.insert(region.to_string()));
    }

    /// Number of describe calls a fresh VM stays `pending`.
    pub fn set_boot_polls(&self, polls: u32) {
        self.with_state(|s| s.boot_polls = polls);
    }

    /// Number of describe calls a terminated VM stays `shutting-down`,
    /// keeping its volume and NIC attached.
    pub fn set_shutdown_polls(&self, polls: u32) {
        self.with_state(|s| s.shutdown_polls = polls);
    }

    /// New volumes stay in `state` (e.g. `creating`) forever.
    pub fn set_new_volume_state(&self, state: &str) {
        self.with_state(|s| s.new_volume_state = Some(state.to_string()));
    }

    /// Attachments stay `attaching` forever.
    pub fn stall_attachments(&self) {
        self.with_state(|s| s.stall_attachments = true);
    }

    /// Associating a floating IP does not show up in `describe_vm`.
    pub fn lag_ip_refresh(&self) {
        self.with_state(|s| s.lag_ip_refresh = true);
    }

    /// Simulate a spot reclaim: the VM disappears, attachments are dropped.
    pub fn reclaim_vm(&self, vm_id: &str) {
        self.with_state(|s| {
            if let Some((vm, _)) = s.vms.get_mut(vm_id) {
                vm.state = VmState::Terminated;
            }
            detach_all(s, vm_id);
        });
    }

    /// Insert a VM that was launched outside of the operator (or before a crash).
    pub fn insert_running_vm(&self, vm: VmInfo) {
        self.with_state(|s| {
            s.vms.insert(vm.provider_id.clone(), (vm, 0));
        });
    }

    pub fn insert_volume(&self, volume: VolumeInfo, tags: Tags) {
        self.with_state(|s| {
            s.volumes.insert(volume.volume_id.clone(), (volume, tags));
        });
    }

    // --- inspection --------------------------------------------------------

    pub fn launch_attempts(&self) -> Vec<(String, String)> {
        self.with_state(|s| s.launch_attempts.clone())
    }

    pub fn terminated_vms(&self) -> Vec<String> {
        self.with_state(|s| s.terminated.clone())
    }

    pub fn deleted_volumes(&self) -> Vec<String> {
        self.with_state(|s| s.deleted_volumes.clone())
    }

    pub fn released_ips(&self) -> Vec<String> {
        self.with_state(|s| s.released_ips.clone())
    }

    pub fn live_vms(&self) -> Vec<VmInfo> {
        self.with_state(|s| {
            s.vms
                .values()
                .filter(|(vm, _)| !vm.state.is_gone())
                .map(|(vm, _)| vm.clone())
                .collect()
        })
    }

    pub fn volumes(&self) -> Vec<VolumeInfo> {
        self.with_state(|s| s.volumes.values().map(|(v, _)| v.clone()).collect())
    }

    pub fn floating_ips(&self) -> Vec<FloatingIpInfo> {
        self.with_state(|s| s.ips.values().map(|(ip, _)| ip.clone()).collect())
    }

    pub fn network_interfaces(&self) -> Vec<NetworkInterfaceInfo> {
        self.with_state(|s| s.nics.values().map(|(n, _)| n.clone()).collect())
    }
}

fn detach_all(s: &mut MockState, vm_id: &str) {
    for (vol, _) in s.volumes.values_mut() {
        if vol.attached_to.as_deref() == Some(vm_id) {
            vol.attached_to = None;
            vol.attachment_state = None;
            vol.state = "available".to_string();
        }
    }
    for (ip, _) in s.ips.values_mut() {
        if ip.vm_id.as_deref() == Some(vm_id) {
            ip.vm_id = None;
            ip.association_id = None;
        }
    }
    for (nic, _) in s.nics.values_mut() {
        if nic.attached_to.as_deref() == Some(vm_id) {
            nic.attached_to = None;
            nic.status = "available".to_string();
        }
    }
}

fn has_tag(tags: &Tags, key: &str, value: &str) -> bool {
    tags.get(key).map(String::as_str) == Some(value)
}

fn region_of_az(az: &str) -> &str {
    az.strip_suffix(|c: char| c.is_ascii_lowercase()).unwrap_or(az)
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn cloud(&self) -> &'static str {
        "mock"
    }

    fn login_user(&self) -> &'static str {
        "admin"
    }

    async fn list_instance_types(&self, region: &str, local_storage_only: bool) -> Result<Vec<InstanceTypeInfo>> {
        self.with_state(|s| {
            if s.failing_regions.contains(region) {
                return Err(anyhow::anyhow!("MockProvider: region '{}' unavailable", region));
            }
            Ok(s.catalog
                .get(region)
                .map(|items| {
                    items
                        .iter()
                        .filter(|it| !local_storage_only || it.instance_storage_gb > 0)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn describe_instance_type(&self, region: &str, sku: &str) -> Result<Option<InstanceTypeInfo>> {
        self.with_state(|s| {
            Ok(s.catalog
                .get(region)
                .and_then(|items| items.iter().find(|it| it.sku == sku).cloned()))
        })
    }

    async fn get_spot_price_history(
        &self,
        region: &str,
        skus: &[String],
        _since: DateTime<Utc>,
        availability_zone: Option<&str>,
    ) -> Result<Vec<SpotPricePoint>> {
        self.with_state(|s| {
            if s.failing_regions.contains(region) {
                return Err(anyhow::anyhow!("MockProvider: region '{}' unavailable", region));
            }
            Ok(s.prices
                .get(region)
                .map(|points| {
                    points
                        .iter()
                        .filter(|p| skus.contains(&p.sku))
                        .filter(|p| availability_zone.map_or(true, |az| p.availability_zone == az))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn get_ondemand_prices(&self, _region: &str, skus: &[String]) -> Result<HashMap<String, f64>> {
        self.with_state(|s| {
            Ok(skus
                .iter()
                .filter_map(|sku| s.ondemand.get(sku).map(|p| (sku.clone(), *p)))
                .collect())
        })
    }

    async fn get_eviction_rate_groups(&self, _region: &str, skus: &[String]) -> Result<HashMap<String, u8>> {
        self.with_state(|s| {
            Ok(skus
                .iter()
                .filter_map(|sku| s.eviction_groups.get(sku).map(|g| (sku.clone(), *g)))
                .collect())
        })
    }

    async fn resolve_boot_image(&self, _region: &str, arch: &str) -> Result<String> {
        Ok(format!("ami-mock-debian-12-{}", arch))
    }

    async fn launch_vm(&self, req: &LaunchRequest) -> Result<VmInfo> {
        self.with_state(|s| {
            s.launch_attempts.push((req.sku.clone(), req.availability_zone.clone()));
            if s.exhausted_skus.contains(&req.sku) {
                return Err(CapacityExhausted {
                    sku: req.sku.clone(),
                    availability_zone: req.availability_zone.clone(),
                    detail: "InsufficientInstanceCapacity".to_string(),
                }
                .into());
            }
            if s.failing_skus.contains(&req.sku) {
                return Err(anyhow::anyhow!("MockProvider: launch of '{}' rejected", req.sku));
            }

            let provider_id = s.next_id("i");
            let ip_private = format!("10.0.0.{}", s.seq % 250 + 2);
            let mut ip_public = if req.assign_public_ip && req.network_interface_id.is_none() {
                Some(format!("198.51.100.{}", s.seq % 250 + 2))
            } else {
                None
            };
            if let Some(nic_id) = req.network_interface_id.as_deref() {
                let (nic, _) = s
                    .nics
                    .get_mut(nic_id)
                    .ok_or_else(|| anyhow::anyhow!("MockProvider: unknown network interface '{}'", nic_id))?;
                nic.attached_to = Some(provider_id.clone());
                nic.status = "in-use".to_string();
                let nic_ip = nic.ip_private.clone();
                ip_public = s
                    .ips
                    .values()
                    .find(|(ip, _)| ip.network_interface_id.as_deref() == Some(nic_id))
                    .map(|(ip, _)| ip.public_ip.clone());
                let vm = VmInfo {
                    provider_id: provider_id.clone(),
                    sku: req.sku.clone(),
                    region: req.region.clone(),
                    availability_zone: req.availability_zone.clone(),
                    state: VmState::Pending,
                    ip_private: nic_ip,
                    ip_public,
                    tags: req.tags.clone(),
                    launched_at: Some(Utc::now()),
                };
                let boot = s.boot_polls;
                s.vms.insert(provider_id, (vm.clone(), boot));
                return Ok(vm);
            }

            let vm = VmInfo {
                provider_id: provider_id.clone(),
                sku: req.sku.clone(),
                region: req.region.clone(),
                availability_zone: req.availability_zone.clone(),
                state: VmState::Pending,
                ip_private: Some(ip_private),
                ip_public,
                tags: req.tags.clone(),
                launched_at: Some(Utc::now()),
            };
            let boot = s.boot_polls;
            s.vms.insert(provider_id, (vm.clone(), boot));
            Ok(vm)
        })
    }

    async fn describe_vm(&self, _region: &str, vm_id: &str) -> Result<Option<VmInfo>> {
        self.with_state(|s| {
            let mut finished_shutdown = false;
            let vm = s.vms.get_mut(vm_id).map(|(vm, polls_left)| {
                match vm.state {
                    VmState::Pending if *polls_left == 0 => vm.state = VmState::Running,
                    VmState::ShuttingDown if *polls_left == 0 => {
                        vm.state = VmState::Terminated;
                        finished_shutdown = true;
                    }
                    VmState::Pending | VmState::ShuttingDown => *polls_left -= 1,
                    _ => {}
                }
                vm.clone()
            });
            if finished_shutdown {
                detach_all(s, vm_id);
            }
            Ok(vm)
        })
    }

    async fn list_vms_by_tag(&self, region: &str, tag_key: &str, tag_value: &str) -> Result<Vec<VmInfo>> {
        self.with_state(|s| {
            Ok(s.vms
                .values()
                .map(|(vm, _)| vm)
                .filter(|vm| vm.region == region && !vm.state.is_gone() && has_tag(&vm.tags, tag_key, tag_value))
                .cloned()
                .collect())
        })
    }

    async fn terminate_vm(&self, _region: &str, vm_id: &str) -> Result<bool> {
        self.with_state(|s| {
            let shutdown = s.shutdown_polls;
            let found = match s.vms.get_mut(vm_id) {
                Some((vm, polls_left)) if !vm.state.is_gone() => {
                    if shutdown == 0 {
                        vm.state = VmState::Terminated;
                    } else {
                        vm.state = VmState::ShuttingDown;
                        *polls_left = shutdown;
                    }
                    true
                }
                _ => false,
            };
            if found {
                s.terminated.push(vm_id.to_string());
                if shutdown == 0 {
                    detach_all(s, vm_id);
                }
            }
            Ok(found)
        })
    }

    async fn list_volumes_by_tag(&self, region: &str, tag_key: &str, tag_value: &str) -> Result<Vec<VolumeInfo>> {
        self.with_state(|s| {
            Ok(s.volumes
                .values()
                .filter(|(v, tags)| region_of_az(&v.availability_zone) == region && has_tag(tags, tag_key, tag_value))
                .map(|(v, _)| v.clone())
                .collect())
        })
    }

    async fn describe_volume(&self, _region: &str, volume_id: &str) -> Result<Option<VolumeInfo>> {
        self.with_state(|s| Ok(s.volumes.get(volume_id).map(|(v, _)| v.clone())))
    }

    async fn create_volume(&self, req: &VolumeRequest) -> Result<VolumeInfo> {
        self.with_state(|s| {
            let state = s.new_volume_state.clone().unwrap_or_else(|| "available".to_string());
            let volume = VolumeInfo {
                volume_id: s.next_id("vol"),
                availability_zone: req.availability_zone.clone(),
                size_gb: req.size_gb,
                volume_type: req.volume_type.clone(),
                state,
                attached_to: None,
                attachment_state: None,
            };
            s.volumes
                .insert(volume.volume_id.clone(), (volume.clone(), req.tags.clone()));
            Ok(volume)
        })
    }

    async fn attach_volume(&self, _region: &str, volume_id: &str, vm_id: &str, _device: &str) -> Result<()> {
        self.with_state(|s| {
            let stall = s.stall_attachments;
            let vm_az = s
                .vms
                .get(vm_id)
                .map(|(vm, _)| vm.availability_zone.clone())
                .ok_or_else(|| anyhow::anyhow!("MockProvider: unknown vm '{}'", vm_id))?;
            let (vol, _) = s
                .volumes
                .get_mut(volume_id)
                .ok_or_else(|| anyhow::anyhow!("MockProvider: unknown volume '{}'", volume_id))?;
            if vol.availability_zone != vm_az {
                return Err(anyhow::anyhow!(
                    "MockProvider: volume {} is in {}, vm {} in {}",
                    volume_id,
                    vol.availability_zone,
                    vm_id,
                    vm_az
                ));
            }
            if vol.attached_to.is_some() && vol.attached_to.as_deref() != Some(vm_id) {
                return Err(anyhow::anyhow!("MockProvider: volume {} is in use", volume_id));
            }
            if vol.state != "available" && vol.attached_to.is_none() {
                return Err(anyhow::anyhow!("MockProvider: volume {} is {}", volume_id, vol.state));
            }
            vol.attached_to = Some(vm_id.to_string());
            vol.attachment_state = Some(if stall { "attaching" } else { "attached" }.to_string());
            vol.state = "in-use".to_string();
            Ok(())
        })
    }

    async fn delete_volume(&self, _region: &str, volume_id: &str) -> Result<bool> {
        self.with_state(|s| {
            if let Some((vol, _)) = s.volumes.get(volume_id) {
                if let Some(vm_id) = vol.attached_to.as_deref() {
                    return Err(anyhow::anyhow!("VolumeInUse: {} is attached to {}", volume_id, vm_id));
                }
            }
            let removed = s.volumes.remove(volume_id).is_some();
            if removed {
                s.deleted_volumes.push(volume_id.to_string());
            }
            Ok(removed)
        })
    }

    async fn list_floating_ips_by_tag(&self, _region: &str, tag_key: &str, tag_value: &str) -> Result<Vec<FloatingIpInfo>> {
        self.with_state(|s| {
            Ok(s.ips
                .values()
                .filter(|(_, tags)| has_tag(tags, tag_key, tag_value))
                .map(|(ip, _)| ip.clone())
                .collect())
        })
    }

    async fn allocate_floating_ip(&self, _region: &str, tags: &Tags) -> Result<FloatingIpInfo> {
        self.with_state(|s| {
            let allocation_id = s.next_id("eipalloc");
            let ip = FloatingIpInfo {
                allocation_id: allocation_id.clone(),
                public_ip: format!("203.0.113.{}", s.seq % 250 + 2),
                association_id: None,
                vm_id: None,
                network_interface_id: None,
            };
            s.ips.insert(allocation_id, (ip.clone(), tags.clone()));
            Ok(ip)
        })
    }

    async fn associate_floating_ip(&self, _region: &str, allocation_id: &str, target: &IpTarget) -> Result<()> {
        self.with_state(|s| {
            let association_id = s.next_id("eipassoc");
            let lag = s.lag_ip_refresh;
            let (ip, _) = s
                .ips
                .get_mut(allocation_id)
                .ok_or_else(|| anyhow::anyhow!("MockProvider: unknown allocation '{}'", allocation_id))?;
            ip.association_id = Some(association_id);
            let public_ip = ip.public_ip.clone();
            match target {
                IpTarget::Vm(vm_id) => {
                    ip.vm_id = Some(vm_id.clone());
                    ip.network_interface_id = None;
                    if let Some((vm, _)) = s.vms.get_mut(vm_id).filter(|_| !lag) {
                        vm.ip_public = Some(public_ip);
                    }
                }
                IpTarget::NetworkInterface(nic_id) => {
                    ip.network_interface_id = Some(nic_id.clone());
                    let attached = s.nics.get(nic_id).and_then(|(n, _)| n.attached_to.clone());
                    ip.vm_id = attached.clone();
                    if let Some((vm, _)) = attached.filter(|_| !lag).and_then(|id| s.vms.get_mut(&id)) {
                        vm.ip_public = Some(public_ip);
                    }
                }
            }
            Ok(())
        })
    }

    async fn release_floating_ip(&self, _region: &str, ip: &FloatingIpInfo) -> Result<bool> {
        self.with_state(|s| {
            let removed = s.ips.remove(&ip.allocation_id).is_some();
            if removed {
                s.released_ips.push(ip.allocation_id.clone());
            }
            Ok(removed)
        })
    }

    async fn list_network_interfaces_by_tag(
        &self,
        region: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<NetworkInterfaceInfo>> {
        self.with_state(|s| {
            Ok(s.nics
                .values()
                .filter(|(n, tags)| region_of_az(&n.availability_zone) == region && has_tag(tags, tag_key, tag_value))
                .map(|(n, _)| n.clone())
                .collect())
        })
    }

    async fn describe_network_interface(&self, _region: &str, nic_id: &str) -> Result<Option<NetworkInterfaceInfo>> {
        self.with_state(|s| Ok(s.nics.get(nic_id).map(|(n, _)| n.clone())))
    }

    async fn create_network_interface(&self, req: &NetworkInterfaceRequest) -> Result<NetworkInterfaceInfo> {
        self.with_state(|s| {
            let nic = NetworkInterfaceInfo {
                nic_id: s.next_id("eni"),
                availability_zone: req.availability_zone.clone(),
                status: "available".to_string(),
                ip_private: Some(format!("10.0.1.{}", s.seq % 250 + 2)),
                attached_to: None,
            };
            s.nics.insert(nic.nic_id.clone(), (nic.clone(), req.tags.clone()));
            Ok(nic)
        })
    }

    async fn delete_network_interface(&self, _region: &str, nic_id: &str) -> Result<bool> {
        self.with_state(|s| {
            if let Some((nic, _)) = s.nics.get(nic_id) {
                if let Some(vm_id) = nic.attached_to.as_deref() {
                    return Err(anyhow::anyhow!(
                        "InvalidNetworkInterface.InUse: {} is attached to {}",
                        nic_id,
                        vm_id
                    ));
                }
            }
            Ok(s.nics.remove(nic_id).is_some())
        })
    }
}
