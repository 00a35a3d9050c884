use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

pub use inventory::*;

/// Raised by `launch_vm` when the provider has no spot capacity for the
/// requested SKU/AZ (or the max price is below the market). Callers detect it
/// with `anyhow::Error::downcast_ref` and move on to the next candidate.
#[derive(Debug, Error)]
#[error("no spot capacity for {sku} in {availability_zone}: {detail}")]
pub struct CapacityExhausted {
    pub sku: String,
    pub availability_zone: String,
    pub detail: String,
}

pub fn is_capacity_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<CapacityExhausted>().is_some()
}

/// Credentials for one reconciliation tick. Built from the manifest and passed
/// explicitly to the provider factory; nothing is stored process-wide.
#[derive(Clone, Default, PartialEq)]
pub struct ProviderCredentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub profile_name: Option<String>,
}

impl ProviderCredentials {
    pub fn has_static_keys(&self) -> bool {
        matches!(
            (self.access_key_id.as_deref(), self.secret_access_key.as_deref()),
            (Some(a), Some(s)) if !a.is_empty() && !s.is_empty()
        )
    }
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "***"))
            .field("profile_name", &self.profile_name)
            .finish()
    }
}

/// Cloud capability interface consumed by the resolver, provisioning and
/// teardown. Every call is scoped to a region; resources are found again
/// through the instance identity tag.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn cloud(&self) -> &'static str;

    /// OS user the configuration action connects as.
    fn login_user(&self) -> &'static str;

    // Catalog & pricing

    /// SKUs usable with spot capacity. With `local_storage_only` only SKUs
    /// that carry instance storage are returned.
    async fn list_instance_types(
        &self,
        region: &str,
        local_storage_only: bool,
    ) -> Result<Vec<InstanceTypeInfo>>;

    async fn describe_instance_type(&self, region: &str, sku: &str) -> Result<Option<InstanceTypeInfo>>;

    async fn get_spot_price_history(
        &self,
        region: &str,
        skus: &[String],
        since: DateTime<Utc>,
        availability_zone: Option<&str>,
    ) -> Result<Vec<SpotPricePoint>>;

    // Optional: hourly on-demand price per SKU.
    // Default returns nothing (caller treats prices as unknown).
    async fn get_ondemand_prices(&self, _region: &str, _skus: &[String]) -> Result<HashMap<String, f64>> {
        Ok(HashMap::new())
    }

    // Optional: published eviction-rate bracket per SKU (0 = least evicted).
    // Default returns nothing.
    async fn get_eviction_rate_groups(&self, _region: &str, _skus: &[String]) -> Result<HashMap<String, u8>> {
        Ok(HashMap::new())
    }

    /// OS image for the given CPU architecture (as reported in `InstanceTypeInfo::arch`).
    async fn resolve_boot_image(&self, region: &str, arch: &str) -> Result<String>;

    // VMs

    async fn launch_vm(&self, req: &LaunchRequest) -> Result<VmInfo>;
    async fn describe_vm(&self, region: &str, vm_id: &str) -> Result<Option<VmInfo>>;
    /// Non-terminated VMs carrying `tag_key=tag_value`.
    async fn list_vms_by_tag(&self, region: &str, tag_key: &str, tag_value: &str) -> Result<Vec<VmInfo>>;
    async fn terminate_vm(&self, region: &str, vm_id: &str) -> Result<bool>;

    // Volumes

    async fn list_volumes_by_tag(&self, region: &str, tag_key: &str, tag_value: &str) -> Result<Vec<VolumeInfo>>;
    async fn describe_volume(&self, region: &str, volume_id: &str) -> Result<Option<VolumeInfo>>;
    async fn create_volume(&self, req: &VolumeRequest) -> Result<VolumeInfo>;
    async fn attach_volume(&self, region: &str, volume_id: &str, vm_id: &str, device: &str) -> Result<()>;
    async fn delete_volume(&self, region: &str, volume_id: &str) -> Result<bool>;

    // Floating IPs

    async fn list_floating_ips_by_tag(&self, region: &str, tag_key: &str, tag_value: &str) -> Result<Vec<FloatingIpInfo>>;
    async fn allocate_floating_ip(&self, region: &str, tags: &Tags) -> Result<FloatingIpInfo>;
    async fn associate_floating_ip(&self, region: &str, allocation_id: &str, target: &IpTarget) -> Result<()>;
    async fn release_floating_ip(&self, region: &str, ip: &FloatingIpInfo) -> Result<bool>;

    // Network interfaces

    async fn list_network_interfaces_by_tag(
        &self,
        region: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<NetworkInterfaceInfo>>;
    async fn describe_network_interface(&self, region: &str, nic_id: &str) -> Result<Option<NetworkInterfaceInfo>>;
    async fn create_network_interface(&self, req: &NetworkInterfaceRequest) -> Result<NetworkInterfaceInfo>;
    async fn delete_network_interface(&self, region: &str, nic_id: &str) -> Result<bool>;
}

pub mod inventory {
    use chrono::{DateTime, Utc};
    use pgspot_common::StorageSpeedClass;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    pub type Tags = BTreeMap<String, String>;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct InstanceTypeInfo {
        pub sku: String,
        /// Provider architecture name, e.g. `x86_64` or `arm64`.
        pub arch: String,
        pub vcpu: u32,
        pub ram_mb: u64,
        /// Total local (instance store) disk, 0 when none.
        pub instance_storage_gb: u64,
        pub instance_storage_class: Option<StorageSpeedClass>,
        pub burstable: bool,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct SpotPricePoint {
        pub sku: String,
        pub availability_zone: String,
        pub price: f64,
        pub timestamp: Option<DateTime<Utc>>,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum VmState {
        Pending,
        Running,
        Stopping,
        Stopped,
        ShuttingDown,
        Terminated,
        Other(String),
    }

    impl VmState {
        pub fn from_provider(raw: &str) -> Self {
            match raw {
                "pending" => VmState::Pending,
                "running" => VmState::Running,
                "stopping" => VmState::Stopping,
                "stopped" => VmState::Stopped,
                "shutting-down" => VmState::ShuttingDown,
                "terminated" => VmState::Terminated,
                other => VmState::Other(other.to_string()),
            }
        }

        pub fn is_gone(&self) -> bool {
            matches!(self, VmState::ShuttingDown | VmState::Terminated)
        }
    }

    impl std::fmt::Display for VmState {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let s = match self {
                VmState::Pending => "pending",
                VmState::Running => "running",
                VmState::Stopping => "stopping",
                VmState::Stopped => "stopped",
                VmState::ShuttingDown => "shutting-down",
                VmState::Terminated => "terminated",
                VmState::Other(s) => s.as_str(),
            };
            f.write_str(s)
        }
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct VmInfo {
        pub provider_id: String,
        pub sku: String,
        pub region: String,
        pub availability_zone: String,
        pub state: VmState,
        pub ip_private: Option<String>,
        pub ip_public: Option<String>,
        pub tags: Tags,
        pub launched_at: Option<DateTime<Utc>>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct LaunchRequest {
        pub region: String,
        pub availability_zone: String,
        pub sku: String,
        pub image_id: String,
        /// Hourly spot max price. None = on-demand price cap.
        pub max_price: Option<f64>,
        /// Plain text, encoded by the adapter.
        pub user_data: Option<String>,
        pub assign_public_ip: bool,
        /// Pre-created interface used as device 0 (floating NIC mode).
        pub network_interface_id: Option<String>,
        pub subnet_id: Option<String>,
        pub security_group_ids: Vec<String>,
        pub key_pair_name: Option<String>,
        pub tags: Tags,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct VolumeInfo {
        pub volume_id: String,
        pub availability_zone: String,
        pub size_gb: u32,
        pub volume_type: String,
        /// `creating`, `available`, `in-use`, `deleting`, ...
        pub state: String,
        pub attached_to: Option<String>,
        /// `attaching`, `attached`, `detaching`, ...
        pub attachment_state: Option<String>,
    }

    impl VolumeInfo {
        pub fn is_attached_to(&self, vm_id: &str) -> bool {
            self.attached_to.as_deref() == Some(vm_id) && self.attachment_state.as_deref() == Some("attached")
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct VolumeRequest {
        pub region: String,
        pub availability_zone: String,
        pub size_gb: u32,
        pub volume_type: String,
        pub iops: Option<i32>,
        pub throughput: Option<i32>,
        pub tags: Tags,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct FloatingIpInfo {
        pub allocation_id: String,
        pub public_ip: String,
        pub association_id: Option<String>,
        pub vm_id: Option<String>,
        pub network_interface_id: Option<String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum IpTarget {
        Vm(String),
        NetworkInterface(String),
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct NetworkInterfaceInfo {
        pub nic_id: String,
        pub availability_zone: String,
        /// `pending`, `available`, `in-use`, ...
        pub status: String,
        pub ip_private: Option<String>,
        pub attached_to: Option<String>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct NetworkInterfaceRequest {
        pub region: String,
        pub availability_zone: String,
        pub subnet_id: Option<String>,
        pub security_group_ids: Vec<String>,
        pub tags: Tags,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "aws")]
pub mod aws;
