use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod diff;
pub mod manifest;
pub mod sku_patterns;

pub use diff::{diff_manifests, ManifestDiff, ValueChange};
pub use manifest::{InstanceManifest, ManifestError, StorageSpeedClass, StorageType};

// -----------------------------------------------------------------------------
// Constants shared by the operator and the provider adapters
// -----------------------------------------------------------------------------

/// Tag put on every cloud resource we create. Value = logical instance name.
pub const INSTANCE_ID_TAG: &str = "pgspot-instance";
/// User tag filled from `expiration_date` so the expiry is visible in the cloud console.
pub const EXPIRATION_TAG: &str = "pgspot-expiration";

pub const SUPPORTED_CLOUDS: &[&str] = &["aws"];

/// Hours per month used for monthly price estimates.
pub const HOURS_PER_MONTH: f64 = 730.0;

/// Manifest keys computed by the engine at runtime. Never part of a diff.
pub const INTERNAL_MANIFEST_FIELDS: &[&str] = &["instance_uuid", "manifest_snapshot_id", "session_vars"];

// -----------------------------------------------------------------------------
// CMDB entities (SQLx mapped)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Instance {
    pub id: Uuid,
    pub cloud: String,
    pub region: String,
    pub instance_name: String,
    pub postgres_version: i64,
    pub storage_type: String,
    pub storage_min: Option<i64>,
    pub cpu_min: Option<i64>,
    pub ram_min: Option<i64>,
    pub user_tags: sqlx::types::Json<serde_json::Value>,
    pub created_on: DateTime<Utc>,
    pub last_modified_on: DateTime<Utc>,
    pub deleted_on: Option<DateTime<Utc>>,
}

/// Point-in-time snapshot of a provider VM, copied from the provider response
/// when the VM was launched or adopted.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Vm {
    pub id: i64,
    pub instance_id: Uuid,
    pub provider_id: String,
    pub cloud: String,
    pub region: String,
    pub availability_zone: String,
    pub sku: String,
    pub price_spot: Option<f64>,
    pub price_ondemand: Option<f64>,
    pub cpu: Option<i64>,
    pub ram_mb: Option<i64>,
    pub instance_storage_gb: Option<i64>,
    pub login_user: String,
    pub ip_private: String,
    pub ip_public: Option<String>,
    pub volume_id: Option<String>,
    pub created_on: DateTime<Utc>,
    pub last_modified_on: DateTime<Utc>,
    pub deleted_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct ManifestSnapshot {
    pub id: i64,
    pub instance_id: Uuid,
    pub created_on: DateTime<Utc>,
    pub manifest: String,
    pub setup_finished_on: Option<DateTime<Utc>>,
}

impl ManifestSnapshot {
    pub fn parse_manifest(&self) -> Result<InstanceManifest, ManifestError> {
        InstanceManifest::from_json_str(&self.manifest)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct IgnoredInstance {
    pub instance_name: String,
    pub created_on: DateTime<Utc>,
}

/// Everything the CMDB needs to record a freshly provisioned (or adopted) VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedVm {
    pub provider_id: String,
    pub cloud: String,
    pub region: String,
    pub availability_zone: String,
    pub sku: String,
    pub price_spot: Option<f64>,
    pub price_ondemand: Option<f64>,
    pub cpu: Option<i64>,
    pub ram_mb: Option<i64>,
    pub instance_storage_gb: Option<i64>,
    pub login_user: String,
    pub ip_private: String,
    pub ip_public: Option<String>,
    pub volume_id: Option<String>,
}

fn connect_address<'a>(ip_public: Option<&'a str>, ip_private: &'a str) -> &'a str {
    ip_public.filter(|ip| !ip.is_empty()).unwrap_or(ip_private)
}

impl Vm {
    /// Address the configuration action should connect to.
    pub fn connect_address(&self) -> &str {
        connect_address(self.ip_public.as_deref(), &self.ip_private)
    }
}

impl ProvisionedVm {
    pub fn connect_address(&self) -> &str {
        connect_address(self.ip_public.as_deref(), &self.ip_private)
    }
}
