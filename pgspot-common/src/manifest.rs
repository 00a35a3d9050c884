//! Desired state of one logical Postgres instance.
//!
//! Manifests are YAML documents. Only the identity fields are mandatory; every
//! nested section has defaults so a minimal manifest looks like:
//!
//! ```yaml
//! region: eu-north-1
//! instance_name: analytics
//! vm:
//!   cpu_min: 2
//!   storage_min: 100
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use uuid::Uuid;

use crate::{EXPIRATION_TAG, SUPPORTED_CLOUDS};

pub const DEFAULT_API_VERSION: &str = "v1";
pub const DEFAULT_KIND: &str = "pgspot_instance";
pub const DEFAULT_POSTGRES_VERSION: u32 = 16;
pub const DEFAULT_VOLUME_TYPE: &str = "gp3";
pub const DEFAULT_SELECTION_STRATEGY: &str = "cheapest";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read manifest file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid instance_name '{0}': only lowercase letters, digits and '-' are allowed")]
    InvalidInstanceName(String),

    #[error("unsupported cloud '{0}'")]
    UnsupportedCloud(String),

    #[error("region could not be determined (set region or availability_zone)")]
    MissingRegion,

    #[error("invalid expiration_date '{0}'")]
    InvalidExpirationDate(String),

    #[error("invalid vm constraints: {0}")]
    InvalidConstraints(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Network,
    Local,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageSpeedClass {
    Hdd,
    #[default]
    Ssd,
    Nvme,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstanceManifest {
    pub api_version: String,
    pub kind: String,
    pub cloud: String,
    pub region: String,
    pub availability_zone: Option<String>,
    pub instance_name: String,
    pub description: Option<String>,
    /// RFC3339, `YYYY-MM-DD HH:MM` (UTC), `YYYY-MM-DD` or `now`.
    pub expiration_date: Option<String>,
    pub vault_password_file: Option<String>,
    pub connstr_output_path: Option<String>,
    pub postgres: PostgresSection,
    pub vm: VmSection,
    pub os: OsSection,
    pub backup: BackupSection,
    pub monitoring: MonitoringSection,
    pub aws: AwsSection,
    pub user_tags: BTreeMap<String, String>,

    // Engine-computed. Excluded from diffs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_snapshot_id: Option<i64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub session_vars: BTreeMap<String, String>,
}

impl Default for InstanceManifest {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            kind: DEFAULT_KIND.to_string(),
            cloud: "aws".to_string(),
            region: String::new(),
            availability_zone: None,
            instance_name: String::new(),
            description: None,
            expiration_date: None,
            vault_password_file: None,
            connstr_output_path: None,
            postgres: PostgresSection::default(),
            vm: VmSection::default(),
            os: OsSection::default(),
            backup: BackupSection::default(),
            monitoring: MonitoringSection::default(),
            aws: AwsSection::default(),
            user_tags: BTreeMap::new(),
            instance_uuid: None,
            manifest_snapshot_id: None,
            session_vars: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostgresSection {
    pub version: u32,
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
    pub admin_is_superuser: bool,
    pub app_db_name: Option<String>,
    pub tuning_profile: String,
    pub config_lines: BTreeMap<String, String>,
    pub extensions: Vec<String>,
}

impl Default for PostgresSection {
    fn default() -> Self {
        Self {
            version: DEFAULT_POSTGRES_VERSION,
            admin_user: None,
            admin_password: None,
            admin_is_superuser: false,
            app_db_name: None,
            tuning_profile: "default".to_string(),
            config_lines: BTreeMap::new(),
            extensions: Vec::new(),
        }
    }
}

/// Hardware constraints and VM placement options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VmSection {
    /// Substring match against the SKU architecture, e.g. `arm` or `x86`.
    pub cpu_architecture: Option<String>,
    pub cpu_min: Option<u32>,
    pub cpu_max: Option<u32>,
    /// GB
    pub ram_min: Option<u32>,
    /// GB. Data volume size for network storage, minimum local disk otherwise.
    pub storage_min: Option<u32>,
    pub storage_type: StorageType,
    pub storage_speed_class: StorageSpeedClass,
    pub volume_type: String,
    pub volume_iops: Option<i32>,
    pub volume_throughput: Option<i32>,
    /// Allow list, `*` wildcards supported.
    pub instance_types: Vec<String>,
    /// Deny list, `*` wildcards supported.
    pub instance_types_denied: Vec<String>,
    pub allow_burstable: bool,
    pub assign_public_ip: bool,
    /// Keep the public/private address on a dedicated network interface that
    /// survives VM replacement.
    pub floating_ips: bool,
    pub instance_selection_strategy: String,
    /// Hourly upper bound for the spot price.
    pub max_price: Option<f64>,
    pub keep_volume_on_destroy: bool,
}

impl Default for VmSection {
    fn default() -> Self {
        Self {
            cpu_architecture: None,
            cpu_min: None,
            cpu_max: None,
            ram_min: None,
            storage_min: None,
            storage_type: StorageType::Network,
            storage_speed_class: StorageSpeedClass::Ssd,
            volume_type: DEFAULT_VOLUME_TYPE.to_string(),
            volume_iops: None,
            volume_throughput: None,
            instance_types: Vec::new(),
            instance_types_denied: Vec::new(),
            allow_burstable: true,
            assign_public_ip: true,
            floating_ips: false,
            instance_selection_strategy: DEFAULT_SELECTION_STRATEGY.to_string(),
            max_price: None,
            keep_volume_on_destroy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OsSection {
    pub ssh_pub_keys: Vec<String>,
    pub ssh_pub_key_paths: Vec<String>,
    pub extra_packages: Vec<String>,
    pub kernel_tuning: bool,
    pub unattended_security_upgrades: bool,
}

impl Default for OsSection {
    fn default() -> Self {
        Self {
            ssh_pub_keys: Vec::new(),
            ssh_pub_key_paths: Vec::new(),
            extra_packages: Vec::new(),
            kernel_tuning: true,
            unattended_security_upgrades: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackupSection {
    #[serde(rename = "type")]
    pub backup_type: String,
    pub retention_days: u32,
    pub destroy_backups: bool,
    pub s3_bucket: Option<String>,
    pub s3_key: Option<String>,
    pub s3_key_secret: Option<String>,
    pub encryption_key: Option<String>,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            backup_type: "none".to_string(),
            retention_days: 1,
            destroy_backups: true,
            s3_bucket: None,
            s3_key: None,
            s3_key_secret: None,
            encryption_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MonitoringSection {
    pub prometheus_node_exporter: bool,
    pub prometheus_postgres_exporter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AwsSection {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub profile_name: Option<String>,
    pub security_group_ids: Vec<String>,
    pub subnet_id: Option<String>,
    pub key_pair_name: Option<String>,
}

fn instance_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9-]+$").expect("static regex"))
}

pub fn is_valid_instance_name(name: &str) -> bool {
    instance_name_regex().is_match(name)
}

/// Drop YAML custom tags (`!vault |`, `!secret`, ...) keeping the tagged value.
fn strip_custom_tags(value: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match value {
        Value::Tagged(tagged) => strip_custom_tags(tagged.value),
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(strip_custom_tags).collect()),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                out.insert(strip_custom_tags(k), strip_custom_tags(v));
            }
            Value::Mapping(out)
        }
        other => other,
    }
}

/// Parse a user supplied expiration date. `now` means "already expired".
pub fn parse_expiration_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.eq_ignore_ascii_case("now") {
        return Utc.timestamp_opt(0, 0).single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

impl InstanceManifest {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ManifestError> {
        let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        let manifest: Self = serde_yaml::from_value(strip_custom_tags(value))?;
        Ok(manifest)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn to_yaml_string(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Engine defaults that depend only on the manifest itself.
    pub fn fill_defaults(&mut self) {
        if self.region.trim().is_empty() {
            if let Some(az) = self.availability_zone.as_deref().map(str::trim) {
                if az.len() > 1 && az.ends_with(|c: char| c.is_ascii_lowercase()) {
                    self.region = az[..az.len() - 1].to_string();
                }
            }
        }
        if let Some(exp) = self.expiration_date.as_deref() {
            if !exp.trim().is_empty() {
                self.user_tags
                    .entry(EXPIRATION_TAG.to_string())
                    .or_insert_with(|| exp.trim().to_string());
            }
        }
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if !is_valid_instance_name(&self.instance_name) {
            return Err(ManifestError::InvalidInstanceName(self.instance_name.clone()));
        }
        if !SUPPORTED_CLOUDS.contains(&self.cloud.as_str()) {
            return Err(ManifestError::UnsupportedCloud(self.cloud.clone()));
        }
        if self.region.trim().is_empty() {
            return Err(ManifestError::MissingRegion);
        }
        if let Some(exp) = self.expiration_date.as_deref() {
            if !exp.trim().is_empty() && parse_expiration_date(exp).is_none() {
                return Err(ManifestError::InvalidExpirationDate(exp.to_string()));
            }
        }
        if let (Some(min), Some(max)) = (self.vm.cpu_min, self.vm.cpu_max) {
            if min > max {
                return Err(ManifestError::InvalidConstraints(format!(
                    "cpu_min ({}) > cpu_max ({})",
                    min, max
                )));
            }
        }
        if let Some(price) = self.vm.max_price {
            if !(price > 0.0) {
                return Err(ManifestError::InvalidConstraints(format!(
                    "max_price must be positive, got {}",
                    price
                )));
            }
        }
        Ok(())
    }

    pub fn expiration_instant(&self) -> Option<DateTime<Utc>> {
        self.expiration_date
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .and_then(parse_expiration_date)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_instant().map(|exp| exp <= now).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Tags for every resource created for this instance (user tags + identity tag).
    pub fn resource_tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.user_tags.clone();
        tags.insert(crate::INSTANCE_ID_TAG.to_string(), self.instance_name.clone());
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
region: eu-north-1
instance_name: analytics
vm:
  cpu_min: 2
  storage_min: 100
"#;

    #[test]
    fn minimal_manifest_gets_defaults() {
        let m = InstanceManifest::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(m.cloud, "aws");
        assert_eq!(m.postgres.version, DEFAULT_POSTGRES_VERSION);
        assert_eq!(m.vm.cpu_min, Some(2));
        assert_eq!(m.vm.storage_type, StorageType::Network);
        assert_eq!(m.vm.instance_selection_strategy, "cheapest");
        assert!(m.vm.assign_public_ip);
        m.validate().unwrap();
    }

    #[test]
    fn custom_tags_are_tolerated() {
        let raw = r#"
region: eu-north-1
instance_name: tagged
postgres:
  admin_password: !vault |
    $ANSIBLE_VAULT;1.1;AES256
    6162636465
aws:
  secret_access_key: !secret plain
"#;
        let m = InstanceManifest::from_yaml_str(raw).unwrap();
        assert!(m
            .postgres
            .admin_password
            .as_deref()
            .unwrap()
            .starts_with("$ANSIBLE_VAULT;1.1;AES256"));
        assert_eq!(m.aws.secret_access_key.as_deref(), Some("plain"));
    }

    #[test]
    fn instance_name_rules() {
        assert!(is_valid_instance_name("pg-1"));
        assert!(!is_valid_instance_name("Pg1"));
        assert!(!is_valid_instance_name("pg_1"));
        assert!(!is_valid_instance_name(""));

        let mut m = InstanceManifest::from_yaml_str(MINIMAL).unwrap();
        m.instance_name = "bad name".into();
        assert!(matches!(m.validate(), Err(ManifestError::InvalidInstanceName(_))));
    }

    #[test]
    fn unsupported_cloud_is_rejected() {
        let mut m = InstanceManifest::from_yaml_str(MINIMAL).unwrap();
        m.cloud = "azure".into();
        assert!(matches!(m.validate(), Err(ManifestError::UnsupportedCloud(_))));
    }

    #[test]
    fn region_is_derived_from_az() {
        let mut m = InstanceManifest::from_yaml_str(
            "instance_name: x\navailability_zone: eu-north-1b\n",
        )
        .unwrap();
        assert!(matches!(m.validate(), Err(ManifestError::MissingRegion)));
        m.fill_defaults();
        assert_eq!(m.region, "eu-north-1");
        m.validate().unwrap();
    }

    #[test]
    fn expiration_parsing_and_tag() {
        let mut m = InstanceManifest::from_yaml_str(MINIMAL).unwrap();
        assert!(!m.is_expired());

        m.expiration_date = Some("2020-01-01 10:00".into());
        assert!(m.is_expired());
        m.fill_defaults();
        assert_eq!(m.user_tags.get(EXPIRATION_TAG).map(String::as_str), Some("2020-01-01 10:00"));

        m.expiration_date = Some("2999-01-01".into());
        assert!(!m.is_expired());

        m.expiration_date = Some("now".into());
        assert!(m.is_expired());

        m.expiration_date = Some("2024-06-01T12:00:00+02:00".into());
        let exp = m.expiration_instant().unwrap();
        assert_eq!(exp.to_rfc3339(), "2024-06-01T10:00:00+00:00");

        m.expiration_date = Some("next tuesday".into());
        assert!(matches!(m.validate(), Err(ManifestError::InvalidExpirationDate(_))));
    }

    #[test]
    fn cpu_bounds_are_checked() {
        let mut m = InstanceManifest::from_yaml_str(MINIMAL).unwrap();
        m.vm.cpu_max = Some(1);
        assert!(matches!(m.validate(), Err(ManifestError::InvalidConstraints(_))));
    }

    #[test]
    fn resource_tags_contain_identity() {
        let mut m = InstanceManifest::from_yaml_str(MINIMAL).unwrap();
        m.user_tags.insert("team".into(), "data".into());
        let tags = m.resource_tags();
        assert_eq!(tags.get(crate::INSTANCE_ID_TAG).map(String::as_str), Some("analytics"));
        assert_eq!(tags.get("team").map(String::as_str), Some("data"));
    }

    #[test]
    fn json_roundtrip_keeps_internal_fields() {
        let mut m = InstanceManifest::from_yaml_str(MINIMAL).unwrap();
        m.manifest_snapshot_id = Some(7);
        let back = InstanceManifest::from_json_str(&m.to_json_value().to_string()).unwrap();
        assert_eq!(back, m);
    }
}
