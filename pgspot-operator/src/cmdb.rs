//! Local state store: logical instances, their VMs and manifest history.
//!
//! Every public method is one short transaction. Nothing here is held open
//! across a provider wait.

use anyhow::{Context, Result};
use chrono::Utc;
use pgspot_common::{diff_manifests, IgnoredInstance, Instance, InstanceManifest, ManifestSnapshot, ProvisionedVm, Vm};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::migrations;

#[derive(Debug, Error)]
pub enum CmdbError {
    #[error("cannot finalize provisioning of instance {instance_id}: {field} is empty")]
    MissingVmField { instance_id: Uuid, field: &'static str },

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),
}

const INSTANCE_COLUMNS: &str = "id, cloud, region, instance_name, postgres_version, storage_type, \
    storage_min, cpu_min, ram_min, user_tags, created_on, last_modified_on, deleted_on";

const VM_COLUMNS: &str = "id, instance_id, provider_id, cloud, region, availability_zone, sku, \
    price_spot, price_ondemand, cpu, ram_mb, instance_storage_gb, login_user, ip_private, ip_public, \
    volume_id, created_on, last_modified_on, deleted_on";

#[derive(Clone)]
pub struct Cmdb {
    pool: SqlitePool,
}

impl Cmdb {
    /// Open (creating if needed) the store and bring the schema up to date.
    pub async fn connect(url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid CMDB url {}", url))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .with_context(|| format!("failed to open CMDB at {}", url))?;
        let cmdb = Self { pool };
        migrations::run_migrations(&cmdb.pool).await?;
        Ok(cmdb)
    }

    /// Private in-memory store (single connection so every query sees the same database).
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let cmdb = Self { pool };
        migrations::run_migrations(&cmdb.pool).await?;
        Ok(cmdb)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // --- instances ---------------------------------------------------------

    pub async fn get_instance(&self, cloud: &str, instance_name: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, Instance>(&format!(
            "SELECT {} FROM instance WHERE cloud = ? AND instance_name = ? AND deleted_on IS NULL",
            INSTANCE_COLUMNS
        ))
        .bind(cloud)
        .bind(instance_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_instance_by_id(&self, id: Uuid) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, Instance>(&format!("SELECT {} FROM instance WHERE id = ?", INSTANCE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Register-or-fetch by (cloud, instance_name); refreshes the descriptive
    /// columns from the manifest when the row already exists.
    pub async fn register_instance(&self, manifest: &InstanceManifest) -> Result<Instance> {
        let now = Utc::now();
        let user_tags = sqlx::types::Json(serde_json::to_value(&manifest.user_tags)?);
        let storage_type = serde_json::to_value(manifest.vm.storage_type)?
            .as_str()
            .unwrap_or("network")
            .to_string();

        let mut tx = self.pool.begin().await?;
        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM instance WHERE cloud = ? AND instance_name = ? AND deleted_on IS NULL",
        )
        .bind(&manifest.cloud)
        .bind(&manifest.instance_name)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some(id) => {
                sqlx::query(
                    "UPDATE instance SET region = ?, postgres_version = ?, storage_type = ?, storage_min = ?, \
                     cpu_min = ?, ram_min = ?, user_tags = ?, last_modified_on = ? WHERE id = ?",
                )
                .bind(&manifest.region)
                .bind(manifest.postgres.version as i64)
                .bind(&storage_type)
                .bind(manifest.vm.storage_min.map(i64::from))
                .bind(manifest.vm.cpu_min.map(i64::from))
                .bind(manifest.vm.ram_min.map(i64::from))
                .bind(&user_tags)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO instance (id, cloud, region, instance_name, postgres_version, storage_type, \
                     storage_min, cpu_min, ram_min, user_tags, created_on, last_modified_on) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(id)
                .bind(&manifest.cloud)
                .bind(&manifest.region)
                .bind(&manifest.instance_name)
                .bind(manifest.postgres.version as i64)
                .bind(&storage_type)
                .bind(manifest.vm.storage_min.map(i64::from))
                .bind(manifest.vm.cpu_min.map(i64::from))
                .bind(manifest.vm.ram_min.map(i64::from))
                .bind(&user_tags)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tracing::info!(
                    "🆕 [cmdb] registered instance {} ({}/{}) as {}",
                    manifest.instance_name,
                    manifest.cloud,
                    manifest.region,
                    id
                );
                id
            }
        };

        let instance = sqlx::query_as::<_, Instance>(&format!("SELECT {} FROM instance WHERE id = ?", INSTANCE_COLUMNS))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(instance)
    }

    /// Soft-delete the instance and all of its VMs.
    pub async fn mark_instance_deleted(&self, instance_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE vm SET deleted_on = ?, last_modified_on = ? WHERE instance_id = ? AND deleted_on IS NULL")
            .bind(now)
            .bind(now)
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        let res = sqlx::query(
            "UPDATE instance SET deleted_on = ?, last_modified_on = ? WHERE id = ? AND deleted_on IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        if res.rows_affected() > 0 {
            tracing::info!("🗑️ [cmdb] instance {} marked deleted", instance_id);
        }
        Ok(())
    }

    // --- manifest snapshots ------------------------------------------------

    /// Store `manifest` unless it does not differ from the latest snapshot.
    /// Returns the snapshot id and whether a new row was written.
    pub async fn store_manifest_snapshot(&self, instance_id: Uuid, manifest: &InstanceManifest) -> Result<(i64, bool)> {
        let mut tx = self.pool.begin().await?;
        let latest = sqlx::query_as::<_, ManifestSnapshot>(
            "SELECT id, instance_id, created_on, manifest, setup_finished_on FROM manifest_snapshot \
             WHERE instance_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(latest) = latest {
            match latest.parse_manifest() {
                Ok(previous) if diff_manifests(&previous, manifest).is_empty() => {
                    tx.commit().await?;
                    return Ok((latest.id, false));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("[cmdb] snapshot {} is unreadable, storing a new one: {}", latest.id, e);
                }
            }
        }

        let body = serde_json::to_string(&manifest.to_json_value())?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO manifest_snapshot (instance_id, created_on, manifest) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(instance_id)
        .bind(Utc::now())
        .bind(body)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!("📝 [cmdb] stored manifest snapshot {} for instance {}", id, instance_id);
        Ok((id, true))
    }

    pub async fn latest_snapshot(&self, instance_id: Uuid) -> Result<Option<ManifestSnapshot>> {
        let row = sqlx::query_as::<_, ManifestSnapshot>(
            "SELECT id, instance_id, created_on, manifest, setup_finished_on FROM manifest_snapshot \
             WHERE instance_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Latest snapshot carrying a completion marker ("last successfully applied state").
    pub async fn last_applied_snapshot(&self, instance_id: Uuid) -> Result<Option<ManifestSnapshot>> {
        let row = sqlx::query_as::<_, ManifestSnapshot>(
            "SELECT id, instance_id, created_on, manifest, setup_finished_on FROM manifest_snapshot \
             WHERE instance_id = ? AND setup_finished_on IS NOT NULL ORDER BY id DESC LIMIT 1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn mark_snapshot_completed(&self, snapshot_id: i64) -> Result<()> {
        sqlx::query("UPDATE manifest_snapshot SET setup_finished_on = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(snapshot_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- vms ---------------------------------------------------------------

    pub async fn active_vm(&self, instance_id: Uuid) -> Result<Option<Vm>> {
        let row = sqlx::query_as::<_, Vm>(&format!(
            "SELECT {} FROM vm WHERE instance_id = ? AND deleted_on IS NULL ORDER BY id DESC LIMIT 1",
            VM_COLUMNS
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn count_active_vms(&self, instance_id: Uuid) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vm WHERE instance_id = ? AND deleted_on IS NULL")
            .bind(instance_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Upsert the VM row keyed by provider id and retire every other active
    /// VM of the instance in the same transaction.
    pub async fn finalize_provisioning(&self, instance_id: Uuid, vm: &ProvisionedVm) -> Result<Vm> {
        for (field, value) in [
            ("provider_id", vm.provider_id.as_str()),
            ("sku", vm.sku.as_str()),
            ("login_user", vm.login_user.as_str()),
            ("ip_private", vm.ip_private.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(CmdbError::MissingVmField { instance_id, field }.into());
            }
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM instance WHERE id = ?")
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(CmdbError::InstanceNotFound(instance_id).into());
        }

        let retired = sqlx::query(
            "UPDATE vm SET deleted_on = ?, last_modified_on = ? \
             WHERE instance_id = ? AND provider_id != ? AND deleted_on IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(instance_id)
        .bind(&vm.provider_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "INSERT INTO vm (instance_id, provider_id, cloud, region, availability_zone, sku, price_spot, \
             price_ondemand, cpu, ram_mb, instance_storage_gb, login_user, ip_private, ip_public, volume_id, \
             created_on, last_modified_on) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (provider_id) DO UPDATE SET \
               instance_id = excluded.instance_id, \
               cloud = excluded.cloud, \
               region = excluded.region, \
               availability_zone = excluded.availability_zone, \
               sku = excluded.sku, \
               price_spot = excluded.price_spot, \
               price_ondemand = excluded.price_ondemand, \
               cpu = excluded.cpu, \
               ram_mb = excluded.ram_mb, \
               instance_storage_gb = excluded.instance_storage_gb, \
               login_user = excluded.login_user, \
               ip_private = excluded.ip_private, \
               ip_public = excluded.ip_public, \
               volume_id = excluded.volume_id, \
               last_modified_on = excluded.last_modified_on, \
               deleted_on = NULL",
        )
        .bind(instance_id)
        .bind(&vm.provider_id)
        .bind(&vm.cloud)
        .bind(&vm.region)
        .bind(&vm.availability_zone)
        .bind(&vm.sku)
        .bind(vm.price_spot)
        .bind(vm.price_ondemand)
        .bind(vm.cpu)
        .bind(vm.ram_mb)
        .bind(vm.instance_storage_gb)
        .bind(&vm.login_user)
        .bind(&vm.ip_private)
        .bind(&vm.ip_public)
        .bind(&vm.volume_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, Vm>(&format!("SELECT {} FROM vm WHERE provider_id = ?", VM_COLUMNS))
            .bind(&vm.provider_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            "✅ [cmdb] finalized vm {} ({} in {}) for instance {}{}",
            row.provider_id,
            row.sku,
            row.availability_zone,
            instance_id,
            if retired > 0 {
                format!(", retired {} previous vm row(s)", retired)
            } else {
                String::new()
            }
        );
        Ok(row)
    }

    pub async fn mark_vms_deleted(&self, instance_id: Uuid) -> Result<u64> {
        let now = Utc::now();
        let res = sqlx::query("UPDATE vm SET deleted_on = ?, last_modified_on = ? WHERE instance_id = ? AND deleted_on IS NULL")
            .bind(now)
            .bind(now)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // --- ignore list -------------------------------------------------------

    /// Insert-if-absent. Returns true when the name was added.
    pub async fn add_ignored_instance(&self, instance_name: &str) -> Result<bool> {
        let res = sqlx::query("INSERT OR IGNORE INTO ignored_instance (instance_name, created_on) VALUES (?, ?)")
            .bind(instance_name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn is_ignored(&self, instance_name: &str) -> Result<bool> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ignored_instance WHERE instance_name = ?")
            .bind(instance_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(n > 0)
    }

    pub async fn list_ignored(&self) -> Result<Vec<IgnoredInstance>> {
        let rows = sqlx::query_as::<_, IgnoredInstance>(
            "SELECT instance_name, created_on FROM ignored_instance ORDER BY instance_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
