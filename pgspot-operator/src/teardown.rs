//! Destroy everything tagged for a logical instance.

use anyhow::Result;
use pgspot_common::{InstanceManifest, INSTANCE_ID_TAG};
use pgspot_providers::{CloudProvider, VmState};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::actions::{ActionRequest, ActionRunner, ActionTarget, INSTANCE_TEARDOWN};
use crate::cmdb::Cmdb;
use crate::provisioning::{wait_for, ProvisioningTimeouts};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub vms_terminated: usize,
    pub volumes_deleted: usize,
    pub volumes_kept: usize,
    pub ips_released: usize,
    pub nics_deleted: usize,
}

/// Tear down the cloud resources of `manifest`'s instance, run the optional
/// `instance_teardown` action and soft-delete the CMDB rows when `instance_id`
/// is known.
pub async fn destroy(
    provider: &dyn CloudProvider,
    cmdb: &Cmdb,
    actions: &dyn ActionRunner,
    manifest: &InstanceManifest,
    instance_id: Option<Uuid>,
    timeouts: ProvisioningTimeouts,
) -> Result<TeardownReport> {
    let name = manifest.instance_name.as_str();
    let region = manifest.region.as_str();
    let mut report = TeardownReport::default();
    tracing::warn!("🗑️ [teardown] {}: destroying instance ({} {})", name, manifest.cloud, region);

    let vms = provider.list_vms_by_tag(region, INSTANCE_ID_TAG, name).await?;
    let mut terminated = Vec::new();
    for vm in vms.iter().filter(|vm| !vm.state.is_gone()) {
        tracing::info!("[teardown] {}: terminating {} ({} in {})", name, vm.provider_id, vm.sku, vm.availability_zone);
        if provider.terminate_vm(region, &vm.provider_id).await? {
            report.vms_terminated += 1;
            terminated.push(vm.provider_id.clone());
        }
    }
    // Tag listings hide shutting-down VMs, which still hold their volume and NIC.
    for vm_id in terminated.iter().map(String::as_str) {
        wait_for(
            &format!("vm {} to terminate", vm_id),
            timeouts.running,
            timeouts.poll,
            move || async move {
                Ok(match provider.describe_vm(region, vm_id).await? {
                    Some(vm) if vm.state != VmState::Terminated => None,
                    _ => Some(()),
                })
            },
        )
        .await?;
    }

    let volumes = provider.list_volumes_by_tag(region, INSTANCE_ID_TAG, name).await?;
    if manifest.vm.keep_volume_on_destroy {
        report.volumes_kept = volumes.len();
        if !volumes.is_empty() {
            tracing::info!("[teardown] {}: keeping {} volume(s)", name, volumes.len());
        }
    } else {
        for volume in &volumes {
            let volume_id = volume.volume_id.as_str();
            wait_for(
                &format!("volume {} to detach", volume_id),
                timeouts.volume_available,
                timeouts.poll,
                move || async move {
                    Ok(match provider.describe_volume(region, volume_id).await? {
                        Some(v) if v.attached_to.is_some() => None,
                        _ => Some(()),
                    })
                },
            )
            .await?;
            if provider.delete_volume(region, volume_id).await? {
                tracing::info!("[teardown] {}: deleted volume {}", name, volume_id);
                report.volumes_deleted += 1;
            }
        }
    }

    for ip in provider.list_floating_ips_by_tag(region, INSTANCE_ID_TAG, name).await? {
        if provider.release_floating_ip(region, &ip).await? {
            tracing::info!("[teardown] {}: released floating ip {}", name, ip.public_ip);
            report.ips_released += 1;
        }
    }

    for nic in provider
        .list_network_interfaces_by_tag(region, INSTANCE_ID_TAG, name)
        .await?
    {
        let nic_id = nic.nic_id.as_str();
        if nic.status != "available" {
            wait_for(
                &format!("network interface {} to detach", nic_id),
                timeouts.nic_available,
                timeouts.poll,
                move || async move {
                    Ok(match provider.describe_network_interface(region, nic_id).await? {
                        Some(n) if n.status != "available" => None,
                        _ => Some(()),
                    })
                },
            )
            .await?;
        }
        if provider.delete_network_interface(region, nic_id).await? {
            tracing::info!("[teardown] {}: deleted network interface {}", name, nic.nic_id);
            report.nics_deleted += 1;
        }
    }

    if actions.has_action(INSTANCE_TEARDOWN) {
        let req = ActionRequest {
            action: INSTANCE_TEARDOWN.to_string(),
            instance_name: name.to_string(),
            manifest: manifest.clone(),
            target: ActionTarget::Localhost,
            overrides: BTreeMap::new(),
        };
        if let Err(e) = actions.run(&req).await {
            tracing::warn!("[teardown] {}: {} action failed: {:#}", name, INSTANCE_TEARDOWN, e);
        }
    }

    if let Some(id) = instance_id {
        cmdb.mark_instance_deleted(id).await?;
    }
    tracing::info!("✅ [teardown] {}: done {:?}", name, report);
    Ok(report)
}
