use crate::{inventory::*, CapacityExhausted, CloudProvider, ProviderCredentials};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_ec2::config::{Credentials, Region};
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{
    ArchitectureValues, DomainType, Filter, InstanceInterruptionBehavior, InstanceMarketOptionsRequest,
    InstanceNetworkInterfaceSpecification, InstanceType, MarketType, Placement, ResourceType,
    SpotInstanceType, SpotMarketOptions, Tag, TagSpecification, VolumeType,
};
use aws_sdk_ec2::Client;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use pgspot_common::StorageSpeedClass;
use reqwest::Client as HttpClient;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Launch errors that mean "try another SKU/AZ".
const CAPACITY_ERROR_CODES: &[&str] = &[
    "InsufficientInstanceCapacity",
    "InsufficientCapacity",
    "SpotMaxPriceTooLow",
    "MaxSpotInstanceCountExceeded",
];

const DEBIAN_OWNER_ID: &str = "136693071363";
const SPOT_ADVISOR_URL: &str = "https://spot-bid-advisor.s3.amazonaws.com/spot-advisor-data.json";
const ONDEMAND_PRICING_URL: &str =
    "https://b0.p.awsstatic.com/pricing/2.0/meteredUnitMaps/ec2/USD/current/ec2-ondemand-without-sec-sel";

pub struct AwsProvider {
    credentials: ProviderCredentials,
    clients: Mutex<HashMap<String, Client>>,
    http: HttpClient,
}

impl AwsProvider {
    pub fn new(credentials: ProviderCredentials) -> Result<Self> {
        // Public pricing documents are optional data. Never let them stall a tick.
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            credentials,
            clients: Mutex::new(HashMap::new()),
            http,
        })
    }

    async fn client(&self, region: &str) -> Client {
        let mut clients = self.clients.lock().await;
        if let Some(c) = clients.get(region) {
            return c.clone();
        }
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if self.credentials.has_static_keys() {
            let creds = Credentials::new(
                self.credentials.access_key_id.clone().unwrap_or_default(),
                self.credentials.secret_access_key.clone().unwrap_or_default(),
                None,
                None,
                "pgspot-manifest",
            );
            loader = loader.credentials_provider(creds);
        } else if let Some(profile) = self.credentials.profile_name.as_deref().filter(|p| !p.is_empty()) {
            loader = loader.profile_name(profile);
        }
        let conf = loader.load().await;
        let client = Client::new(&conf);
        clients.insert(region.to_string(), client.clone());
        client
    }

    async fn default_subnet(&self, client: &Client, availability_zone: &str) -> Result<String> {
        let out = client
            .describe_subnets()
            .filters(filter("availability-zone", availability_zone))
            .filters(filter("default-for-az", "true"))
            .send()
            .await
            .context("describe_subnets failed")?;
        out.subnets()
            .iter()
            .find_map(|s| s.subnet_id().map(str::to_string))
            .ok_or_else(|| anyhow::anyhow!("no default subnet in {}", availability_zone))
    }

    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("GET {} returned {}", url, resp.status()));
        }
        Ok(resp.json().await?)
    }
}

fn filter(name: &str, value: &str) -> Filter {
    Filter::builder().name(name).values(value).build()
}

fn tag_filter(key: &str, value: &str) -> Filter {
    filter(&format!("tag:{}", key), value)
}

fn tag_spec(resource: ResourceType, tags: &Tags) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource)
        .set_tags(Some(
            tags.iter()
                .map(|(k, v)| Tag::builder().key(k).value(v).build())
                .collect(),
        ))
        .build()
}

fn tags_of(tags: &[Tag]) -> Tags {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect()
}

fn to_chrono(dt: &aws_sdk_ec2::primitives::DateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(dt.secs(), dt.subsec_nanos()).single()
}

fn region_of_az(az: &str) -> String {
    az.strip_suffix(|c: char| c.is_ascii_lowercase()).unwrap_or(az).to_string()
}

fn vm_from_instance(inst: &aws_sdk_ec2::types::Instance) -> Option<VmInfo> {
    let availability_zone = inst
        .placement()
        .and_then(|p| p.availability_zone())
        .unwrap_or_default()
        .to_string();
    Some(VmInfo {
        provider_id: inst.instance_id()?.to_string(),
        sku: inst.instance_type().map(|t| t.as_str().to_string()).unwrap_or_default(),
        region: region_of_az(&availability_zone),
        availability_zone,
        state: inst
            .state()
            .and_then(|s| s.name())
            .map(|n| VmState::from_provider(n.as_str()))
            .unwrap_or(VmState::Other("unknown".to_string())),
        ip_private: inst.private_ip_address().map(str::to_string),
        ip_public: inst.public_ip_address().map(str::to_string),
        tags: tags_of(inst.tags()),
        launched_at: inst.launch_time().and_then(to_chrono),
    })
}

fn volume_from_sdk(v: &aws_sdk_ec2::types::Volume) -> Option<VolumeInfo> {
    let attachment = v.attachments().first();
    Some(VolumeInfo {
        volume_id: v.volume_id()?.to_string(),
        availability_zone: v.availability_zone().unwrap_or_default().to_string(),
        size_gb: v.size().unwrap_or_default().max(0) as u32,
        volume_type: v.volume_type().map(|t| t.as_str().to_string()).unwrap_or_default(),
        state: v.state().map(|s| s.as_str().to_string()).unwrap_or_default(),
        attached_to: attachment.and_then(|a| a.instance_id()).map(str::to_string),
        attachment_state: attachment.and_then(|a| a.state()).map(|s| s.as_str().to_string()),
    })
}

fn nic_from_sdk(n: &aws_sdk_ec2::types::NetworkInterface) -> Option<NetworkInterfaceInfo> {
    Some(NetworkInterfaceInfo {
        nic_id: n.network_interface_id()?.to_string(),
        availability_zone: n.availability_zone().unwrap_or_default().to_string(),
        status: n.status().map(|s| s.as_str().to_string()).unwrap_or_default(),
        ip_private: n.private_ip_address().map(str::to_string),
        attached_to: n.attachment().and_then(|a| a.instance_id()).map(str::to_string),
    })
}

fn ip_from_sdk(a: &aws_sdk_ec2::types::Address) -> Option<FloatingIpInfo> {
    Some(FloatingIpInfo {
        allocation_id: a.allocation_id()?.to_string(),
        public_ip: a.public_ip().unwrap_or_default().to_string(),
        association_id: a.association_id().map(str::to_string),
        vm_id: a.instance_id().map(str::to_string),
        network_interface_id: a.network_interface_id().map(str::to_string),
    })
}

fn instance_type_from_sdk(it: &aws_sdk_ec2::types::InstanceTypeInfo) -> Option<InstanceTypeInfo> {
    let sku = it.instance_type()?.as_str().to_string();
    let arch = it
        .processor_info()
        .and_then(|p| p.supported_architectures().first())
        .map(|a| a.as_str().to_string())
        .unwrap_or_default();
    let storage = it.instance_storage_info();
    let instance_storage_gb = storage
        .and_then(|s| s.total_size_in_gb())
        .unwrap_or_default()
        .max(0) as u64;
    let instance_storage_class = storage.map(|s| {
        let nvme = s
            .nvme_support()
            .map(|n| n.as_str() == "required" || n.as_str() == "supported")
            .unwrap_or(false);
        let hdd = s
            .disks()
            .iter()
            .any(|d| d.r#type().map(|t| t.as_str() == "hdd").unwrap_or(false));
        if hdd {
            StorageSpeedClass::Hdd
        } else if nvme {
            StorageSpeedClass::Nvme
        } else {
            StorageSpeedClass::Ssd
        }
    });
    Some(InstanceTypeInfo {
        sku,
        arch,
        vcpu: it.v_cpu_info().and_then(|v| v.default_v_cpus()).unwrap_or_default().max(0) as u32,
        ram_mb: it.memory_info().and_then(|m| m.size_in_mib()).unwrap_or_default().max(0) as u64,
        instance_storage_gb,
        instance_storage_class: instance_storage_class.filter(|_| instance_storage_gb > 0),
        burstable: it.burstable_performance_supported().unwrap_or(false),
    })
}

/// Region code -> location label used by the public on-demand price documents.
fn pricing_location(region: &str) -> Option<&'static str> {
    Some(match region {
        "us-east-1" => "US East (N. Virginia)",
        "us-east-2" => "US East (Ohio)",
        "us-west-1" => "US West (N. California)",
        "us-west-2" => "US West (Oregon)",
        "ca-central-1" => "Canada (Central)",
        "eu-central-1" => "EU (Frankfurt)",
        "eu-central-2" => "EU (Zurich)",
        "eu-west-1" => "EU (Ireland)",
        "eu-west-2" => "EU (London)",
        "eu-west-3" => "EU (Paris)",
        "eu-north-1" => "EU (Stockholm)",
        "eu-south-1" => "EU (Milan)",
        "eu-south-2" => "EU (Spain)",
        "ap-northeast-1" => "Asia Pacific (Tokyo)",
        "ap-northeast-2" => "Asia Pacific (Seoul)",
        "ap-southeast-1" => "Asia Pacific (Singapore)",
        "ap-southeast-2" => "Asia Pacific (Sydney)",
        "ap-south-1" => "Asia Pacific (Mumbai)",
        "sa-east-1" => "South America (Sao Paulo)",
        _ => return None,
    })
}

/// Extract `sku -> hourly price` for `skus` from an on-demand price document.
fn parse_ondemand_document(doc: &serde_json::Value, location: &str, skus: &[String]) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    let Some(entries) = doc
        .get("regions")
        .and_then(|r| r.get(location))
        .and_then(|r| r.as_object())
    else {
        return out;
    };
    for entry in entries.values() {
        let Some(sku) = entry.get("Instance Type").and_then(|v| v.as_str()) else {
            continue;
        };
        if !skus.iter().any(|s| s == sku) {
            continue;
        }
        if let Some(price) = entry
            .get("price")
            .and_then(|v| v.as_str())
            .and_then(|p| p.parse::<f64>().ok())
            .filter(|p| *p > 0.0)
        {
            out.insert(sku.to_string(), price);
        }
    }
    out
}

/// Extract `sku -> eviction bracket` from the spot advisor document (Linux).
fn parse_spot_advisor_document(doc: &serde_json::Value, region: &str, skus: &[String]) -> HashMap<String, u8> {
    let Some(entries) = doc
        .get("spot_advisor")
        .and_then(|r| r.get(region))
        .and_then(|r| r.get("Linux"))
        .and_then(|r| r.as_object())
    else {
        return HashMap::new();
    };
    skus.iter()
        .filter_map(|sku| {
            let r = entries.get(sku)?.get("r")?.as_u64()?;
            Some((sku.clone(), r.min(u8::MAX as u64) as u8))
        })
        .collect()
}

fn is_capacity_code(code: Option<&str>) -> bool {
    code.map(|c| CAPACITY_ERROR_CODES.contains(&c)).unwrap_or(false)
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn cloud(&self) -> &'static str {
        "aws"
    }

    fn login_user(&self) -> &'static str {
        "admin"
    }

    async fn list_instance_types(&self, region: &str, local_storage_only: bool) -> Result<Vec<InstanceTypeInfo>> {
        let client = self.client(region).await;
        let mut req = client
            .describe_instance_types()
            .filters(filter("supported-usage-class", "spot"));
        if local_storage_only {
            req = req.filters(filter("instance-storage-supported", "true"));
        }
        let mut pages = req.into_paginator().send();
        let mut out = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("describe_instance_types failed in {}", region))?;
            out.extend(page.instance_types().iter().filter_map(instance_type_from_sdk));
        }
        Ok(out)
    }

    async fn describe_instance_type(&self, region: &str, sku: &str) -> Result<Option<InstanceTypeInfo>> {
        let client = self.client(region).await;
        let out = client
            .describe_instance_types()
            .instance_types(InstanceType::from(sku))
            .send()
            .await
            .with_context(|| format!("describe_instance_types({}) failed", sku))?;
        Ok(out.instance_types().iter().find_map(instance_type_from_sdk))
    }

    async fn get_spot_price_history(
        &self,
        region: &str,
        skus: &[String],
        since: DateTime<Utc>,
        availability_zone: Option<&str>,
    ) -> Result<Vec<SpotPricePoint>> {
        if skus.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.client(region).await;
        let mut pages = client
            .describe_spot_price_history()
            .set_instance_types(Some(skus.iter().map(|s| InstanceType::from(s.as_str())).collect()))
            .product_descriptions("Linux/UNIX")
            .start_time(aws_sdk_ec2::primitives::DateTime::from_secs(since.timestamp()))
            .set_availability_zone(availability_zone.map(str::to_string))
            .into_paginator()
            .send();
        let mut out = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("describe_spot_price_history failed in {}", region))?;
            for sp in page.spot_price_history() {
                let (Some(sku), Some(az), Some(price)) = (
                    sp.instance_type().map(|t| t.as_str().to_string()),
                    sp.availability_zone(),
                    sp.spot_price().and_then(|p| p.parse::<f64>().ok()),
                ) else {
                    continue;
                };
                out.push(SpotPricePoint {
                    sku,
                    availability_zone: az.to_string(),
                    price,
                    timestamp: sp.timestamp().and_then(to_chrono),
                });
            }
        }
        Ok(out)
    }

    async fn get_ondemand_prices(&self, region: &str, skus: &[String]) -> Result<HashMap<String, f64>> {
        let Some(location) = pricing_location(region) else {
            tracing::debug!("[resolver] no on-demand price document for region {}", region);
            return Ok(HashMap::new());
        };
        let url = format!(
            "{}/{}/Linux/index.json",
            ONDEMAND_PRICING_URL,
            location.replace(' ', "%20")
        );
        match self.fetch_json(&url).await {
            Ok(doc) => Ok(parse_ondemand_document(&doc, location, skus)),
            Err(e) => {
                tracing::warn!("[resolver] on-demand prices unavailable for {}: {}", region, e);
                Ok(HashMap::new())
            }
        }
    }

    async fn get_eviction_rate_groups(&self, region: &str, skus: &[String]) -> Result<HashMap<String, u8>> {
        match self.fetch_json(SPOT_ADVISOR_URL).await {
            Ok(doc) => Ok(parse_spot_advisor_document(&doc, region, skus)),
            Err(e) => {
                tracing::warn!("[resolver] spot advisor data unavailable: {}", e);
                Ok(HashMap::new())
            }
        }
    }

    async fn resolve_boot_image(&self, region: &str, arch: &str) -> Result<String> {
        let client = self.client(region).await;
        let (name_arch, sdk_arch) = if arch.contains("arm") {
            ("arm64", ArchitectureValues::Arm64)
        } else {
            ("amd64", ArchitectureValues::X8664)
        };
        let out = client
            .describe_images()
            .owners(DEBIAN_OWNER_ID)
            .filters(filter("name", &format!("debian-12-{}-*", name_arch)))
            .filters(filter("architecture", sdk_arch.as_str()))
            .filters(filter("state", "available"))
            .send()
            .await
            .context("describe_images failed")?;
        out.images()
            .iter()
            .filter(|img| img.image_id().is_some())
            .max_by(|a, b| a.creation_date().cmp(&b.creation_date()))
            .and_then(|img| img.image_id().map(str::to_string))
            .ok_or_else(|| anyhow::anyhow!("no Debian 12 image for {} in {}", arch, region))
    }

    async fn launch_vm(&self, req: &LaunchRequest) -> Result<VmInfo> {
        let client = self.client(&req.region).await;

        let spot = SpotMarketOptions::builder()
            .set_max_price(req.max_price.map(|p| format!("{:.5}", p)))
            .spot_instance_type(SpotInstanceType::OneTime)
            .instance_interruption_behavior(InstanceInterruptionBehavior::Terminate)
            .build();

        let nic = match req.network_interface_id.as_deref() {
            Some(nic_id) => InstanceNetworkInterfaceSpecification::builder()
                .device_index(0)
                .network_interface_id(nic_id)
                .build(),
            None => InstanceNetworkInterfaceSpecification::builder()
                .device_index(0)
                .associate_public_ip_address(req.assign_public_ip)
                .delete_on_termination(true)
                .set_subnet_id(req.subnet_id.clone())
                .set_groups(if req.security_group_ids.is_empty() {
                    None
                } else {
                    Some(req.security_group_ids.clone())
                })
                .build(),
        };

        let user_data = req
            .user_data
            .as_deref()
            .map(|u| base64::engine::general_purpose::STANDARD.encode(u));

        let result = client
            .run_instances()
            .image_id(&req.image_id)
            .instance_type(InstanceType::from(req.sku.as_str()))
            .min_count(1)
            .max_count(1)
            .placement(Placement::builder().availability_zone(&req.availability_zone).build())
            .instance_market_options(
                InstanceMarketOptionsRequest::builder()
                    .market_type(MarketType::Spot)
                    .spot_options(spot)
                    .build(),
            )
            .network_interfaces(nic)
            .set_user_data(user_data)
            .set_key_name(req.key_pair_name.clone())
            .tag_specifications(tag_spec(ResourceType::Instance, &req.tags))
            .send()
            .await;

        let out = match result {
            Ok(out) => out,
            Err(e) if is_capacity_code(e.code()) => {
                return Err(CapacityExhausted {
                    sku: req.sku.clone(),
                    availability_zone: req.availability_zone.clone(),
                    detail: format!("{}: {}", e.code().unwrap_or_default(), e.message().unwrap_or_default()),
                }
                .into());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("run_instances {} in {} failed", req.sku, req.availability_zone)));
            }
        };

        out.instances()
            .iter()
            .find_map(vm_from_instance)
            .ok_or_else(|| anyhow::anyhow!("run_instances returned no instance"))
    }

    async fn describe_vm(&self, region: &str, vm_id: &str) -> Result<Option<VmInfo>> {
        let client = self.client(region).await;
        let result = client.describe_instances().instance_ids(vm_id).send().await;
        let out = match result {
            Ok(out) => out,
            Err(e) if e.code() == Some("InvalidInstanceID.NotFound") => return Ok(None),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("describe_instances({}) failed", vm_id))),
        };
        Ok(out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find_map(vm_from_instance))
    }

    async fn list_vms_by_tag(&self, region: &str, tag_key: &str, tag_value: &str) -> Result<Vec<VmInfo>> {
        let client = self.client(region).await;
        let mut pages = client
            .describe_instances()
            .filters(tag_filter(tag_key, tag_value))
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("pending")
                    .values("running")
                    .values("stopping")
                    .values("stopped")
                    .build(),
            )
            .into_paginator()
            .send();
        let mut out = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.context("describe_instances failed")?;
            out.extend(
                page.reservations()
                    .iter()
                    .flat_map(|r| r.instances())
                    .filter_map(vm_from_instance),
            );
        }
        Ok(out)
    }

    async fn terminate_vm(&self, region: &str, vm_id: &str) -> Result<bool> {
        let client = self.client(region).await;
        match client.terminate_instances().instance_ids(vm_id).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.code() == Some("InvalidInstanceID.NotFound") => Ok(false),
            Err(e) => Err(anyhow::Error::new(e).context(format!("terminate_instances({}) failed", vm_id))),
        }
    }

    async fn list_volumes_by_tag(&self, region: &str, tag_key: &str, tag_value: &str) -> Result<Vec<VolumeInfo>> {
        let client = self.client(region).await;
        let out = client
            .describe_volumes()
            .filters(tag_filter(tag_key, tag_value))
            .send()
            .await
            .context("describe_volumes failed")?;
        Ok(out.volumes().iter().filter_map(volume_from_sdk).collect())
    }

    async fn describe_volume(&self, region: &str, volume_id: &str) -> Result<Option<VolumeInfo>> {
        let client = self.client(region).await;
        match client.describe_volumes().volume_ids(volume_id).send().await {
            Ok(out) => Ok(out.volumes().iter().find_map(volume_from_sdk)),
            Err(e) if e.code() == Some("InvalidVolume.NotFound") => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("describe_volumes({}) failed", volume_id))),
        }
    }

    async fn create_volume(&self, req: &VolumeRequest) -> Result<VolumeInfo> {
        let client = self.client(&req.region).await;
        let out = client
            .create_volume()
            .availability_zone(&req.availability_zone)
            .size(req.size_gb as i32)
            .volume_type(VolumeType::from(req.volume_type.as_str()))
            .set_iops(req.iops)
            .set_throughput(req.throughput)
            .tag_specifications(tag_spec(ResourceType::Volume, &req.tags))
            .send()
            .await
            .with_context(|| format!("create_volume in {} failed", req.availability_zone))?;
        let volume_id = out
            .volume_id()
            .ok_or_else(|| anyhow::anyhow!("create_volume returned no volume id"))?;
        Ok(VolumeInfo {
            volume_id: volume_id.to_string(),
            availability_zone: req.availability_zone.clone(),
            size_gb: req.size_gb,
            volume_type: req.volume_type.clone(),
            state: out.state().map(|s| s.as_str().to_string()).unwrap_or_else(|| "creating".to_string()),
            attached_to: None,
            attachment_state: None,
        })
    }

    async fn attach_volume(&self, region: &str, volume_id: &str, vm_id: &str, device: &str) -> Result<()> {
        let client = self.client(region).await;
        client
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(vm_id)
            .device(device)
            .send()
            .await
            .with_context(|| format!("attach_volume({} -> {}) failed", volume_id, vm_id))?;
        Ok(())
    }

    async fn delete_volume(&self, region: &str, volume_id: &str) -> Result<bool> {
        let client = self.client(region).await;
        match client.delete_volume().volume_id(volume_id).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.code() == Some("InvalidVolume.NotFound") => Ok(false),
            Err(e) => Err(anyhow::Error::new(e).context(format!("delete_volume({}) failed", volume_id))),
        }
    }

    async fn list_floating_ips_by_tag(&self, region: &str, tag_key: &str, tag_value: &str) -> Result<Vec<FloatingIpInfo>> {
        let client = self.client(region).await;
        let out = client
            .describe_addresses()
            .filters(tag_filter(tag_key, tag_value))
            .send()
            .await
            .context("describe_addresses failed")?;
        Ok(out.addresses().iter().filter_map(ip_from_sdk).collect())
    }

    async fn allocate_floating_ip(&self, region: &str, tags: &Tags) -> Result<FloatingIpInfo> {
        let client = self.client(region).await;
        let out = client
            .allocate_address()
            .domain(DomainType::Vpc)
            .tag_specifications(tag_spec(ResourceType::ElasticIp, tags))
            .send()
            .await
            .context("allocate_address failed")?;
        Ok(FloatingIpInfo {
            allocation_id: out
                .allocation_id()
                .ok_or_else(|| anyhow::anyhow!("allocate_address returned no allocation id"))?
                .to_string(),
            public_ip: out.public_ip().unwrap_or_default().to_string(),
            association_id: None,
            vm_id: None,
            network_interface_id: None,
        })
    }

    async fn associate_floating_ip(&self, region: &str, allocation_id: &str, target: &IpTarget) -> Result<()> {
        let client = self.client(region).await;
        let req = client
            .associate_address()
            .allocation_id(allocation_id)
            .allow_reassociation(true);
        let req = match target {
            IpTarget::Vm(vm_id) => req.instance_id(vm_id),
            IpTarget::NetworkInterface(nic_id) => req.network_interface_id(nic_id),
        };
        req.send()
            .await
            .with_context(|| format!("associate_address({}) failed", allocation_id))?;
        Ok(())
    }

    async fn release_floating_ip(&self, region: &str, ip: &FloatingIpInfo) -> Result<bool> {
        let client = self.client(region).await;
        if let Some(assoc) = ip.association_id.as_deref() {
            client
                .disassociate_address()
                .association_id(assoc)
                .send()
                .await
                .with_context(|| format!("disassociate_address({}) failed", assoc))?;
        }
        match client.release_address().allocation_id(&ip.allocation_id).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.code() == Some("InvalidAllocationID.NotFound") => Ok(false),
            Err(e) => Err(anyhow::Error::new(e).context(format!("release_address({}) failed", ip.allocation_id))),
        }
    }

    async fn list_network_interfaces_by_tag(
        &self,
        region: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<NetworkInterfaceInfo>> {
        let client = self.client(region).await;
        let out = client
            .describe_network_interfaces()
            .filters(tag_filter(tag_key, tag_value))
            .send()
            .await
            .context("describe_network_interfaces failed")?;
        Ok(out.network_interfaces().iter().filter_map(nic_from_sdk).collect())
    }

    async fn describe_network_interface(&self, region: &str, nic_id: &str) -> Result<Option<NetworkInterfaceInfo>> {
        let client = self.client(region).await;
        match client.describe_network_interfaces().network_interface_ids(nic_id).send().await {
            Ok(out) => Ok(out.network_interfaces().iter().find_map(nic_from_sdk)),
            Err(e) if e.code() == Some("InvalidNetworkInterfaceID.NotFound") => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("describe_network_interfaces({}) failed", nic_id))),
        }
    }

    async fn create_network_interface(&self, req: &NetworkInterfaceRequest) -> Result<NetworkInterfaceInfo> {
        let client = self.client(&req.region).await;
        let subnet_id = match req.subnet_id.clone() {
            Some(s) => s,
            None => self.default_subnet(&client, &req.availability_zone).await?,
        };
        let out = client
            .create_network_interface()
            .subnet_id(subnet_id)
            .set_groups(if req.security_group_ids.is_empty() {
                None
            } else {
                Some(req.security_group_ids.clone())
            })
            .tag_specifications(tag_spec(ResourceType::NetworkInterface, &req.tags))
            .send()
            .await
            .with_context(|| format!("create_network_interface in {} failed", req.availability_zone))?;
        out.network_interface()
            .and_then(nic_from_sdk)
            .ok_or_else(|| anyhow::anyhow!("create_network_interface returned no interface"))
    }

    async fn delete_network_interface(&self, region: &str, nic_id: &str) -> Result<bool> {
        let client = self.client(region).await;
        match client.delete_network_interface().network_interface_id(nic_id).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.code() == Some("InvalidNetworkInterfaceID.NotFound") => Ok(false),
            Err(e) => Err(anyhow::Error::new(e).context(format!("delete_network_interface({}) failed", nic_id))),
        }
    }
}
