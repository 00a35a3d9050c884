//! Instance type resolution: hardware constraints -> priced (SKU, AZ) candidates.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use pgspot_common::manifest::VmSection;
use pgspot_common::sku_patterns::SkuPatterns;
use pgspot_common::{StorageSpeedClass, StorageType, HOURS_PER_MONTH};
use pgspot_providers::{CloudProvider, InstanceTypeInfo, SpotPricePoint};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Candidates kept after the hardware sort, before price lookups.
pub const MAX_PRICED_SKUS: usize = 10;
pub const PRICE_LOOKBACK_DAYS: i64 = 1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareConstraints {
    pub cpu_min: Option<u32>,
    pub cpu_max: Option<u32>,
    pub ram_min_gb: Option<u32>,
    pub storage_min_gb: Option<u32>,
    pub storage_type: StorageType,
    pub storage_speed_class: StorageSpeedClass,
    pub cpu_architecture: Option<String>,
    pub allow_burstable: bool,
    pub instance_types: Vec<String>,
    pub instance_types_denied: Vec<String>,
    pub max_price: Option<f64>,
}

impl From<&VmSection> for HardwareConstraints {
    fn from(vm: &VmSection) -> Self {
        Self {
            cpu_min: vm.cpu_min,
            cpu_max: vm.cpu_max,
            ram_min_gb: vm.ram_min,
            storage_min_gb: vm.storage_min,
            storage_type: vm.storage_type,
            storage_speed_class: vm.storage_speed_class,
            cpu_architecture: vm.cpu_architecture.clone(),
            allow_burstable: vm.allow_burstable,
            instance_types: vm.instance_types.clone(),
            instance_types_denied: vm.instance_types_denied.clone(),
            max_price: vm.max_price,
        }
    }
}

/// A priced offer for one SKU in one availability zone.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub info: InstanceTypeInfo,
    pub region: String,
    pub availability_zone: String,
    /// Average hourly spot price over the lookback window.
    pub price_spot: f64,
    pub price_ondemand: Option<f64>,
    pub eviction_rate_group: Option<u8>,
}

impl Candidate {
    pub fn has_pricing(&self) -> bool {
        self.price_spot.is_finite() && self.price_spot > 0.0
    }

    pub fn monthly_spot(&self) -> f64 {
        self.price_spot * HOURS_PER_MONTH
    }

    pub fn monthly_ondemand(&self) -> Option<f64> {
        self.price_ondemand.map(|p| p * HOURS_PER_MONTH)
    }
}

fn storage_class_ok(actual: Option<StorageSpeedClass>, wanted: StorageSpeedClass) -> bool {
    match (actual, wanted) {
        (Some(a), StorageSpeedClass::Ssd) => a == StorageSpeedClass::Ssd || a == StorageSpeedClass::Nvme,
        (Some(a), w) => a == w,
        (None, _) => false,
    }
}

/// True when `info` satisfies every active constraint.
pub fn matches_constraints(info: &InstanceTypeInfo, c: &HardwareConstraints) -> bool {
    let allow = SkuPatterns::new(&c.instance_types);
    let deny = SkuPatterns::new(&c.instance_types_denied);
    matches_hardware(info, c) && sku_allowed(&info.sku, &allow, &deny)
}

fn sku_allowed(sku: &str, allow: &SkuPatterns, deny: &SkuPatterns) -> bool {
    (allow.is_empty() || allow.matches(sku)) && !deny.matches(sku)
}

fn matches_hardware(info: &InstanceTypeInfo, c: &HardwareConstraints) -> bool {
    if let Some(arch) = c.cpu_architecture.as_deref().filter(|a| !a.trim().is_empty()) {
        if !info.arch.to_ascii_lowercase().contains(&arch.trim().to_ascii_lowercase()) {
            return false;
        }
    }
    if !c.allow_burstable && info.burstable {
        return false;
    }
    if c.cpu_min.map_or(false, |min| info.vcpu < min) {
        return false;
    }
    if c.cpu_max.map_or(false, |max| info.vcpu > max) {
        return false;
    }
    if c.ram_min_gb.map_or(false, |gb| info.ram_mb < u64::from(gb) * 1024) {
        return false;
    }
    if c.storage_type == StorageType::Local {
        if info.instance_storage_gb == 0 {
            return false;
        }
        if c.storage_min_gb.map_or(false, |gb| info.instance_storage_gb < u64::from(gb)) {
            return false;
        }
        if !storage_class_ok(info.instance_storage_class, c.storage_speed_class) {
            return false;
        }
    }
    true
}

/// Filter then sort by (cpu, ram) for network storage, (cpu, local disk) for local storage.
pub fn filter_and_sort(types: Vec<InstanceTypeInfo>, c: &HardwareConstraints) -> Vec<InstanceTypeInfo> {
    let allow = SkuPatterns::new(&c.instance_types);
    let deny = SkuPatterns::new(&c.instance_types_denied);
    let mut out: Vec<InstanceTypeInfo> = types
        .into_iter()
        .filter(|t| matches_hardware(t, c) && sku_allowed(&t.sku, &allow, &deny))
        .collect();
    match c.storage_type {
        StorageType::Network => out.sort_by(|a, b| (a.vcpu, a.ram_mb, &a.sku).cmp(&(b.vcpu, b.ram_mb, &b.sku))),
        StorageType::Local => out.sort_by(|a, b| {
            (a.vcpu, a.instance_storage_gb, &a.sku).cmp(&(b.vcpu, b.instance_storage_gb, &b.sku))
        }),
    }
    out
}

/// Average price per (SKU, AZ), ascending. Pairs without a positive average
/// carry no pricing data and are dropped.
pub fn average_prices(points: &[SpotPricePoint]) -> Vec<(String, String, f64)> {
    let mut sums: HashMap<(String, String), (f64, u32)> = HashMap::new();
    for p in points.iter().filter(|p| p.price.is_finite()) {
        let entry = sums
            .entry((p.sku.clone(), p.availability_zone.clone()))
            .or_insert((0.0, 0));
        entry.0 += p.price;
        entry.1 += 1;
    }
    let mut out: Vec<(String, String, f64)> = sums
        .into_iter()
        .map(|((sku, az), (sum, n))| (sku, az, sum / f64::from(n)))
        .filter(|(_, _, avg)| *avg > 0.0)
        .collect();
    out.sort_by(|a, b| {
        a.2.partial_cmp(&b.2)
            .unwrap_or(Ordering::Equal)
            .then_with(|| (&a.0, &a.1).cmp(&(&b.0, &b.1)))
    });
    out
}

/// Resolve candidates for one region. `pinned_az` restricts pricing to one AZ.
pub async fn resolve_region(
    provider: &dyn CloudProvider,
    region: &str,
    c: &HardwareConstraints,
    pinned_az: Option<&str>,
) -> Result<Vec<Candidate>> {
    let types = provider
        .list_instance_types(region, c.storage_type == StorageType::Local)
        .await?;
    let total = types.len();
    let mut matching = filter_and_sort(types, c);
    let matched = matching.len();
    matching.truncate(MAX_PRICED_SKUS);
    tracing::debug!(
        "[resolver] {}: {} SKUs listed, {} match, pricing {}",
        region,
        total,
        matched,
        matching.len()
    );
    if matching.is_empty() {
        return Ok(Vec::new());
    }

    let skus: Vec<String> = matching.iter().map(|t| t.sku.clone()).collect();
    let since = Utc::now() - ChronoDuration::days(PRICE_LOOKBACK_DAYS);
    let points = provider.get_spot_price_history(region, &skus, since, pinned_az).await?;
    let ondemand = provider.get_ondemand_prices(region, &skus).await.unwrap_or_default();
    let eviction = provider.get_eviction_rate_groups(region, &skus).await.unwrap_or_default();

    let by_sku: HashMap<&str, &InstanceTypeInfo> = matching.iter().map(|t| (t.sku.as_str(), t)).collect();
    let mut out = Vec::new();
    for (sku, az, price) in average_prices(&points) {
        let Some(info) = by_sku.get(sku.as_str()) else {
            continue;
        };
        if c.max_price.map_or(false, |max| price > max) {
            continue;
        }
        out.push(Candidate {
            info: (*info).clone(),
            region: region.to_string(),
            price_ondemand: ondemand.get(&sku).copied(),
            eviction_rate_group: eviction.get(&sku).copied(),
            availability_zone: az,
            price_spot: price,
        });
    }
    Ok(out)
}

/// Resolve over several regions. Regions are queried concurrently; a failing
/// or empty region is logged and skipped. Result is sorted by price, ties
/// keep region order.
pub async fn resolve(
    provider: &dyn CloudProvider,
    regions: &[String],
    c: &HardwareConstraints,
    pinned_az: Option<&str>,
) -> Result<Vec<Candidate>> {
    let lookups = regions
        .iter()
        .map(|region| resolve_region(provider, region, c, pinned_az));
    let results = join_all(lookups).await;

    let mut out = Vec::new();
    let mut failures = Vec::new();
    for (region, result) in regions.iter().zip(results) {
        match result {
            Ok(found) if !found.is_empty() => out.extend(found),
            Ok(_) => {
                tracing::warn!("[resolver] no SKU matches in {}", region);
                failures.push(format!("{}: no match", region));
            }
            Err(e) => {
                tracing::warn!("[resolver] lookup failed in {}: {:#}", region, e);
                failures.push(format!("{}: {:#}", region, e));
            }
        }
    }

    if out.is_empty() {
        anyhow::bail!("no SKUs match the hardware constraints ({})", failures.join("; "));
    }
    out.sort_by(|a, b| a.price_spot.partial_cmp(&b.price_spot).unwrap_or(Ordering::Equal));
    Ok(out)
}
