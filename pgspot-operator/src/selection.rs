use rand::Rng;
use std::cmp::Ordering;

use crate::resolver::Candidate;

/// One priced (SKU, AZ) offer as seen by a selection strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedOffer {
    pub sku: String,
    pub availability_zone: String,
    pub price: f64,
    pub eviction_rate_group: Option<u8>,
}

impl From<&Candidate> for RankedOffer {
    fn from(c: &Candidate) -> Self {
        Self {
            sku: c.info.sku.clone(),
            availability_zone: c.availability_zone.clone(),
            price: c.price_spot,
            eviction_rate_group: c.eviction_rate_group,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    Cheapest,
    Random,
    EvictionRate,
}

/// Registered strategy names.
pub const STRATEGIES: &[(&str, SelectionStrategy)] = &[
    ("cheapest", SelectionStrategy::Cheapest),
    ("random", SelectionStrategy::Random),
    ("eviction-rate", SelectionStrategy::EvictionRate),
];

pub const DEFAULT_STRATEGY: SelectionStrategy = SelectionStrategy::Cheapest;

fn has_pricing(offer: &RankedOffer) -> bool {
    offer.price.is_finite() && offer.price > 0.0
}

fn by_price(a: &RankedOffer, b: &RankedOffer) -> Ordering {
    a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal)
}

impl SelectionStrategy {
    pub fn lookup(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        STRATEGIES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| *s)
    }

    /// Registered strategy for `name`, the default one otherwise.
    pub fn from_name(name: &str) -> Self {
        match Self::lookup(name) {
            Some(s) => s,
            None => {
                tracing::warn!(
                    "[resolver] unknown instance_selection_strategy '{}', using '{}'",
                    name,
                    DEFAULT_STRATEGY.name()
                );
                DEFAULT_STRATEGY
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SelectionStrategy::Cheapest => "cheapest",
            SelectionStrategy::Random => "random",
            SelectionStrategy::EvictionRate => "eviction-rate",
        }
    }

    /// Pick exactly one offer. Offers without pricing data (price <= 0) are
    /// never picked; `None` when nothing priced is left.
    pub fn select(&self, offers: &[RankedOffer]) -> Option<RankedOffer> {
        let mut priced: Vec<&RankedOffer> = offers.iter().filter(|o| has_pricing(o)).collect();
        if priced.is_empty() {
            return None;
        }
        match self {
            SelectionStrategy::Cheapest => priced.into_iter().min_by(|a, b| by_price(a, b)).cloned(),
            SelectionStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..priced.len());
                Some(priced[idx].clone())
            }
            SelectionStrategy::EvictionRate => {
                // Unknown bracket sorts after every known one.
                priced.sort_by(|a, b| {
                    let ga = a.eviction_rate_group.map(u16::from).unwrap_or(u16::MAX);
                    let gb = b.eviction_rate_group.map(u16::from).unwrap_or(u16::MAX);
                    ga.cmp(&gb).then_with(|| by_price(a, b))
                });
                priced.first().map(|o| (*o).clone())
            }
        }
    }
}

/// Order `candidates` for launching: the strategy's pick first, then the rest
/// by ascending price. Fails if the picked offer is not one of the candidates.
pub fn order_for_launch(strategy: SelectionStrategy, candidates: &[Candidate]) -> anyhow::Result<Vec<Candidate>> {
    let offers: Vec<RankedOffer> = candidates.iter().map(RankedOffer::from).collect();
    let picked = strategy
        .select(&offers)
        .ok_or_else(|| anyhow::anyhow!("no candidate has pricing data"))?;

    let idx = candidates
        .iter()
        .position(|c| c.info.sku == picked.sku && c.availability_zone == picked.availability_zone)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "selected {} in {} is not in the candidate set",
                picked.sku,
                picked.availability_zone
            )
        })?;

    let mut rest: Vec<Candidate> = candidates
        .iter()
        .enumerate()
        .filter(|(i, c)| *i != idx && c.has_pricing())
        .map(|(_, c)| c.clone())
        .collect();
    rest.sort_by(|a, b| a.price_spot.partial_cmp(&b.price_spot).unwrap_or(Ordering::Equal));

    let mut ordered = Vec::with_capacity(rest.len() + 1);
    ordered.push(candidates[idx].clone());
    ordered.extend(rest);
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(sku: &str, az: &str, price: f64, group: Option<u8>) -> RankedOffer {
        RankedOffer {
            sku: sku.into(),
            availability_zone: az.into(),
            price,
            eviction_rate_group: group,
        }
    }

    fn offers() -> Vec<RankedOffer> {
        vec![
            offer("m6idn.large", "eu-north-1b", 0.03805, Some(2)),
            offer("r6gd.large", "eu-north-1a", 0.0237, Some(3)),
            offer("m6gd.large", "eu-north-1c", 0.0300, Some(0)),
            offer("c6gd.large", "eu-north-1a", 0.0, Some(0)),
        ]
    }

    #[test]
    fn registry_lookup_and_fallback() {
        assert_eq!(SelectionStrategy::lookup("eviction-rate"), Some(SelectionStrategy::EvictionRate));
        assert_eq!(SelectionStrategy::lookup("Random"), Some(SelectionStrategy::Random));
        assert_eq!(SelectionStrategy::lookup("balanced"), None);
        assert_eq!(SelectionStrategy::from_name("balanced"), SelectionStrategy::Cheapest);
        for (name, s) in STRATEGIES {
            assert_eq!(s.name(), *name);
        }
    }

    #[test]
    fn cheapest_ignores_unpriced() {
        let picked = SelectionStrategy::Cheapest.select(&offers()).unwrap();
        assert_eq!(picked.sku, "r6gd.large");
    }

    #[test]
    fn eviction_rate_prefers_lowest_bracket_then_price() {
        let picked = SelectionStrategy::EvictionRate.select(&offers()).unwrap();
        // c6gd.large is bracket 0 too but has no price.
        assert_eq!(picked.sku, "m6gd.large");

        let unknown = vec![
            offer("a", "z", 0.01, None),
            offer("b", "z", 0.05, Some(4)),
        ];
        assert_eq!(SelectionStrategy::EvictionRate.select(&unknown).unwrap().sku, "b");
    }

    #[test]
    fn random_only_returns_priced_offers() {
        let all = offers();
        for _ in 0..50 {
            let picked = SelectionStrategy::Random.select(&all).unwrap();
            assert!(all.contains(&picked));
            assert!(picked.price > 0.0);
        }
    }

    #[test]
    fn nothing_priced_selects_nothing() {
        let unpriced = vec![offer("a", "z", 0.0, None)];
        for (_, s) in STRATEGIES {
            assert!(s.select(&unpriced).is_none());
            assert!(s.select(&[]).is_none());
        }
    }
}
