//! SKU allow/deny list matching.
//!
//! Patterns are case-insensitive and `*` matches any substring (including
//! empty). No other glob features are supported.

use regex::Regex;

/// Compiled allow or deny list.
pub struct SkuPatterns {
    patterns: Vec<Regex>,
}

impl SkuPatterns {
    pub fn new(raw: &[String]) -> Self {
        let patterns = raw
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .filter_map(|p| compile_wildcard(p).ok())
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, sku: &str) -> bool {
        let sku = sku.trim();
        !sku.is_empty() && self.patterns.iter().any(|re| re.is_match(sku))
    }
}

fn compile_wildcard(pattern: &str) -> Result<Regex, regex::Error> {
    let body: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("(?i)^{}$", body.join(".*")))
}

/// Return true if `sku` matches at least one pattern.
pub fn sku_matches_patterns(sku: &str, patterns: &[String]) -> bool {
    SkuPatterns::new(patterns).matches(sku)
}
