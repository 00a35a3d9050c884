use anyhow::Result;
use pgspot_common::InstanceManifest;
use pgspot_providers::{CloudProvider, ProviderCredentials};
use std::str::FromStr;
use std::sync::Arc;

/// Clouds the operator knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cloud {
    Aws,
}

pub const CLOUDS: &[(&str, Cloud)] = &[("aws", Cloud::Aws)];

impl FromStr for Cloud {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        CLOUDS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| *c)
            .ok_or_else(|| anyhow::anyhow!("unsupported cloud '{}'", s))
    }
}

pub fn credentials_from_manifest(manifest: &InstanceManifest) -> ProviderCredentials {
    let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    ProviderCredentials {
        access_key_id: non_empty(&manifest.aws.access_key_id),
        secret_access_key: non_empty(&manifest.aws.secret_access_key),
        profile_name: non_empty(&manifest.aws.profile_name),
    }
}

/// Builds a provider for one tick from that tick's credentials.
pub trait ProviderFactory: Send + Sync {
    fn get_provider(&self, cloud: &str, credentials: &ProviderCredentials) -> Result<Arc<dyn CloudProvider>>;
}

pub struct ProviderManager;

impl ProviderFactory for ProviderManager {
    fn get_provider(&self, cloud: &str, credentials: &ProviderCredentials) -> Result<Arc<dyn CloudProvider>> {
        match cloud.parse::<Cloud>()? {
            Cloud::Aws => aws_provider(credentials),
        }
    }
}

#[cfg(feature = "provider-aws")]
fn aws_provider(credentials: &ProviderCredentials) -> Result<Arc<dyn CloudProvider>> {
    let provider = pgspot_providers::aws::AwsProvider::new(credentials.clone())?;
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "provider-aws"))]
fn aws_provider(_credentials: &ProviderCredentials) -> Result<Arc<dyn CloudProvider>> {
    anyhow::bail!("cloud 'aws' is not compiled in (enable the provider-aws feature)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_registry() {
        assert_eq!("aws".parse::<Cloud>().unwrap(), Cloud::Aws);
        assert_eq!(" AWS ".parse::<Cloud>().unwrap(), Cloud::Aws);
        assert!("gcp".parse::<Cloud>().is_err());
        assert!(ProviderManager
            .get_provider("azure", &ProviderCredentials::default())
            .is_err());
    }

    #[test]
    fn credentials_come_from_the_manifest() {
        let m = InstanceManifest::from_yaml_str(
            "region: eu-north-1\ninstance_name: pg1\naws:\n  access_key_id: AKIA123\n  secret_access_key: shh\n  profile_name: ''\n",
        )
        .unwrap();
        let creds = credentials_from_manifest(&m);
        assert_eq!(creds.access_key_id.as_deref(), Some("AKIA123"));
        assert_eq!(creds.secret_access_key.as_deref(), Some("shh"));
        assert!(creds.profile_name.is_none());
        assert!(creds.has_static_keys());
    }
}
