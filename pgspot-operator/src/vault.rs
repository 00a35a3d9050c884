//! Decryption of vault-sealed manifest values.

use anyhow::{Context, Result};
use pgspot_common::InstanceManifest;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const VAULT_PREFIX: &str = "$ANSIBLE_VAULT;";
pub const DEFAULT_VAULT_EXECUTABLE: &str = "ansible-vault";
const DECRYPT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn is_vault_sealed(value: &str) -> bool {
    value.trim_start().starts_with(VAULT_PREFIX)
}

fn count_sealed(value: &Value) -> usize {
    match value {
        Value::String(s) if is_vault_sealed(s) => 1,
        Value::Array(items) => items.iter().map(count_sealed).sum(),
        Value::Object(map) => map.values().map(count_sealed).sum(),
        _ => 0,
    }
}

#[derive(Debug, Clone)]
pub struct VaultDecryptor {
    command: String,
    timeout: Duration,
}

impl Default for VaultDecryptor {
    fn default() -> Self {
        Self::new(DEFAULT_VAULT_EXECUTABLE)
    }
}

impl VaultDecryptor {
    /// `command` may carry leading arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: DECRYPT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn decrypt(&self, sealed: &str, password_file: &Path) -> Result<String> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty vault executable"))?;
        let mut child = Command::new(program)
            .args(parts)
            .arg("decrypt")
            .arg("--vault-password-file")
            .arg(password_file)
            .arg("--output")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", program))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = format!("{}\n", sealed.trim());
            stdin.write_all(payload.as_bytes()).await?;
        }

        let child_id = child.id();
        let output = tokio::select! {
            result = child.wait_with_output() => result.context("vault decrypt failed")?,
            _ = tokio::time::sleep(self.timeout) => {
                if let Some(pid) = child_id {
                    let _ = Command::new("kill").args(["-9", &pid.to_string()]).output().await;
                }
                anyhow::bail!("vault decrypt timed out after {}s", self.timeout.as_secs());
            }
        };

        if !output.status.success() {
            anyhow::bail!(
                "vault decrypt exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end_matches('\n').to_string())
    }

    /// Decrypt every sealed string in `value`, in place. Returns how many were decrypted.
    pub async fn decrypt_value(&self, value: &mut Value, password_file: &Path) -> Result<usize> {
        // Iterative walk, async recursion would need boxing.
        let mut stack: Vec<&mut Value> = vec![value];
        let mut done = 0;
        while let Some(v) = stack.pop() {
            match v {
                Value::String(s) if is_vault_sealed(s) => {
                    *s = self.decrypt(s, password_file).await?;
                    done += 1;
                }
                Value::Array(items) => stack.extend(items.iter_mut()),
                Value::Object(map) => stack.extend(map.values_mut()),
                _ => {}
            }
        }
        Ok(done)
    }

    /// Decrypt the sealed values of `manifest` in place.
    pub async fn decrypt_manifest(&self, manifest: &mut InstanceManifest) -> Result<usize> {
        let mut value = manifest.to_json_value();
        let sealed = count_sealed(&value);
        if sealed == 0 {
            return Ok(0);
        }
        let password_file: PathBuf = manifest
            .vault_password_file
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "{} has {} vault-sealed value(s) but no vault_password_file",
                    manifest.instance_name,
                    sealed
                )
            })?;

        let done = self
            .decrypt_value(&mut value, &password_file)
            .await
            .with_context(|| format!("decrypting secrets of {}", manifest.instance_name))?;
        *manifest = serde_json::from_value(value).context("decrypted manifest no longer parses")?;
        tracing::debug!("[vault] {}: decrypted {} value(s)", manifest.instance_name, done);
        Ok(done)
    }
}
