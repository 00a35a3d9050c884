//! External configuration actions (`instance_setup`, `instance_teardown`).
//!
//! Each run gets a throw-away working directory holding the manifest, the
//! engine overrides and an inventory for the target. Files the action writes
//! into `output/` come back as key/value pairs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use pgspot_common::InstanceManifest;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub const INSTANCE_SETUP: &str = "instance_setup";
pub const INSTANCE_TEARDOWN: &str = "instance_teardown";
pub const OUTPUT_DIR: &str = "output";
pub const ACTION_ENTRYPOINT: &str = "playbook.yml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionTarget {
    Host { address: String, login_user: String },
    Localhost,
}

#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub action: String,
    pub instance_name: String,
    pub manifest: InstanceManifest,
    pub target: ActionTarget,
    /// Engine-computed values handed to the action; action output wins on collision.
    pub overrides: BTreeMap<String, String>,
}

#[async_trait]
pub trait ActionRunner: Send + Sync {
    fn has_action(&self, action: &str) -> bool;

    /// Run the action and return `overrides` merged with its outputs.
    async fn run(&self, req: &ActionRequest) -> Result<BTreeMap<String, String>>;
}

pub struct AnsibleActionRunner {
    command: String,
    actions_dir: PathBuf,
    work_root: PathBuf,
    timeout: Duration,
}

impl AnsibleActionRunner {
    /// `command` may carry leading arguments (`"ansible-playbook -v"`).
    pub fn new(command: impl Into<String>, actions_dir: impl Into<PathBuf>, work_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            actions_dir: actions_dir.into(),
            work_root: work_root.into(),
            timeout,
        }
    }

    fn entrypoint(&self, action: &str) -> PathBuf {
        self.actions_dir.join(action).join(ACTION_ENTRYPOINT)
    }
}

pub fn render_inventory(target: &ActionTarget) -> String {
    match target {
        ActionTarget::Host { address, login_user } => format!(
            "[all]\ntarget ansible_host={} ansible_user={} ansible_ssh_common_args='-o StrictHostKeyChecking=no'\n",
            address, login_user
        ),
        ActionTarget::Localhost => "[all]\nlocalhost ansible_connection=local\n".to_string(),
    }
}

/// Every regular file in `dir` becomes `file name -> trimmed contents`.
pub fn collect_outputs(dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let key = entry.file_name().to_string_lossy().to_string();
        let value = std::fs::read_to_string(entry.path()).with_context(|| format!("read output {}", key))?;
        out.insert(key, value.trim().to_string());
    }
    Ok(out)
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl ActionRunner for AnsibleActionRunner {
    fn has_action(&self, action: &str) -> bool {
        self.entrypoint(action).is_file()
    }

    async fn run(&self, req: &ActionRequest) -> Result<BTreeMap<String, String>> {
        let entrypoint = self.entrypoint(&req.action);
        if !entrypoint.is_file() {
            anyhow::bail!("action '{}' not found at {}", req.action, entrypoint.display());
        }

        std::fs::create_dir_all(&self.work_root)
            .with_context(|| format!("create {}", self.work_root.display()))?;
        let workdir = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", req.instance_name, req.action))
            .tempdir_in(&self.work_root)
            .context("create action working directory")?;
        let dir = workdir.path();

        let manifest_path = dir.join("manifest.yml");
        let overrides_path = dir.join("engine_overrides.yml");
        let inventory_path = dir.join("inventory");
        let output_dir = dir.join(OUTPUT_DIR);
        std::fs::write(&manifest_path, req.manifest.to_yaml_string()?)?;
        std::fs::write(&overrides_path, serde_yaml::to_string(&req.overrides)?)?;
        std::fs::write(&inventory_path, render_inventory(&req.target))?;
        std::fs::create_dir_all(&output_dir)?;

        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty action executable"))?;
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .arg("-i")
            .arg(&inventory_path)
            .arg(&entrypoint)
            .arg("--extra-vars")
            .arg(format!("@{}", manifest_path.display()))
            .arg("--extra-vars")
            .arg(format!("@{}", overrides_path.display()))
            .arg("--extra-vars")
            .arg(format!("output_dir={}", output_dir.display()))
            .current_dir(dir)
            .env("PGSPOT_OUTPUT_DIR", &output_dir)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::info!(
            "⚙️ [action] {}: running '{}' on {}",
            req.instance_name,
            req.action,
            match &req.target {
                ActionTarget::Host { address, .. } => address.as_str(),
                ActionTarget::Localhost => "localhost",
            }
        );

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}' for action '{}'", program, req.action))?;
        // wait_with_output() takes ownership, keep the pid for the kill path.
        let child_id = child.id();
        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.with_context(|| format!("action '{}' failed to complete", req.action))?
            }
            _ = tokio::time::sleep(self.timeout) => {
                if let Some(pid) = child_id {
                    // Negative pid: the whole process group.
                    let _ = Command::new("kill")
                        .args(["-KILL", "--", &format!("-{}", pid)])
                        .output()
                        .await;
                }
                anyhow::bail!(
                    "action '{}' for {} timed out after {}s",
                    req.action,
                    req.instance_name,
                    self.timeout.as_secs()
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!("[action] {} stdout:\n{}", req.action, tail(&stdout, 40));
        if !output.status.success() {
            anyhow::bail!(
                "action '{}' for {} exited with {}: {}",
                req.action,
                req.instance_name,
                output.status,
                tail(if stderr.trim().is_empty() { &stdout } else { &stderr }, 20)
            );
        }

        let mut merged = req.overrides.clone();
        let outputs = collect_outputs(&output_dir)?;
        tracing::info!(
            "✅ [action] {}: '{}' finished, {} output(s)",
            req.instance_name,
            req.action,
            outputs.len()
        );
        merged.extend(outputs);
        Ok(merged)
    }
}
