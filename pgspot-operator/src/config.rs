use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Process settings, read once at startup (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct Settings {
    pub manifest_path: Option<PathBuf>,
    /// Inline manifest, takes precedence over `manifest_path`.
    pub manifest_inline: Option<String>,
    pub config_dir: PathBuf,
    pub cmdb_path: PathBuf,
    pub main_loop_interval: Duration,
    pub actions_dir: PathBuf,
    pub action_executable: String,
    pub action_timeout: Duration,
    pub vault_password_file: Option<PathBuf>,
    pub vm_boot_grace: Duration,
    pub dry_run: bool,
    pub teardown: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let config_dir = default_config_dir();
        Self {
            manifest_path: None,
            manifest_inline: None,
            cmdb_path: config_dir.join("cmdb.db"),
            config_dir,
            main_loop_interval: Duration::from_secs(60),
            actions_dir: PathBuf::from("./actions"),
            action_executable: "ansible-playbook".to_string(),
            action_timeout: Duration::from_secs(1800),
            vault_password_file: None,
            vm_boot_grace: Duration::from_secs(30),
            dry_run: false,
            teardown: false,
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".pgspot"))
        .unwrap_or_else(|| PathBuf::from(".pgspot"))
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        env_string(key)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(default),
    )
}

fn env_bool(key: &str) -> bool {
    env_string(key)
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        let config_dir = env_string("PGSPOT_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.config_dir);
        let cmdb_path = env_string("PGSPOT_CMDB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.join("cmdb.db"));

        Self {
            manifest_path: env_string("PGSPOT_MANIFEST_PATH").map(PathBuf::from),
            manifest_inline: env::var("PGSPOT_MANIFEST").ok().filter(|s| !s.trim().is_empty()),
            config_dir,
            cmdb_path,
            main_loop_interval: env_secs("PGSPOT_MAIN_LOOP_INTERVAL_S", 60),
            actions_dir: env_string("PGSPOT_ACTIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.actions_dir),
            action_executable: env_string("PGSPOT_ACTION_EXECUTABLE").unwrap_or(defaults.action_executable),
            action_timeout: env_secs("PGSPOT_ACTION_TIMEOUT_S", 1800),
            vault_password_file: env_string("PGSPOT_VAULT_PASSWORD_FILE").map(PathBuf::from),
            vm_boot_grace: env_secs("PGSPOT_VM_BOOT_GRACE_S", 30),
            dry_run: env_bool("PGSPOT_DRY_RUN"),
            teardown: env_bool("PGSPOT_TEARDOWN"),
        }
    }

    pub fn cmdb_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.cmdb_path.display())
    }

    /// Root for per-action working directories.
    pub fn work_dir(&self) -> PathBuf {
        self.config_dir.join("work")
    }
}
