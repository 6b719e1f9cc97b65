pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "MACHINEFLOW_CONFIG";
pub const SUBSCRIPTION_ENV: &str = "MACHINEFLOW_SUBSCRIPTION_ID";
pub const TOKEN_ENVS: [&str; 2] = ["MACHINEFLOW_ARM_TOKEN", "AZURE_ACCESS_TOKEN"];

pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com";
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 90 * 60;
pub const DEFAULT_MAX_PROVISIONING_RECOVERIES: u32 = 3;
pub const DEFAULT_STORE_DIR: &str = ".machineflow";

/// Regions offering availability zones
pub const DEFAULT_ZONAL_LOCATIONS: [&str; 12] = [
    "australiaeast",
    "centralus",
    "eastus",
    "eastus2",
    "francecentral",
    "japaneast",
    "northeurope",
    "southcentralus",
    "southeastasia",
    "uksouth",
    "westeurope",
    "westus2",
];

/// Get the MachineFlow configuration directory, creating it if needed
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("machineflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Find the configuration file
///
/// Search order:
/// 1. `MACHINEFLOW_CONFIG` (direct path)
/// 2. current directory: machineflow.yaml, .machineflow.yaml
/// 3. ~/.config/machineflow/config.yaml (global)
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    for filename in ["machineflow.yaml", ".machineflow.yaml"] {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("machineflow").join("config.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Used for clusters that do not name a subscription
    pub subscription_id: String,
    pub arm_endpoint: String,
    pub reconcile_timeout_secs: u64,
    pub max_provisioning_recoveries: u32,
    pub zonal_locations: Vec<String>,
    /// Root of the file-backed object store
    pub store_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            subscription_id: String::new(),
            arm_endpoint: DEFAULT_ARM_ENDPOINT.to_string(),
            reconcile_timeout_secs: DEFAULT_RECONCILE_TIMEOUT_SECS,
            max_provisioning_recoveries: DEFAULT_MAX_PROVISIONING_RECOVERIES,
            zonal_locations: DEFAULT_ZONAL_LOCATIONS.iter().map(|l| l.to_string()).collect(),
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Settings from `path`, the discovered file or defaults, in that order,
    /// with environment overrides applied
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => match find_config_file() {
                Ok(path) => Self::from_file(&path)?,
                Err(ConfigError::ConfigFileNotFound) => Self::default(),
                Err(e) => return Err(e),
            },
        };
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(subscription) = std::env::var(SUBSCRIPTION_ENV) {
            if !subscription.is_empty() {
                self.subscription_id = subscription;
            }
        }
    }

    /// Bearer token for Azure Resource Manager
    pub fn arm_token(&self) -> Result<String> {
        TOKEN_ENVS
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|token| !token.is_empty())
            .ok_or(ConfigError::MissingToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_get_config_dir() {
        let config_dir = get_config_dir().unwrap();
        assert!(config_dir.ends_with("machineflow"));
        assert!(config_dir.exists());
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        fs::write(temp_dir.path().join(".machineflow.yaml"), "storeDir: s").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = temp_env::with_var_unset(CONFIG_ENV, find_config_file);

        std::env::set_current_dir(original_dir).unwrap();
        assert!(result.unwrap().ends_with(".machineflow.yaml"));
    }

    #[test]
    #[serial]
    fn test_visible_file_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        fs::write(temp_dir.path().join("machineflow.yaml"), "{}").unwrap();
        fs::write(temp_dir.path().join(".machineflow.yaml"), "{}").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = temp_env::with_var_unset(CONFIG_ENV, find_config_file);

        std::env::set_current_dir(original_dir).unwrap();
        assert!(result.unwrap().ends_with("machineflow.yaml"));
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "{}").unwrap();

        let result = temp_env::with_var(CONFIG_ENV, Some(&config_path), find_config_file);
        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("machineflow.yaml");
        fs::write(&path, "subscriptionId: sub-1\nreconcileTimeoutSecs: 60\n").unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.subscription_id, "sub-1");
        assert_eq!(settings.reconcile_timeout_secs, 60);
        assert_eq!(settings.arm_endpoint, DEFAULT_ARM_ENDPOINT);
        assert_eq!(settings.max_provisioning_recoveries, 3);
        assert!(settings.zonal_locations.iter().any(|l| l == "eastus"));
        assert_eq!(settings.store_dir, PathBuf::from(".machineflow"));
    }

    #[test]
    fn test_invalid_file_names_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("machineflow.yaml");
        fs::write(&path, "reconcileTimeoutSecs: soon\n").unwrap();

        let err = Settings::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("machineflow.yaml"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_subscription() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("machineflow.yaml");
        fs::write(&path, "subscriptionId: from-file\n").unwrap();

        let settings = temp_env::with_var(SUBSCRIPTION_ENV, Some("from-env"), || {
            Settings::load(Some(&path))
        })
        .unwrap();
        assert_eq!(settings.subscription_id, "from-env");
    }

    #[test]
    #[serial]
    fn test_arm_token_lookup() {
        let settings = Settings::default();

        temp_env::with_vars(
            [
                ("MACHINEFLOW_ARM_TOKEN", None),
                ("AZURE_ACCESS_TOKEN", Some("az-token")),
            ],
            || assert_eq!(settings.arm_token().unwrap(), "az-token"),
        );
        temp_env::with_vars(
            [
                ("MACHINEFLOW_ARM_TOKEN", Some("mf-token")),
                ("AZURE_ACCESS_TOKEN", Some("az-token")),
            ],
            || assert_eq!(settings.arm_token().unwrap(), "mf-token"),
        );
        temp_env::with_vars_unset(["MACHINEFLOW_ARM_TOKEN", "AZURE_ACCESS_TOKEN"], || {
            assert!(matches!(
                settings.arm_token(),
                Err(ConfigError::MissingToken)
            ))
        });
    }
}
