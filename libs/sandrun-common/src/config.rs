// Run configuration for sandrun
use crate::types::ImageSpec;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "sandrun.json";
pub const ENV_PREFIX: &str = "SANDRUN_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Concurrent execution slots requested from the execution client
    pub slots: u32,
    pub image: ImageSpec,
    pub python_version: String,
    /// Interpreter used to create the dependency environment
    pub host_python: String,
    /// Staging directory for the dependency environment
    pub venv_dir: String,
    pub requirements: String,
    /// Per-job timeout. Zero disables it.
    pub job_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            slots: 24,
            image: ImageSpec {
                name: "python".to_string(),
                tag: "3.12-alpine3.19".to_string(),
                use_layers: true,
                use_environment: true,
            },
            python_version: "3.12".to_string(),
            host_python: "python3".to_string(),
            venv_dir: "sandrun_venv".to_string(),
            requirements: "test-requirements.txt".to_string(),
            job_timeout_secs: 600,
        }
    }
}

impl RunConfig {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: RunConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `sandrun.json` when present, built-in defaults otherwise
    pub fn load_default() -> Result<Self> {
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            Self::load(default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `SANDRUN_*` overrides from environment variables
    pub fn apply_env_from<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(key) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match key {
                "SLOTS" => {
                    self.slots = value
                        .parse()
                        .with_context(|| format!("Invalid {ENV_PREFIX}SLOTS: {value}"))?;
                }
                "IMAGE" => {
                    self.image = ImageSpec::parse(value)
                        .with_context(|| format!("Invalid {ENV_PREFIX}IMAGE: {value}"))?;
                }
                "JOB_TIMEOUT_SECS" => {
                    self.job_timeout_secs = value.parse().with_context(|| {
                        format!("Invalid {ENV_PREFIX}JOB_TIMEOUT_SECS: {value}")
                    })?;
                }
                "VENV_DIR" => self.venv_dir = value.to_string(),
                "HOST_PYTHON" => self.host_python = value.to_string(),
                _ => {}
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.slots == 0 {
            bail!("slots must be at least 1");
        }
        if self.venv_dir.is_empty() {
            bail!("venv_dir cannot be empty");
        }
        if self.python_version.is_empty() {
            bail!("python_version cannot be empty");
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Option<std::time::Duration> {
        match self.job_timeout_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }
}
