/// Command-line interface and configuration resolution
///
/// **Precedence (highest first):**
/// 1. Command-line flags
/// 2. `SANDRUN_*` environment variables
/// 3. The JSON config file (`--config`, or `sandrun.json` when present)
/// 4. Built-in defaults

use anyhow::{Context, Result};
use clap::Parser;
use sandrun_common::config::RunConfig;
use sandrun_common::types::ImageSpec;
use std::path::PathBuf;

#[derive(Debug, Default, Parser)]
#[command(name = "sandrun")]
#[command(about = "Run every pytest case of a project as its own sandboxed container job", long_about = None)]
pub struct Args {
    /// Path to a JSON config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Concurrent execution slots
    #[arg(short, long)]
    pub slots: Option<u32>,

    /// Container image (e.g., python:3.12-alpine3.19)
    #[arg(short, long)]
    pub image: Option<String>,

    /// Per-job timeout in seconds (0 disables it)
    #[arg(long)]
    pub job_timeout_secs: Option<u64>,

    /// Staging directory for the dependency environment
    #[arg(long)]
    pub venv_dir: Option<String>,

    /// Only list the collected tests, do not run them
    #[arg(long)]
    pub list: bool,
}

impl Args {
    pub fn resolve(&self) -> Result<RunConfig> {
        self.resolve_with_env(std::env::vars())
    }

    pub fn resolve_with_env<I>(&self, vars: I) -> Result<RunConfig>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::load_default()?,
        };
        config.apply_env_from(vars)?;

        if let Some(slots) = self.slots {
            config.slots = slots;
        }
        if let Some(image) = &self.image {
            config.image = ImageSpec::parse(image)
                .with_context(|| format!("Invalid --image: {}", image))?;
        }
        if let Some(secs) = self.job_timeout_secs {
            config.job_timeout_secs = secs;
        }
        if let Some(venv_dir) = &self.venv_dir {
            config.venv_dir = venv_dir.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from([
            "sandrun",
            "--slots",
            "4",
            "--image",
            "python:3.11",
            "--job-timeout-secs",
            "30",
            "--list",
        ]);
        assert_eq!(args.slots, Some(4));
        assert_eq!(args.image.as_deref(), Some("python:3.11"));
        assert_eq!(args.job_timeout_secs, Some(30));
        assert!(args.list);
    }

    #[test]
    fn test_flags_override_env_and_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"slots": 2, "venv_dir": "from_file"}}"#).unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            slots: Some(16),
            ..Default::default()
        };
        let config = args
            .resolve_with_env(env(&[("SANDRUN_SLOTS", "8"), ("SANDRUN_VENV_DIR", "from_env")]))
            .unwrap();

        assert_eq!(config.slots, 16);
        assert_eq!(config.venv_dir, "from_env");
    }

    #[test]
    fn test_file_values_survive_without_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"job_timeout_secs": 45}}"#).unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let config = args.resolve_with_env(Vec::new()).unwrap();
        assert_eq!(config.job_timeout_secs, 45);
        assert_eq!(config.slots, 24);
    }

    #[test]
    fn test_invalid_image_flag() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/sandrun.json")),
            ..Default::default()
        };
        assert!(args.resolve_with_env(Vec::new()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{}}").unwrap();
        let args = Args {
            config: Some(file.path().to_path_buf()),
            image: Some(String::new()),
            ..Default::default()
        };
        let err = args.resolve_with_env(Vec::new()).unwrap_err();
        assert!(err.to_string().contains("--image"));
    }

    #[test]
    fn test_zero_slots_flag_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{}}").unwrap();
        let args = Args {
            config: Some(file.path().to_path_buf()),
            slots: Some(0),
            ..Default::default()
        };
        assert!(args.resolve_with_env(Vec::new()).is_err());
    }
}
