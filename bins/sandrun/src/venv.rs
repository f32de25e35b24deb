// Dependency environment setup: a virtual environment with the test
// requirements installed, later shipped to jobs as a layer.
use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

pub struct VenvInstaller {
    host_python: String,
    venv_dir: PathBuf,
    requirements: PathBuf,
}

impl VenvInstaller {
    pub fn new(host_python: impl Into<String>, venv_dir: PathBuf, requirements: PathBuf) -> Self {
        Self {
            host_python: host_python.into(),
            venv_dir,
            requirements,
        }
    }

    pub fn venv_dir(&self) -> &Path {
        &self.venv_dir
    }

    pub async fn install(&self) -> Result<()> {
        if !self.requirements.exists() {
            bail!("Requirements file not found: {}", self.requirements.display());
        }

        tokio::fs::create_dir_all(&self.venv_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.venv_dir.display()))?;

        info!(venv = %self.venv_dir.display(), "Creating virtual environment");
        let mut venv = Command::new(&self.host_python);
        venv.arg("-m").arg("venv").arg(&self.venv_dir);
        run(venv, "python -m venv").await?;

        info!(requirements = %self.requirements.display(), "Installing requirements");
        let mut pip = Command::new(self.venv_dir.join("bin").join("pip"));
        pip.arg("install").arg("-r").arg(&self.requirements);
        run(pip, "pip install").await?;

        Ok(())
    }
}

async fn run(mut command: Command, what: &str) -> Result<()> {
    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to launch {}", what))?;

    if !output.status.success() {
        bail!(
            "{} failed ({}): {}",
            what,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_requirements_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let installer = VenvInstaller::new(
            "python3",
            dir.path().join("venv"),
            dir.path().join("test-requirements.txt"),
        );

        let err = installer.install().await.unwrap_err();
        assert!(err.to_string().contains("Requirements file not found"));
        assert!(!dir.path().join("venv").exists());
    }

    #[tokio::test]
    async fn test_failing_interpreter_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("reqs.txt"), "pytest\n").unwrap();
        let installer = VenvInstaller::new(
            "/nonexistent/python",
            dir.path().join("venv"),
            dir.path().join("reqs.txt"),
        );

        let err = installer.install().await.unwrap_err();
        assert!(err.to_string().contains("Failed to launch python -m venv"));
    }
}
