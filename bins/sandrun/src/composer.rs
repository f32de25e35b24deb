/// Job Composer - One Isolated Job per Test Case
///
/// **Core Responsibility:**
/// Translate a discovered test case into a self-contained job spec that runs
/// exactly that test, single-worker, on a private writable filesystem with
/// ephemeral temp and cache directories.
///
/// Pure: builds values, performs no I/O.

use anyhow::{Result, bail};
use sandrun_common::types::{
    ImageSpec, JobDevice, JobMount, JobMountFsType, JobSpec, LayerRef, TestCase,
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub const SHELL: &str = "/bin/sh";
pub const PYTHON: &str = "/usr/local/bin/python";
pub const PYTEST_CACHE_DIR: &str = ".pytest_cache";

/// A composed job and the label it is reported under
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedJob {
    pub label: String,
    pub spec: JobSpec,
}

#[derive(Debug, Clone)]
pub struct JobComposer {
    work_dir: PathBuf,
    image: ImageSpec,
    layers: Arc<[LayerRef]>,
}

/// Rewrite a dotted case id into pytest's node id syntax
pub fn node_id(case_id: &str) -> String {
    case_id.replace('.', "::")
}

/// Label for a test case, also usable when composition fails
pub fn label_for(test_case: &TestCase) -> String {
    format!("{}::{}", test_case.source_file.display(), node_id(&test_case.case_id))
}

impl JobComposer {
    pub fn new(work_dir: PathBuf, image: ImageSpec, layers: Vec<LayerRef>) -> Self {
        Self {
            work_dir,
            image,
            layers: layers.into(),
        }
    }

    /// Express `source_file` relative to the working directory
    pub fn relative_source(&self, source_file: &Path) -> Result<PathBuf> {
        let relative = if source_file.is_absolute() {
            match source_file.strip_prefix(&self.work_dir) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => bail!(
                    "{} is outside the working directory {}",
                    source_file.display(),
                    self.work_dir.display()
                ),
            }
        } else {
            source_file.components()
                .filter(|c| !matches!(c, Component::CurDir))
                .collect()
        };

        if relative.as_os_str().is_empty() {
            bail!("Empty test source path");
        }
        if relative.components().any(|c| matches!(c, Component::ParentDir)) {
            bail!("{} is outside the working directory", source_file.display());
        }
        Ok(relative)
    }

    pub fn compose(&self, test_case: &TestCase) -> Result<PreparedJob> {
        let file = self.relative_source(&test_case.source_file)?;
        if test_case.case_id.trim().is_empty() {
            bail!("Test in {} has an empty case id", file.display());
        }

        let selector = format!("{}::{}", file.display(), node_id(&test_case.case_id));
        let script = format!("{} -m pytest -n 1 {}", PYTHON, selector);

        let spec = JobSpec {
            program: SHELL.to_string(),
            arguments: vec!["-c".to_string(), script],
            image: self.image.clone(),
            layers: self.layers.to_vec(),
            user: 0,
            group: 0,
            devices: vec![JobDevice::Null],
            mounts: vec![
                JobMount {
                    fs_type: JobMountFsType::Tmp,
                    mount_point: PathBuf::from("/tmp"),
                },
                JobMount {
                    fs_type: JobMountFsType::Tmp,
                    mount_point: self.work_dir.join(PYTEST_CACHE_DIR),
                },
            ],
            working_directory: self.work_dir.clone(),
            enable_writable_file_system: true,
        };

        Ok(PreparedJob {
            label: selector,
            spec,
        })
    }
}
