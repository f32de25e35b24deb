use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One independently runnable test, as reported by test discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub source_file: PathBuf,
    /// Dotted case id, e.g. `TestClass.test_method`.
    pub case_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub name: String,
    pub tag: String,
    #[serde(default = "default_true")]
    pub use_layers: bool,
    #[serde(default = "default_true")]
    pub use_environment: bool,
}

fn default_true() -> bool {
    true
}

impl ImageSpec {
    /// Parse a `name[:tag]` reference. A colon that belongs to a registry
    /// host (`localhost:5000/python`) is not taken as the tag separator.
    pub fn parse(reference: &str) -> anyhow::Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            anyhow::bail!("Image reference cannot be empty");
        }

        let (name, tag) = match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag),
            _ => (reference, "latest"),
        };
        if name.is_empty() || tag.is_empty() {
            anyhow::bail!("Invalid image reference: {}", reference);
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
            use_layers: true,
            use_environment: true,
        })
    }
}

/// Renders the `name:tag` reference the container engine expects
impl fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobDevice {
    Full,
    Fuse,
    Null,
    Random,
    Tty,
    Urandom,
    Zero,
}

impl JobDevice {
    pub fn path(&self) -> &'static str {
        match self {
            JobDevice::Full => "/dev/full",
            JobDevice::Fuse => "/dev/fuse",
            JobDevice::Null => "/dev/null",
            JobDevice::Random => "/dev/random",
            JobDevice::Tty => "/dev/tty",
            JobDevice::Urandom => "/dev/urandom",
            JobDevice::Zero => "/dev/zero",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobMountFsType {
    Proc,
    Tmp,
    Sys,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMount {
    pub fs_type: JobMountFsType,
    pub mount_point: PathBuf,
}

/// Reference to a layer previously registered with an execution client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerRef(pub u32);

/// Complete description of one isolated remote execution.
///
/// Layer order matters: later layers shadow earlier ones at conflicting paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub program: String,
    pub arguments: Vec<String>,
    pub image: ImageSpec,
    pub layers: Vec<LayerRef>,
    pub user: u32,
    pub group: u32,
    pub devices: Vec<JobDevice>,
    pub mounts: Vec<JobMount>,
    pub working_directory: PathBuf,
    pub enable_writable_file_system: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDuration {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl From<std::time::Duration> for JobDuration {
    fn from(d: std::time::Duration) -> Self {
        Self {
            seconds: d.as_secs(),
            nanoseconds: d.subsec_nanos(),
        }
    }
}

/// Resolved disposition of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobResult {
    Completed {
        exit_code: i64,
        duration: JobDuration,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// Infrastructure failure; says nothing about the test itself.
    Error { message: String },
}

impl JobResult {
    pub fn error(message: impl Into<String>) -> Self {
        JobResult::Error {
            message: message.into(),
        }
    }
}
