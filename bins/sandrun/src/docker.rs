/// Docker Execution Client
///
/// **Responsibility:**
/// Run job specs as containers on the local Docker daemon.
///
/// **Docker Execution Rules:**
/// 1. Pulls the job's image if not present
/// 2. Creates the container with the job's user, working directory, tmpfs
///    mounts and devices, network disabled
/// 3. Extracts each layer archive at `/` in order, so later layers shadow
///    earlier ones
/// 4. Captures stdout/stderr bytes and measures wall-clock duration
/// 5. Removes the container before the result is delivered
///
/// At most `slots` containers run at once; further submissions wait for a
/// free slot inside their own task and signal their handle once they hold
/// one. A job cancelled mid-run leaves removal to its `ContainerGuard`. Job
/// tasks and guard removals are tracked and drained by `DockerClient::finish`.

use crate::archive;
use crate::client::{ExecutionClient, JobHandle};
use sandrun_common::layer::Layer;
use sandrun_common::types::{JobDevice, JobDuration, JobMountFsType, JobResult, JobSpec, LayerRef};
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceMapping, HostConfig};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct LayerStore {
    by_layer: HashMap<Layer, LayerRef>,
    archives: Vec<Bytes>,
}

/// Label carried by every container a client creates
pub const CLIENT_LABEL: &str = "sandrun.client";

/// Background tasks that must complete before the process exits
#[derive(Clone, Default)]
struct TaskTracker(Arc<Mutex<Vec<JoinHandle<()>>>>);

impl TaskTracker {
    fn track(&self, handle: JoinHandle<()>) {
        let mut pending = self.0.lock().unwrap_or_else(|p| p.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    async fn drain(&self) {
        let pending = std::mem::take(&mut *self.0.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in pending {
            let _ = handle.await;
        }
    }
}

pub struct DockerClient {
    docker: Docker,
    project_dir: PathBuf,
    client_id: String,
    slots: Arc<Semaphore>,
    layers: Mutex<LayerStore>,
    jobs: TaskTracker,
    removals: TaskTracker,
}

impl DockerClient {
    pub fn new(project_dir: PathBuf, slots: u32) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        Ok(DockerClient {
            docker,
            project_dir,
            client_id: uuid::Uuid::new_v4().to_string(),
            slots: Arc::new(Semaphore::new(slots as usize)),
            layers: Mutex::new(LayerStore::default()),
            jobs: TaskTracker::default(),
            removals: TaskTracker::default(),
        })
    }

    /// Wait for job tasks, including aborted ones, and the container
    /// removals they leave behind. Call before exiting.
    pub async fn finish(&self) {
        self.jobs.drain().await;
        self.removals.drain().await;
    }

    fn lookup_layer(&self, layer: &Layer) -> Option<LayerRef> {
        let store = self.layers.lock().unwrap_or_else(|p| p.into_inner());
        store.by_layer.get(layer).copied()
    }

    fn archives_for(&self, refs: &[LayerRef]) -> Result<Vec<Bytes>> {
        let store = self.layers.lock().unwrap_or_else(|p| p.into_inner());
        refs.iter()
            .map(|r| {
                store
                    .archives
                    .get(r.0 as usize)
                    .cloned()
                    .ok_or_else(|| anyhow!("Unknown layer reference {}", r.0))
            })
            .collect()
    }
}

impl ExecutionClient for DockerClient {
    async fn add_layer(&self, layer: Layer) -> Result<LayerRef> {
        if let Some(existing) = self.lookup_layer(&layer) {
            return Ok(existing);
        }

        let project_dir = self.project_dir.clone();
        let to_build = layer.clone();
        let archive = tokio::task::spawn_blocking(move || {
            archive::build_archive(&to_build, &project_dir)
        })
        .await
        .context("Layer archive task failed")??;

        let mut store = self.layers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = store.by_layer.get(&layer) {
            return Ok(*existing);
        }
        let layer_ref = LayerRef(store.archives.len() as u32);
        debug!(layer_ref = layer_ref.0, bytes = archive.len(), "Registered layer");
        store.archives.push(archive);
        store.by_layer.insert(layer, layer_ref);
        Ok(layer_ref)
    }

    fn submit_job(&self, spec: JobSpec) -> Result<JobHandle> {
        let archives = self.archives_for(&spec.layers)?;
        let runner = ContainerRunner {
            docker: self.docker.clone(),
            client_id: self.client_id.clone(),
            removals: self.removals.clone(),
        };
        let slots = Arc::clone(&self.slots);
        let (sender, receiver) = oneshot::channel();
        let (started_tx, started_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let result = match slots.acquire_owned().await {
                Ok(_permit) => {
                    let _ = started_tx.send(());
                    runner
                        .run(&spec, &archives)
                        .await
                        .unwrap_or_else(|e| JobResult::error(format!("{:#}", e)))
                }
                Err(_) => JobResult::error("execution slots closed"),
            };
            let _ = sender.send(result);
        });

        let execution = task.abort_handle();
        self.jobs.track(task);
        Ok(JobHandle::new(receiver, Some(execution)).with_start_signal(started_rx))
    }
}

/// Container cleanup guard - removes the container if the job task is
/// aborted before `remove` runs
struct ContainerGuard {
    docker: Docker,
    container_id: Option<String>,
    removals: TaskTracker,
}

impl ContainerGuard {
    async fn remove(mut self) {
        if let Some(container_id) = self.container_id.take() {
            remove_container(&self.docker, &container_id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        let docker = self.docker.clone();
        let handle = tokio::spawn(async move {
            remove_container(&docker, &container_id).await;
        });
        self.removals.track(handle);
    }
}

async fn remove_container(docker: &Docker, container_id: &str) {
    let remove_options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };

    match docker.remove_container(container_id, Some(remove_options)).await {
        Ok(()) => debug!(container_id = %container_id, "Container removed"),
        Err(e) => warn!(container_id = %container_id, error = %e, "Failed to clean up container"),
    }
}

/// Ensure the image is available locally, pulling it on a cache miss
async fn ensure_image(docker: &Docker, image: &str) -> Result<()> {
    if docker.inspect_image(image).await.is_ok() {
        debug!("Image cache hit: {}", image);
        return Ok(());
    }

    warn!("Image cache miss: {} (pulling now)", image);

    let options = Some(CreateImageOptions {
        from_image: image,
        ..Default::default()
    });

    let mut stream = docker.create_image(options, None, None);
    while let Some(result) = stream.next().await {
        result.context("Failed to pull Docker image")?;
    }

    info!("Image pulled successfully: {}", image);
    Ok(())
}

/// Translate a job spec into a container configuration
fn container_config(spec: &JobSpec, client_id: &str) -> Config<String> {
    let tmpfs: HashMap<String, String> = spec
        .mounts
        .iter()
        .filter(|m| m.fs_type == JobMountFsType::Tmp)
        .map(|m| (m.mount_point.display().to_string(), String::new()))
        .collect();

    // Docker already provides the standard character devices
    let devices: Vec<DeviceMapping> = spec
        .devices
        .iter()
        .filter(|d| **d == JobDevice::Fuse)
        .map(|d| DeviceMapping {
            path_on_host: Some(d.path().to_string()),
            path_in_container: Some(d.path().to_string()),
            cgroup_permissions: Some("rwm".to_string()),
        })
        .collect();

    Config {
        image: Some(spec.image.to_string()),
        entrypoint: Some(vec![spec.program.clone()]),
        cmd: Some(spec.arguments.clone()),
        user: Some(format!("{}:{}", spec.user, spec.group)),
        working_dir: Some(spec.working_directory.display().to_string()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(true),
        labels: Some(HashMap::from([(CLIENT_LABEL.to_string(), client_id.to_string())])),
        host_config: Some(HostConfig {
            tmpfs: Some(tmpfs),
            devices: Some(devices),
            readonly_rootfs: Some(!spec.enable_writable_file_system),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Per-job view of the client, moved into the job's task
struct ContainerRunner {
    docker: Docker,
    client_id: String,
    removals: TaskTracker,
}

impl ContainerRunner {
    async fn run(&self, spec: &JobSpec, archives: &[Bytes]) -> Result<JobResult> {
        let image = spec.image.to_string();
        ensure_image(&self.docker, &image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", image))?;

        let container_name = format!("sandrun-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), container_config(spec, &self.client_id))
            .await
            .context("Failed to create Docker container")?;

        let guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: Some(container.id.clone()),
            removals: self.removals.clone(),
        };

        let outcome = self.execute(&container.id, archives).await;
        guard.remove().await;
        outcome
    }

    async fn execute(&self, container_id: &str, archives: &[Bytes]) -> Result<JobResult> {
        let docker = &self.docker;
        for archive in archives {
            let options = UploadToContainerOptions {
                path: "/",
                ..Default::default()
            };
            docker
                .upload_to_container(container_id, Some(options), archive.clone())
                .await
                .context("Failed to extract layer into container")?;
        }

        let start_time = Instant::now();
        docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        });

        let mut logs_stream = docker.logs(container_id, logs_options);
        while let Some(output) = logs_stream.next().await {
            match output.context("Failed to read container logs")? {
                LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                _ => {}
            }
        }

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = docker.wait_container(container_id, Some(wait_options));
        let exit_code = match wait_stream.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports a non-zero exit status as an error
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e).context("Failed to wait for container"),
            None => return Err(anyhow!("No wait response from container")),
        };
        let elapsed = start_time.elapsed();

        debug!(
            container_id = %container_id,
            exit_code = exit_code,
            duration_ms = elapsed.as_millis() as u64,
            "Container exited"
        );

        Ok(JobResult::Completed {
            exit_code,
            duration: JobDuration::from(elapsed),
            stdout,
            stderr,
        })
    }
}
