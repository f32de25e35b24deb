// Layer construction for a test run
use crate::client::ExecutionClient;
use anyhow::{Context, Result};
use sandrun_common::layer::{Layer, PrefixOptions};
use sandrun_common::types::LayerRef;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Where the dependency tree lives inside the container
pub const SYSTEM_PREFIX: &str = "/usr/local/";

/// The layer set every job in a run shares, in overlay order
pub fn standard_layers(venv_dir: &str, python_version: &str, work_dir: &Path) -> Vec<Layer> {
    let work = work_dir.display().to_string();
    let venv = venv_dir.trim_end_matches('/');

    let dependencies = Layer::glob(
        format!("{venv}/lib/python{python_version}/site-packages/**"),
        PrefixOptions {
            canonicalize: false,
            follow_symlinks: false,
            strip_prefix: Some(format!("{venv}/")),
            prepend_prefix: Some(SYSTEM_PREFIX.to_string()),
        },
    );

    let stubs = Layer::stubs([
        "/dev/null".to_string(),
        "/tmp/".to_string(),
        format!("{}/.pytest_cache/", work.trim_end_matches('/')),
    ]);

    let source = PrefixOptions {
        canonicalize: false,
        follow_symlinks: false,
        strip_prefix: None,
        prepend_prefix: Some(work),
    };

    vec![
        dependencies,
        stubs,
        Layer::glob("**.py", source.clone()),
        Layer::glob("**.pyc", source),
    ]
}

/// Registers layers with an execution client, once per distinct layer
pub struct LayerBuilder<'a, C: ExecutionClient> {
    client: &'a C,
    built: HashMap<Layer, LayerRef>,
}

impl<'a, C: ExecutionClient> LayerBuilder<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self {
            client,
            built: HashMap::new(),
        }
    }

    pub async fn build_layer(&mut self, layer: Layer) -> Result<LayerRef> {
        if let Some(existing) = self.built.get(&layer) {
            return Ok(*existing);
        }

        let layer_ref = self
            .client
            .add_layer(layer.clone())
            .await
            .with_context(|| format!("Failed to register layer {:?}", layer))?;
        self.built.insert(layer, layer_ref);
        Ok(layer_ref)
    }

    /// Build every layer in order. Any failure aborts the whole set.
    pub async fn build_all(&mut self, layers: Vec<Layer>) -> Result<Vec<LayerRef>> {
        let mut refs = Vec::with_capacity(layers.len());
        for layer in layers {
            refs.push(self.build_layer(layer).await?);
        }
        info!(layers = refs.len(), "Layers registered");
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::JobHandle;
    use anyhow::bail;
    use sandrun_common::types::JobSpec;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingClient {
        added: AtomicU32,
        fail: bool,
    }

    impl ExecutionClient for CountingClient {
        async fn add_layer(&self, _layer: Layer) -> Result<LayerRef> {
            if self.fail {
                bail!("upload refused");
            }
            Ok(LayerRef(self.added.fetch_add(1, Ordering::SeqCst)))
        }

        fn submit_job(&self, _spec: JobSpec) -> Result<JobHandle> {
            bail!("not used")
        }
    }

    #[test]
    fn test_standard_layers() {
        let layers = standard_layers("sandrun_venv", "3.12", Path::new("/home/dev/proj"));
        assert_eq!(layers.len(), 4);

        match &layers[0] {
            Layer::Glob { pattern, prefix_options } => {
                assert_eq!(pattern, "sandrun_venv/lib/python3.12/site-packages/**");
                assert_eq!(prefix_options.strip_prefix.as_deref(), Some("sandrun_venv/"));
                assert_eq!(prefix_options.prepend_prefix.as_deref(), Some("/usr/local/"));
                assert_eq!(
                    prefix_options.remap("sandrun_venv/lib/python3.12/site-packages/six.py"),
                    PathBuf::from("/usr/local/lib/python3.12/site-packages/six.py")
                );
            }
            other => panic!("expected glob layer, got {:?}", other),
        }

        assert_eq!(
            layers[1],
            Layer::stubs(["/dev/null", "/tmp/", "/home/dev/proj/.pytest_cache/"])
        );

        match &layers[2] {
            Layer::Glob { pattern, prefix_options } => {
                assert_eq!(pattern, "**.py");
                assert_eq!(prefix_options.strip_prefix, None);
                assert_eq!(
                    prefix_options.remap("tests/test_io.py"),
                    PathBuf::from("/home/dev/proj/tests/test_io.py")
                );
            }
            other => panic!("expected glob layer, got {:?}", other),
        }
        assert!(matches!(&layers[3], Layer::Glob { pattern, .. } if pattern == "**.pyc"));
    }

    #[tokio::test]
    async fn test_build_layer_is_idempotent() {
        let client = CountingClient::default();
        let mut builder = LayerBuilder::new(&client);

        let a = builder.build_layer(Layer::stubs(["/tmp/"])).await.unwrap();
        let b = builder.build_layer(Layer::stubs(["/tmp/"])).await.unwrap();
        let c = builder.build_layer(Layer::stubs(["/dev/null"])).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(client.added.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_registration_failure_is_fatal() {
        let client = CountingClient {
            fail: true,
            ..Default::default()
        };
        let mut builder = LayerBuilder::new(&client);
        let layers = standard_layers("venv", "3.12", Path::new("/w"));

        let err = builder.build_all(layers).await.unwrap_err();
        assert!(format!("{:#}", err).contains("upload refused"));
    }
}
