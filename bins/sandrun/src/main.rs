mod archive;
mod client;
mod collector;
mod composer;
mod config;
mod discovery;
mod dispatch;
mod docker;
mod layers;
mod reporter;
mod session;
mod venv;


use clap::Parser;
use collector::{OutputSink, ResultCollector};
use composer::{label_for, JobComposer};
use config::Args;
use discovery::{PytestInventory, TestInventory};
use dispatch::DispatchOrchestrator;
use docker::DockerClient;
use layers::{standard_layers, LayerBuilder};
use reporter::Reporter;
use session::Session;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use venv::VenvInstaller;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs share the report's lock and go to stderr; stdout carries the report
    let sink = OutputSink::stdio();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_writer(sink.clone())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();
    let config = args.resolve().map_err(|e| {
        error!("Failed to resolve configuration: {:#}", e);
        e
    })?;

    let work_dir = std::env::current_dir()?.canonicalize()?;
    info!(
        work_dir = %work_dir.display(),
        image = %config.image,
        slots = config.slots,
        "sandrun starting"
    );

    let collector = ResultCollector::new(sink.clone(), Arc::new(Reporter::new()));

    sink.line("creating venv");
    let installer = VenvInstaller::new(
        config.host_python.clone(),
        work_dir.join(&config.venv_dir),
        work_dir.join(&config.requirements),
    );
    installer.install().await?;

    sink.line("collecting tests");
    let inventory = PytestInventory::from_venv(installer.venv_dir(), work_dir.clone());
    let tests = inventory.enumerate().await?;

    if args.list {
        for test_case in &tests {
            sink.line(&label_for(test_case));
        }
        return Ok(ExitCode::SUCCESS);
    }

    sink.line("creating layers");
    let client = Arc::new(DockerClient::new(work_dir.clone(), config.slots)?);
    let layer_refs = LayerBuilder::new(client.as_ref())
        .build_all(standard_layers(&config.venv_dir, &config.python_version, &work_dir))
        .await?;

    let composer = JobComposer::new(work_dir.clone(), config.image.clone(), layer_refs);
    let session = Session::new(Arc::clone(&client), composer, config.job_timeout());
    let orchestrator = DispatchOrchestrator::new(session, collector);

    sink.line("enqueuing");
    let waiters = orchestrator.dispatch(&tests);

    sink.line(&format!("running {} jobs", waiters.len()));
    let summary = waiters.join().await;
    client.finish().await;

    if summary.total() > 0 {
        sink.line(&summary.to_string());
    }
    info!(
        passed = summary.passed,
        failed = summary.failed,
        errors = summary.errored,
        "Run complete"
    );

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
