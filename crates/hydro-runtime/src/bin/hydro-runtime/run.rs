//! Command implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hydro_runtime::automation::{
    AutomationEngine, AutomationServices, AutomationState, DirectoryProgramSource,
    EngineSettings, ExecutorRegistry, FileSessionStore, ProgramGraph, ProgramSource,
    StaticDevices,
};
use hydro_runtime::command::TransportManager;
use hydro_runtime::config::HydroConfig;
use hydro_runtime::io::TransportRegistry;

pub async fn run_program(config: PathBuf, program: String, verbose: bool) -> anyhow::Result<()> {
    let config = load_config(&config, verbose)?;
    let transport = TransportManager::from_config(&config, TransportRegistry::default_registry());
    let programs = Arc::new(DirectoryProgramSource::new(config.runtime.program_dir.clone()));
    let services = AutomationServices::new(transport.clone(), programs)
        .with_sessions(Arc::new(FileSessionStore::new(
            config.runtime.session_dir.clone(),
        )))
        .with_devices(Arc::new(StaticDevices::new(config.devices.clone())));
    let engine = AutomationEngine::new(
        services,
        ExecutorRegistry::standard(),
        EngineSettings::from(&config.runtime),
    );

    let session = engine
        .load_program(&program)
        .await
        .with_context(|| format!("load program '{program}'"))?;
    engine.start_program().await?;
    info!(program = %program, session = %session, "running");

    tokio::select! {
        () = engine.wait_idle() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("listen for ctrl-c")?;
            warn!("interrupted, stopping program");
            if let Err(err) = engine.stop_program().await {
                warn!("stop failed: {err}");
            }
        }
    }
    transport.disconnect_all().await;

    let snapshot = engine.get_snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    if snapshot.state == AutomationState::Error {
        bail!(
            "program '{program}' failed at block '{}': {}",
            snapshot.failed_block.as_deref().unwrap_or("?"),
            snapshot.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

pub async fn run_ping(config: PathBuf, controller: String, verbose: bool) -> anyhow::Result<()> {
    let config = load_config(&config, verbose)?;
    let transport = TransportManager::from_config(&config, TransportRegistry::default_registry());
    let result = transport.ping(&controller).await;
    transport.disconnect_all().await;
    let response = result.with_context(|| format!("ping '{controller}'"))?;
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

pub async fn run_validate(
    config: PathBuf,
    program: Option<String>,
    verbose: bool,
) -> anyhow::Result<()> {
    let config = load_config(&config, verbose)?;
    println!(
        "config ok: {} controller(s), {} device(s)",
        config.controllers.len(),
        config.devices.len()
    );
    let Some(program) = program else {
        return Ok(());
    };
    let registry = ExecutorRegistry::standard();
    let definition = DirectoryProgramSource::new(config.runtime.program_dir.clone())
        .load(&program)
        .await?;
    let graph = ProgramGraph::build(&definition, |block_type| registry.contains(block_type))?;
    println!(
        "program ok: '{}' with {} block(s), entry '{}'",
        graph.program_id,
        graph.blocks().count(),
        graph.entry()
    );
    Ok(())
}

fn load_config(path: &Path, verbose: bool) -> anyhow::Result<HydroConfig> {
    let config =
        HydroConfig::load(path).with_context(|| format!("load config {}", path.display()))?;
    init_logging(&config.runtime.log_level, verbose);
    Ok(config)
}

fn init_logging(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
