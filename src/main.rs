//! VCS Sandbox CLI
//!
//! Reconciles one sandbox against a remote project and writes its change log.

use std::path::PathBuf;
use std::sync::Arc;

use vcs_sandbox::{
    ChangeLog, CliTransport, Error, ResyncOptions, SandboxDescriptor, SandboxReconciler,
    SessionPool, Settings, Validate,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Parse args (basic positional arguments only)
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 4 {
        eprintln!("Usage: {} <settings.toml> <local-path> <project> [variant]", args[0]);
        eprintln!("\nCreates or reuses the sandbox at <local-path>, resyncs it and");
        eprintln!("writes <local-path>.changes.log.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  VCS_SANDBOX_CLI=<path>  Override the client program");
        std::process::exit(1);
    }

    let settings_path = PathBuf::from(&args[1]);
    let mut target = SandboxDescriptor::trunk(&args[2], &args[3]);
    if let Some(variant) = args.get(4) {
        target = target.with_variant(variant);
    }

    if let Err(e) = run(settings_path, target).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(settings_path: PathBuf, target: SandboxDescriptor) -> Result<(), Error> {
    let settings = Settings::load(&settings_path)?;
    for warning in settings.validate().into_result()? {
        tracing::warn!(warning = %warning, "settings warning");
    }

    let identity = settings
        .server
        .as_ref()
        .ok_or_else(|| Error::Config("settings have no [server] section".to_string()))?
        .identity()?;

    let transport = Arc::new(CliTransport::new(&settings.cli));
    let pool = Arc::new(SessionPool::new(
        transport,
        settings.session.clone(),
        settings.pool.clone(),
    ));
    let evictor = pool.spawn_evictor();

    let reconciler = SandboxReconciler::new(settings.sandbox.clone());
    let log = ChangeLog::new(format!("{}.changes.log", target.local_path.display()));
    let options = ResyncOptions {
        scope: settings.sandbox.scope.clone(),
        ..Default::default()
    };

    tracing::info!(identity = %identity, project = %target.project, "reconciling sandbox");

    let session = pool.acquire(&identity).await?;
    let outcome = reconciler
        .reconcile(&session, &target, &options, Some(&log))
        .await;

    match &outcome {
        Ok(_) => pool.release(&identity, session).await,
        Err(e) if e.is_command() => pool.invalidate(&identity, session).await,
        Err(_) => pool.release(&identity, session).await,
    }
    pool.shutdown().await;
    evictor.abort();

    let (state, report) = outcome?;

    println!("\n{}", "=".repeat(60));
    println!("Sandbox {}: {}", state, target.local_path.display());
    println!("{}", "=".repeat(60));
    println!();
    println!("Changes: {}", report.len());
    for record in &report {
        println!("  {} {}", record.message, record.file);
    }
    println!();
    println!("Change log: {}", log.path().display());

    Ok(())
}
