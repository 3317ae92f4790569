use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use offload::cli::{
    build_inputs, env_file_arg, format_profiles, format_run_report, profiles_add, profiles_delete,
    profiles_list, profiles_use, run_compute, Cli, Commands, ProfilesAction, RunArgs,
    WorkerArgs,
};
use offload::compute::ComputeRegistry;
use offload::config::{
    default_profiles_path, expand_path, load_profiles_from, save_profiles_to, PoolEndpoint,
};
use offload::server::{create_router, WorkerState};

#[tokio::main]
async fn main() {
    // The env file must be in place before clap reads `env` defaults
    let args: Vec<String> = std::env::args().collect();
    let env_loaded = env_file_arg(&args).map(|path| match dotenvy::from_path(&path) {
        Ok(()) => Ok(path),
        Err(e) => Err(format!("Failed to load env file {}: {}", path.display(), e)),
    });
    let cli = Cli::parse_from(args);

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match env_loaded {
        Some(Ok(path)) => debug!("Loaded env file {}", path.display()),
        Some(Err(e)) => {
            error!("{}", e);
            process::exit(1);
        }
        None => {}
    }

    let profiles_path = cli
        .profiles
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(default_profiles_path);

    let result = match cli.command {
        Commands::Worker(args) => run_worker(args).await,
        Commands::Run(args) => run(args, &profiles_path).await,
        Commands::Profiles(args) => {
            profiles(args.action.unwrap_or(ProfilesAction::List), &profiles_path)
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let registry = Arc::new(ComputeRegistry::with_builtins());
    let mut state = WorkerState::new(registry.clone(), args.workers);
    if let Some(key) = args.api_key {
        state = state.with_api_key(key);
    }
    let app = create_router(state);

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

    info!("Worker listening on {} ({} workers)", addr, args.workers);
    info!("Compute functions: {}", registry.names().join(", "));
    info!("Endpoints:");
    info!("  GET  /health     - Health check");
    info!("  GET  /v1/workers - Worker ids");
    info!("  POST /v1/compute - Run a compute request");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down worker");
        })
        .await?;
    Ok(())
}

async fn run(args: RunArgs, profiles_path: &std::path::Path) -> anyhow::Result<()> {
    let profiles = load_profiles_from(profiles_path)?;
    let inputs = build_inputs(&args.inputs)?;

    let report = run_compute(
        profiles,
        Arc::new(ComputeRegistry::with_builtins()),
        &args.compute,
        args.profile.as_deref(),
        inputs,
        args.log.as_deref(),
    )
    .await?;

    println!("{}", format_run_report(&report));
    if let Some(ref e) = report.error {
        anyhow::bail!("Computation '{}' failed: {}", args.compute, e);
    }
    Ok(())
}

fn profiles(action: ProfilesAction, path: &std::path::Path) -> anyhow::Result<()> {
    let mut config = load_profiles_from(path)?;

    match action {
        ProfilesAction::List => {
            print!("{}", format_profiles(&profiles_list(&config)));
            return Ok(());
        }
        ProfilesAction::Use { name } => {
            profiles_use(&mut config, &name)?;
            println!("Switched to profile '{}'", name);
        }
        ProfilesAction::AddLocal { name, workers } => {
            profiles_add(&mut config, &name, PoolEndpoint::Local { workers })?;
            println!("Added profile '{}'", name);
        }
        ProfilesAction::AddHttp {
            name,
            urls,
            api_key,
        } => {
            profiles_add(&mut config, &name, PoolEndpoint::Http { urls, api_key })?;
            println!("Added profile '{}'", name);
        }
        ProfilesAction::Delete { name } => {
            if !profiles_delete(&mut config, &name) {
                anyhow::bail!("Profile '{}' not found", name);
            }
            println!("Deleted profile '{}'", name);
        }
    }

    save_profiles_to(&config, path)?;
    Ok(())
}
