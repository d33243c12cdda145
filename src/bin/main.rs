use std::{error::Error, process::ExitCode};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use redeploy::{
    artifact::{ArtifactManager, list_backups},
    cli::{Cli, Commands, TargetArgs, parse_args},
    command::ShellRunner,
    config::{DeployConfig, load_config},
    constants::NOTIFICATION_TIME_FORMAT,
    health::{HealthProber, HealthStatus, HttpCheck, ProbePolicy},
    notify::EventNotifier,
    orchestrator::Orchestrator,
    process::{ProcessControl, ProcessController},
    wait::{CancelToken, ThreadWait},
};

fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Deploy {
            target,
            on_backup_failure,
            abort_on_uncertain_stop,
            event_file,
            no_lock,
        } => {
            let mut overrides = target.overrides();
            overrides.on_backup_failure = on_backup_failure;
            overrides.abort_on_uncertain_stop = abort_on_uncertain_stop;
            overrides.event_file = event_file;
            let file = load_config(target.config.as_deref())?;
            let config = DeployConfig::resolve(file, overrides)?;
            deploy(config, no_lock)
        }
        Commands::Status { target } => status(&resolve_config(&target)?),
        Commands::Backups { target } => backups(&resolve_config(&target)?),
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn resolve_config(target: &TargetArgs) -> Result<DeployConfig, Box<dyn Error>> {
    let file = load_config(target.config.as_deref())?;
    Ok(DeployConfig::resolve(file, target.overrides())?)
}

fn process_controller(config: &DeployConfig) -> ProcessController<ShellRunner> {
    let request = &config.request;
    let runner = ShellRunner::new()
        .with_working_dir(&request.deploy_dir)
        .with_env("REDEPLOY_APP_NAME", &request.app_name);
    ProcessController::new(runner).with_command_timeout(config.timings.command_timeout)
}

fn deploy(config: DeployConfig, no_lock: bool) -> Result<ExitCode, Box<dyn Error>> {
    let cancel = CancelToken::new();
    if let Err(err) = cancel.install_handler() {
        warn!("Failed to install interrupt handler: {err}");
    }

    let process = process_controller(&config);
    let artifacts = ArtifactManager::with_entrypoints(&config.entrypoints)?;

    let mut notifier = EventNotifier::new().with_targets(config.notify.targets());
    if let Some(path) = &config.notify.event_file {
        notifier = notifier.with_event_file(path);
    }

    let mut orchestrator = Orchestrator::new(
        config,
        process,
        artifacts,
        HealthProber::new(HttpCheck),
        notifier,
    )
    .with_cancel_token(cancel);
    if no_lock {
        orchestrator = orchestrator.without_lock();
    }

    let outcome = orchestrator.run();
    if !outcome.is_success() {
        error!("Deployment of {} failed", orchestrator.config().request.app_name);
    }
    Ok(outcome.exit_code())
}

fn status(config: &DeployConfig) -> Result<ExitCode, Box<dyn Error>> {
    let app_name = &config.request.app_name;
    let state = process_controller(config).state(&config.process_pattern);
    let pids = ProcessController::<ShellRunner>::matching_pids(&config.process_pattern);

    println!("Application: {app_name}");
    println!("Process:     {state:?} {pids:?}");

    let policy = ProbePolicy {
        max_attempts: 1,
        ..config.timings.probe_policy()
    };
    let health = HealthProber::new(HttpCheck).probe(
        &config.health_check_url,
        policy,
        &ThreadWait::uninterruptible(),
    )?;
    println!("Health:      {health:?} ({})", config.health_check_url);

    if health == HealthStatus::Healthy {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn backups(config: &DeployConfig) -> Result<ExitCode, Box<dyn Error>> {
    let request = &config.request;
    let backups = list_backups(&request.backup_dir, &request.app_name)?;

    if backups.is_empty() {
        info!(
            "No backups of {} in {}",
            request.app_name,
            request.backup_dir.display()
        );
        return Ok(ExitCode::SUCCESS);
    }

    for backup in backups {
        println!(
            "{}  {}",
            backup.created_at.format(NOTIFICATION_TIME_FORMAT),
            backup.path.display()
        );
    }
    Ok(ExitCode::SUCCESS)
}
