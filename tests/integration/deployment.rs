#[path = "common/mod.rs"]
mod common;

use std::{
    cell::RefCell,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use common::{
    kill_marked, read_lines, snapshot, spawn_marked, unique_marker, write_build, write_live_build,
};
use redeploy::{
    artifact::{ArtifactManager, list_backups},
    command::ShellRunner,
    config::{ConfigOverrides, DeployConfig, FileConfig, Timings},
    health::{HealthCheck, HealthProber},
    notify::{DeploymentEvent, EventStatus, Notifier},
    orchestrator::{DeploymentOutcome, Orchestrator},
    process::{ProcessControl, ProcessController},
    wait::CancelToken,
};
use tempfile::{TempDir, tempdir};

/// Health check that always answers the same way.
struct FixedCheck(bool);

impl HealthCheck for FixedCheck {
    fn check(&self, _endpoint: &str, _timeout: Duration) -> Result<(), String> {
        if self.0 { Ok(()) } else { Err("connection refused".into()) }
    }
}

/// Health check that requests cancellation on its first call and fails.
struct CancellingCheck(CancelToken);

impl HealthCheck for CancellingCheck {
    fn check(&self, _endpoint: &str, _timeout: Duration) -> Result<(), String> {
        self.0.cancel();
        Err("operator interrupted".into())
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier(Rc<RefCell<Vec<DeploymentEvent>>>);

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &DeploymentEvent) {
        self.0.borrow_mut().push(event.clone());
    }
}

struct Layout {
    _root: TempDir,
    source: PathBuf,
    deploy: PathBuf,
    backups: PathBuf,
    start_log: PathBuf,
}

impl Layout {
    fn new() -> Self {
        let root = tempdir().expect("failed to create tempdir");
        let base = root.path().to_path_buf();
        Self {
            source: base.join("build"),
            deploy: base.join("srv/web"),
            backups: base.join("backups"),
            start_log: base.join("started.log"),
            _root: root,
        }
    }

    fn config(&self, pattern: &str) -> DeployConfig {
        let mut config = DeployConfig::resolve(
            FileConfig::default(),
            ConfigOverrides {
                app_name: Some("web".into()),
                app_version: Some("v2".into()),
                source_dir: Some(self.source.clone()),
                deploy_dir: Some(self.deploy.clone()),
                backup_dir: Some(self.backups.clone()),
                health_check_url: Some("http://127.0.0.1:9/health".into()),
                process_pattern: Some(pattern.into()),
                ..Default::default()
            },
        )
        .expect("resolve config");
        config.timings = Timings {
            grace_period: Duration::from_millis(500),
            force_delay: Duration::from_millis(200),
            settle_delay: Duration::ZERO,
            probe_interval: Duration::from_millis(20),
            probe_attempts: 3,
            probe_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(10),
        };
        config
    }
}

fn controller(deploy_dir: &Path) -> ProcessController<ShellRunner> {
    ProcessController::new(ShellRunner::new().with_working_dir(deploy_dir))
}

fn deploy<C: HealthCheck>(
    config: DeployConfig,
    check: C,
    cancel: CancelToken,
) -> (DeploymentOutcome, Vec<DeploymentEvent>) {
    let notifier = RecordingNotifier::default();
    let events = Rc::clone(&notifier.0);
    let process = controller(&config.request.deploy_dir);
    let outcome = Orchestrator::new(
        config,
        process,
        ArtifactManager::default(),
        HealthProber::new(check),
        notifier,
    )
    .with_cancel_token(cancel)
    .run();
    let events = events.borrow().clone();
    (outcome, events)
}

#[test]
fn healthy_release_replaces_running_version() {
    let layout = Layout::new();
    write_live_build(&layout.deploy, "v1", &layout.start_log);
    write_build(&layout.source, "v2", &layout.start_log);
    let marker = unique_marker("healthy");
    spawn_marked(&marker);

    let (outcome, events) = deploy(layout.config(&marker), FixedCheck(true), CancelToken::new());

    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(snapshot(&layout.deploy), snapshot(&layout.source));
    assert_eq!(read_lines(&layout.start_log), ["started v2"]);
    assert!(!controller(&layout.deploy).is_running(&marker));

    let backups = list_backups(&layout.backups, "web").expect("list backups");
    assert_eq!(backups.len(), 1);
    assert_eq!(
        fs::read_to_string(backups[0].path.join("VERSION")).expect("backup version"),
        "v1\n"
    );

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, EventStatus::Success);
    assert!(events[0].message.starts_with("Deployment completed in"));
    kill_marked(&marker);
}

#[test]
fn unhealthy_release_restores_previous_artifact_exactly() {
    let layout = Layout::new();
    write_live_build(&layout.deploy, "v1", &layout.start_log);
    fs::write(layout.deploy.join("only-in-v1.txt"), "legacy").expect("write extra file");
    write_build(&layout.source, "v2", &layout.start_log);
    let before = snapshot(&layout.deploy);
    let marker = unique_marker("unhealthy");
    spawn_marked(&marker);

    let (outcome, events) = deploy(layout.config(&marker), FixedCheck(false), CancelToken::new());

    match &outcome {
        DeploymentOutcome::Failed {
            reason,
            rolled_back,
        } => {
            assert!(rolled_back);
            assert!(reason.contains("Health check failed after 3 attempts"), "{reason}");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(snapshot(&layout.deploy), before);
    assert_eq!(read_lines(&layout.start_log), ["started v2", "started v1"]);

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, EventStatus::Failure);
    assert!(events[0].rolled_back);
    kill_marked(&marker);
}

#[test]
fn first_deployment_with_failing_start_is_not_rolled_back() {
    let layout = Layout::new();
    write_build(&layout.source, "v2", &layout.start_log);
    let mut config = layout.config(&unique_marker("first"));
    config.start_command = Some("exit 3".into());

    let (outcome, events) = deploy(config, FixedCheck(true), CancelToken::new());

    match &outcome {
        DeploymentOutcome::Failed {
            reason,
            rolled_back,
        } => {
            assert!(!rolled_back);
            assert!(reason.contains("exit code 3"), "{reason}");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(snapshot(&layout.deploy), snapshot(&layout.source));
    assert!(list_backups(&layout.backups, "web").expect("list backups").is_empty());
    assert_eq!(events.len(), 1);
    assert!(!events[0].rolled_back);
}

#[test]
fn interrupt_during_health_check_still_rolls_back() {
    let layout = Layout::new();
    write_live_build(&layout.deploy, "v1", &layout.start_log);
    write_build(&layout.source, "v2", &layout.start_log);
    let before = snapshot(&layout.deploy);
    let marker = unique_marker("interrupt");
    spawn_marked(&marker);
    let cancel = CancelToken::new();

    let (outcome, events) = deploy(
        layout.config(&marker),
        CancellingCheck(cancel.clone()),
        cancel,
    );

    match &outcome {
        DeploymentOutcome::Failed {
            reason,
            rolled_back,
        } => {
            assert!(rolled_back);
            assert!(reason.contains("interrupted"), "{reason}");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(snapshot(&layout.deploy), before);
    assert_eq!(read_lines(&layout.start_log), ["started v2", "started v1"]);
    assert_eq!(events.len(), 1);
    kill_marked(&marker);
}

#[test]
fn missing_source_fails_after_stopping_without_rollback() {
    let layout = Layout::new();
    write_live_build(&layout.deploy, "v1", &layout.start_log);
    let before = snapshot(&layout.deploy);
    let marker = unique_marker("nosource");
    spawn_marked(&marker);

    let (outcome, events) = deploy(layout.config(&marker), FixedCheck(true), CancelToken::new());

    assert_eq!(
        outcome,
        DeploymentOutcome::Failed {
            reason: format!("Source directory not found: {}", layout.source.display()),
            rolled_back: false,
        }
    );
    assert_eq!(snapshot(&layout.deploy), before);
    assert!(read_lines(&layout.start_log).is_empty());
    assert_eq!(events.len(), 1);
    kill_marked(&marker);
}
