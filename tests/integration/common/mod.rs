#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    fs,
    io::{Read, Write},
    net::TcpListener,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
    sync::atomic::{AtomicU32, Ordering},
    thread,
    time::{Duration, Instant},
};

use redeploy::{command::ShellRunner, process::ProcessController};

/// A marker unique to this test process, safe to use as a process pattern.
pub fn unique_marker(label: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "redeploy-it-{label}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Starts a long-running shell loop whose command line carries `marker`.
/// The child is reaped on a helper thread so it never lingers as a zombie.
pub fn spawn_marked(marker: &str) -> u32 {
    let child = Command::new("sh")
        .arg("-c")
        .arg("while :; do sleep 0.1; done")
        .arg(marker)
        .spawn()
        .expect("spawn marked process");
    let pid = child.id();
    thread::spawn(move || {
        let mut child = child;
        let _ = child.wait();
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while ProcessController::<ShellRunner>::matching_pids(marker).is_empty() {
        assert!(Instant::now() < deadline, "marked process never appeared");
        thread::sleep(Duration::from_millis(50));
    }
    pid
}

/// Kills anything still matching `marker`.
pub fn kill_marked(marker: &str) {
    for pid in ProcessController::<ShellRunner>::matching_pids(marker) {
        let _ = Command::new("kill").arg("-9").arg(pid.to_string()).status();
    }
}

/// Writes an application build: a version file plus a `start.sh` that appends
/// `started <version>` to `start_log`.
pub fn write_build(dir: &Path, version: &str, start_log: &Path) {
    fs::create_dir_all(dir.join("config")).expect("create build dir");
    fs::write(dir.join("VERSION"), format!("{version}\n")).expect("write version");
    fs::write(
        dir.join("config/app.yaml"),
        format!("release: {version}\n"),
    )
    .expect("write app config");

    let script = dir.join("start.sh");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\necho \"started {version}\" >> '{}'\n",
            start_log.display()
        ),
    )
    .expect("write start script");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).expect("chmod start script");
}

/// Relative path to contents for every file under `root`.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in fs::read_dir(dir).expect("read dir") {
            let path = entry.expect("dir entry").path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let relative = path.strip_prefix(root).expect("relative path").to_path_buf();
                out.insert(relative, fs::read(&path).expect("read file"));
            }
        }
    }

    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Serves `status_line` to every connection until the test process exits.
pub fn serve_health(status_line: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind health server");
    let addr = listener.local_addr().expect("health server addr");
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let _ = write!(
                stream,
                "HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
        }
    });
    format!("http://{addr}/health")
}

/// A URL nothing is listening on.
pub fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe port");
    let addr = listener.local_addr().expect("probe addr");
    drop(listener);
    format!("http://{addr}/health")
}

/// Writes a build that is already live, with `start.sh` executable.
pub fn write_live_build(dir: &Path, version: &str, start_log: &Path) {
    write_build(dir, version, start_log);
    fs::set_permissions(dir.join("start.sh"), fs::Permissions::from_mode(0o755))
        .expect("chmod live start script");
}
