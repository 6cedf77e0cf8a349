use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::TempDir;

fn fieldsync_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_fieldsync") {
        return PathBuf::from(path);
    }

    let this_test = std::env::current_exe().expect("current_exe");
    let deps_dir = this_test.parent().expect("deps dir");
    let debug_dir = deps_dir.parent().expect("debug dir");
    debug_dir.join("fieldsync")
}

struct DaemonProcess {
    child: Child,
    binary: PathBuf,
    home: PathBuf,
}

impl DaemonProcess {
    fn start(binary: PathBuf, home: PathBuf) -> Self {
        let child = Command::new(&binary)
            .env("HOME", &home)
            .env("USERPROFILE", &home)
            .args(["daemon", "start"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");

        Self {
            child,
            binary,
            home,
        }
    }

    fn stop(&mut self) -> bool {
        let _ = run(&self.binary, &self.home, &["daemon", "stop"]);

        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return true;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
        false
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.stop();
        }
    }
}

fn run(binary: &Path, home: &Path, args: &[&str]) -> Output {
    Command::new(binary)
        .env("HOME", home)
        .env("USERPROFILE", home)
        .args(args)
        .output()
        .expect("run fieldsync")
}

fn json_of(output: &Output) -> Option<Value> {
    if !output.status.success() {
        return None;
    }
    serde_json::from_slice(&output.stdout).ok()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn daemon_answers_status_and_sync_then_stops() {
    let home = TempDir::new().expect("home");
    let binary = fieldsync_bin_path();

    let init = run(&binary, home.path(), &["init", "--site", "north-yard"]);
    assert!(init.status.success(), "init failed");

    let mut daemon = DaemonProcess::start(binary.clone(), home.path().to_path_buf());
    assert!(
        wait_until(Duration::from_secs(5), || {
            json_of(&run(&binary, home.path(), &["daemon", "status"]))
                .and_then(|v| v.get("running").and_then(Value::as_bool))
                .unwrap_or(false)
        }),
        "daemon did not report running state in time",
    );

    let status = json_of(&run(&binary, home.path(), &["status", "--json"])).expect("status json");
    assert_eq!(status["site_id"], Value::from("north-yard"));
    assert_eq!(status["queue"]["pending_count"], Value::from(0));

    let sync = run(&binary, home.path(), &["sync", "--critical", "--json"]);
    let report = json_of(&sync).expect("sync json");
    assert_eq!(report["mode"], Value::from("critical"));

    let clear = run(&binary, home.path(), &["clear", "--yes"]);
    assert!(clear.status.success());
    assert!(String::from_utf8_lossy(&clear.stdout).contains("No failed mutations"));

    assert!(daemon.stop(), "daemon did not exit after stop request");
    let after = json_of(&run(&binary, home.path(), &["daemon", "status"])).expect("status json");
    assert_eq!(after["running"], Value::Bool(false));
}
