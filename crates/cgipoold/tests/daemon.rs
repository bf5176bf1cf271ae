//! End-to-end tests against the `cgipoold` binary.

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tempfile::tempdir;

fn cgipoold() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cgipoold"));
    cmd.env("RUST_LOG", "debug").stdin(Stdio::null());
    cmd
}

fn run(cmd: &mut Command) -> Output {
    cmd.output().expect("run cgipoold")
}

fn wait_for(what: &str, timeout: Duration, mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if ready() {
            return;
        }
        sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {what}");
}

fn terminate(child: &mut Child) -> ExitStatus {
    let pid = Pid::from_raw(child.id() as i32);
    kill(pid, Signal::SIGTERM).expect("send SIGTERM");
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if let Some(status) = child.try_wait().expect("poll daemon") {
            return status;
        }
        assert!(Instant::now() < deadline, "daemon did not exit after SIGTERM");
        sleep(Duration::from_millis(50));
    }
}

fn alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn read_pid(path: &Path) -> u32 {
    std::fs::read_to_string(path)
        .expect("read pid file")
        .trim()
        .parse()
        .expect("parse pid")
}

#[test]
fn discover_resolves_manifest_to_pools() {
    let dir = tempdir().expect("tempdir");
    let build = dir.path().join("build");
    std::fs::create_dir_all(&build).expect("create build dir");
    std::fs::write(build.join("search.cgi"), "").expect("write executable");
    let manifest = dir.path().join("manifest.json");
    std::fs::write(
        &manifest,
        r#"{
            "samples": {
                "search": {"language": "c", "default_ports": [8080, 8081, 8082]},
                "missing": {"language": "c", "executable": "gone.cgi"},
                "legacy": {"language": "perl", "path": "legacy.pl"}
            }
        }"#,
    )
    .expect("write manifest");

    let output = run(cgipoold()
        .arg("discover")
        .arg("--manifest")
        .arg(&manifest)
        .arg("--build-dir")
        .arg(&build)
        .args(["--format", "json"]));

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("discover prints JSON");
    let pools = value["pools"].as_array().expect("pools array");
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0]["name"], "search");
    assert_eq!(pools[0]["min"], 2);
    assert_eq!(pools[0]["max"], 4);
    assert_eq!(pools[0]["base_port"], 8080);
    assert_eq!(value["skipped"].as_array().expect("skipped array").len(), 2);
}

#[test]
fn missing_manifest_is_fatal() {
    let dir = tempdir().expect("tempdir");
    let output = run(cgipoold()
        .arg("pool")
        .arg("--manifest")
        .arg(dir.path().join("nope.json"))
        .arg("--upstream-file")
        .arg(dir.path().join("upstreams.conf")));

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope.json"));
    assert!(!dir.path().join("upstreams.conf").exists());
}

#[test]
fn init_config_writes_scaffold_once() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("process_config.json");

    let first = run(cgipoold()
        .args(["supervise", "init-config", "--config"])
        .arg(&config));
    assert!(first.status.success());
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config).expect("read config"))
            .expect("config is JSON");
    assert_eq!(written["processes"]["pool_manager"]["restart_policy"], "always");
    assert_eq!(written["processes"]["yarp_proxy"]["depends_on"][0], "pool_manager");

    let second = run(cgipoold()
        .args(["supervise", "init-config", "--config"])
        .arg(&config));
    assert!(!second.status.success());
}

#[test]
fn supervise_starts_in_order_and_stops_on_sigterm() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("processes.json");
    let work = dir.path().display().to_string();
    std::fs::write(
        &config,
        format!(
            r#"{{
                "processes": {{
                    "api": {{
                        "command": ["sh", "-c", "echo $$ > api.pid; exec sleep 60"],
                        "cwd": "{work}",
                        "depends_on": ["db"],
                        "startup_delay": 0.2
                    }},
                    "db": {{
                        "command": ["sh", "-c", "echo $$ > db.pid; exec sleep 60"],
                        "cwd": "{work}",
                        "restart_policy": "always",
                        "startup_delay": 0.2,
                        "health_check": {{"type": "command", "command": "test -f db.pid", "timeout": 2}}
                    }}
                }},
                "global_settings": {{
                    "shutdown_timeout": 2,
                    "health_check_interval": 0.5,
                    "log_directory": "{work}/logs",
                    "orphan_patterns": [],
                    "reclaim_orphans_on_start": false
                }}
            }}"#
        ),
    )
    .expect("write config");

    let mut daemon = cgipoold()
        .args(["supervise", "start", "--config"])
        .arg(&config)
        .current_dir(dir.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("start daemon");

    let api_pid_file = dir.path().join("api.pid");
    wait_for("api to start", Duration::from_secs(10), || api_pid_file.exists());
    // Let the pid write land before reading it.
    sleep(Duration::from_millis(100));
    let db = read_pid(&dir.path().join("db.pid"));
    let api = read_pid(&api_pid_file);
    assert!(alive(db) && alive(api));

    let status = terminate(&mut daemon);
    assert!(status.success(), "daemon exited with {status}");
    wait_for("children to exit", Duration::from_secs(5), || !alive(db) && !alive(api));
    assert!(dir.path().join("logs").is_dir());
}

#[test]
fn pool_mode_publishes_and_shuts_down() {
    let dir = tempdir().expect("tempdir");
    let pools = dir.path().join("pools.toml");
    let upstreams = dir.path().join("upstreams.conf");
    // Nothing listens on these ports, so every worker fails verification.
    std::fs::write(
        &pools,
        r#"
[[pool]]
name = "echo"
command = { program = "sleep", args = ["30"] }
min = 1
max = 2
base_port = 47100
probe = { kind = "port", settle = 0.05, verify_timeout = 0.2, check_timeout = 0.2 }
"#,
    )
    .expect("write pools");

    let mut daemon = cgipoold()
        .arg("pool")
        .arg("--config")
        .arg(&pools)
        .arg("--upstream-file")
        .arg(&upstreams)
        .args(["--interval", "0.2"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("start daemon");

    wait_for("upstream file", Duration::from_secs(10), || upstreams.exists());
    let content = std::fs::read_to_string(&upstreams).expect("read upstreams");
    assert!(content.starts_with("# Auto-generated upstream configuration"));
    assert!(!content.contains("echo_pool"));

    let status = terminate(&mut daemon);
    assert!(status.success(), "daemon exited with {status}");
}
