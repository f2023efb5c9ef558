#![cfg(all(unix, feature = "cli"))]

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/brcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_bridgerelay"));
    cmd.env_remove("BRIDGERELAY_SOCKET")
        .env_remove("BRIDGERELAY_LOG")
        .arg("--log-level")
        .arg("error");
    cmd
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    loop {
        if UnixStream::connect(path).is_ok() {
            return;
        }
        if start.elapsed() >= timeout {
            panic!("broker did not start listening");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn start_broker(sock_path: &Path) -> Child {
    let child = bin()
        .arg("serve")
        .arg(sock_path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve command should start");
    wait_for_socket(sock_path, Duration::from_secs(3));
    child
}

fn pair(sock_path: &Path, token: &str, initiator: bool, stream_id: u64, timeout: &str) -> Output {
    let mut cmd = bin();
    cmd.arg("--format")
        .arg("json")
        .arg("pair")
        .arg(sock_path)
        .arg("--token")
        .arg(token)
        .arg("--stream-id")
        .arg(stream_id.to_string())
        .arg("--timeout")
        .arg(timeout);
    if initiator {
        cmd.arg("--initiator");
    }
    cmd.output().expect("pair should run")
}

fn generate_token() -> String {
    let output = bin()
        .arg("--format")
        .arg("json")
        .arg("token")
        .output()
        .expect("token should run");
    assert!(output.status.success());
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("token output should be json");
    value["token"]
        .as_str()
        .expect("token field should be a string")
        .to_string()
}

#[test]
fn token_outputs_64_hex_chars() {
    let token = generate_token();
    assert_eq!(token.len(), 64);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(token, generate_token());
}

#[test]
fn version_prints_package_version() {
    let output = bin().arg("version").output().expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn two_clients_pair_through_broker() {
    let dir = unique_temp_dir("pair");
    let sock_path = dir.join("relay.sock");
    let mut broker = start_broker(&sock_path);
    let token = generate_token();

    let initiator = {
        let sock_path = sock_path.clone();
        let token = token.clone();
        thread::spawn(move || pair(&sock_path, &token, true, 11, "10s"))
    };
    let responder = pair(&sock_path, &token, false, 22, "10s");
    let initiator = initiator.join().expect("initiator thread");

    for (output, role, local) in [(&initiator, "initiator", 11), (&responder, "responder", 22)] {
        assert!(
            output.status.success(),
            "{role} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let value: serde_json::Value =
            serde_json::from_slice(&output.stdout).expect("pair output should be json");
        assert_eq!(value["role"], role);
        assert_eq!(value["local_stream"], local);
        assert_eq!(value["token_prefix"], &token[..8]);
        assert!(value["relay_stream"].as_u64().is_some());
    }
    assert_ne!(
        String::from_utf8_lossy(&initiator.stdout),
        String::from_utf8_lossy(&responder.stdout)
    );

    let _ = broker.kill();
    let _ = broker.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unanswered_pair_times_out_with_124() {
    let dir = unique_temp_dir("timeout");
    let sock_path = dir.join("relay.sock");
    let mut broker = start_broker(&sock_path);

    let output = pair(&sock_path, &generate_token(), true, 1, "200ms");
    assert_eq!(output.status.code(), Some(124));

    let _ = broker.kill();
    let _ = broker.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn invalid_token_is_usage_error() {
    let output = pair(Path::new("/tmp/brcli-unused.sock"), "not-hex", true, 1, "1s");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn missing_broker_fails() {
    let missing = unique_temp_dir("missing").join("absent.sock");
    let output = pair(&missing, &"00".repeat(32), false, 1, "1s");
    assert_eq!(output.status.code(), Some(1));
}
