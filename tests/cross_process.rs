//! Drives the `cached_httpfs` binary from several processes sharing one
//! cache directory.

use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_cached_httpfs");

struct Sandbox {
    _temp: TempDir,
    root: Utf8PathBuf,
}

impl Sandbox {
    fn cache_dir(&self) -> Utf8PathBuf {
        self.root.join("cache")
    }

    fn source(&self, name: &str, contents: &[u8]) -> Utf8PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, contents).expect("write source file");
        path
    }

    fn command(&self) -> Command {
        let mut command = Command::new(BIN);
        command
            .arg("--cache-dir")
            .arg(self.cache_dir())
            .env_remove("HTTPFS_CACHE_DIR")
            .env_remove("HTTPFS_ENABLE_CACHE")
            .env("RUST_LOG", "cached_httpfs=debug");
        command
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command().args(args).output().expect("run cached_httpfs")
    }
}

#[fixture]
fn sandbox() -> Sandbox {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 path");
    Sandbox { _temp: temp, root }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_owned()
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "status {:?}, stderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn put(sandbox: &Sandbox, key: &str, source: &Utf8Path, extra: &[&str]) -> Output {
    sandbox
        .command()
        .args(["put", key, source.as_str()])
        .args(extra)
        .output()
        .expect("run put")
}

#[rstest]
fn populated_entry_is_visible_to_later_processes(sandbox: Sandbox) {
    let source = sandbox.source("payload.bin", b"remote bytes");

    let stored = put(&sandbox, "object1", &source, &[]);
    assert_success(&stored);
    assert_eq!(stdout(&stored), "stored 12");

    let stat = sandbox.run(&["stat", "object1"]);
    assert_success(&stat);
    assert_eq!(stdout(&stat), "initialized 12");

    let cat = sandbox.run(&["cat", "object1"]);
    assert_success(&cat);
    assert_eq!(cat.stdout, b"remote bytes");

    let again = put(&sandbox, "object1", &source, &[]);
    assert_success(&again);
    assert_eq!(stdout(&again), "exists 12");
}

#[rstest]
fn missing_key_is_reported(sandbox: Sandbox) {
    let stat = sandbox.run(&["stat", "object2"]);
    assert_success(&stat);
    assert_eq!(stdout(&stat), "missing");

    let cat = sandbox.run(&["cat", "object2"]);
    assert_eq!(cat.status.code(), Some(2));
    assert!(cat.stdout.is_empty());
}

#[rstest]
fn crashed_population_is_discarded(sandbox: Sandbox) {
    let source = sandbox.source("payload.bin", b"0123456789");

    let crashed = put(&sandbox, "object1", &source, &["--abandon"]);
    assert_eq!(crashed.status.code(), Some(3));
    assert!(sandbox.cache_dir().join("object1").exists());

    let stat = sandbox.run(&["stat", "object1"]);
    assert_success(&stat);
    assert_eq!(stdout(&stat), "missing");

    let stored = put(&sandbox, "object1", &source, &["--stream", "--chunk-size", "3"]);
    assert_success(&stored);
    assert_eq!(stdout(&stored), "stored 10");

    let cat = sandbox.run(&["cat", "object1"]);
    assert_eq!(cat.stdout, b"0123456789");
}

#[rstest]
fn concurrent_put_waits_for_the_populator(sandbox: Sandbox) {
    let source = sandbox.source("payload.bin", &[7_u8; 4096]);

    let slow = sandbox
        .command()
        .args(["put", "object1", source.as_str(), "--hold-ms", "750"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn slow put");

    // Give the slow writer time to create the file and take its lock.
    let file = sandbox.cache_dir().join("object1");
    for _ in 0..200 {
        if file.exists() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(file.exists(), "populator never created {file}");

    let fast = put(&sandbox, "object1", &source, &[]);
    let slow = slow.wait_with_output().expect("slow put finishes");

    assert_success(&slow);
    assert_success(&fast);
    assert_eq!(stdout(&slow), "stored 4096");
    assert_eq!(stdout(&fast), "exists 4096");
}

#[rstest]
fn discarded_population_frees_the_key_while_its_process_lives(sandbox: Sandbox) {
    let source = sandbox.source("payload.bin", b"0123456789");

    let mut discarding = sandbox
        .command()
        .args([
            "put",
            "object1",
            source.as_str(),
            "--hold-ms",
            "300",
            "--discard",
            "--linger-ms",
            "5000",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn discarding put");

    let file = sandbox.cache_dir().join("object1");
    for _ in 0..200 {
        if file.exists() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(file.exists(), "populator never created {file}");

    let stored = put(&sandbox, "object1", &source, &[]);
    assert_success(&stored);
    assert_eq!(stdout(&stored), "stored 10");
    assert!(
        discarding.try_wait().expect("poll discarding put").is_none(),
        "the second put must not need the first process to exit"
    );

    discarding.kill().expect("stop lingering put");
    discarding.wait().expect("reap lingering put");

    let cat = sandbox.run(&["cat", "object1"]);
    assert_eq!(cat.stdout, b"0123456789");
}
