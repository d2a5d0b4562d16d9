use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    thread,
};

use sweetdesk_core::logging::{
    install_panic_hook, PanicHookInstallPlan, DEFAULT_CRASH_DIR_NAME, DEFAULT_LOG_DIR_NAME,
};
use tempfile::tempdir;

const CHILD_MODE_ENV: &str = "SWEETDESK_PANIC_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "SWEETDESK_PANIC_CHILD_DATA_DIR";

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("test_panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME)
}

fn crash_artifacts(crash_dir: &Path) -> Vec<PathBuf> {
    let mut paths = fs::read_dir(crash_dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

/// Only does something when spawned by the tests below.
#[test]
fn test_panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(
        std::env::var(CHILD_DATA_DIR_ENV).expect("child data dir must be set"),
    );

    let first = install_panic_hook(Some(data_dir.as_path()));
    assert!(matches!(
        first,
        PanicHookInstallPlan::Installed { .. } | PanicHookInstallPlan::AlreadyInstalled { .. }
    ));
    assert!(matches!(
        install_panic_hook(Some(data_dir.as_path())),
        PanicHookInstallPlan::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "worker_panic" => {
            let worker = thread::Builder::new()
                .name("batch-worker".to_string())
                .spawn(|| panic!("tile 3 exploded url=https://u:p@cdn.example.com/x.png"))
                .expect("spawn worker");
            let _ = worker.join();
            panic!("intentional panic after worker failure");
        }
        "unwritable" => {
            let dir = crash_dir(&data_dir);
            if dir.exists() {
                fs::remove_dir_all(&dir).expect("remove crash directory");
            }
            fs::write(&dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("intentional panic with unwritable crash dir");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn test_crash_hook_writes_one_artifact_per_panic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("worker_panic", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let artifacts = crash_artifacts(&crash_dir(data_dir.path()));
    assert_eq!(artifacts.len(), 2, "{artifacts:?}");

    let contents: Vec<String> = artifacts
        .iter()
        .map(|path| fs::read_to_string(path).expect("read crash artifact"))
        .collect();

    let worker = contents
        .iter()
        .find(|text| text.contains("thread=batch-worker"))
        .expect("artifact for the worker thread");
    assert!(worker.contains("payload=tile 3 exploded"));
    assert!(!worker.contains("u:p@"), "credentials must be redacted");
    assert!(worker.contains("timestamp_utc="));
    assert!(worker.contains("location="));
    assert!(worker.contains("backtrace_policy="));

    assert!(contents
        .iter()
        .any(|text| text.contains("payload=intentional panic after worker failure")));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn test_crash_hook_unwritable_crash_dir_warns_and_does_not_repanic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("unwritable", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("intentional panic with unwritable crash dir"));
    assert!(stderr.contains("Warning: failed to write panic crash artifact under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
