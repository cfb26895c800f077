//! Script and bundle execution tests.
//!
//! Needs the `test-utils` feature, which the dev-dependency on this crate enables.

#![cfg(feature = "test-utils")]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rust_node_ssh::test_utils::scripts;
use rust_node_ssh::{BundleConfig, ClientConfig, FakeTransport, NodeError, Script};

const SUDO_DIR: &str = "/opt/deckhouse/tmp";

fn local_script(dir: &Path) -> PathBuf {
    let path = dir.join("check.sh");
    std::fs::write(&path, "#!/bin/bash\necho ok\n").unwrap();
    path
}

#[tokio::test]
async fn execute_uploads_runs_and_cleans_up() {
    let t = Arc::new(FakeTransport::new("node-0"));
    t.on_command("bash ./check.sh", scripts::echo("ok\n"));
    let local = tempfile::tempdir().unwrap();

    let script = Script::new(t.clone(), local_script(local.path()), ["arg"]);
    let stdout = script.execute().await.unwrap();

    assert_eq!(stdout, b"ok\n");
    assert_eq!(
        t.fs().file("./check.sh").unwrap(),
        b"#!/bin/bash\necho ok\n"
    );
    assert_eq!(
        t.executed(),
        vec![
            "bash ./check.sh arg".to_string(),
            "rm -f ./check.sh".to_string()
        ]
    );
}

#[tokio::test]
async fn sudo_script_uses_sudo_upload_dir() {
    let t = Arc::new(FakeTransport::new("node-0").with_become_pass("pw"));
    t.fs().with_dir(SUDO_DIR);
    t.on_command("check.sh", scripts::sudo("pw", scripts::echo("ok\n")));
    let local = tempfile::tempdir().unwrap();

    let script = Script::new(t.clone(), local_script(local.path()), Vec::<String>::new()).sudo();
    assert_eq!(script.execute().await.unwrap(), b"ok\n");

    assert!(t.fs().file(&format!("{SUDO_DIR}/check.sh")).is_some());
    let executed = t.executed();
    assert_eq!(executed.len(), 2);
    assert!(executed[0].starts_with("sudo -p SudoPassword"));
    assert!(executed[0].contains(&format!("bash {SUDO_DIR}/check.sh")));
    assert!(executed[1].contains(&format!("rm -f {SUDO_DIR}/check.sh")));
}

#[tokio::test]
async fn upload_dir_override() {
    let t = Arc::new(FakeTransport::new("node-0"));
    t.fs().with_dir("/var/tmp");
    let local = tempfile::tempdir().unwrap();

    let script = Script::new(t.clone(), local_script(local.path()), Vec::<String>::new())
        .with_execute_upload_dir("/var/tmp/");
    assert_eq!(script.remote_path().unwrap(), "/var/tmp/check.sh");
    script.execute().await.unwrap();
    assert_eq!(t.executed()[0], "bash /var/tmp/check.sh");
}

#[tokio::test]
async fn cleanup_can_be_disabled() {
    let t = Arc::new(FakeTransport::new("node-0"));
    let local = tempfile::tempdir().unwrap();

    let script = Script::new(t.clone(), local_script(local.path()), Vec::<String>::new())
        .with_cleanup_after_exec(false);
    script.execute().await.unwrap();
    assert_eq!(t.executed(), vec!["bash ./check.sh".to_string()]);
}

#[tokio::test]
async fn commander_mode_skips_upload() {
    let t = Arc::new(FakeTransport::new("node-0"));

    let script = Script::new(t.clone(), "/opt/scripts/check.sh", ["--fast"])
        .with_commander_mode(true);
    script.execute().await.unwrap();

    assert!(t.fs().paths().is_empty());
    assert_eq!(
        t.executed(),
        vec!["bash /opt/scripts/check.sh --fast".to_string()]
    );
}

#[tokio::test]
async fn failed_script_is_still_removed() {
    let t = Arc::new(FakeTransport::new("node-0"));
    t.on_command("bash ./check.sh", scripts::output("", "bad input\n", 3));
    let local = tempfile::tempdir().unwrap();

    let script = Script::new(t.clone(), local_script(local.path()), Vec::<String>::new());
    let err = script.execute().await.unwrap_err();

    assert_eq!(err.exit_status(), Some(3));
    assert_eq!(err.stderr(), Some("bad input\n"));
    assert_eq!(t.executed().last().unwrap(), "rm -f ./check.sh");
}

#[tokio::test]
async fn script_environment_is_exported() {
    let t = Arc::new(FakeTransport::new("node-0"));
    let local = tempfile::tempdir().unwrap();

    let script = Script::new(t.clone(), local_script(local.path()), Vec::<String>::new())
        .with_envs([("NODE", "master-0")])
        .with_cleanup_after_exec(false);
    script.execute().await.unwrap();
    assert_eq!(t.executed(), vec!["export NODE=master-0; bash ./check.sh".to_string()]);
}

fn bundle_transport(max_step_failures: u32) -> Arc<FakeTransport> {
    let config = ClientConfig::default().bundle(BundleConfig {
        max_step_failures,
        ..BundleConfig::default()
    });
    let t = Arc::new(
        FakeTransport::new("node-0")
            .with_config(config)
            .with_become_pass("pw"),
    );
    t.fs().with_dir(SUDO_DIR);
    t
}

fn local_bundle() -> tempfile::TempDir {
    let parent = tempfile::tempdir().unwrap();
    let bundle = parent.path().join("bundle");
    std::fs::create_dir_all(bundle.join("bundle_steps")).unwrap();
    std::fs::write(bundle.join("bashible.sh"), "#!/bin/bash\n").unwrap();
    std::fs::write(bundle.join("bundle_steps").join("001_step.sh"), "true\n").unwrap();
    parent
}

#[tokio::test]
async fn bundle_gives_up_on_repeating_step() {
    let t = bundle_transport(3);
    let mut lines = Vec::new();
    for _ in 0..5 {
        lines.push("=== Step: /var/lib/bashible/bundle_steps/001_step.sh".to_string());
        lines.push("===".to_string());
        lines.push("curl: connection refused".to_string());
    }
    t.on_command("tar xpof", scripts::sudo("pw", scripts::lines_then_hang(lines)));
    let parent = local_bundle();

    let seen = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&seen);
    let script = Script::new(t.clone(), "bashible", Vec::<String>::new())
        .with_stdout_handler(move |_| *counter.lock().unwrap() += 1);
    let err = script
        .execute_bundle(parent.path(), "bundle")
        .await
        .unwrap_err();

    match err {
        NodeError::BundleTimeout { step, failures } => {
            assert_eq!(step, "/var/lib/bashible/bundle_steps/001_step.sh");
            assert_eq!(failures, 4);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(*seen.lock().unwrap() >= 13);
}

#[tokio::test]
async fn bundle_runs_to_completion() {
    let t = bundle_transport(10);
    t.on_command(
        "tar xpof",
        scripts::sudo(
            "pw",
            scripts::echo("=== Step: 001_step.sh\nok\n=== Step: 002_step.sh\ndone\n"),
        ),
    );
    let parent = local_bundle();

    Script::new(t.clone(), "bashible", Vec::<String>::new())
        .execute_bundle(parent.path(), "bundle")
        .await
        .unwrap();

    let executed = t.executed();
    assert_eq!(executed.len(), 2);
    assert!(executed[0].contains(&format!("mkdir -p {SUDO_DIR}")));
    assert!(executed[1].contains(&format!(
        "tar xpof {SUDO_DIR}/bundle.tar -C {SUDO_DIR} && cd {SUDO_DIR}/bundle && ./bashible.sh"
    )));

    let archive = t.fs().file(&format!("{SUDO_DIR}/bundle.tar")).unwrap();
    let mut names = Vec::new();
    let mut tar = tar::Archive::new(archive.as_slice());
    for entry in tar.entries().unwrap() {
        let entry = entry.unwrap();
        names.push(entry.path().unwrap().display().to_string());
    }
    assert!(names.iter().any(|n| n == "bundle/bashible.sh"), "{names:?}");
    assert!(
        names.iter().any(|n| n == "bundle/bundle_steps/001_step.sh"),
        "{names:?}"
    );
}

#[tokio::test]
async fn bundle_step_failure_exit_is_reported() {
    let t = bundle_transport(10);
    t.on_command(
        "tar xpof",
        scripts::sudo("pw", scripts::output("=== Step: 001_step.sh\n", "fatal\n", 1)),
    );
    let parent = local_bundle();

    let err = Script::new(t.clone(), "bashible", Vec::<String>::new())
        .execute_bundle(parent.path(), "bundle")
        .await
        .unwrap_err();
    assert_eq!(err.exit_status(), Some(1));
}
