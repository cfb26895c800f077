//! File transfer tests against the in-memory remote filesystem.
//!
//! Needs the `test-utils` feature, which the dev-dependency on this crate enables.

#![cfg(feature = "test-utils")]

use std::sync::Arc;

use rust_node_ssh::{FakeTransport, File};

fn setup() -> (Arc<FakeTransport>, File) {
    let t = Arc::new(FakeTransport::new("node-0"));
    let file = File::new(t.clone());
    (t, file)
}

#[tokio::test]
async fn upload_file_to_path() {
    let (t, file) = setup();
    t.fs().with_dir("/etc/kubernetes");
    let local = tempfile::tempdir().unwrap();
    let path = local.path().join("admin.conf");
    std::fs::write(&path, "apiVersion: v1\n").unwrap();

    file.upload(&path, "/etc/kubernetes/renamed.conf").await.unwrap();
    assert_eq!(
        t.fs().file("/etc/kubernetes/renamed.conf").unwrap(),
        b"apiVersion: v1\n"
    );
}

#[tokio::test]
async fn upload_file_into_directory() {
    let (t, file) = setup();
    t.fs().with_dir("/etc/kubernetes");
    let local = tempfile::tempdir().unwrap();
    let path = local.path().join("admin.conf");
    std::fs::write(&path, "data").unwrap();

    file.upload(&path, "/etc/kubernetes").await.unwrap();
    assert_eq!(t.fs().file("/etc/kubernetes/admin.conf").unwrap(), b"data");
}

#[tokio::test]
async fn directory_round_trip() {
    let (t, file) = setup();
    t.fs().with_dir("/srv");
    let local = tempfile::tempdir().unwrap();
    let tree = local.path().join("manifests");
    std::fs::create_dir_all(tree.join("addons")).unwrap();
    std::fs::write(tree.join("pod.yaml"), "kind: Pod\n").unwrap();
    std::fs::write(tree.join("addons").join("dns.yaml"), "kind: Service\n").unwrap();

    file.upload(&tree, "/srv/manifests").await.unwrap();
    assert!(t.fs().is_dir("/srv/manifests/addons"));
    assert_eq!(t.fs().file("/srv/manifests/pod.yaml").unwrap(), b"kind: Pod\n");
    assert_eq!(
        t.fs().file("/srv/manifests/addons/dns.yaml").unwrap(),
        b"kind: Service\n"
    );

    let out = local.path().join("copy");
    file.download("/srv/manifests", &out).await.unwrap();
    assert_eq!(std::fs::read(out.join("pod.yaml")).unwrap(), b"kind: Pod\n");
    assert_eq!(
        std::fs::read(out.join("addons").join("dns.yaml")).unwrap(),
        b"kind: Service\n"
    );
}

#[tokio::test]
async fn download_file_into_directory() {
    let (t, file) = setup();
    t.fs().put_file("/var/log/kubelet.log", "started\n");
    let local = tempfile::tempdir().unwrap();

    file.download("/var/log/kubelet.log", local.path()).await.unwrap();
    assert_eq!(
        std::fs::read(local.path().join("kubelet.log")).unwrap(),
        b"started\n"
    );
}

#[tokio::test]
async fn missing_remote_path() {
    let (_t, file) = setup();
    let local = tempfile::tempdir().unwrap();
    let err = file
        .download("/does/not/exist", &local.path().join("x"))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("no such file or directory"),
        "{err}"
    );
}

#[tokio::test]
async fn missing_local_path() {
    let (_t, file) = setup();
    let local = tempfile::tempdir().unwrap();
    let err = file
        .upload(&local.path().join("absent.sh"), "/tmp/absent.sh")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to open local file"), "{err}");
}

#[tokio::test]
async fn upload_into_missing_remote_directory_fails() {
    let (_t, file) = setup();
    let local = tempfile::tempdir().unwrap();
    let path = local.path().join("a.txt");
    std::fs::write(&path, "a").unwrap();
    assert!(file.upload(&path, "/missing/dir/a.txt").await.is_err());
}

#[tokio::test]
async fn bytes_round_trip() {
    let (t, file) = setup();
    t.fs().with_dir("/tmp");

    file.upload_bytes(b"token: abc\n", "/tmp/bootstrap-token").await.unwrap();
    assert_eq!(t.fs().file("/tmp/bootstrap-token").unwrap(), b"token: abc\n");
    assert_eq!(
        file.download_bytes("/tmp/bootstrap-token").await.unwrap(),
        b"token: abc\n"
    );
}
