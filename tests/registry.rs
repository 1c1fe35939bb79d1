//! Registry persistence, allocation, and restart behavior.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use clap::Parser;
use faasd::apis::FaasError;
use faasd::cfg::{Context, FaasdOptions};
use faasd::registry::Registry;

fn context(work_dir: &str, pool_start: &str, pool_end: &str) -> Context {
    let options = FaasdOptions::parse_from([
        "faasd",
        "--work-dir",
        work_dir,
        "--pool-start",
        pool_start,
        "--pool-end",
        pool_end,
    ]);
    Context::from(&options)
}

fn rootfs(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("rootfs");
    fs::create_dir_all(&path).unwrap();
    path.to_str().unwrap().to_string()
}

#[tokio::test]
async fn publish_lookup_list_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let cxt = context(dir.path().to_str().unwrap(), "10.0.0.10", "10.0.0.254");
    let registry = Registry::load(&cxt).unwrap();
    let rootfs = rootfs(&dir);

    let d = registry
        .publish("hello", &rootfs, vec!["/app/handler".to_string()])
        .await
        .unwrap();

    assert_eq!(d.ip, Ipv4Addr::new(10, 0, 0, 10));
    assert_eq!(d.port, 80);
    assert_eq!(registry.lookup("hello").await.unwrap(), d);
    assert!(registry.contains("hello").await);
    assert_eq!(registry.list().await.len(), 1);

    let err = registry.lookup("other").await.unwrap_err();
    assert!(matches!(err, FaasError::NotFound(_)));
}

#[tokio::test]
async fn records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cxt = context(dir.path().to_str().unwrap(), "10.0.0.10", "10.0.0.254");
    let rootfs = rootfs(&dir);

    let before = {
        let registry = Registry::load(&cxt).unwrap();
        registry
            .publish("hello", &rootfs, vec!["/app/handler".to_string()])
            .await
            .unwrap()
    };

    let registry = Registry::load(&cxt).unwrap();
    assert_eq!(registry.lookup("hello").await.unwrap(), before);
    // The next allocation continues past the restored record.
    let second = registry
        .publish("other", &rootfs, vec!["/bin/run".to_string()])
        .await
        .unwrap();
    assert_eq!(second.ip, Ipv4Addr::new(10, 0, 0, 11));
}

#[tokio::test]
async fn duplicate_name_leaves_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let cxt = context(dir.path().to_str().unwrap(), "10.0.0.10", "10.0.0.254");
    let registry = Registry::load(&cxt).unwrap();
    let rootfs = rootfs(&dir);

    registry
        .publish("hello", &rootfs, vec!["/app/handler".to_string()])
        .await
        .unwrap();
    let persisted = fs::read_to_string(cxt.registry_file()).unwrap();

    let err = registry
        .publish("hello", &rootfs, vec!["/bin/other".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(err, FaasError::AlreadyExists(_)));
    assert_eq!(fs::read_to_string(cxt.registry_file()).unwrap(), persisted);
}

#[tokio::test]
async fn allocation_is_ordered_and_exhausts() {
    let dir = tempfile::tempdir().unwrap();
    let cxt = context(dir.path().to_str().unwrap(), "10.9.0.10", "10.9.0.11");
    let registry = Registry::load(&cxt).unwrap();
    let rootfs = rootfs(&dir);

    let a = registry
        .publish("a", &rootfs, vec!["/r".to_string()])
        .await
        .unwrap();
    let b = registry
        .publish("b", &rootfs, vec!["/r".to_string()])
        .await
        .unwrap();
    assert_eq!(a.ip, Ipv4Addr::new(10, 9, 0, 10));
    assert_eq!(b.ip, Ipv4Addr::new(10, 9, 0, 11));

    let err = registry
        .publish("c", &rootfs, vec!["/r".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, FaasError::PoolExhausted(_)));
}

#[tokio::test]
async fn removal_frees_the_address_for_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let cxt = context(dir.path().to_str().unwrap(), "10.9.1.10", "10.9.1.11");
    let registry = Registry::load(&cxt).unwrap();
    let rootfs = rootfs(&dir);

    let a = registry
        .publish("a", &rootfs, vec!["/r".to_string()])
        .await
        .unwrap();
    registry.remove("a").await.unwrap();
    assert!(matches!(
        registry.lookup("a").await.unwrap_err(),
        FaasError::NotFound(_)
    ));

    let b = registry
        .publish("b", &rootfs, vec!["/r".to_string()])
        .await
        .unwrap();
    assert_eq!(b.ip, a.ip);
}

#[tokio::test]
async fn writes_are_atomic_renames() {
    let dir = tempfile::tempdir().unwrap();
    let cxt = context(dir.path().to_str().unwrap(), "10.0.0.10", "10.0.0.254");
    let registry = Registry::load(&cxt).unwrap();
    let rootfs = rootfs(&dir);

    registry
        .publish("hello", &rootfs, vec!["/app/handler".to_string()])
        .await
        .unwrap();

    assert!(Path::new(&cxt.registry_file()).exists());
    assert!(!Path::new(&format!("{}.tmp", cxt.registry_file())).exists());

    let doc: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(cxt.registry_file()).unwrap()).unwrap();
    assert_eq!(doc["version"], 1);
    assert_eq!(doc["deployments"]["hello"]["ip"], "10.0.0.10");
}

#[tokio::test]
async fn missing_rootfs_records_are_kept_not_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let cxt = context(dir.path().to_str().unwrap(), "10.0.0.10", "10.0.0.254");

    {
        let registry = Registry::load(&cxt).unwrap();
        registry
            .publish("ghost", "/nonexistent/rootfs", vec!["/r".to_string()])
            .await
            .unwrap();
    }

    // Reload validates, complains, and keeps the record on disk.
    let registry = Registry::load(&cxt).unwrap();
    assert!(registry.contains("ghost").await);
    let persisted = fs::read_to_string(cxt.registry_file()).unwrap();
    assert!(persisted.contains("ghost"));
}
