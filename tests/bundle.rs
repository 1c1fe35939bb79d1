//! Bundle construction: the runtime configuration document.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use clap::Parser;
use faasd::apis::Deployment;
use faasd::bundle;
use faasd::cfg::{Context, FaasdOptions};

fn context(work_dir: &str) -> Context {
    let options = FaasdOptions::parse_from(["faasd", "--work-dir", work_dir]);
    Context::from(&options)
}

fn deployment() -> Deployment {
    Deployment {
        name: "hello".to_string(),
        ip: Ipv4Addr::new(10, 0, 0, 10),
        port: 80,
        rootfs: "/var/lib/faasd/images/hello/rootfs".to_string(),
        cmd: vec!["/app/handler".to_string(), "--fast".to_string()],
    }
}

fn build_config(cxt: &Context) -> serde_json::Value {
    let bundle_dir = bundle::build(cxt, &deployment(), "faas-test", "/run/faas-test.sock").unwrap();
    let config = fs::read_to_string(format!("{bundle_dir}/config.json")).unwrap();
    serde_json::from_str(&config).unwrap()
}

#[test]
fn process_runs_the_launch_command_without_privileges() {
    let dir = tempfile::tempdir().unwrap();
    let v = build_config(&context(dir.path().to_str().unwrap()));

    assert_eq!(v["process"]["args"][0], "/app/handler");
    assert_eq!(v["process"]["args"][1], "--fast");
    assert_eq!(v["process"]["cwd"], "/");
    assert_eq!(v["process"]["noNewPrivileges"], true);

    let env = v["process"]["env"].as_array().unwrap();
    assert_eq!(env.len(), 1);
    assert!(env[0].as_str().unwrap().starts_with("PATH="));
}

#[test]
fn rootfs_is_referenced_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let v = build_config(&context(dir.path().to_str().unwrap()));

    assert_eq!(v["root"]["path"], "/var/lib/faasd/images/hello/rootfs");
    assert_eq!(v["root"]["readonly"], true);
}

#[test]
fn control_socket_is_bind_mounted_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let v = build_config(&context(dir.path().to_str().unwrap()));

    let mounts = v["mounts"].as_array().unwrap();
    let control = mounts
        .iter()
        .find(|m| m["destination"] == "/control.sock")
        .expect("control socket mount");
    assert_eq!(control["type"], "bind");
    assert_eq!(control["source"], "/run/faas-test.sock");
    let options = control["options"].as_array().unwrap();
    assert!(options.contains(&serde_json::json!("bind")));
    assert!(options.contains(&serde_json::json!("ro")));

    let tmp = mounts
        .iter()
        .find(|m| m["destination"] == "/tmp")
        .expect("tmp mount");
    assert_eq!(tmp["type"], "tmpfs");

    for required in ["/proc", "/dev", "/sys"] {
        assert!(
            mounts.iter().any(|m| m["destination"] == required),
            "{required}"
        );
    }
}

#[test]
fn namespaces_resources_and_hardening_are_set() {
    let dir = tempfile::tempdir().unwrap();
    let v = build_config(&context(dir.path().to_str().unwrap()));

    let namespaces: Vec<&str> = v["linux"]["namespaces"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["type"].as_str().unwrap())
        .collect();
    for required in ["pid", "network", "ipc", "uts", "mount"] {
        assert!(namespaces.contains(&required), "{required}");
    }

    assert_eq!(v["linux"]["resources"]["memory"]["limit"], 536870912i64);
    assert_eq!(v["linux"]["resources"]["cpu"]["quota"], 100000);
    assert_eq!(v["linux"]["resources"]["cpu"]["period"], 100000);

    let masked = v["linux"]["maskedPaths"].as_array().unwrap();
    assert!(masked.contains(&serde_json::json!("/proc/kcore")));
    let readonly = v["linux"]["readonlyPaths"].as_array().unwrap();
    assert!(readonly.contains(&serde_json::json!("/proc/sys")));
}

#[test]
fn bundle_removal_is_complete_and_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cxt = context(dir.path().to_str().unwrap());

    let bundle_dir =
        bundle::build(&cxt, &deployment(), "faas-gone", "/run/faas-gone.sock").unwrap();
    assert!(Path::new(&bundle_dir).join("config.json").exists());

    bundle::remove(&bundle_dir).unwrap();
    assert!(!Path::new(&bundle_dir).exists());
    bundle::remove(&bundle_dir).unwrap();
}
