//! Helpers for building synthetic `docker save` archives in memory.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

pub enum Item<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
}

/// One layer archive from an ordered list of entries.
pub fn layer_tar(items: &[Item]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    for item in items {
        match item {
            Item::Dir(path) => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                builder
                    .append_data(&mut header, *path, std::io::empty())
                    .unwrap();
            }
            Item::File(path, data) => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(data.len() as u64);
                header.set_mode(0o755);
                builder.append_data(&mut header, *path, *data).unwrap();
            }
        }
    }

    builder.into_inner().unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// A complete image archive: manifest, configuration, layers in order.
pub fn image_tar(entrypoint: &[&str], cmd: &[&str], layers: &[Vec<u8>]) -> Vec<u8> {
    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Entrypoint": if entrypoint.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::json!(entrypoint)
            },
            "Cmd": if cmd.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::json!(cmd)
            },
        },
    });

    let layer_names: Vec<String> = (0..layers.len())
        .map(|i| format!("layer{i}/layer.tar"))
        .collect();
    let manifest = serde_json::json!([{
        "Config": "config.json",
        "RepoTags": ["test:latest"],
        "Layers": layer_names,
    }]);

    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in [
        ("manifest.json", serde_json::to_vec(&manifest).unwrap()),
        ("config.json", serde_json::to_vec(&config).unwrap()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data.as_slice()).unwrap();
    }
    for (name, data) in layer_names.iter().zip(layers) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, name.as_str(), data.as_slice())
            .unwrap();
    }

    builder.into_inner().unwrap()
}

/// The one-layer hello image used by the happy-path tests.
pub fn hello_image() -> Vec<u8> {
    let layer = layer_tar(&[
        Item::Dir("app/"),
        Item::File("app/handler", b"#!/bin/sh\necho hello\n"),
    ]);
    image_tar(&["/app/handler"], &[], &[layer])
}
