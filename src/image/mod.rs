/*
Copyright 2024 The openBCE Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::fs;
use std::io::{BufReader, Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::apis::{FaasError, FaasResult};

/// Whiteout prefix of the overlay convention; `.wh.foo` in a layer deletes
/// `foo` from the layers below it.
const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Top-level entry of a `docker save` archive.
#[derive(Deserialize, Debug)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

#[derive(Deserialize, Default, Debug)]
struct ImageConfig {
    #[serde(default)]
    config: Option<RuntimeConfig>,
}

#[derive(Deserialize, Default, Debug)]
struct RuntimeConfig {
    #[serde(rename = "Entrypoint", default)]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
}

/// Materialize a layered image archive under `<dest_root>/rootfs` and return
/// the launch command (`entrypoint ++ cmd`) from the image configuration.
///
/// The destination is either absent or complete: a failed layer application
/// removes the partial tree before the error is surfaced. The scratch
/// directory holding the unpacked archive is removed on all exit paths.
pub fn materialize(archive: &[u8], dest_root: &str) -> FaasResult<Vec<String>> {
    let scratch = tempfile::Builder::new()
        .prefix("faasd-image-")
        .tempdir()
        .map_err(|e| FaasError::Extraction(format!("scratch directory: {e}")))?;

    let mut tar = tar::Archive::new(Cursor::new(archive));
    tar.unpack(scratch.path())
        .map_err(|e| FaasError::InvalidInput(format!("malformed image archive: {e}")))?;

    let manifest = read_manifest(scratch.path())?;
    let cmd = read_launch_command(scratch.path(), &manifest.config)?;

    let rootfs = format!("{dest_root}/rootfs");
    fs::create_dir_all(dest_root)
        .map_err(|e| FaasError::Extraction(format!("create {dest_root}: {e}")))?;
    // Plain create_dir so an existing rootfs is rejected, never overlaid.
    fs::create_dir(&rootfs).map_err(|e| match e.kind() {
        std::io::ErrorKind::AlreadyExists => {
            FaasError::AlreadyExists(format!("rootfs {rootfs} already exists"))
        }
        _ => FaasError::Extraction(format!("create {rootfs}: {e}")),
    })?;

    tracing::debug!("Applying <{}> layers to <{}>.", manifest.layers.len(), rootfs);
    for layer in &manifest.layers {
        if let Err(e) = apply_layer(&scratch.path().join(layer), Path::new(&rootfs)) {
            let _ = fs::remove_dir_all(&rootfs);
            return Err(e);
        }
    }

    Ok(cmd)
}

fn read_manifest(scratch: &Path) -> FaasResult<ManifestEntry> {
    let data = fs::read_to_string(scratch.join("manifest.json"))
        .map_err(|e| FaasError::InvalidInput(format!("image manifest: {e}")))?;
    let mut entries: Vec<ManifestEntry> = serde_json::from_str(&data)
        .map_err(|e| FaasError::InvalidInput(format!("image manifest: {e}")))?;

    // A published archive carries exactly one image.
    if entries.is_empty() {
        return Err(FaasError::InvalidInput("empty image manifest".to_string()));
    }

    Ok(entries.remove(0))
}

fn read_launch_command(scratch: &Path, config_name: &str) -> FaasResult<Vec<String>> {
    let data = fs::read_to_string(scratch.join(config_name))
        .map_err(|e| FaasError::InvalidInput(format!("image configuration: {e}")))?;
    let config: ImageConfig = serde_json::from_str(&data)
        .map_err(|e| FaasError::InvalidInput(format!("image configuration: {e}")))?;

    let runtime = config.config.unwrap_or_default();
    let mut cmd = runtime.entrypoint.unwrap_or_default();
    cmd.extend(runtime.cmd.unwrap_or_default());

    if cmd.is_empty() {
        return Err(FaasError::InvalidInput(
            "image has neither entrypoint nor cmd".to_string(),
        ));
    }

    Ok(cmd)
}

/// Apply one layer archive onto `dest`. Regular entries replace whatever sits
/// at their path; whiteout entries delete the underlying entry instead of
/// being materialized.
fn apply_layer(layer_path: &Path, dest: &Path) -> FaasResult<()> {
    let reader = open_layer(layer_path)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|e| FaasError::InvalidInput(format!("layer {}: {e}", layer_path.display())))?;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| FaasError::InvalidInput(format!("layer {}: {e}", layer_path.display())))?;
        let path: PathBuf = entry
            .path()
            .map_err(|e| FaasError::InvalidInput(format!("layer entry path: {e}")))?
            .into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(FaasError::InvalidInput(format!(
                "layer entry escapes the rootfs: {}",
                path.display()
            )));
        }

        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let parent = dest.join(path.parent().unwrap_or_else(|| Path::new("")));

        if name == OPAQUE_MARKER {
            clear_dir(&parent)?;
            continue;
        }

        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_entry(&parent.join(target))?;
            continue;
        }

        // Directories merge; anything else replaces the existing entry,
        // whatever its type.
        let out = dest.join(&path);
        let is_dir = entry.header().entry_type().is_dir();
        if !is_dir && out.symlink_metadata().is_ok() {
            remove_entry(&out)?;
        } else if is_dir && out.symlink_metadata().map(|m| !m.is_dir()).unwrap_or(false) {
            remove_entry(&out)?;
        }

        entry
            .unpack_in(dest)
            .map_err(|e| FaasError::Extraction(format!("unpack {}: {e}", path.display())))?;
    }

    Ok(())
}

/// Layers may be stored gzip-compressed or plain; sniff the magic bytes.
fn open_layer(layer_path: &Path) -> FaasResult<Box<dyn Read>> {
    let mut magic = [0u8; 2];
    let mut probe = fs::File::open(layer_path)
        .map_err(|e| FaasError::InvalidInput(format!("layer {}: {e}", layer_path.display())))?;
    let n = probe.read(&mut magic).unwrap_or(0);

    let file = fs::File::open(layer_path)
        .map_err(|e| FaasError::InvalidInput(format!("layer {}: {e}", layer_path.display())))?;

    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn remove_entry(path: &Path) -> FaasResult<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .map_err(|e| FaasError::Extraction(format!("whiteout {}: {e}", path.display()))),
        Ok(_) => fs::remove_file(path)
            .map_err(|e| FaasError::Extraction(format!("whiteout {}: {e}", path.display()))),
        Err(_) => Ok(()),
    }
}

fn clear_dir(dir: &Path) -> FaasResult<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    let entries = fs::read_dir(dir)
        .map_err(|e| FaasError::Extraction(format!("opaque dir {}: {e}", dir.display())))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| FaasError::Extraction(format!("opaque dir {}: {e}", dir.display())))?;
        remove_entry(&entry.path())?;
    }

    Ok(())
}
