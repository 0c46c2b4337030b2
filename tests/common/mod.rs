//! Fixture archives shared by the integration tests.
#![allow(dead_code)]

use oci2local::config::{Config, ExtractorKind};
use oci2local::{LocalFileApi, LocalRepository, ProcessRunner};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tar_rs as tar;

pub fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

/// A flat root filesystem holding `etc/motd` and `bin/app`.
pub fn rootfs_bytes(motd: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "etc/motd", motd.as_bytes());
    append_file(&mut builder, "bin/app", b"#!/bin/sh\n");
    builder.into_inner().unwrap()
}

pub fn write_rootfs_tar(path: &Path) {
    fs::write(path, rootfs_bytes("hello\n")).unwrap();
}

/// A legacy `docker save` archive of `busybox:latest` with layers `base` <- `top`.
pub fn write_legacy_save(path: &Path) {
    let mut builder = tar::Builder::new(Vec::new());
    append_file(
        &mut builder,
        "repositories",
        json!({"busybox": {"latest": "top"}}).to_string().as_bytes(),
    );
    for (id, parent) in [("base", None), ("top", Some("base"))] {
        let mut layer_json = json!({"id": id, "os": "linux"});
        if let Some(parent) = parent {
            layer_json["parent"] = json!(parent);
        }
        append_file(&mut builder, &format!("{}/VERSION", id), b"1.0");
        append_file(&mut builder, &format!("{}/json", id), layer_json.to_string().as_bytes());
        append_file(&mut builder, &format!("{}/layer.tar", id), &rootfs_bytes(id));
    }
    fs::write(path, builder.into_inner().unwrap()).unwrap();
}

/// A `manifest.json` only archive of `app:1.0` whose layers are content addressed blobs.
pub fn write_manifest_save(path: &Path) {
    let mut builder = tar::Builder::new(Vec::new());
    let manifest = json!([{
        "Config": "blobs/sha256/cfg",
        "RepoTags": ["app:1.0"],
        "Layers": ["blobs/sha256/aaa1", "blobs/sha256/bbb2"]
    }]);
    let config = json!({
        "created": "2024-05-01T00:00:00Z",
        "architecture": "amd64",
        "os": "linux",
        "rootfs": {"type": "layers", "diff_ids": []}
    });
    append_file(&mut builder, "manifest.json", manifest.to_string().as_bytes());
    append_file(&mut builder, "blobs/sha256/cfg", config.to_string().as_bytes());
    append_file(&mut builder, "blobs/sha256/aaa1", &rootfs_bytes("one"));
    append_file(&mut builder, "blobs/sha256/bbb2", &rootfs_bytes("two"));
    fs::write(path, builder.into_inner().unwrap()).unwrap();
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Appends `data` under `blobs/sha256/` and returns its descriptor.
fn append_blob(builder: &mut tar::Builder<Vec<u8>>, media_type: &str, data: &[u8]) -> Value {
    let hex = sha256_hex(data);
    append_file(builder, &format!("blobs/sha256/{}", hex), data);
    json!({
        "mediaType": media_type,
        "digest": format!("sha256:{}", hex),
        "size": data.len()
    })
}

/// An OCI layout archive of `docker.io/library/busybox:1.36` with two layers.
///
/// Returns the layer digests (hex), oldest first.
pub fn write_oci_save(path: &Path) -> Vec<String> {
    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "oci-layout", br#"{"imageLayoutVersion": "1.0.0"}"#);

    let config = json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": {"type": "layers", "diff_ids": []}
    });
    let config_desc = append_blob(
        &mut builder,
        "application/vnd.oci.image.config.v1+json",
        config.to_string().as_bytes(),
    );
    let layer_descs: Vec<Value> = ["one", "two"]
        .iter()
        .map(|motd| append_blob(&mut builder, "application/vnd.oci.image.layer.v1.tar", &rootfs_bytes(motd)))
        .collect();
    let layer_hexes = layer_descs
        .iter()
        .map(|d| d["digest"].as_str().unwrap().trim_start_matches("sha256:").to_string())
        .collect();

    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": config_desc,
        "layers": layer_descs
    });
    let mut manifest_desc = append_blob(
        &mut builder,
        "application/vnd.oci.image.manifest.v1+json",
        manifest.to_string().as_bytes(),
    );
    manifest_desc["annotations"] = json!({
        "io.containerd.image.name": "docker.io/library/busybox:1.36",
        "org.opencontainers.image.ref.name": "1.36"
    });

    let index = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [manifest_desc]
    });
    append_file(&mut builder, "index.json", index.to_string().as_bytes());
    fs::write(path, builder.into_inner().unwrap()).unwrap();
    layer_hexes
}

pub fn builtin_config(topdir: &Path) -> Config {
    Config {
        extractor: ExtractorKind::Builtin,
        ..Config::default()
    }
    .with_topdir(topdir)
}

pub fn local_api(topdir: &Path) -> LocalFileApi<LocalRepository, ProcessRunner> {
    LocalFileApi::from_config(&builtin_config(topdir)).unwrap()
}
