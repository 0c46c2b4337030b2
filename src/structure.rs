//! Parse an unpacked `docker save` archive into an [`ImageStructure`].
//!
//! Two generations of the format are understood, often present side by side:
//! - the legacy v1 layout: a `repositories` file (repo → tag → top layer id) and one
//!   directory per layer holding `json` (with its `parent`) and `layer.tar`;
//! - the `manifest.json` layout: entries with `Config`, `RepoTags` and ordered
//!   `Layers` (oldest → newest). Layers stored as `blobs/sha256/<hex>` carry no legacy
//!   `json`; one is synthesized from the image configuration, chained by manifest order.
//!
//! OCI image layouts (`oci-layout`, `index.json`, `blobs/<alg>/<hex>`) are read by
//! [`load_oci_structure`] into one [`OciImage`] per manifest.

use anyhow::{anyhow, bail, Context, Result};
use oci_spec::image::{Descriptor, Digest, ImageIndex, ImageManifest, MediaType, ANNOTATION_REF_NAME};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDirKind {
    Docker,
    Oci,
}

/// Kind of an unpacked image directory. An `oci-layout` marker wins over
/// `manifest.json`, since newer `docker save` archives carry both.
pub fn imagedir_type(dir: &Path) -> Option<ImageDirKind> {
    if dir.join("oci-layout").exists() {
        Some(ImageDirKind::Oci)
    } else if dir.join("manifest.json").exists() || dir.join("repositories").exists() {
        Some(ImageDirKind::Docker)
    } else {
        None
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(default, rename = "RepoTags")]
    pub repo_tags: Option<Vec<String>>,
    #[serde(default, rename = "Layers")]
    pub layers: Vec<String>,
}

impl ManifestEntry {
    fn has_tag(&self, imagetag: &str) -> bool {
        self.repo_tags
            .as_ref()
            .map(|tags| tags.iter().any(|t| t == imagetag))
            .unwrap_or(false)
    }
}

/// One layer of the archive. `json_path` is `None` for synthesized metadata.
#[derive(Debug, Clone, Default)]
pub struct RepoLayer {
    pub json: Option<Value>,
    pub json_path: Option<PathBuf>,
    pub layer_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ImageStructure {
    pub repositories: BTreeMap<String, BTreeMap<String, String>>,
    pub manifest: Vec<ManifestEntry>,
    pub repolayers: BTreeMap<String, RepoLayer>,
}

/// Layer id for a manifest `Layers` entry: `<id>/layer.tar` → `<id>`,
/// `blobs/sha256/<hex>` → `<hex>`.
pub fn manifest_layer_id(layer_path: &str) -> Option<String> {
    let path = Path::new(layer_path);
    let id = if path.file_name()? == "layer.tar" {
        path.parent()?.file_name()?
    } else {
        path.file_name()?
    };
    let id = id.to_str()?;
    let id = id.strip_suffix(".tar").unwrap_or(id);
    (!id.is_empty()).then(|| id.to_string())
}

/// Splits `repo:tag`, keeping registry ports (`host:5000/app:1.0`) in the repository.
pub fn split_imagetag(imagetag: &str) -> Option<(String, String)> {
    let slash = imagetag.rfind('/').map(|i| i + 1).unwrap_or(0);
    let colon = imagetag[slash..].rfind(':')? + slash;
    let (repo, tag) = (&imagetag[..colon], &imagetag[colon + 1..]);
    if repo.is_empty() || tag.is_empty() {
        return None;
    }
    Some((repo.to_string(), tag.to_string()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn load_structure(dir: &Path) -> Result<ImageStructure> {
    let mut structure = ImageStructure::default();

    let repositories_path = dir.join("repositories");
    if repositories_path.exists() {
        structure.repositories = read_json(&repositories_path)?;
    }

    let manifest_path = dir.join("manifest.json");
    if manifest_path.exists() {
        structure.manifest = read_json(&manifest_path)?;
    }

    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let layer_dir = entry.path();
        let json_path = layer_dir.join("json");
        let layer_path = layer_dir.join("layer.tar");
        if !json_path.exists() && !layer_path.exists() {
            continue;
        }

        let id = entry.file_name().to_string_lossy().to_string();
        let json = if json_path.exists() {
            Some(read_json::<Value>(&json_path)?)
        } else {
            None
        };
        structure.repolayers.insert(
            id,
            RepoLayer {
                json,
                json_path: json_path.exists().then_some(json_path),
                layer_path: layer_path.exists().then_some(layer_path),
            },
        );
    }

    let manifest = structure.manifest.clone();
    for entry in &manifest {
        add_manifest_layers(dir, entry, &mut structure.repolayers)?;
    }

    Ok(structure)
}

/// Registers the blobs of a manifest entry and gives every layer lacking a legacy
/// `json` one built from the image configuration.
fn add_manifest_layers(
    dir: &Path,
    entry: &ManifestEntry,
    repolayers: &mut BTreeMap<String, RepoLayer>,
) -> Result<()> {
    let mut config: Option<oci_spec::image::ImageConfiguration> = None;
    let mut parent: Option<String> = None;

    for layer_ref in &entry.layers {
        let id = manifest_layer_id(layer_ref)
            .ok_or_else(|| anyhow!("Invalid layer reference in manifest.json: {}", layer_ref))?;
        let blob = dir.join(layer_ref);

        let layer = repolayers.entry(id.clone()).or_default();
        if layer.layer_path.is_none() && blob.exists() {
            layer.layer_path = Some(blob);
        }
        if layer.json.is_none() {
            if config.is_none() {
                config = Some(
                    read_json(&dir.join(&entry.config))
                        .context("Failed to parse image configuration")?,
                );
            }
            if let Some(config) = &config {
                let mut synthesized = json!({
                    "id": id,
                    "created": config.created().clone().unwrap_or_default(),
                    "architecture": config.architecture().to_string(),
                    "os": config.os().to_string(),
                });
                if let Some(parent) = &parent {
                    synthesized["parent"] = Value::String(parent.clone());
                }
                layer.json = Some(synthesized);
            }
        }
        parent = Some(id);
    }
    Ok(())
}

impl ImageStructure {
    /// Top layer of `imagerepo:tag`, from `repositories` or else from `manifest.json`.
    pub fn top_layer_id(&self, imagerepo: &str, tag: &str) -> Option<String> {
        if let Some(id) = self.repositories.get(imagerepo).and_then(|tags| tags.get(tag)) {
            return Some(id.clone());
        }

        let imagetag = format!("{}:{}", imagerepo, tag);
        self.manifest
            .iter()
            .find(|entry| entry.has_tag(&imagetag))
            .and_then(|entry| entry.layers.last())
            .and_then(|layer| manifest_layer_id(layer))
    }

    /// Layer ids from `top_layer_id` down to the base layer, following `parent`.
    pub fn ancestry(&self, top_layer_id: &str) -> Result<Vec<String>> {
        let mut ancestry = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(top_layer_id.to_string());

        while let Some(id) = current {
            if !seen.insert(id.clone()) {
                bail!("Layer parent chain loops at {}", id);
            }
            let layer = self
                .repolayers
                .get(&id)
                .ok_or_else(|| anyhow!("Layer {} not found in image", id))?;
            current = layer
                .json
                .as_ref()
                .and_then(|json| json["parent"].as_str())
                .filter(|parent| !parent.is_empty())
                .map(|parent| parent.to_string());
            ancestry.push(id);
        }

        Ok(ancestry)
    }

    /// Every `(imagerepo, tag)` the archive names.
    pub fn repo_tags(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        for (repo, tags) in &self.repositories {
            for tag in tags.keys() {
                out.push((repo.clone(), tag.clone()));
            }
        }
        for entry in &self.manifest {
            for imagetag in entry.repo_tags.iter().flatten() {
                if let Some(pair) = split_imagetag(imagetag) {
                    if !out.contains(&pair) {
                        out.push(pair);
                    }
                }
            }
        }
        out
    }
}

const CONTAINERD_IMAGE_NAME: &str = "io.containerd.image.name";
const DOCKER_REFERENCE_TYPE: &str = "vnd.docker.reference.type";

/// One image manifest of an OCI layout.
#[derive(Debug, Clone)]
pub struct OciImage {
    /// `(imagerepo, tag)` when the index annotations name a repository.
    pub name: Option<(String, String)>,
    /// Tag from `org.opencontainers.image.ref.name` when it names no repository.
    pub ref_tag: Option<String>,
    pub manifest: Value,
    pub config_id: String,
    pub config_path: PathBuf,
    /// Oldest first.
    pub layers: Vec<OciLayer>,
}

#[derive(Debug, Clone)]
pub struct OciLayer {
    pub id: String,
    pub path: PathBuf,
}

impl OciImage {
    /// `(imagerepo, tag)` to store the image under. `imagerepo` overrides the
    /// annotated repository; a bare ref tag needs it.
    pub fn target(&self, imagerepo: Option<&str>) -> Option<(String, String)> {
        match (&self.name, &self.ref_tag, imagerepo) {
            (Some((_, tag)), _, Some(repo)) => Some((repo.to_string(), tag.clone())),
            (Some(name), _, None) => Some(name.clone()),
            (None, Some(tag), Some(repo)) => Some((repo.to_string(), tag.clone())),
            (None, None, Some(repo)) => Some((repo.to_string(), "latest".to_string())),
            (None, _, None) => None,
        }
    }
}

pub fn blob_path(dir: &Path, digest: &Digest) -> PathBuf {
    dir.join("blobs")
        .join(digest.algorithm().to_string())
        .join(digest.digest())
}

/// Drops the implicit Docker Hub prefixes containerd writes into image names.
fn short_repo(repo: &str) -> String {
    repo.strip_prefix("docker.io/library/")
        .or_else(|| repo.strip_prefix("docker.io/"))
        .unwrap_or(repo)
        .to_string()
}

fn oci_image_name(annotations: Option<&HashMap<String, String>>) -> (Option<(String, String)>, Option<String>) {
    let Some(annotations) = annotations else {
        return (None, None);
    };
    let named = annotations
        .get(CONTAINERD_IMAGE_NAME)
        .or_else(|| annotations.get(ANNOTATION_REF_NAME))
        .and_then(|name| split_imagetag(name));
    match named {
        Some((repo, tag)) => (Some((short_repo(&repo), tag)), None),
        None => (None, annotations.get(ANNOTATION_REF_NAME).cloned()),
    }
}

/// Reads every image manifest reachable from `index.json`, following nested indexes.
pub fn load_oci_structure(dir: &Path) -> Result<Vec<OciImage>> {
    let index = ImageIndex::from_file(dir.join("index.json")).context("Failed to parse index.json")?;
    let mut images = Vec::new();
    collect_oci_images(dir, index.manifests(), None, &mut images)?;
    Ok(images)
}

fn collect_oci_images(
    dir: &Path,
    descriptors: &[Descriptor],
    inherited: Option<&HashMap<String, String>>,
    images: &mut Vec<OciImage>,
) -> Result<()> {
    for descriptor in descriptors {
        let annotations = descriptor.annotations().as_ref().or(inherited);
        if descriptor
            .annotations()
            .as_ref()
            .is_some_and(|a| a.contains_key(DOCKER_REFERENCE_TYPE))
        {
            continue;
        }

        let path = blob_path(dir, descriptor.digest());
        match descriptor.media_type() {
            MediaType::ImageIndex => {
                let nested = ImageIndex::from_file(&path)
                    .with_context(|| format!("Failed to parse index {}", path.display()))?;
                collect_oci_images(dir, nested.manifests(), annotations, images)?;
            }
            MediaType::ImageManifest => images.push(read_oci_image(dir, &path, annotations)?),
            other => log::debug!("Skipping {} entry in index.json", other),
        }
    }
    Ok(())
}

fn read_oci_image(
    dir: &Path,
    manifest_path: &Path,
    annotations: Option<&HashMap<String, String>>,
) -> Result<OciImage> {
    let manifest = ImageManifest::from_file(manifest_path)
        .with_context(|| format!("Failed to parse manifest {}", manifest_path.display()))?;
    let (name, ref_tag) = oci_image_name(annotations);
    let layers = manifest
        .layers()
        .iter()
        .map(|layer| OciLayer {
            id: layer.digest().digest().to_string(),
            path: blob_path(dir, layer.digest()),
        })
        .collect();

    Ok(OciImage {
        name,
        ref_tag,
        manifest: read_json(manifest_path)?,
        config_id: manifest.config().digest().digest().to_string(),
        config_path: blob_path(dir, manifest.config().digest()),
        layers,
    })
}
