//! Layer ids and placement of layer files into the repository.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const JSON_SUFFIX: &str = ".json";
const LAYER_TAR_SUFFIX: &str = ".layer.tar";
/// Suffix of layer blobs stored in the layers directory.
pub const LAYER_SUFFIX: &str = ".layer";

/// How a file reached its place in the layers directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Renamed,
    Copied,
    Failed,
}

/// Resolves the id a layer file is stored under.
///
/// An explicit `layerid` wins; otherwise the id comes from the file name with a
/// `.json` or `.layer.tar` suffix removed. Qualified ids (`sha256:abc`) keep the part
/// after the last colon. `None` when there is nothing to derive an id from.
pub fn effective_layer_id(filepath: &Path, layerid: &str) -> Option<String> {
    let raw = if !layerid.is_empty() {
        layerid
    } else {
        let name = filepath.file_name()?.to_str()?;
        name.strip_suffix(JSON_SUFFIX)
            .or_else(|| name.strip_suffix(LAYER_TAR_SUFFIX))
            .unwrap_or(name)
    };

    let id = raw.rsplit(':').next().unwrap_or(raw);
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// `<layersdir>/<id>.json` for metadata sidecars, `<layersdir>/<id>.layer` for blobs.
pub fn layer_destination(layersdir: &Path, filepath: &Path, layer_id: &str) -> PathBuf {
    if filepath.to_string_lossy().ends_with("json") {
        layers_json(layersdir, layer_id)
    } else {
        layers_blob(layersdir, layer_id)
    }
}

pub fn layers_blob(layersdir: &Path, layer_id: &str) -> PathBuf {
    layersdir.join(format!("{}{}", layer_id, LAYER_SUFFIX))
}

pub fn layers_json(layersdir: &Path, layer_id: &str) -> PathBuf {
    layersdir.join(format!("{}{}", layer_id, JSON_SUFFIX))
}

/// Filesystem moves used to place layer files; swapped out in tests.
pub trait FileMover {
    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()>;
    fn copy(&self, src: &Path, dst: &Path) -> io::Result<u64>;
}

/// Moves files with `std::fs`.
#[derive(Debug, Clone, Default)]
pub struct FsMover;

impl FileMover for FsMover {
    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        fs::rename(src, dst)
    }

    fn copy(&self, src: &Path, dst: &Path) -> io::Result<u64> {
        fs::copy(src, dst)
    }
}

/// Moves `src` to `dst`, copying when the rename is refused (cross-device, permissions).
///
/// The copy leaves `src` in place and is not atomic.
pub fn place_file(mover: &dyn FileMover, src: &Path, dst: &Path) -> Placement {
    match mover.rename(src, dst) {
        Ok(()) => Placement::Renamed,
        Err(e) => {
            log::debug!(
                "rename failed ({}), falling back to copy: {} -> {}",
                e,
                src.display(),
                dst.display()
            );
            copy_file(mover, src, dst)
        }
    }
}

/// Copies `src` to `dst` without attempting a rename.
pub fn copy_file(mover: &dyn FileMover, src: &Path, dst: &Path) -> Placement {
    match mover.copy(src, dst) {
        Ok(_) => Placement::Copied,
        Err(e) => {
            log::warn!("Failed to copy {} to {}: {}", src.display(), dst.display(), e);
            Placement::Failed
        }
    }
}
