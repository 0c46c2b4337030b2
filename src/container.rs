//! Containers materialized directly from an imported filesystem tarball.
//!
//! A container lives in `containers/<id>/` with:
//! - `ROOT/`: the unpacked filesystem
//! - `container.json`: layer metadata the container was created from
//! - `imagerepo.name`: the `repo:tag` it is attributed to

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::archive::{CommandRunner, Extractor};
use crate::repository::ContainerStore;
use crate::unique;

// A container being cloned is attributed here until its own `imagerepo.name` lands.
const CLONING_REPO: &str = "CLONING";
const CLONING_TAG: &str = "inprogress";

pub struct ContainerStructure<'a, S: ContainerStore> {
    store: &'a S,
}

impl<'a, S: ContainerStore> ContainerStructure<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Creates a new container whose root filesystem is `layer_file` unpacked.
    ///
    /// Returns the container id. When unpacking fails the partially built container
    /// directory is left for the caller to inspect or remove.
    pub fn create_fromlayer<C: CommandRunner>(
        &self,
        extractor: &Extractor<C>,
        imagerepo: &str,
        tag: &str,
        layer_file: &Path,
        container_json: &Value,
    ) -> Result<String> {
        let container_id = unique::container_id();
        let container_dir = self.store.setup_container(imagerepo, tag, &container_id)?;

        let json = serde_json::to_string(container_json)?;
        fs::write(container_dir.join("container.json"), json)
            .context("Failed to write container.json")?;

        let rootdir = container_dir.join("ROOT");
        fs::create_dir_all(&rootdir)
            .with_context(|| format!("Failed to create {}", rootdir.display()))?;

        extractor
            .extract(layer_file, &rootdir)
            .with_context(|| format!("Failed to unpack {} into container {}", layer_file.display(), container_id))?;

        Ok(container_id)
    }

    /// Restores a container exported as a tarball of its directory.
    ///
    /// The tarball carries its own `container.json`, `imagerepo.name` and `ROOT/`.
    pub fn clone_fromfile<C: CommandRunner>(&self, extractor: &Extractor<C>, clone_file: &Path) -> Result<String> {
        let container_id = unique::container_id();
        let container_dir = self.store.setup_container(CLONING_REPO, CLONING_TAG, &container_id)?;

        extractor
            .extract(clone_file, &container_dir)
            .with_context(|| format!("Failed to restore container clone from {}", clone_file.display()))?;

        Ok(container_id)
    }

    /// Copies an existing container into a new one and returns the new id.
    pub fn clone_container(&self, container: &str) -> Result<String> {
        let source_dir = self
            .store
            .cd_container(container)
            .ok_or_else(|| anyhow!("Source container not found: {}", container))?;

        let container_id = unique::container_id();
        let dest_dir = self.store.setup_container(CLONING_REPO, CLONING_TAG, &container_id)?;
        copy_dir_recursive(&source_dir, &dest_dir)
            .with_context(|| format!("Failed to clone container {}", container))?;

        Ok(container_id)
    }
}

/// Recursively copies `src` into `dst`, recreating symlinks instead of following them.
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("Failed to create directory {}", dst.display()))?;

    for entry in fs::read_dir(src).with_context(|| format!("Failed to read directory {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if fs::symlink_metadata(&dst_path).is_ok() {
                fs::remove_file(&dst_path)?;
            }
            symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).with_context(|| {
                format!("Failed to copy {} to {}", src_path.display(), dst_path.display())
            })?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("symlinks are not supported on this platform: {}", link.display()),
    ))
}
