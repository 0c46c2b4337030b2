//! On-disk local image repository.
//!
//! Layout under the repository root:
//! - `repos/<imagerepo>/<tag>/`: version marker (`v1`/`v2`), `ancestry` and other
//!   per-tag JSON, plus symlinks to the layers the tag is made of.
//! - `layers/`: layer blobs (`<id>.layer`) and metadata sidecars (`<id>.json`), shared
//!   by every image.
//! - `containers/<id>/`: containers created from imported layers; container names are
//!   symlinks next to them.
//!
//! [`Repository`] is the contract the import pipeline works against. It is stateful:
//! [`Repository::cd_imagerepo`], [`Repository::setup_imagerepo`] and
//! [`Repository::setup_tag`] move a cursor that the later calls operate on.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::path::{Component, Path, PathBuf};

pub const VERSION_V1: &str = "v1";
pub const VERSION_V2: &str = "v2";

pub trait Repository {
    /// Existing tag directory for `(imagerepo, tag)`, or `None`. Selects it when found.
    fn cd_imagerepo(&mut self, imagerepo: &str, tag: &str) -> Option<PathBuf>;

    /// Creates the image repository directory and selects it.
    /// Returns `true` when it was created, `false` when it already existed.
    fn setup_imagerepo(&mut self, imagerepo: &str) -> Result<bool>;

    /// Creates (or reuses) the tag directory under the selected image repository.
    fn setup_tag(&mut self, tag: &str) -> Result<PathBuf>;

    /// Records the metadata schema version of the selected tag.
    fn set_version(&mut self, version: &str) -> Result<()>;

    fn layersdir(&self) -> &Path;

    /// Links a layer file (blob or JSON sidecar) into the selected tag.
    fn add_image_layer(&mut self, layer_file: &Path) -> Result<()>;

    /// Writes `data` as JSON. Relative names land in the selected tag directory,
    /// absolute paths must be inside the repository.
    fn save_json(&mut self, name: &Path, data: &Value) -> Result<()>;
}

/// Storage for containers created from imported layers.
pub trait ContainerStore {
    /// Creates the directory of a new container and records which image it came from.
    fn setup_container(&self, imagerepo: &str, tag: &str, container_id: &str) -> Result<PathBuf>;

    /// Resolves a container name or id to the container id.
    fn get_container_id(&self, name: &str) -> Option<String>;

    fn set_container_name(&self, container_id: &str, name: &str) -> Result<()>;

    /// Directory of an existing container, by id or name.
    fn cd_container(&self, container: &str) -> Option<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct LocalRepository {
    topdir: PathBuf,
    reposdir: PathBuf,
    layersdir: PathBuf,
    containersdir: PathBuf,
    cur_repodir: Option<PathBuf>,
    cur_tagdir: Option<PathBuf>,
}

/// Splits a user supplied name into plain path components, refusing anything that
/// would leave the directory it is joined to.
fn relative_name(name: &str) -> Result<PathBuf> {
    let trimmed = name.trim_matches('/');
    if trimmed.is_empty() {
        bail!("Empty repository name");
    }

    let mut out = PathBuf::new();
    for comp in Path::new(trimmed).components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            _ => bail!("Invalid repository name: {}", name),
        }
    }
    Ok(out)
}

fn single_component(name: &str, what: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        bail!("Invalid {} name: {:?}", what, name);
    }
    Ok(())
}

impl LocalRepository {
    pub fn new<P: Into<PathBuf>>(topdir: P) -> Self {
        let topdir = topdir.into();
        Self {
            reposdir: topdir.join("repos"),
            layersdir: topdir.join("layers"),
            containersdir: topdir.join("containers"),
            topdir,
            cur_repodir: None,
            cur_tagdir: None,
        }
    }

    /// Creates the top-level directories of the repository.
    pub fn setup(&self) -> Result<()> {
        for dir in [&self.reposdir, &self.layersdir, &self.containersdir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn topdir(&self) -> &Path {
        &self.topdir
    }

    pub fn reposdir(&self) -> &Path {
        &self.reposdir
    }

    pub fn containersdir(&self) -> &Path {
        &self.containersdir
    }

    pub fn cur_tagdir(&self) -> Option<&Path> {
        self.cur_tagdir.as_deref()
    }

    fn tagdir(&self) -> Result<&Path> {
        self.cur_tagdir
            .as_deref()
            .ok_or_else(|| anyhow!("No image tag selected"))
    }

    /// Version marker of the selected tag, if any.
    pub fn version(&self) -> Option<&'static str> {
        let tagdir = self.cur_tagdir.as_deref()?;
        [VERSION_V1, VERSION_V2]
            .into_iter()
            .find(|v| tagdir.join(v).exists())
    }

    pub fn load_json(&self, name: &Path) -> Result<Value> {
        let path = self.json_path(name)?;
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn json_path(&self, name: &Path) -> Result<PathBuf> {
        if name.components().any(|c| c == Component::ParentDir) {
            bail!("Refusing a path with '..': {}", name.display());
        }
        if name.is_absolute() || name.starts_with(&self.topdir) {
            if !name.starts_with(&self.topdir) {
                bail!("Refusing to write outside the repository: {}", name.display());
            }
            Ok(name.to_path_buf())
        } else {
            Ok(self.tagdir()?.join(name))
        }
    }

    /// Link target for `file` as seen from `linkdir`: relative when both live in the
    /// repository, so the tree can be moved as a whole.
    fn link_target(&self, linkdir: &Path, file: &Path) -> PathBuf {
        match (linkdir.strip_prefix(&self.topdir), file.strip_prefix(&self.topdir)) {
            (Ok(from), Ok(to)) => {
                let mut target = PathBuf::new();
                for _ in from.components() {
                    target.push("..");
                }
                target.join(to)
            }
            _ => file.to_path_buf(),
        }
    }

    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.containersdir.join(container_id)
    }
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

impl Repository for LocalRepository {
    fn cd_imagerepo(&mut self, imagerepo: &str, tag: &str) -> Option<PathBuf> {
        if single_component(tag, "tag").is_err() {
            return None;
        }
        let repodir = self.reposdir.join(relative_name(imagerepo).ok()?);
        let tagdir = repodir.join(tag);
        if !tagdir.is_dir() {
            return None;
        }
        self.cur_repodir = Some(repodir);
        self.cur_tagdir = Some(tagdir.clone());
        Some(tagdir)
    }

    fn setup_imagerepo(&mut self, imagerepo: &str) -> Result<bool> {
        let repodir = self.reposdir.join(relative_name(imagerepo)?);
        self.cur_tagdir = None;
        if repodir.is_dir() {
            self.cur_repodir = Some(repodir);
            return Ok(false);
        }
        fs::create_dir_all(&repodir)
            .with_context(|| format!("Failed to create image repository: {}", repodir.display()))?;
        self.cur_repodir = Some(repodir);
        Ok(true)
    }

    fn setup_tag(&mut self, tag: &str) -> Result<PathBuf> {
        single_component(tag, "tag")?;
        let repodir = self
            .cur_repodir
            .as_ref()
            .ok_or_else(|| anyhow!("No image repository selected"))?;
        let tagdir = repodir.join(tag);
        fs::create_dir_all(&tagdir)
            .with_context(|| format!("Failed to create tag directory: {}", tagdir.display()))?;
        self.cur_tagdir = Some(tagdir.clone());
        Ok(tagdir)
    }

    fn set_version(&mut self, version: &str) -> Result<()> {
        let other = match version {
            VERSION_V1 => VERSION_V2,
            VERSION_V2 => VERSION_V1,
            _ => bail!("Unknown repository version: {}", version),
        };
        let tagdir = self.tagdir()?.to_path_buf();

        let other_marker = tagdir.join(other);
        if other_marker.exists() {
            // A lone marker belongs to an empty tag and can be replaced.
            let entries = fs::read_dir(&tagdir)?.count();
            if entries > 1 {
                bail!("Tag {} already holds a {} image", tagdir.display(), other);
            }
            fs::remove_file(&other_marker)?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(tagdir.join(version))
            .with_context(|| format!("Failed to write version marker in {}", tagdir.display()))?;
        Ok(())
    }

    fn layersdir(&self) -> &Path {
        &self.layersdir
    }

    fn add_image_layer(&mut self, layer_file: &Path) -> Result<()> {
        let tagdir = self.tagdir()?.to_path_buf();
        if !layer_file.exists() {
            bail!("Layer file does not exist: {}", layer_file.display());
        }
        let name = layer_file
            .file_name()
            .ok_or_else(|| anyhow!("Invalid layer file: {}", layer_file.display()))?;

        let link = tagdir.join(name);
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link)?;
        }
        let target = self.link_target(&tagdir, layer_file);
        symlink(&target, &link)
            .with_context(|| format!("Failed to link layer {} into {}", layer_file.display(), tagdir.display()))
    }

    fn save_json(&mut self, name: &Path, data: &Value) -> Result<()> {
        let path = self.json_path(name)?;
        let content = serde_json::to_string(data)?;
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
    }
}

impl ContainerStore for LocalRepository {
    fn setup_container(&self, imagerepo: &str, tag: &str, container_id: &str) -> Result<PathBuf> {
        single_component(container_id, "container")?;
        let dir = self.container_dir(container_id);
        if dir.exists() {
            bail!("Container already exists: {}", container_id);
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create container directory: {}", dir.display()))?;
        fs::write(dir.join("imagerepo.name"), format!("{}:{}", imagerepo, tag))
            .context("Failed to write imagerepo.name")?;
        Ok(dir)
    }

    fn get_container_id(&self, name: &str) -> Option<String> {
        if single_component(name, "container").is_err() {
            return None;
        }
        let path = self.containersdir.join(name);
        let meta = fs::symlink_metadata(&path).ok()?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&path).ok()?;
            let id = target.file_name()?.to_str()?.to_string();
            self.container_dir(&id).is_dir().then_some(id)
        } else if meta.is_dir() {
            Some(name.to_string())
        } else {
            None
        }
    }

    fn set_container_name(&self, container_id: &str, name: &str) -> Result<()> {
        single_component(name, "container")?;
        if !self.container_dir(container_id).is_dir() {
            bail!("Container does not exist: {}", container_id);
        }
        let link = self.containersdir.join(name);
        if fs::symlink_metadata(&link).is_ok() {
            bail!("Container name already in use: {}", name);
        }
        symlink(Path::new(container_id), &link)
            .with_context(|| format!("Failed to name container {} as {}", container_id, name))
    }

    fn cd_container(&self, container: &str) -> Option<PathBuf> {
        let container_id = self.get_container_id(container)?;
        let dir = self.container_dir(&container_id);
        dir.is_dir().then_some(dir)
    }
}
