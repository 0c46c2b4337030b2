//! Import and load of local image tarballs into a [`Repository`].
//!
//! Every public operation reports failure through its return value (`false`, `None`
//! or an empty list) after logging the cause through the [`Notifier`].

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

use crate::archive::{CommandRunner, Extractor, ProcessRunner};
use crate::config::Config;
use crate::container::ContainerStructure;
use crate::host::HostInfo;
use crate::layer::{self, FileMover, FsMover, Placement};
use crate::metadata::{ContainerMeta, DEFAULT_COMMENT};
use crate::notifier::Notifier;
use crate::repository::{ContainerStore, LocalRepository, Repository, VERSION_V1, VERSION_V2};
use crate::structure::{self, ImageDirKind, ImageStructure, OciImage};
use crate::unique;

const ANCESTRY: &str = "ancestry";
const MANIFEST: &str = "manifest";

pub struct LocalFileApi<R: Repository, C: CommandRunner = ProcessRunner> {
    repo: R,
    extractor: Extractor<C>,
    mover: Box<dyn FileMover>,
    host: HostInfo,
    notifier: Notifier,
    move_tarball: bool,
    register_copied_layers: bool,
}

impl LocalFileApi<LocalRepository, ProcessRunner> {
    /// Opens (creating when needed) the repository under `config.topdir`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let repo = LocalRepository::new(&config.topdir);
        repo.setup()?;
        Ok(Self::new(repo, ProcessRunner, config))
    }
}

impl<R: Repository, C: CommandRunner> LocalFileApi<R, C> {
    pub fn new(repo: R, runner: C, config: &Config) -> Self {
        Self {
            repo,
            extractor: Extractor::new(runner, config),
            mover: Box::new(FsMover),
            host: HostInfo::new(),
            notifier: Notifier::new(config.verbosity),
            move_tarball: config.move_tarball,
            register_copied_layers: config.register_copied_layers,
        }
    }

    /// Replaces how layer files are renamed and copied into the repository.
    pub fn with_file_mover<M: FileMover + 'static>(mut self, mover: M) -> Self {
        self.mover = Box::new(mover);
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn repository_mut(&mut self) -> &mut R {
        &mut self.repo
    }

    pub fn extractor(&self) -> &Extractor<C> {
        &self.extractor
    }

    /// Moves a layer blob or its json into the layers directory and links it into
    /// the current tag.
    ///
    /// The id is `layerid` when given, else derived from the file name. A file that
    /// only could be copied is left unregistered unless `register_copied_layers` is set.
    pub fn move_layer_to_repo(&mut self, filepath: &Path, layerid: &str) -> bool {
        if filepath.as_os_str().is_empty() && layerid.is_empty() {
            return false;
        }

        let Some(layer_id) = layer::effective_layer_id(filepath, layerid) else {
            self.notifier
                .error(&format!("Cannot derive a layer id from {}", filepath.display()));
            return false;
        };
        let target = layer::layer_destination(self.repo.layersdir(), filepath, &layer_id);

        match layer::place_file(self.mover.as_ref(), filepath, &target) {
            Placement::Renamed => self.register_layer(&target),
            Placement::Copied if self.register_copied_layers => self.register_layer(&target),
            Placement::Copied => {
                self.notifier.warn(&format!(
                    "Layer {} was copied instead of moved and is not registered",
                    target.display()
                ));
                false
            }
            Placement::Failed => {
                self.notifier.error(&format!(
                    "Failed to move {} to {}",
                    filepath.display(),
                    target.display()
                ));
                false
            }
        }
    }

    /// Places a layer file of an archive being loaded. A file already moved into
    /// the layers directory by an earlier image of the same archive is linked again.
    fn place_archive_layer(&mut self, filepath: &Path, layer_id: &str) -> bool {
        let target = layer::layer_destination(self.repo.layersdir(), filepath, layer_id);
        if !filepath.exists() && target.exists() {
            self.notifier
                .debug(&format!("Layer {} already in repository", target.display()));
            return self.register_layer(&target);
        }
        self.move_layer_to_repo(filepath, layer_id)
    }

    fn register_layer(&mut self, layer_file: &Path) -> bool {
        match self.repo.add_image_layer(layer_file) {
            Ok(()) => true,
            Err(e) => {
                self.notifier.error(&format!("{:#}", e));
                false
            }
        }
    }

    /// Metadata for a layer already stored as `<layers>/<layer_id>.layer`.
    pub fn create_container_meta(&self, layer_id: &str, comment: &str) -> ContainerMeta {
        let layer_file = layer::layers_blob(self.repo.layersdir(), layer_id);
        let size = fs::metadata(&layer_file).map(|m| m.len()).ok();
        ContainerMeta::for_layer(layer_id, comment, &self.host, size)
    }

    /// Unpacks `tarfile` into `destdir`. Whatever was extracted before a failure stays.
    pub fn untar_saved_container(&self, tarfile: &Path, destdir: &Path) -> bool {
        match self.extractor.extract(tarfile, destdir) {
            Ok(()) => true,
            Err(e) => {
                self.notifier.error(&format!("{:#}", e));
                false
            }
        }
    }

    /// Imports a flat filesystem tarball as a single layer image `imagerepo:tag`.
    ///
    /// Returns the new layer id, or `None` when the tarball is missing, the tag
    /// already exists or any repository step fails.
    pub fn import_toimage(&mut self, tarfile: &Path, imagerepo: &str, tag: &str) -> Option<String> {
        if !tarfile.exists() {
            self.notifier
                .error(&format!("Tar file does not exist: {}", tarfile.display()));
            return None;
        }

        if let Err(e) = self.repo.setup_imagerepo(imagerepo) {
            self.notifier.error(&format!("{:#}", e));
            return None;
        }
        if self.repo.cd_imagerepo(imagerepo, tag).is_some() {
            self.notifier
                .info(&format!("Tag already exists in repo: {}:{}", imagerepo, tag));
            return None;
        }

        match self.import_layer(tarfile, tag) {
            Ok(layer_id) => {
                self.notifier
                    .info(&format!("Imported {} as layer {}", tarfile.display(), layer_id));
                Some(layer_id)
            }
            Err(e) => {
                self.notifier.error(&format!("{:#}", e));
                None
            }
        }
    }

    fn import_layer(&mut self, tarfile: &Path, tag: &str) -> Result<String> {
        self.repo
            .setup_tag(tag)
            .with_context(|| format!("Failed to setup tag {}", tag))?;
        self.repo
            .set_version(VERSION_V1)
            .context("Failed to set repository version")?;

        let layer_id = unique::layer_v1();
        let layer_file = layer::layers_blob(self.repo.layersdir(), &layer_id);
        let json_file = layer::layers_json(self.repo.layersdir(), &layer_id);

        if self.move_tarball {
            if let Err(e) = self.mover.rename(tarfile, &layer_file) {
                self.notifier
                    .debug(&format!("Cannot move {} ({}), copying", tarfile.display(), e));
            }
        }
        if !layer_file.exists()
            && layer::copy_file(self.mover.as_ref(), tarfile, &layer_file) == Placement::Failed
        {
            bail!("Failed to move or copy {}", tarfile.display());
        }

        self.repo.add_image_layer(&layer_file)?;
        self.repo.save_json(Path::new(ANCESTRY), &json!([layer_id]))?;
        let container_json = self.create_container_meta(&layer_id, DEFAULT_COMMENT);
        self.repo.save_json(&json_file, &container_json.to_json())?;
        self.repo.add_image_layer(&json_file)?;

        Ok(layer_id)
    }

    /// Loads `imagerepo:tag` from a parsed archive into the repository.
    ///
    /// Returns the placed layer ids, newest first, or an empty list when the tag
    /// already exists or setting up the tag fails.
    pub fn load_image(&mut self, structure: &ImageStructure, imagerepo: &str, tag: &str) -> Vec<String> {
        self.load_image_as(structure, imagerepo, imagerepo, tag)
    }

    fn load_image_as(
        &mut self,
        structure: &ImageStructure,
        source_repo: &str,
        imagerepo: &str,
        tag: &str,
    ) -> Vec<String> {
        if !self.select_new_tag(imagerepo, tag, VERSION_V1) {
            return Vec::new();
        }
        self.load_layers(structure, source_repo, tag)
    }

    /// Creates and selects `imagerepo:tag` with a version marker. `false` when the
    /// tag already exists or a step fails.
    fn select_new_tag(&mut self, imagerepo: &str, tag: &str, version: &str) -> bool {
        if self.repo.cd_imagerepo(imagerepo, tag).is_some() {
            self.notifier
                .info(&format!("Repository and tag already exist: {}:{}", imagerepo, tag));
            return false;
        }
        match self.prepare_tag(imagerepo, tag, version) {
            Ok(()) => true,
            Err(e) => {
                self.notifier.error(&format!("{:#}", e));
                false
            }
        }
    }

    fn prepare_tag(&mut self, imagerepo: &str, tag: &str, version: &str) -> Result<()> {
        self.repo
            .setup_imagerepo(imagerepo)
            .with_context(|| format!("Failed to setup image repository {}", imagerepo))?;
        self.repo
            .setup_tag(tag)
            .with_context(|| format!("Failed to setup tag {}", tag))?;
        self.repo
            .set_version(version)
            .context("Failed to set repository version")?;
        Ok(())
    }

    /// Places the layers of `imagerepo:tag` into the tag selected by `load_image`.
    pub fn load_image_step2(&mut self, structure: &ImageStructure, imagerepo: &str, tag: &str) -> Vec<String> {
        self.load_layers(structure, imagerepo, tag)
    }

    fn load_layers(&mut self, structure: &ImageStructure, imagerepo: &str, tag: &str) -> Vec<String> {
        match self.place_image_layers(structure, imagerepo, tag) {
            Ok(ancestry) => ancestry,
            Err(e) => {
                self.notifier.error(&format!("{:#}", e));
                Vec::new()
            }
        }
    }

    fn place_image_layers(&mut self, structure: &ImageStructure, imagerepo: &str, tag: &str) -> Result<Vec<String>> {
        let top_layer_id = structure
            .top_layer_id(imagerepo, tag)
            .ok_or_else(|| anyhow!("Image {}:{} not found in archive", imagerepo, tag))?;
        let ancestry = structure.ancestry(&top_layer_id)?;
        let total = ancestry.len() as u64;
        let progress = self.notifier.create_progress_bar(total, "Placing layers");

        for (index, layer_id) in ancestry.iter().rev().enumerate() {
            let layer = structure
                .repolayers
                .get(layer_id)
                .ok_or_else(|| anyhow!("Layer {} not found in archive", layer_id))?;

            match (&layer.json_path, &layer.json) {
                (Some(json_path), _) => {
                    if !self.place_archive_layer(json_path, layer_id) {
                        bail!("Failed to place metadata of layer {}", layer_id);
                    }
                }
                (None, Some(json)) => {
                    let json_file = layer::layers_json(self.repo.layersdir(), layer_id);
                    self.repo.save_json(&json_file, json)?;
                    self.repo.add_image_layer(&json_file)?;
                }
                (None, None) => bail!("Layer {} has no metadata", layer_id),
            }

            let layer_path = layer
                .layer_path
                .as_ref()
                .ok_or_else(|| anyhow!("Layer {} has no layer.tar", layer_id))?;
            if !self.place_archive_layer(layer_path, layer_id) {
                bail!("Failed to place layer {}", layer_id);
            }

            if let Some(pb) = &progress {
                pb.inc(1);
            }
            self.notifier.progress(index as u64 + 1, total, "Placing layers");
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        self.repo.save_json(Path::new(ANCESTRY), &json!(ancestry))?;
        Ok(ancestry)
    }

    /// Loads one image of an OCI layout into a new `imagerepo:tag` marked `v2`.
    ///
    /// The config lands in `<layers>/<config>.json`, the blobs in `<layers>/<id>.layer`
    /// and the manifest in the tag. Returns the layer ids, newest first.
    pub fn load_oci_image(&mut self, image: &OciImage, imagerepo: &str, tag: &str) -> Vec<String> {
        if !self.select_new_tag(imagerepo, tag, VERSION_V2) {
            return Vec::new();
        }
        match self.place_oci_layers(image) {
            Ok(layer_ids) => layer_ids,
            Err(e) => {
                self.notifier.error(&format!("{:#}", e));
                Vec::new()
            }
        }
    }

    fn place_oci_layers(&mut self, image: &OciImage) -> Result<Vec<String>> {
        let config_content = fs::read_to_string(&image.config_path)
            .with_context(|| format!("Failed to read image config {}", image.config_path.display()))?;
        let config: Value = serde_json::from_str(&config_content)
            .with_context(|| format!("Failed to parse image config {}", image.config_path.display()))?;
        let config_file = layer::layers_json(self.repo.layersdir(), &image.config_id);
        self.repo.save_json(&config_file, &config)?;
        self.repo.add_image_layer(&config_file)?;

        let total = image.layers.len() as u64;
        let progress = self.notifier.create_progress_bar(total, "Placing layers");
        for (index, oci_layer) in image.layers.iter().enumerate() {
            if !self.place_archive_layer(&oci_layer.path, &oci_layer.id) {
                bail!("Failed to place layer {}", oci_layer.id);
            }
            if let Some(pb) = &progress {
                pb.inc(1);
            }
            self.notifier.progress(index as u64 + 1, total, "Placing layers");
        }
        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        self.repo.save_json(Path::new(MANIFEST), &image.manifest)?;
        Ok(image.layers.iter().rev().map(|l| l.id.clone()).collect())
    }

    /// Loads every image of a `docker save` tarball or OCI layout archive and returns
    /// the `repo:tag` names loaded. With `imagerepo` all tags are stored under that
    /// repository.
    pub fn load(&mut self, tarfile: &Path, imagerepo: Option<&str>) -> Vec<String> {
        if !tarfile.exists() {
            self.notifier
                .error(&format!("Tar file does not exist: {}", tarfile.display()));
            return Vec::new();
        }

        // Extract next to the layers so that placement is a rename, not a copy.
        let tmpdir = match tempfile::Builder::new()
            .prefix(".load-")
            .tempdir_in(self.repo.layersdir())
        {
            Ok(dir) => dir,
            Err(e) => {
                self.notifier
                    .error(&format!("Failed to create temporary directory: {}", e));
                return Vec::new();
            }
        };

        self.notifier.info(&format!("Extracting {}", tarfile.display()));
        if !self.untar_saved_container(tarfile, tmpdir.path()) {
            self.notifier
                .error(&format!("Failed to extract image: {}", tarfile.display()));
            return Vec::new();
        }

        let result = match structure::imagedir_type(tmpdir.path()) {
            Some(ImageDirKind::Oci) => self.load_oci_dir(tmpdir.path(), imagerepo),
            Some(ImageDirKind::Docker) => self.load_docker_dir(tmpdir.path(), imagerepo),
            None => Err(anyhow!("Not a docker or OCI saved image: {}", tarfile.display())),
        };

        match result {
            Ok(loaded) if loaded.is_empty() => {
                self.notifier
                    .error(&format!("No images loaded from {}", tarfile.display()));
                loaded
            }
            Ok(loaded) => loaded,
            Err(e) => {
                self.notifier.error(&format!("{:#}", e));
                Vec::new()
            }
        }
    }

    fn load_docker_dir(&mut self, dir: &Path, imagerepo: Option<&str>) -> Result<Vec<String>> {
        let structure = structure::load_structure(dir)?;
        let mut loaded = Vec::new();
        for (source_repo, tag) in structure.repo_tags() {
            let target_repo = imagerepo.unwrap_or(&source_repo);
            self.notifier.info(&format!("Loading {}:{}", target_repo, tag));
            if !self
                .load_image_as(&structure, &source_repo, target_repo, &tag)
                .is_empty()
            {
                loaded.push(format!("{}:{}", target_repo, tag));
            }
        }
        Ok(loaded)
    }

    fn load_oci_dir(&mut self, dir: &Path, imagerepo: Option<&str>) -> Result<Vec<String>> {
        let images = structure::load_oci_structure(dir)?;
        let mut loaded = Vec::new();
        for image in &images {
            let Some((target_repo, tag)) = image.target(imagerepo) else {
                self.notifier
                    .error("OCI image has no repository name; give one to load it");
                continue;
            };
            self.notifier.info(&format!("Loading {}:{}", target_repo, tag));
            if !self.load_oci_image(image, &target_repo, &tag).is_empty() {
                loaded.push(format!("{}:{}", target_repo, tag));
            }
        }
        Ok(loaded)
    }
}

impl<R: Repository + ContainerStore, C: CommandRunner> LocalFileApi<R, C> {
    /// Creates a container straight from a filesystem tarball, without an image.
    ///
    /// Returns the container id. An existing `container_name` is refused.
    pub fn import_tocontainer(
        &mut self,
        tarfile: &Path,
        imagerepo: &str,
        tag: &str,
        container_name: Option<&str>,
    ) -> Option<String> {
        if !tarfile.exists() {
            self.notifier
                .error(&format!("Tar file does not exist: {}", tarfile.display()));
            return None;
        }
        if !self.container_name_free(container_name) {
            return None;
        }

        let layer_id = unique::layer_v1();
        let size = fs::metadata(tarfile).map(|m| m.len()).ok();
        let container_json = ContainerMeta::for_layer(&layer_id, DEFAULT_COMMENT, &self.host, size);

        let container_id = match ContainerStructure::new(&self.repo).create_fromlayer(
            &self.extractor,
            imagerepo,
            tag,
            tarfile,
            &container_json.to_json(),
        ) {
            Ok(id) => id,
            Err(e) => {
                self.notifier.error(&format!("{:#}", e));
                return None;
            }
        };

        if let Some(name) = container_name {
            if let Err(e) = self.repo.set_container_name(&container_id, name) {
                self.notifier.warn(&format!("{:#}", e));
            }
        }
        self.notifier
            .info(&format!("Created container {}", container_id));
        Some(container_id)
    }

    /// Restores a container from a tarball of an exported container directory.
    ///
    /// Returns the new container id. An existing `container_name` is refused.
    pub fn import_clone(&mut self, tarfile: &Path, container_name: Option<&str>) -> Option<String> {
        if !tarfile.exists() {
            self.notifier
                .error(&format!("Tar file does not exist: {}", tarfile.display()));
            return None;
        }
        if !self.container_name_free(container_name) {
            return None;
        }

        let result = ContainerStructure::new(&self.repo).clone_fromfile(&self.extractor, tarfile);
        self.finish_clone(result, container_name)
    }

    /// Copies the container `container` (id or name) into a new container.
    ///
    /// Returns the new container id. An existing `container_name` is refused.
    pub fn clone_container(&mut self, container: &str, container_name: Option<&str>) -> Option<String> {
        if !self.container_name_free(container_name) {
            return None;
        }

        let result = ContainerStructure::new(&self.repo).clone_container(container);
        self.finish_clone(result, container_name)
    }

    fn container_name_free(&self, container_name: Option<&str>) -> bool {
        match container_name {
            Some(name) if self.repo.get_container_id(name).is_some() => {
                self.notifier
                    .error(&format!("Container name already exists: {}", name));
                false
            }
            _ => true,
        }
    }

    fn finish_clone(&mut self, result: Result<String>, container_name: Option<&str>) -> Option<String> {
        let container_id = match result {
            Ok(id) => id,
            Err(e) => {
                self.notifier.error(&format!("{:#}", e));
                return None;
            }
        };

        if let Some(name) = container_name {
            if let Err(e) = self.repo.set_container_name(&container_id, name) {
                self.notifier
                    .error(&format!("Invalid container name {}: {:#}", name, e));
                return None;
            }
        }
        self.notifier
            .info(&format!("Cloned into container {}", container_id));
        Some(container_id)
    }
}
