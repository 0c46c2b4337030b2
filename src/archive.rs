//! Unpacking of saved images and container tarballs.
//!
//! The default path spawns the system `tar` through a [`CommandRunner`], so tests can
//! swap in a fake runner. [`extract_builtin`] does the same job in-process with the
//! `tar` crate for hosts without a usable `tar` binary. Both skip device nodes
//! (`dev/*`) and overlay whiteout markers (`.wh.*`), and neither restores ownership:
//! everything stays unprivileged.

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tar_rs as tar;

use crate::config::{Config, ExtractorKind};

/// Exit status and captured output of a finished process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

pub trait CommandRunner {
    /// Runs `program` to completion. `Err` only when it could not be started.
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs programs with `std::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute {} command: {:?}", program, args))?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Arguments for `tar` to unpack `tarfile` into `destdir` without privileges.
pub fn tar_extract_args(tarfile: &Path, destdir: &Path, verbose: bool) -> Vec<String> {
    let mut args = vec![
        "-C".to_string(),
        destdir.display().to_string(),
        "-x".to_string(),
        "--delay-directory-restore".to_string(),
    ];
    if verbose {
        args.push("-v".to_string());
    }
    args.extend(
        [
            "--one-file-system",
            "--no-same-owner",
            "--overwrite",
            "--exclude=dev/*",
            "--exclude=etc/udev/devices/*",
            "--no-same-permissions",
            "--exclude=.[wW][hH].*",
            "-f",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(tarfile.display().to_string());
    args
}

/// Unpacks archives the way the configuration asks for.
pub struct Extractor<C: CommandRunner = ProcessRunner> {
    runner: C,
    kind: ExtractorKind,
    tar_program: String,
    verbose: bool,
}

impl<C: CommandRunner> Extractor<C> {
    pub fn new(runner: C, config: &Config) -> Self {
        Self {
            runner,
            kind: config.extractor,
            tar_program: config.tar_program.clone(),
            verbose: config.verbose_extract,
        }
    }

    pub fn runner(&self) -> &C {
        &self.runner
    }

    /// Unpacks `tarfile` into an existing `destdir`. On failure whatever was already
    /// written stays in place.
    pub fn extract(&self, tarfile: &Path, destdir: &Path) -> Result<()> {
        match self.kind {
            ExtractorKind::External => {
                let args = tar_extract_args(tarfile, destdir, self.verbose);
                let output = self.runner.run(&self.tar_program, &args)?;
                if !output.success() {
                    bail!(
                        "{} exited with status {:?}: {}",
                        self.tar_program,
                        output.status,
                        output.stderr.trim()
                    );
                }
                Ok(())
            }
            ExtractorKind::Builtin => extract_builtin(tarfile, destdir),
        }
    }
}

/// Whether an archive member is left out of an unprivileged extraction.
fn is_excluded(rel_path: &Path) -> bool {
    if rel_path.starts_with("dev") && rel_path != Path::new("dev") {
        return true;
    }
    if rel_path.starts_with("etc/udev/devices") && rel_path != Path::new("etc/udev/devices") {
        return true;
    }
    rel_path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.get(..4))
        .map(|prefix| prefix.eq_ignore_ascii_case(".wh."))
        .unwrap_or(false)
}

/// Normalizes a path from a tar archive so it cannot escape the extraction root.
fn normalize_tar_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }

    out
}

fn open_archive(tar_path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(tar_path)
        .with_context(|| format!("Failed to open tar file: {}", tar_path.display()))?;

    let mut buf_reader = BufReader::new(file);
    let mut magic_bytes = [0u8; 2];
    let is_gzip = match buf_reader.read_exact(&mut magic_bytes) {
        Ok(()) => magic_bytes == [0x1f, 0x8b],
        Err(_) => false,
    };

    // Reopen the file since we consumed some bytes
    let file = File::open(tar_path)?;
    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

fn remove_existing(dest: &Path) {
    if let Ok(metadata) = fs::symlink_metadata(dest) {
        if metadata.is_dir() && !metadata.is_symlink() {
            fs::remove_dir_all(dest).ok();
        } else {
            fs::remove_file(dest).ok();
        }
    }
}

struct PendingHardlink {
    rel_dest: PathBuf,
    rel_target: PathBuf,
}

/// Fails when a symlink unpacked earlier would carry `rel_path` outside `root`.
///
/// `root` must be canonical. Only the parent directories are checked unless
/// `include_last` is set, since a member replaces whatever sits at its own path.
fn check_inside(root: &Path, rel_path: &Path, include_last: bool) -> Result<()> {
    let components: Vec<Component> = rel_path.components().collect();
    let checked = if include_last {
        components.len()
    } else {
        components.len().saturating_sub(1)
    };

    let mut current = root.to_path_buf();
    for comp in &components[..checked] {
        current.push(comp);
        let is_symlink = fs::symlink_metadata(&current)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            continue;
        }
        let resolved = fs::canonicalize(&current)
            .with_context(|| format!("Dangling symlink in member path: {}", rel_path.display()))?;
        if !resolved.starts_with(root) {
            bail!(
                "Member {} resolves outside the extraction directory",
                rel_path.display()
            );
        }
    }
    Ok(())
}

/// Unpacks a plain or gzipped tar archive into `destdir` in-process.
///
/// Members that fail are logged and skipped; the ones already written stay in place
/// and the call reports an error naming how many members were lost.
pub fn extract_builtin(tar_path: &Path, destdir: &Path) -> Result<()> {
    let mut archive = open_archive(tar_path)?;
    fs::create_dir_all(destdir)
        .with_context(|| format!("Failed to create directory: {}", destdir.display()))?;
    let destdir = &fs::canonicalize(destdir)
        .with_context(|| format!("Failed to resolve directory: {}", destdir.display()))?;

    let mut pending_hardlinks = Vec::new();
    let mut failures = 0usize;

    for entry_result in archive.entries()? {
        let mut entry = entry_result.context("Failed to read tar entry")?;
        let rel_path = normalize_tar_path(&entry.path().context("Failed to get entry path")?);
        if rel_path.as_os_str().is_empty() || is_excluded(&rel_path) {
            continue;
        }

        if let Err(e) = check_inside(destdir, &rel_path, false) {
            log::warn!("{:#}", e);
            failures += 1;
            continue;
        }

        let dest = destdir.join(&rel_path);
        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                log::warn!("Failed to create directory {}: {}", parent.display(), e);
                failures += 1;
                continue;
            }
        }

        let header = entry.header();
        let entry_type = header.entry_type();
        let mode = header.mode().ok();

        let result: Result<()> = match entry_type {
            tar::EntryType::Directory => {
                if fs::symlink_metadata(&dest).map(|m| !m.is_dir()).unwrap_or(false) {
                    remove_existing(&dest);
                }
                fs::create_dir_all(&dest)
                    .with_context(|| format!("Failed to create directory: {}", dest.display()))
                    .map(|_| set_mode(&dest, mode.unwrap_or(0o755) | 0o700))
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                remove_existing(&dest);
                File::create(&dest)
                    .and_then(|mut out| std::io::copy(&mut entry, &mut out))
                    .with_context(|| format!("Failed to write file: {}", dest.display()))
                    .map(|_| {
                        if let Some(mode) = mode {
                            set_mode(&dest, mode | 0o600);
                        }
                    })
            }
            tar::EntryType::Symlink => match header.link_name() {
                Ok(Some(link_name)) => {
                    remove_existing(&dest);
                    symlink(&link_name, &dest)
                        .with_context(|| format!("Failed to create symlink: {}", dest.display()))
                }
                _ => Err(anyhow!("Symlink without target: {}", dest.display())),
            },
            tar::EntryType::Link => match header.link_name() {
                Ok(Some(link_name)) => {
                    pending_hardlinks.push(PendingHardlink {
                        rel_dest: rel_path.clone(),
                        rel_target: normalize_tar_path(&link_name),
                    });
                    Ok(())
                }
                _ => Err(anyhow!("Hardlink without target: {}", dest.display())),
            },
            _ => {
                // Device nodes and fifos need privileges we do not assume.
                log::debug!("Skipping unsupported entry type {:?}: {}", entry_type, rel_path.display());
                Ok(())
            }
        };

        if let Err(e) = result {
            log::warn!("{:#}", e);
            failures += 1;
        }
    }

    for hardlink in pending_hardlinks {
        let target = destdir.join(&hardlink.rel_target);
        let dest = destdir.join(&hardlink.rel_dest);
        let result = check_inside(destdir, &hardlink.rel_target, true)
            .and_then(|_| check_inside(destdir, &hardlink.rel_dest, false))
            .and_then(|_| link_or_copy(&target, &dest));
        if let Err(e) = result {
            log::warn!(
                "Skipping hardlink {} -> {}: {:#}",
                dest.display(),
                target.display(),
                e
            );
            failures += 1;
        }
    }

    if failures > 0 {
        return Err(anyhow!(
            "{} member(s) of {} could not be extracted",
            failures,
            tar_path.display()
        ));
    }
    Ok(())
}

fn link_or_copy(target: &Path, dest: &Path) -> Result<()> {
    if !target.exists() {
        return Err(anyhow!("hardlink target missing: {}", target.display()));
    }
    remove_existing(dest);
    if let Err(e) = fs::hard_link(target, dest) {
        log::debug!("hardlink failed ({}), falling back to copy: {}", e, dest.display());
        fs::copy(target, dest)
            .with_context(|| format!("Failed to copy {} to {}", target.display(), dest.display()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)) {
        log::debug!("Failed to set permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }

    fn write_fixture(path: &Path) {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "etc/hostname", b"box\n");
        append_file(&mut builder, "dev/null", b"");
        append_file(&mut builder, "var/.wh.cache", b"");
        append_file(&mut builder, "usr/bin/tool", b"#!/bin/sh\n");

        let mut link = tar::Header::new_gnu();
        link.set_size(0);
        link.set_entry_type(tar::EntryType::Link);
        link.set_mode(0o644);
        builder.append_link(&mut link, "usr/bin/tool2", "usr/bin/tool").unwrap();

        let mut sym = tar::Header::new_gnu();
        sym.set_size(0);
        sym.set_entry_type(tar::EntryType::Symlink);
        sym.set_mode(0o777);
        builder.append_link(&mut sym, "bin", "usr/bin").unwrap();

        fs::write(path, builder.into_inner().unwrap()).unwrap();
    }

    #[test]
    fn test_tar_extract_args() {
        let args = tar_extract_args(Path::new("/tmp/c.tar"), Path::new("/tmp/root"), false);
        assert_eq!(&args[..3], &["-C", "/tmp/root", "-x"]);
        assert!(args.contains(&"--exclude=dev/*".to_string()));
        assert!(args.contains(&"--no-same-owner".to_string()));
        assert!(!args.contains(&"-v".to_string()));
        assert_eq!(&args[args.len() - 2..], &["-f", "/tmp/c.tar"]);

        let verbose = tar_extract_args(Path::new("c.tar"), Path::new("root"), true);
        assert!(verbose.contains(&"-v".to_string()));
    }

    struct FakeRunner {
        status: Option<i32>,
        calls: std::cell::RefCell<Vec<(String, Vec<String>)>>,
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            self.calls.borrow_mut().push((program.to_string(), args.to_vec()));
            Ok(CommandOutput {
                status: self.status,
                stdout: String::new(),
                stderr: "tar: something went wrong".to_string(),
            })
        }
    }

    fn fake(status: Option<i32>) -> FakeRunner {
        FakeRunner {
            status,
            calls: std::cell::RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn test_external_extractor_status() {
        let config = Config::default();
        let ok = Extractor::new(fake(Some(0)), &config);
        assert!(ok.extract(Path::new("c.tar"), Path::new("root")).is_ok());
        let calls = ok.runner().calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "tar");
        assert!(calls[0].1.contains(&"--exclude=dev/*".to_string()));

        let failed = Extractor::new(fake(Some(2)), &config);
        let err = failed.extract(Path::new("c.tar"), Path::new("root")).unwrap_err();
        assert!(format!("{:#}", err).contains("something went wrong"));

        let killed = Extractor::new(fake(None), &config);
        assert!(killed.extract(Path::new("c.tar"), Path::new("root")).is_err());
    }

    #[test]
    fn test_is_excluded() {
        assert!(is_excluded(Path::new("dev/null")));
        assert!(is_excluded(Path::new("dev/pts/0")));
        assert!(!is_excluded(Path::new("dev")));
        assert!(!is_excluded(Path::new("devices/x")));
        assert!(is_excluded(Path::new("etc/udev/devices/tty")));
        assert!(is_excluded(Path::new("var/.wh.cache")));
        assert!(is_excluded(Path::new(".WH..wh..opq")));
        assert!(!is_excluded(Path::new("etc/passwd")));
    }

    #[test]
    fn test_normalize_tar_path() {
        assert_eq!(normalize_tar_path(Path::new("./etc/passwd")), PathBuf::from("etc/passwd"));
        assert_eq!(normalize_tar_path(Path::new("/abs/file")), PathBuf::from("abs/file"));
        assert_eq!(normalize_tar_path(Path::new("../../etc/x")), PathBuf::from("etc/x"));
    }

    #[test]
    fn test_extract_builtin() {
        let dir = tempdir().unwrap();
        let tarball = dir.path().join("container.tar");
        write_fixture(&tarball);
        let root = dir.path().join("ROOT");

        extract_builtin(&tarball, &root).unwrap();

        assert_eq!(fs::read(root.join("etc/hostname")).unwrap(), b"box\n");
        assert_eq!(fs::read(root.join("usr/bin/tool2")).unwrap(), b"#!/bin/sh\n");
        assert!(!root.join("dev/null").exists());
        assert!(!root.join("var/.wh.cache").exists());
        #[cfg(unix)]
        assert_eq!(fs::read_link(root.join("bin")).unwrap(), PathBuf::from("usr/bin"));
    }

    #[test]
    fn test_extract_builtin_gzip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let dir = tempdir().unwrap();
        let plain = dir.path().join("plain.tar");
        write_fixture(&plain);

        let gz = dir.path().join("container.tar.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&fs::read(&plain).unwrap()).unwrap();
        fs::write(&gz, encoder.finish().unwrap()).unwrap();

        let root = dir.path().join("ROOT");
        extract_builtin(&gz, &root).unwrap();
        assert!(root.join("etc/hostname").exists());
    }

    fn append_symlink(builder: &mut tar::Builder<Vec<u8>>, path: &str, target: &Path) {
        let mut sym = tar::Header::new_gnu();
        sym.set_size(0);
        sym.set_entry_type(tar::EntryType::Symlink);
        sym.set_mode(0o777);
        builder.append_link(&mut sym, path, target).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_builtin_refuses_writes_through_symlinks() {
        let dir = tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret"), b"secret").unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        append_symlink(&mut builder, "evil", &outside);
        append_file(&mut builder, "evil/pwned", b"owned");
        append_symlink(&mut builder, "leak", &outside.join("secret"));
        let mut link = tar::Header::new_gnu();
        link.set_size(0);
        link.set_entry_type(tar::EntryType::Link);
        link.set_mode(0o644);
        builder.append_link(&mut link, "copied", "leak").unwrap();
        append_file(&mut builder, "etc/ok", b"fine");
        let tarball = dir.path().join("evil.tar");
        fs::write(&tarball, builder.into_inner().unwrap()).unwrap();

        let root = dir.path().join("ROOT");
        assert!(extract_builtin(&tarball, &root).is_err());

        assert!(!outside.join("pwned").exists());
        assert!(fs::symlink_metadata(root.join("copied")).is_err());
        assert_eq!(fs::read(root.join("etc/ok")).unwrap(), b"fine");
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_builtin_allows_symlinks_inside_root() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "usr/lib/a.so", b"a");
        append_symlink(&mut builder, "lib", Path::new("usr/lib"));
        append_file(&mut builder, "lib/b.so", b"b");
        let dir = tempdir().unwrap();
        let tarball = dir.path().join("ok.tar");
        fs::write(&tarball, builder.into_inner().unwrap()).unwrap();

        let root = dir.path().join("ROOT");
        extract_builtin(&tarball, &root).unwrap();
        assert_eq!(fs::read(root.join("usr/lib/b.so")).unwrap(), b"b");
    }

    #[test]
    fn test_extract_builtin_missing_archive() {
        let dir = tempdir().unwrap();
        assert!(extract_builtin(&dir.path().join("nope.tar"), &dir.path().join("out")).is_err());
    }
}
