mod common;

use oci2local::repository::{ContainerStore, Repository};
use serde_json::Value;
use std::fs;
use tempfile::tempdir;

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_import_toimage_builds_tag() {
    let dir = tempdir().unwrap();
    let topdir = dir.path().join("top");
    let tarball = dir.path().join("rootfs.tar");
    common::write_rootfs_tar(&tarball);
    let tar_size = fs::metadata(&tarball).unwrap().len();

    let mut api = common::local_api(&topdir);
    let layer_id = api
        .import_toimage(&tarball, "myimage", "latest")
        .expect("import should succeed");

    let tagdir = topdir.join("repos/myimage/latest");
    assert!(tagdir.join("v1").exists());
    assert_eq!(read_json(&tagdir.join("ancestry")), serde_json::json!([layer_id]));

    // Both layer files are linked into the tag and resolve into layers/.
    let layer_link = tagdir.join(format!("{}.layer", layer_id));
    let json_link = tagdir.join(format!("{}.json", layer_id));
    assert!(fs::symlink_metadata(&layer_link).unwrap().file_type().is_symlink());
    assert_eq!(fs::metadata(&layer_link).unwrap().len(), tar_size);

    let meta = read_json(&json_link);
    assert_eq!(meta["id"], layer_id.as_str());
    assert_eq!(meta["size"], tar_size);
    assert_eq!(meta["comment"], "created by oci2local");
    assert!(meta["container_config"].is_object());

    assert!(!tarball.exists(), "tarball should have been moved");
}

#[test]
fn test_import_toimage_existing_tag_is_refused() {
    let dir = tempdir().unwrap();
    let topdir = dir.path().join("top");
    let first = dir.path().join("first.tar");
    let second = dir.path().join("second.tar");
    common::write_rootfs_tar(&first);
    common::write_rootfs_tar(&second);

    let mut api = common::local_api(&topdir);
    assert!(api.import_toimage(&first, "myimage", "latest").is_some());
    let layers_before = fs::read_dir(topdir.join("layers")).unwrap().count();

    assert_eq!(api.import_toimage(&second, "myimage", "latest"), None);
    assert_eq!(fs::read_dir(topdir.join("layers")).unwrap().count(), layers_before);
    assert!(second.exists());

    // A different tag of the same repository is fine.
    assert!(api.import_toimage(&second, "myimage", "v2").is_some());
}

#[test]
fn test_import_toimage_missing_tarball() {
    let dir = tempdir().unwrap();
    let topdir = dir.path().join("top");
    let mut api = common::local_api(&topdir);

    assert_eq!(api.import_toimage(&dir.path().join("nope.tar"), "myimage", "latest"), None);
    assert!(!topdir.join("repos/myimage").exists());
}

#[test]
fn test_import_toimage_invalid_tag() {
    let dir = tempdir().unwrap();
    let topdir = dir.path().join("top");
    let tarball = dir.path().join("rootfs.tar");
    common::write_rootfs_tar(&tarball);
    let mut api = common::local_api(&topdir);

    assert_eq!(api.import_toimage(&tarball, "myimage", "../escape"), None);
    assert!(tarball.exists());
}

#[test]
fn test_import_tocontainer() {
    let dir = tempdir().unwrap();
    let topdir = dir.path().join("top");
    let tarball = dir.path().join("rootfs.tar");
    common::write_rootfs_tar(&tarball);

    let mut api = common::local_api(&topdir);
    let container_id = api
        .import_tocontainer(&tarball, "myimage", "latest", Some("web"))
        .expect("container should be created");

    let repo = api.repository();
    assert_eq!(repo.get_container_id("web"), Some(container_id.clone()));

    let container_dir = repo.container_dir(&container_id);
    assert_eq!(fs::read_to_string(container_dir.join("ROOT/etc/motd")).unwrap(), "hello\n");
    assert_eq!(
        fs::read_to_string(container_dir.join("imagerepo.name")).unwrap(),
        "myimage:latest"
    );
    let meta = read_json(&container_dir.join("container.json"));
    assert_eq!(meta["size"], fs::metadata(&tarball).unwrap().len());
    assert!(tarball.exists(), "tarball is only read");

    // Names are unique.
    assert_eq!(api.import_tocontainer(&tarball, "myimage", "latest", Some("web")), None);
    assert!(api.import_tocontainer(&tarball, "myimage", "latest", None).is_some());
    assert!(api.repository().layersdir().read_dir().unwrap().next().is_none());
}

/// A tarball of an exported container directory.
fn write_container_export(path: &std::path::Path) {
    let mut builder = tar_rs::Builder::new(Vec::new());
    common::append_file(&mut builder, "container.json", br#"{"id": "exported"}"#);
    common::append_file(&mut builder, "imagerepo.name", b"busybox:latest");
    common::append_file(&mut builder, "ROOT/etc/motd", b"exported\n");
    fs::write(path, builder.into_inner().unwrap()).unwrap();
}

#[test]
fn test_import_clone() {
    let dir = tempdir().unwrap();
    let topdir = dir.path().join("top");
    let tarball = dir.path().join("container.tar");
    write_container_export(&tarball);

    let mut api = common::local_api(&topdir);
    assert_eq!(api.import_clone(&dir.path().join("nope.tar"), None), None);

    let container_id = api
        .import_clone(&tarball, Some("restored"))
        .expect("container should be restored");
    let repo = api.repository();
    assert_eq!(repo.get_container_id("restored"), Some(container_id.clone()));

    let container_dir = repo.container_dir(&container_id);
    assert_eq!(fs::read_to_string(container_dir.join("ROOT/etc/motd")).unwrap(), "exported\n");
    assert_eq!(
        fs::read_to_string(container_dir.join("imagerepo.name")).unwrap(),
        "busybox:latest"
    );
    assert_eq!(read_json(&container_dir.join("container.json"))["id"], "exported");

    // Names are unique.
    assert_eq!(api.import_clone(&tarball, Some("restored")), None);
    assert_eq!(api.import_clone(&tarball, Some("bad/name")), None);
}

#[test]
fn test_clone_container() {
    let dir = tempdir().unwrap();
    let topdir = dir.path().join("top");
    let tarball = dir.path().join("rootfs.tar");
    common::write_rootfs_tar(&tarball);

    let mut api = common::local_api(&topdir);
    let source_id = api
        .import_tocontainer(&tarball, "myimage", "latest", Some("source"))
        .unwrap();

    assert_eq!(api.clone_container("missing", None), None);
    assert_eq!(api.clone_container("source", Some("source")), None);

    let clone_id = api
        .clone_container("source", Some("copy"))
        .expect("container should be cloned");
    assert_ne!(clone_id, source_id);

    let repo = api.repository();
    assert_eq!(repo.get_container_id("copy"), Some(clone_id.clone()));
    let clone_dir = repo.container_dir(&clone_id);
    assert_eq!(fs::read_to_string(clone_dir.join("ROOT/etc/motd")).unwrap(), "hello\n");
    assert_eq!(
        fs::read_to_string(clone_dir.join("imagerepo.name")).unwrap(),
        "myimage:latest"
    );
    assert!(repo.container_dir(&source_id).join("ROOT/etc/motd").exists());
}
