//! Directory-backed [`Store`].

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tracing::{debug, info, warn};

use super::{
    ContainerOptions, ContainerRecord, ImageRecord, LayerRecord, MANIFEST_KEY, Store, layer_chain,
};
use crate::archive::{ApplyOptions, apply_layer_file, changes, decompressed_reader, write_layer};
use crate::idtools::IdMappings;
use crate::system::{FileLock, StoreLayout};
use crate::util::digest::{DigestingWriter, sha256_digest};
use crate::util::fs::{atomic_write, atomic_write_json, read_json};
use crate::util::random_id;

const CONTAINER_RECORD: &str = "container.json";
const IMAGE_RECORD: &str = "image.json";
const IMAGE_ROOTFS: &str = "rootfs";

#[derive(Debug)]
pub struct LocalStore {
    layout: StoreLayout,
}

impl LocalStore {
    /// Open (creating if needed) a store at the layout's roots.
    pub fn open(layout: StoreLayout) -> StevedoreResult<Self> {
        layout.prepare()?;
        debug!(root = %layout.root().display(), "Opened local store");
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn lock(&self) -> StevedoreResult<FileLock> {
        FileLock::acquire(&self.layout.store_lock())
    }

    fn container_record_path(&self, id: &str) -> PathBuf {
        self.layout.container_dir(id).join(CONTAINER_RECORD)
    }

    fn image_record_path(&self, id: &str) -> PathBuf {
        self.layout.image_dir(id).join(IMAGE_RECORD)
    }

    fn big_data_path(&self, id: &str, key: &str) -> PathBuf {
        self.layout
            .image_dir(id)
            .join(URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }

    fn read_containers(&self) -> StevedoreResult<Vec<ContainerRecord>> {
        read_records(&self.layout.containers_dir(), CONTAINER_RECORD)
    }

    fn read_images(&self) -> StevedoreResult<Vec<ImageRecord>> {
        read_records(&self.layout.images_dir(), IMAGE_RECORD)
    }

    fn write_container(&self, record: &ContainerRecord) -> StevedoreResult<()> {
        atomic_write_json(&self.container_record_path(&record.id), record)
    }

    fn write_image(&self, record: &ImageRecord) -> StevedoreResult<()> {
        atomic_write_json(&self.image_record_path(&record.id), record)
    }

    fn find_container(&self, id_or_name: &str) -> StevedoreResult<ContainerRecord> {
        let all = self.read_containers()?;
        resolve(all, id_or_name, |c| &c.id, |c| &c.names)
            .ok_or_else(|| StevedoreError::ContainerUnknown(id_or_name.to_string()))
    }

    fn find_image(&self, id_or_name: &str) -> StevedoreResult<ImageRecord> {
        let key = id_or_name.strip_prefix("sha256:").unwrap_or(id_or_name);
        let all = self.read_images()?;
        resolve(all, key, |i| &i.id, |i| &i.names)
            .ok_or_else(|| StevedoreError::ImageUnknown(id_or_name.to_string()))
    }

    /// Apply a layer chain (base first) into `dest`.
    fn materialize(
        &self,
        top: Option<&str>,
        dest: &Path,
        mappings: &IdMappings,
    ) -> StevedoreResult<()> {
        fs::create_dir_all(dest)
            .map_err(|e| StevedoreError::io(format!("Failed to create {}", dest.display()), e))?;
        let options = ApplyOptions {
            id_mappings: mappings.clone(),
            ..Default::default()
        };
        let chain = layer_chain(self, top)?;
        for layer in chain.iter().rev() {
            debug!(layer = %layer.id, dest = %dest.display(), "Applying layer");
            apply_layer_file(&self.layout.layer_tar(&layer.id), dest, &options)?;
        }
        Ok(())
    }

    fn store_layer(
        &self,
        parent: Option<&str>,
        diff: &mut dyn Read,
        compressed_digest: Option<&str>,
    ) -> StevedoreResult<LayerRecord> {
        if let Some(parent) = parent {
            self.layer(parent)?;
        }
        let tmp_dir = self.layout.tmp_dir();
        let staged = tempfile::NamedTempFile::new_in(&tmp_dir)
            .map_err(|e| StevedoreError::io("Failed to create layer staging file", e))?;

        let (_, mut reader) = decompressed_reader(diff)?;
        let mut writer = DigestingWriter::new(staged);
        io::copy(&mut reader, &mut writer)
            .map_err(|e| StevedoreError::io("Failed to stage layer", e))?;
        let (staged, digester) = writer.into_parts();
        let (diff_digest, diff_size) = digester.finish();

        let id = layer_id(parent, &diff_digest);
        let record_path = self.layout.layer_record(&id);
        if record_path.exists() {
            debug!(layer = %id, "Layer already present");
            return self.layer(&id);
        }

        staged
            .persist(self.layout.layer_tar(&id))
            .map_err(|e| StevedoreError::io("Failed to store layer", e.error))?;
        let record = LayerRecord {
            id: id.clone(),
            parent: parent.map(str::to_string),
            diff_digest,
            diff_size,
            compressed_digest: compressed_digest.map(str::to_string),
            created: Utc::now(),
        };
        atomic_write_json(&record_path, &record)?;
        info!(layer = %id, size = diff_size, "Stored layer");
        Ok(record)
    }

    fn compute_container_diff(&self, container: &ContainerRecord) -> StevedoreResult<File> {
        let rootfs = self.layout.container_rootfs(&container.id);
        let mut out = tempfile::tempfile_in(self.layout.tmp_dir())
            .map_err(|e| StevedoreError::io("Failed to create diff file", e))?;

        let changed = match container.parent_layer.as_deref() {
            Some(top) => {
                let lower = tempfile::tempdir_in(self.layout.tmp_dir())
                    .map_err(|e| StevedoreError::io("Failed to create diff base", e))?;
                self.materialize(Some(top), lower.path(), &container.id_mappings)?;
                changes(Some(lower.path()), &rootfs)?
            }
            None => changes(None, &rootfs)?,
        };
        debug!(container = %container.id, changes = changed.len(), "Computed container changes");

        out = write_layer(&rootfs, &changed, &container.id_mappings, out)?;
        out.seek(SeekFrom::Start(0))
            .map_err(|e| StevedoreError::io("Failed to rewind diff file", e))?;
        Ok(out)
    }
}

impl Store for LocalStore {
    fn create_container(&self, options: &ContainerOptions) -> StevedoreResult<ContainerRecord> {
        let _lock = self.lock()?;
        let existing = self.read_containers()?;
        for name in &options.names {
            if existing.iter().any(|c| c.names.contains(name) || &c.id == name) {
                return Err(StevedoreError::NameInUse(name.clone()));
            }
        }

        let (image, parent_layer) = match options.image.as_deref() {
            Some(image) => {
                let record = self.find_image(image)?;
                (record.id, record.top_layer)
            }
            None => (String::new(), None),
        };

        let id = random_id();
        let record = ContainerRecord {
            id: id.clone(),
            names: options.names.clone(),
            image,
            parent_layer,
            metadata: options.metadata.clone(),
            id_mappings: options.id_mappings.clone(),
            mount_count: 0,
            created: Utc::now(),
        };

        let dir = self.layout.container_dir(&id);
        let result = (|| {
            fs::create_dir_all(self.layout.container_userdata(&id)).map_err(|e| {
                StevedoreError::io(format!("Failed to create {}", dir.display()), e)
            })?;
            self.materialize(
                record.parent_layer.as_deref(),
                &self.layout.container_rootfs(&id),
                &record.id_mappings,
            )?;
            self.write_container(&record)
        })();
        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!(container = %id, error = %cleanup, "Failed to remove partial container");
            }
            return Err(e);
        }
        info!(container = %id, names = ?record.names, "Created container");
        Ok(record)
    }

    fn container(&self, id_or_name: &str) -> StevedoreResult<ContainerRecord> {
        self.find_container(id_or_name)
    }

    fn containers(&self) -> StevedoreResult<Vec<ContainerRecord>> {
        self.read_containers()
    }

    fn container_directory(&self, id: &str) -> StevedoreResult<PathBuf> {
        let record = self.find_container(id)?;
        Ok(self.layout.container_userdata(&record.id))
    }

    fn container_run_directory(&self, id: &str) -> StevedoreResult<PathBuf> {
        let record = self.find_container(id)?;
        let dir = self.layout.container_run_dir(&record.id);
        fs::create_dir_all(&dir)
            .map_err(|e| StevedoreError::io(format!("Failed to create {}", dir.display()), e))?;
        Ok(dir)
    }

    fn mount_container(&self, id: &str) -> StevedoreResult<PathBuf> {
        let _lock = self.lock()?;
        let mut record = self.find_container(id)?;
        record.mount_count += 1;
        self.write_container(&record)?;
        Ok(self.layout.container_rootfs(&record.id))
    }

    fn unmount_container(&self, id: &str, force: bool) -> StevedoreResult<bool> {
        let _lock = self.lock()?;
        let mut record = self.find_container(id)?;
        record.mount_count = if force {
            0
        } else {
            record.mount_count.saturating_sub(1)
        };
        self.write_container(&record)?;
        Ok(record.mount_count > 0)
    }

    fn delete_container(&self, id: &str) -> StevedoreResult<()> {
        let _lock = self.lock()?;
        let record = self.find_container(id)?;
        if record.mount_count > 0 {
            warn!(container = %record.id, mounts = record.mount_count, "Deleting mounted container");
        }
        let dir = self.layout.container_dir(&record.id);
        fs::remove_dir_all(&dir)
            .map_err(|e| StevedoreError::io(format!("Failed to remove {}", dir.display()), e))?;
        let run_dir = self.layout.container_run_dir(&record.id);
        if run_dir.exists() {
            fs::remove_dir_all(&run_dir).map_err(|e| {
                StevedoreError::io(format!("Failed to remove {}", run_dir.display()), e)
            })?;
        }
        info!(container = %record.id, "Deleted container");
        Ok(())
    }

    fn layer(&self, id: &str) -> StevedoreResult<LayerRecord> {
        let path = self.layout.layer_record(id);
        if !path.exists() {
            return Err(StevedoreError::LayerUnknown(id.to_string()));
        }
        read_json(&path)
    }

    fn layers(&self) -> StevedoreResult<Vec<LayerRecord>> {
        let dir = self.layout.layers_dir();
        let entries = fs::read_dir(&dir)
            .map_err(|e| StevedoreError::io(format!("Failed to list {}", dir.display()), e))?;
        let mut layers = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                layers.push(read_json(&path)?);
            }
        }
        Ok(layers)
    }

    fn put_layer(
        &self,
        parent: Option<&str>,
        diff: &mut dyn Read,
        compressed_digest: Option<&str>,
    ) -> StevedoreResult<LayerRecord> {
        let _lock = self.lock()?;
        self.store_layer(parent, diff, compressed_digest)
    }

    fn diff(&self, layer: &str) -> StevedoreResult<Box<dyn Read + Send>> {
        self.layer(layer)?;
        let path = self.layout.layer_tar(layer);
        let file = File::open(&path)
            .map_err(|e| StevedoreError::io(format!("Failed to open {}", path.display()), e))?;
        Ok(Box::new(file))
    }

    fn container_diff(&self, container: &str) -> StevedoreResult<Box<dyn Read + Send>> {
        let record = self.find_container(container)?;
        Ok(Box::new(self.compute_container_diff(&record)?))
    }

    fn commit_container_layer(&self, container: &str) -> StevedoreResult<LayerRecord> {
        let record = self.find_container(container)?;
        let mut diff = self.compute_container_diff(&record)?;
        let _lock = self.lock()?;
        self.store_layer(record.parent_layer.as_deref(), &mut diff, None)
    }

    fn create_image(
        &self,
        id: &str,
        top_layer: Option<&str>,
        names: &[String],
    ) -> StevedoreResult<ImageRecord> {
        let _lock = self.lock()?;
        if self.image_record_path(id).exists() {
            return Err(StevedoreError::NameInUse(format!("image ID {}", id)));
        }
        if let Some(top) = top_layer {
            self.layer(top)?;
        }
        fs::create_dir_all(self.layout.image_dir(id))
            .map_err(|e| StevedoreError::io("Failed to create image directory", e))?;
        let record = ImageRecord {
            id: id.to_string(),
            names: Vec::new(),
            top_layer: top_layer.map(str::to_string),
            digest: String::new(),
            big_data_keys: Vec::new(),
            mount_count: 0,
            created: Utc::now(),
        };
        self.write_image(&record)?;
        self.assign_names(id, names)?;
        info!(image = %id, names = ?names, "Created image");
        self.find_image(id)
    }

    fn image(&self, id_or_name: &str) -> StevedoreResult<ImageRecord> {
        self.find_image(id_or_name)
    }

    fn images(&self) -> StevedoreResult<Vec<ImageRecord>> {
        self.read_images()
    }

    fn add_image_names(&self, id: &str, names: &[String]) -> StevedoreResult<()> {
        let _lock = self.lock()?;
        let record = self.find_image(id)?;
        self.assign_names(&record.id, names)
    }

    fn remove_image_names(&self, id: &str, names: &[String]) -> StevedoreResult<()> {
        let _lock = self.lock()?;
        let mut record = self.find_image(id)?;
        record.names.retain(|n| !names.contains(n));
        self.write_image(&record)
    }

    fn delete_image(&self, id: &str) -> StevedoreResult<()> {
        let _lock = self.lock()?;
        let record = self.find_image(id)?;
        if let Some(user) = self
            .read_containers()?
            .into_iter()
            .find(|c| c.image == record.id)
        {
            return Err(StevedoreError::Storage(format!(
                "image {} is in use by container {}",
                record.id, user.id
            )));
        }
        let dir = self.layout.image_dir(&record.id);
        fs::remove_dir_all(&dir)
            .map_err(|e| StevedoreError::io(format!("Failed to remove {}", dir.display()), e))?;
        info!(image = %record.id, "Deleted image");
        Ok(())
    }

    fn image_big_data(&self, id: &str, key: &str) -> StevedoreResult<Vec<u8>> {
        let record = self.find_image(id)?;
        if !record.big_data_keys.iter().any(|k| k == key) {
            return Err(StevedoreError::NotFound(format!(
                "item {:?} of image {}",
                key, record.id
            )));
        }
        let path = self.big_data_path(&record.id, key);
        fs::read(&path)
            .map_err(|e| StevedoreError::io(format!("Failed to read {}", path.display()), e))
    }

    fn set_image_big_data(&self, id: &str, key: &str, data: &[u8]) -> StevedoreResult<()> {
        let _lock = self.lock()?;
        let mut record = self.find_image(id)?;
        atomic_write(&self.big_data_path(&record.id, key), data)?;
        if !record.big_data_keys.iter().any(|k| k == key) {
            record.big_data_keys.push(key.to_string());
        }
        if key == MANIFEST_KEY {
            record.digest = sha256_digest(data);
        }
        self.write_image(&record)
    }

    fn mount_image(&self, id: &str) -> StevedoreResult<PathBuf> {
        let _lock = self.lock()?;
        let mut record = self.find_image(id)?;
        let mount_point = self.layout.image_dir(&record.id).join(IMAGE_ROOTFS);
        if record.mount_count == 0 || !mount_point.exists() {
            if mount_point.exists() {
                fs::remove_dir_all(&mount_point).map_err(|e| {
                    StevedoreError::io(format!("Failed to reset {}", mount_point.display()), e)
                })?;
            }
            self.materialize(record.top_layer.as_deref(), &mount_point, &IdMappings::default())?;
        }
        record.mount_count += 1;
        self.write_image(&record)?;
        debug!(image = %record.id, mounts = record.mount_count, "Mounted image");
        Ok(mount_point)
    }

    fn unmount_image(&self, id: &str, force: bool) -> StevedoreResult<bool> {
        let _lock = self.lock()?;
        let mut record = self.find_image(id)?;
        record.mount_count = if force {
            0
        } else {
            record.mount_count.saturating_sub(1)
        };
        if record.mount_count == 0 {
            let mount_point = self.layout.image_dir(&record.id).join(IMAGE_ROOTFS);
            if mount_point.exists() {
                fs::remove_dir_all(&mount_point).map_err(|e| {
                    StevedoreError::io(format!("Failed to remove {}", mount_point.display()), e)
                })?;
            }
        }
        self.write_image(&record)?;
        Ok(record.mount_count > 0)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.layout.tmp_dir()
    }

    fn cache_dir(&self) -> PathBuf {
        self.layout.cache_dir()
    }

    fn locks_dir(&self) -> PathBuf {
        self.layout.locks_dir()
    }
}

impl LocalStore {
    /// Give `names` to image `id`, taking them away from any other image.
    fn assign_names(&self, id: &str, names: &[String]) -> StevedoreResult<()> {
        for mut other in self.read_images()? {
            if other.id == id {
                continue;
            }
            let before = other.names.len();
            other.names.retain(|n| !names.contains(n));
            if other.names.len() != before {
                debug!(image = %other.id, "Reassigning image names");
                self.write_image(&other)?;
            }
        }
        let mut record: ImageRecord = read_json(&self.image_record_path(id))?;
        for name in names {
            if !record.names.contains(name) {
                record.names.push(name.clone());
            }
        }
        self.write_image(&record)
    }
}

/// Layer IDs chain the parent so identical diffs on different bases differ.
fn layer_id(parent: Option<&str>, diff_digest: &str) -> String {
    let input = format!("{}\n{}", parent.unwrap_or(""), diff_digest);
    let digest = sha256_digest(input.as_bytes());
    digest.trim_start_matches("sha256:").to_string()
}

fn read_records<T: serde::de::DeserializeOwned>(
    dir: &Path,
    file_name: &str,
) -> StevedoreResult<Vec<T>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StevedoreError::io(
                format!("Failed to list {}", dir.display()),
                e,
            ));
        }
    };
    let mut records = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path().join(file_name);
        if path.exists() {
            records.push(read_json(&path)?);
        }
    }
    Ok(records)
}

/// Exact ID, then exact name, then unique ID prefix.
fn resolve<T>(
    records: Vec<T>,
    key: &str,
    id: impl Fn(&T) -> &String,
    names: impl Fn(&T) -> &Vec<String>,
) -> Option<T> {
    if key.is_empty() {
        return None;
    }
    let mut by_prefix = Vec::new();
    let mut by_name = None;
    for record in records {
        if id(&record) == key {
            return Some(record);
        }
        if names(&record).iter().any(|n| n == key) {
            by_name = Some(record);
        } else if id(&record).starts_with(key) {
            by_prefix.push(record);
        }
    }
    if by_name.is_some() {
        return by_name;
    }
    if by_prefix.len() == 1 {
        return by_prefix.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::apply::tests::{TestEntry, build_tar};
    use crate::storage::CONFIG_KEY;
    use tempfile::TempDir;

    fn store() -> (TempDir, LocalStore) {
        let dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(dir.path().join("root"), dir.path().join("run"));
        let store = LocalStore::open(layout).unwrap();
        (dir, store)
    }

    fn put(store: &LocalStore, parent: Option<&str>, entries: &[TestEntry]) -> LayerRecord {
        let tar = build_tar(entries);
        store.put_layer(parent, &mut tar.as_slice(), None).unwrap()
    }

    #[test]
    fn test_put_layer_is_deduplicated() {
        let (_dir, store) = store();
        let entries = [TestEntry::File("a", b"hello")];
        let first = put(&store, None, &entries);
        let second = put(&store, None, &entries);
        assert_eq!(first.id, second.id);
        assert_eq!(first.diff_size, build_tar(&entries).len() as u64);
    }

    #[test]
    fn test_missing_parent_layer_is_transient() {
        let (_dir, store) = store();
        let tar = build_tar(&[TestEntry::File("a", b"x")]);
        let missing = "d".repeat(64);
        let err = store.put_layer(Some(&missing), &mut tar.as_slice(), None).unwrap_err();
        assert!(matches!(err, StevedoreError::LayerUnknown(ref id) if *id == missing), "{err:?}");
        assert!(err.is_transient());
    }

    #[test]
    fn test_layer_id_depends_on_parent() {
        let (_dir, store) = store();
        let base = put(&store, None, &[TestEntry::File("base", b"x")]);
        let entries = [TestEntry::File("a", b"hello")];
        let top = put(&store, Some(&base.id), &entries);
        let alone = put(&store, None, &entries);
        assert_ne!(top.id, alone.id);
        assert_eq!(top.diff_digest, alone.diff_digest);
    }

    #[test]
    fn test_container_from_image_and_diff() {
        let (_dir, store) = store();
        let base = put(
            &store,
            None,
            &[
                TestEntry::Dir("etc"),
                TestEntry::File("etc/os-release", b"ID=test\n"),
            ],
        );
        store
            .create_image("img1", Some(&base.id), &["localhost/base:latest".to_string()])
            .unwrap();

        let container = store
            .create_container(&ContainerOptions {
                names: vec!["base-working-container".to_string()],
                image: Some("localhost/base:latest".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(container.image, "img1");

        let rootfs = store.mount_container(&container.id).unwrap();
        assert!(rootfs.join("etc/os-release").exists());
        fs::write(rootfs.join("added"), b"new").unwrap();

        let mut diff = store.container_diff("base-working-container").unwrap();
        let mut bytes = Vec::new();
        diff.read_to_end(&mut bytes).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["added".to_string()]);

        let layer = store.commit_container_layer(&container.id).unwrap();
        assert_eq!(layer.parent.as_deref(), Some(base.id.as_str()));
    }

    #[test]
    fn test_container_names_are_unique() {
        let (_dir, store) = store();
        let options = ContainerOptions {
            names: vec!["working".to_string()],
            ..Default::default()
        };
        store.create_container(&options).unwrap();
        let err = store.create_container(&options).unwrap_err();
        assert!(matches!(err, StevedoreError::NameInUse(_)));
    }

    #[test]
    fn test_lookup_by_prefix_and_name() {
        let (_dir, store) = store();
        let c = store
            .create_container(&ContainerOptions {
                names: vec!["box".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.container(&c.id[..8]).unwrap().id, c.id);
        assert_eq!(store.container("box").unwrap().id, c.id);
        assert!(matches!(
            store.container("nope").unwrap_err(),
            StevedoreError::ContainerUnknown(_)
        ));
    }

    #[test]
    fn test_image_names_move_between_images() {
        let (_dir, store) = store();
        let name = vec!["localhost/app:latest".to_string()];
        store.create_image("one", None, &name).unwrap();
        store.create_image("two", None, &name).unwrap();
        assert!(store.image("one").unwrap().names.is_empty());
        assert_eq!(store.image("localhost/app:latest").unwrap().id, "two");
    }

    #[test]
    fn test_big_data_and_manifest_digest() {
        let (_dir, store) = store();
        store.create_image("abc", None, &[]).unwrap();
        store.set_image_big_data("abc", MANIFEST_KEY, b"{}").unwrap();
        store.set_image_big_data("abc", CONFIG_KEY, b"cfg").unwrap();
        let record = store.image("sha256:abc").unwrap();
        assert_eq!(record.digest, sha256_digest(b"{}"));
        assert_eq!(store.image_big_data("abc", CONFIG_KEY).unwrap(), b"cfg");
        assert!(matches!(
            store.image_big_data("abc", "missing").unwrap_err(),
            StevedoreError::NotFound(_)
        ));
    }

    #[test]
    fn test_image_mount_refcount() {
        let (_dir, store) = store();
        let layer = put(&store, None, &[TestEntry::File("f", b"1")]);
        store.create_image("img", Some(&layer.id), &[]).unwrap();
        let point = store.mount_image("img").unwrap();
        assert!(point.join("f").exists());
        store.mount_image("img").unwrap();
        assert!(store.unmount_image("img", false).unwrap());
        assert!(!store.unmount_image("img", false).unwrap());
        assert!(!point.exists());
        assert!(matches!(
            store.unmount_image("ghost", false).unwrap_err(),
            StevedoreError::ImageUnknown(_)
        ));
    }

    #[test]
    fn test_delete_image_in_use_fails() {
        let (_dir, store) = store();
        store.create_image("img", None, &[]).unwrap();
        let c = store
            .create_container(&ContainerOptions {
                image: Some("img".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(store.delete_image("img").is_err());
        store.delete_container(&c.id).unwrap();
        store.delete_image("img").unwrap();
    }
}
