use log::{debug, info};
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::deployment::{DeploymentId, DeploymentManifest};
use crate::error::StoreError;

const EXTENSION: &str = "json";

/// Directory of manifests, one `<id>.json` file per deployment.
///
/// Saving never touches other deployments: history is kept until explicitly deleted.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: DeploymentId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, EXTENSION))
    }

    /// Fails with [`StoreError::Corrupted`] when `path` exists but is not a regular file.
    fn ensure_file(path: &Path) -> Result<bool, StoreError> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(true),
            Ok(_) => Err(StoreError::Corrupted(path.to_path_buf())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the manifest atomically: to a temporary file first, then renamed into place.
    pub fn save(&self, manifest: &DeploymentManifest) -> Result<(), StoreError> {
        let path = self.path(manifest.id());
        Self::ensure_file(&path)?;
        fs::create_dir_all(&self.dir)?;

        let json = serde_json::to_string_pretty(manifest)?;
        let temp_path = path.with_extension("tmp");
        let mut temp_file = File::create(&temp_path)?;
        temp_file.write_all(json.as_bytes())?;
        temp_file.sync_all()?;
        fs::rename(&temp_path, &path)?;

        info!("Store: saved deployment {}", manifest.id());
        Ok(())
    }

    pub fn get(&self, id: DeploymentId) -> Result<DeploymentManifest, StoreError> {
        let path = self.path(id);
        if !Self::ensure_file(&path)? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Self::load(&path)
    }

    fn load(path: &Path) -> Result<DeploymentManifest, StoreError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Ids of every stored deployment, oldest first. Files that are not manifests are skipped.
    pub fn ids(&self) -> Result<Vec<DeploymentId>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<DeploymentId>().ok())
            else {
                debug!("Store: skipping foreign file {}", path.display());
                continue;
            };
            Self::ensure_file(&path)?;
            ids.push(id);
        }

        ids.sort();
        Ok(ids)
    }

    /// Every stored manifest, oldest first.
    pub fn list(&self) -> Result<Vec<DeploymentManifest>, StoreError> {
        self.ids()?
            .into_iter()
            .map(|id| Self::load(&self.path(id)))
            .collect()
    }

    /// The most recent deployment that succeeded, if any.
    pub fn latest_successful(&self) -> Result<Option<DeploymentManifest>, StoreError> {
        for id in self.ids()?.into_iter().rev() {
            let manifest = self.get(id)?;
            if manifest.outcome().is_success() {
                return Ok(Some(manifest));
            }
        }
        Ok(None)
    }

    pub fn delete(&self, id: DeploymentId) -> Result<(), StoreError> {
        let path = self.path(id);
        if !Self::ensure_file(&path)? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        fs::remove_file(&path)?;
        info!("Store: deleted deployment {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{Category, Outcome, Resource, ResourceTable};
    use chrono::Utc;
    use harbor_protocol::{Config, ControlPlane, Service};

    fn manifest(nanos: u64) -> DeploymentManifest {
        manifest_with(nanos, Outcome::Succeeded)
    }

    fn manifest_with(nanos: u64, outcome: Outcome) -> DeploymentManifest {
        let config = Config::new(
            vec![
                Service::new("web", "nginx:1.27").with_requires(["db"]),
                Service::new("db", "postgres:16"),
            ],
            ControlPlane {
                host: "harbor.example.com".into(),
            },
        )
        .unwrap();

        let mut resources = ResourceTable::new();
        resources.record(
            Category::CreatedContainers,
            "db",
            Resource::Container {
                id: "c1".into(),
                name: "db-1".into(),
            },
        );
        resources.record(
            Category::CreatedNetworks,
            "web",
            Resource::Network {
                id: "n1".into(),
                name: "web-1".into(),
                subnet: "10.0.0.0/24".parse().unwrap(),
            },
        );

        DeploymentManifest::new(
            DeploymentId::from_nanos(nanos),
            Utc::now(),
            config,
            resources,
            outcome,
        )
    }

    #[test]
    fn test_save_then_get_preserves_resources() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("deployments"));
        let saved = manifest(7);

        store.save(&saved).unwrap();
        let loaded = store.get(saved.id()).unwrap();

        assert_eq!(loaded.id(), saved.id());
        assert_eq!(loaded.resources(), saved.resources());
        assert_eq!(loaded, saved);
    }

    #[test]
    fn test_list_is_sorted_and_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        for nanos in [30, 10, 20] {
            store.save(&manifest(nanos)).unwrap();
        }
        fs::write(dir.path().join("README.txt"), "hello").unwrap();
        fs::write(dir.path().join("notes.json"), "{}").unwrap();

        let ids: Vec<u64> = store.list().unwrap().iter().map(|m| m.id().as_nanos()).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn test_latest_successful_skips_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        store.save(&manifest(10)).unwrap();
        store.save(&manifest(20)).unwrap();
        store
            .save(&manifest_with(
                30,
                Outcome::Failed {
                    message: "db: health check failed".into(),
                },
            ))
            .unwrap();

        assert_eq!(store.latest_successful().unwrap().unwrap().id().as_nanos(), 20);
    }

    #[test]
    fn test_missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("absent"));

        assert!(store.list().unwrap().is_empty());
        assert!(store.latest_successful().unwrap().is_none());
        assert!(matches!(
            store.get(DeploymentId::from_nanos(1)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_directory_in_place_of_manifest_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let id = DeploymentId::from_nanos(5);
        fs::create_dir(dir.path().join(format!("{}.json", id))).unwrap();

        assert!(matches!(store.get(id), Err(StoreError::Corrupted(_))));
        assert!(matches!(store.list(), Err(StoreError::Corrupted(_))));
        assert!(matches!(store.save(&manifest(5)), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn test_delete_keeps_other_deployments() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        store.save(&manifest(1)).unwrap();
        store.save(&manifest(2)).unwrap();

        store.delete(DeploymentId::from_nanos(1)).unwrap();

        assert_eq!(store.ids().unwrap(), vec![DeploymentId::from_nanos(2)]);
        assert!(matches!(
            store.delete(DeploymentId::from_nanos(1)),
            Err(StoreError::NotFound(_))
        ));
    }
}
