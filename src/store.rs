use std::fs::{self, OpenOptions};
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::Builder;

use crate::domain::{ReviewPages, StrainSlug};
use crate::error::HarvestError;

const ARTIFACT_PREFIX: &str = "reviews_";
const ARTIFACT_SUFFIX: &str = ".json";

#[derive(Debug, Clone)]
pub struct Store {
    artifact_root: Utf8PathBuf,
    snapshot_path: Utf8PathBuf,
    aggregate_path: Utf8PathBuf,
}

impl Store {
    pub fn new(
        artifact_root: Utf8PathBuf,
        snapshot_path: Utf8PathBuf,
        aggregate_path: Utf8PathBuf,
    ) -> Self {
        Self {
            artifact_root,
            snapshot_path,
            aggregate_path,
        }
    }

    pub fn in_dir(root: &Utf8Path) -> Self {
        Self::new(
            root.join("reviews"),
            root.join("strains_metadata.json"),
            root.join("reviews_aggregate.jsonl"),
        )
    }

    pub fn artifact_root(&self) -> &Utf8Path {
        &self.artifact_root
    }

    pub fn snapshot_path(&self) -> &Utf8Path {
        &self.snapshot_path
    }

    pub fn aggregate_path(&self) -> &Utf8Path {
        &self.aggregate_path
    }

    pub fn artifact_path(&self, slug: &StrainSlug) -> Utf8PathBuf {
        self.artifact_root
            .join(format!("{ARTIFACT_PREFIX}{slug}{ARTIFACT_SUFFIX}"))
    }

    pub fn ensure_artifact_root(&self) -> Result<(), HarvestError> {
        fs::create_dir_all(self.artifact_root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    pub fn artifact_exists(&self, slug: &StrainSlug) -> bool {
        self.artifact_path(slug).as_std_path().is_file()
    }

    pub fn snapshot_exists(&self) -> bool {
        self.snapshot_path.as_std_path().is_file()
    }

    pub fn write_artifact(
        &self,
        slug: &StrainSlug,
        pages: &ReviewPages,
    ) -> Result<Utf8PathBuf, HarvestError> {
        let path = self.artifact_path(slug);
        Self::write_json_atomic(&path, pages)?;
        Ok(path)
    }

    pub fn read_artifact(path: &Utf8Path) -> Result<ReviewPages, HarvestError> {
        Self::read_json(path)
    }

    pub fn read_snapshot(&self) -> Result<Vec<Value>, HarvestError> {
        Self::read_json(&self.snapshot_path)
    }

    pub fn write_snapshot(&self, entries: &[Value]) -> Result<(), HarvestError> {
        Self::write_json_atomic(&self.snapshot_path, &entries)
    }

    pub fn remove_snapshot(&self) -> Result<bool, HarvestError> {
        if !self.snapshot_exists() {
            return Ok(false);
        }
        fs::remove_file(self.snapshot_path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(true)
    }

    pub fn list_artifacts(&self) -> Result<Vec<Utf8PathBuf>, HarvestError> {
        if !self.artifact_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(self.artifact_root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|path| {
                HarvestError::Filesystem(format!("non UTF-8 path {}", path.display()))
            })?;
            if path.as_std_path().is_file() && artifact_slug(&path).is_some() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn write_json_atomic<T: Serialize + ?Sized>(
        path: &Utf8Path,
        value: &T,
    ) -> Result<(), HarvestError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let content =
            serde_json::to_vec(value).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".leafly-harvest")
            .suffix(".tmp")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn append_json_lines<T: Serialize>(
        path: &Utf8Path,
        rows: &[T],
    ) -> Result<(), HarvestError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        let mut content = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut content, row)
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            content.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("open {path}: {err}")))?;
        file.write_all(&content)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        file.sync_all()
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, HarvestError> {
        let content = fs::read(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("read {path}: {err}")))?;
        serde_json::from_slice(&content).map_err(|err| HarvestError::ArtifactCorrupt {
            path: path.to_string(),
            message: err.to_string(),
        })
    }
}

pub fn artifact_slug(path: &Utf8Path) -> Option<StrainSlug> {
    path.file_name()?
        .strip_prefix(ARTIFACT_PREFIX)?
        .strip_suffix(ARTIFACT_SUFFIX)?
        .parse()
        .ok()
}
