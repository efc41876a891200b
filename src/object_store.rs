//! Object store seam: list/get/put of named binary blobs.
//!
//! Names are `/`-separated and relative to the container. Listing is
//! lexicographic, matching what blob services return.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::ObjectStoreConfig;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object store connection string is not configured")]
    MissingConnectionString,
    #[error("object store container name is not configured")]
    MissingContainer,
    #[error("container directory {path} does not exist")]
    ContainerNotFound { path: PathBuf },
    #[error("invalid object name '{0}'")]
    InvalidName(String),
    #[error("object '{0}' not found")]
    NotFound(String),
    #[error("I/O error on object '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl ObjectStoreError {
    /// True for failures that mean the store could not be reached at all.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::MissingConnectionString | Self::MissingContainer | Self::ContainerNotFound { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    AlreadyExists,
}

pub trait ObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
    fn get(&self, name: &str) -> Result<Vec<u8>, ObjectStoreError>;
    /// Writes `bytes` under `name` unless an object with that name exists.
    /// Existing objects are never overwritten.
    fn put_new(&self, name: &str, bytes: &[u8]) -> Result<PutOutcome, ObjectStoreError>;
}

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn connect(cfg: &ObjectStoreConfig) -> Result<Self, ObjectStoreError> {
        let connection_string = cfg
            .connection_string
            .as_deref()
            .ok_or(ObjectStoreError::MissingConnectionString)?;
        let container = cfg
            .container
            .as_deref()
            .ok_or(ObjectStoreError::MissingContainer)?;

        let base = connection_string
            .strip_prefix("file://")
            .unwrap_or(connection_string);
        let root = Path::new(base).join(container);
        if !root.is_dir() {
            return Err(ObjectStoreError::ContainerNotFound { path: root });
        }

        info!(
            component = "object_store",
            event = "object_store.connect",
            root = %root.display()
        );

        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_name(name)?;
        Ok(name
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment)))
    }

    fn collect(&self, dir: &Path, relative: &str, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') {
                continue;
            }
            let name = if relative.is_empty() {
                file_name
            } else {
                format!("{relative}/{file_name}")
            };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &name, out)?;
            } else {
                out.push(name);
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut names = Vec::new();
        self.collect(&self.root, "", &mut names)
            .map_err(|source| ObjectStoreError::Io {
                name: prefix.to_string(),
                source,
            })?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        debug!(
            component = "object_store",
            event = "object_store.list",
            prefix,
            count = names.len()
        );
        Ok(names)
    }

    fn get(&self, name: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.path_for(name)?;
        fs::read(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => ObjectStoreError::NotFound(name.to_string()),
            _ => ObjectStoreError::Io {
                name: name.to_string(),
                source,
            },
        })
    }

    fn put_new(&self, name: &str, bytes: &[u8]) -> Result<PutOutcome, ObjectStoreError> {
        let path = self.path_for(name)?;
        let io_err = |source| ObjectStoreError::Io {
            name: name.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let created = write_new_atomic(&path, bytes).map_err(io_err)?;
        Ok(if created {
            PutOutcome::Created
        } else {
            PutOutcome::AlreadyExists
        })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    pub fn insert(&self, name: &str, bytes: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), bytes.into());
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let objects = self
            .objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(objects
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get(&self, name: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let objects = self
            .objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        objects
            .get(name)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(name.to_string()))
    }

    fn put_new(&self, name: &str, bytes: &[u8]) -> Result<PutOutcome, ObjectStoreError> {
        validate_name(name)?;
        let mut objects = self
            .objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if objects.contains_key(name) {
            return Ok(PutOutcome::AlreadyExists);
        }
        objects.insert(name.to_string(), bytes.to_vec());
        Ok(PutOutcome::Created)
    }
}

fn validate_name(name: &str) -> Result<(), ObjectStoreError> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == ".." || segment.starts_with('.'));
    if invalid {
        return Err(ObjectStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Writes through a hidden temp file and links it into place, so readers
/// never see a partial object and an existing object is never replaced.
/// Returns `false` when `path` already existed.
fn write_new_atomic(path: &Path, bytes: &[u8]) -> io::Result<bool> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "object path has no file name"))?;
    let tmp_path = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    let linked = fs::hard_link(&tmp_path, path);
    fs::remove_file(&tmp_path)?;
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}
