//! Content cache: metadata rows plus a blob tree keyed by model id.
//!
//! ```text
//! <root>/
//!   cache.db                         models / fits / operations rows
//!   models/<model_id>/
//!     compiler_output.log
//!     warnings.log
//!     model_<model_id>.bin.gz        compiled module; written last
//!     fits/<fit_id>.fit.gz           framed message stream
//! ```
//!
//! Every blob is written to a temporary file in its final directory,
//! fsynced and renamed into place, so readers see either the previous state
//! or the complete record. The module blob doubles as the completion marker
//! for a model: a directory without one is an interrupted compile.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::CacheError;
use super::sqlite::{FitRow, ModelRow, SqliteStorage};
use crate::naming::{FitName, ModelId};

pub const DB_FILE: &str = "cache.db";
const MODELS_DIR: &str = "models";
const FITS_DIR: &str = "fits";
const COMPILER_OUTPUT_FILE: &str = "compiler_output.log";
const WARNINGS_FILE: &str = "warnings.log";

/// Suffixes a module blob may carry, before the compression extension.
pub const MODULE_SUFFIXES: &[&str] = &[".bin", ".so", ".dylib", ".dll"];
const MODULE_WRITE_SUFFIX: &str = ".bin";
const BLOB_EXT: &str = ".gz";
const FIT_EXT: &str = ".fit.gz";

/// A compiled model read back from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredModel {
    pub id: ModelId,
    pub source_text: String,
    pub object_code: Vec<u8>,
    /// Hex SHA-256 of `object_code`, checked when it was read.
    pub sha256: String,
    pub compiler_output: String,
    pub warnings: String,
}

/// Model metadata without the module bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: ModelId,
    pub compiler_output: String,
    pub warnings: String,
}

pub struct Cache {
    root: PathBuf,
    db: Mutex<SqliteStorage>,
}

impl Cache {
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        let started = Instant::now();
        fs::create_dir_all(root.join(MODELS_DIR))?;
        let db = SqliteStorage::open(&root.join(DB_FILE))?;
        info!(
            root = %root.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cache ready"
        );
        Ok(Self {
            root: root.to_path_buf(),
            db: Mutex::new(db),
        })
    }

    pub fn model_dir(&self, id: &ModelId) -> PathBuf {
        self.root.join(MODELS_DIR).join(id.as_str())
    }

    fn module_path(&self, id: &ModelId) -> PathBuf {
        self.model_dir(id)
            .join(format!("model_{id}{MODULE_WRITE_SUFFIX}{BLOB_EXT}"))
    }

    fn fit_path(&self, name: &FitName) -> PathBuf {
        self.model_dir(&name.model)
            .join(FITS_DIR)
            .join(format!("{}{FIT_EXT}", name.fit))
    }

    /// The module blob in `dir`, whichever recognized suffix it has.
    fn find_module(dir: &Path, id: &ModelId) -> Option<PathBuf> {
        MODULE_SUFFIXES
            .iter()
            .map(|suffix| dir.join(format!("model_{id}{suffix}{BLOB_EXT}")))
            .find(|path| path.is_file())
    }

    // -------------------------------------------------------------------------
    // Models
    // -------------------------------------------------------------------------

    pub fn put_model(
        &self,
        id: &ModelId,
        source_text: &str,
        object_code: &[u8],
        compiler_output: &str,
        warnings: &str,
    ) -> Result<(), CacheError> {
        let dir = self.model_dir(id);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(COMPILER_OUTPUT_FILE), compiler_output.as_bytes())?;
        write_atomic(&dir.join(WARNINGS_FILE), warnings.as_bytes())?;

        self.db.lock().upsert_model(&ModelRow {
            id: id.to_string(),
            source_text: source_text.to_string(),
            compiler_output: compiler_output.to_string(),
            warnings: warnings.to_string(),
            sha256: hex::encode(Sha256::digest(object_code)),
            created_at: SqliteStorage::now_millis(),
        })?;

        write_atomic(&self.module_path(id), &compress(object_code)?)?;
        debug!(model = %id, bytes = object_code.len(), "Stored model");
        Ok(())
    }

    pub fn get_model(&self, id: &ModelId) -> Result<StoredModel, CacheError> {
        let not_found = || CacheError::NotFound(id.name());
        let row = self.db.lock().get_model(id.as_str())?.ok_or_else(not_found)?;
        let path = Self::find_module(&self.model_dir(id), id).ok_or_else(not_found)?;
        let object_code = decompress(&fs::read(&path)?)
            .map_err(|e| CacheError::Corruption(format!("{}: {e}", path.display())))?;

        let digest = hex::encode(Sha256::digest(&object_code));
        if digest != row.sha256 {
            warn!(model = %id, expected = %row.sha256, actual = %digest, "Module digest mismatch");
            return Err(CacheError::Corruption(format!(
                "module for {} does not match its recorded digest",
                id.name()
            )));
        }

        Ok(StoredModel {
            id: id.clone(),
            source_text: row.source_text,
            object_code,
            sha256: digest,
            compiler_output: row.compiler_output,
            warnings: row.warnings,
        })
    }

    /// Diagnostics of a completed model, without reading its module.
    pub fn describe_model(&self, id: &ModelId) -> Result<ModelInfo, CacheError> {
        let not_found = || CacheError::NotFound(id.name());
        if Self::find_module(&self.model_dir(id), id).is_none() {
            return Err(not_found());
        }
        let row = self.db.lock().get_model(id.as_str())?.ok_or_else(not_found)?;
        Ok(ModelInfo {
            id: id.clone(),
            compiler_output: row.compiler_output,
            warnings: row.warnings,
        })
    }

    /// Remove a model, every fit underneath it and the operations that
    /// produced them. Missing entries are not an error; look the model up
    /// first to distinguish.
    pub fn delete_model(&self, id: &ModelId) -> Result<(), CacheError> {
        let dir = self.model_dir(id);
        if let Some(module) = Self::find_module(&dir, id) {
            fs::remove_file(module)?;
        }
        {
            let db = self.db.lock();
            db.delete_model(id.as_str())?;
            db.delete_model_operations(id.as_str())?;
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(model = %id, "Deleted model");
        Ok(())
    }

    /// Ids of all completely compiled models, sorted.
    pub fn list_model_ids(&self) -> Result<Vec<ModelId>, CacheError> {
        let entries = match fs::read_dir(self.root.join(MODELS_DIR)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().and_then(|s| ModelId::parse(s).ok()) else {
                continue;
            };
            if Self::find_module(&entry.path(), &id).is_some() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    // -------------------------------------------------------------------------
    // Fits
    // -------------------------------------------------------------------------

    pub fn put_fit(
        &self,
        name: &FitName,
        function: &str,
        argument_fingerprint: &str,
        stream: &[u8],
    ) -> Result<(), CacheError> {
        if self.db.lock().get_model(name.model.as_str())?.is_none() {
            return Err(CacheError::NotFound(name.model.name()));
        }
        let path = self.fit_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &compress(stream)?)?;

        self.db.lock().insert_fit(&FitRow {
            id: name.fit.to_string(),
            model_id: name.model.to_string(),
            function: function.to_string(),
            argument_fingerprint: argument_fingerprint.to_string(),
            size: i64::try_from(stream.len()).unwrap_or(i64::MAX),
            created_at: SqliteStorage::now_millis(),
        })?;
        debug!(fit = %name, bytes = stream.len(), "Stored fit");
        Ok(())
    }

    /// The uncompressed framed stream of a fit.
    pub fn get_fit(&self, name: &FitName) -> Result<Vec<u8>, CacheError> {
        let row = self
            .db
            .lock()
            .get_fit(name.model.as_str(), name.fit.as_str())?
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        let path = self.fit_path(name);
        let compressed = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let stream = decompress(&compressed)
            .map_err(|e| CacheError::Corruption(format!("{}: {e}", path.display())))?;
        if i64::try_from(stream.len()).ok() != Some(row.size) {
            return Err(CacheError::Corruption(format!(
                "{name} has {} bytes, expected {}",
                stream.len(),
                row.size
            )));
        }
        Ok(stream)
    }

    pub fn has_fit(&self, name: &FitName) -> Result<bool, CacheError> {
        Ok(self
            .db
            .lock()
            .get_fit(name.model.as_str(), name.fit.as_str())?
            .is_some()
            && self.fit_path(name).is_file())
    }

    /// Remove a fit and the operation record that produced it.
    pub fn delete_fit(&self, name: &FitName) -> Result<(), CacheError> {
        let had_row = {
            let db = self.db.lock();
            db.delete_operation(&name.operation_name(), name.model.as_str())?;
            db.delete_fit(name.model.as_str(), name.fit.as_str())?
        };
        let had_file = match fs::remove_file(self.fit_path(name)) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !had_row && !had_file {
            return Err(CacheError::NotFound(name.to_string()));
        }
        debug!(fit = %name, "Deleted fit");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Persist the record of the operation producing `fit`.
    pub fn put_operation<T: Serialize>(
        &self,
        fit: &FitName,
        record: &T,
        done: bool,
    ) -> Result<(), CacheError> {
        let json = serde_json::to_string(record)?;
        self.db
            .lock()
            .put_operation(&fit.operation_name(), fit.model.as_str(), &json, done)
    }

    pub fn get_operation<T: DeserializeOwned>(&self, name: &str) -> Result<T, CacheError> {
        let json = self
            .db
            .lock()
            .get_operation(name)?
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Operation records that were never marked done.
    pub fn pending_operations<T: DeserializeOwned>(&self) -> Result<Vec<T>, CacheError> {
        let rows = self.db.lock().pending_operations()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(CacheError::from))
            .collect()
    }
}

fn compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::fast());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn decompress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// Write `bytes` to `path` so that readers never observe a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| CacheError::Io(e.error))?;
    sync_dir(parent)?;
    Ok(())
}

fn sync_dir(path: &Path) -> std::io::Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()
}
