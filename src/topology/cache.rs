/// On-disk cache for router state.
///
/// One BSON document with a `version` integer and per-key sub-documents,
/// written via atomic rename. The router boots from this file when the
/// config servers are unreachable.
use bson::{Bson, Document};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

const CACHE_VERSION: i32 = 1;

pub struct DiskCache {
    filename: Option<PathBuf>,
    data: Mutex<BTreeMap<String, Document>>,
}

impl DiskCache {
    /// Opens the cache, loading whatever survives a version check.
    /// `None` filename gives an in-memory cache that never persists.
    pub fn open(filename: Option<PathBuf>) -> DiskCache {
        let mut data = BTreeMap::new();

        if let Some(path) = &filename {
            match fs::read(path) {
                Ok(raw) => match Document::from_reader(&mut raw.as_slice()) {
                    Ok(doc) if doc.get_i32("version") == Ok(CACHE_VERSION) => {
                        for (k, v) in doc {
                            if k == "version" {
                                continue;
                            }
                            if let Bson::Document(d) = v {
                                data.insert(k, d);
                            }
                        }
                        info!("loaded state cache from {}", path.display());
                    }
                    Ok(_) => warn!("{}: unsupported cache version, ignoring", path.display()),
                    Err(e) => warn!("{}: cannot parse cache: {e}", path.display()),
                },
                Err(_) => {} // no cache yet
            }
        }

        DiskCache { filename, data: Mutex::new(data) }
    }

    pub fn get(&self, key: &str) -> Document {
        self.data.lock().get(key).cloned().unwrap_or_default()
    }

    /// Stores `value` under `key` and rewrites the file atomically.
    /// Persistence failures are logged, never fatal.
    pub fn put(&self, key: &str, value: Document) {
        let snapshot = {
            let mut data = self.data.lock();
            data.insert(key.to_string(), value);
            data.clone()
        };

        let Some(path) = &self.filename else { return };

        let mut doc = Document::new();
        doc.insert("version", CACHE_VERSION);
        for (k, v) in snapshot {
            doc.insert(k, v);
        }
        let mut raw = Vec::new();
        if doc.to_writer(&mut raw).is_err() {
            return;
        }

        let tmp = path.with_extension("tmp");
        if let Err(e) = fs::write(&tmp, &raw).and_then(|_| fs::rename(&tmp, path)) {
            warn!("cannot update {}: {e}", path.display());
            let _ = fs::remove_file(&tmp);
        }
    }
}
