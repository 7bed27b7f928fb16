//! The code cache, spec.md §4.J.
//!
//! Grounded in `original_source/libs/jsRuntime/src/CodeCache.cc`:
//! `load_script_source` is `LoadScriptFile`, `store_compiled` combines
//! `SetCodeCache`/`WriteCacheDataToFile`, and cache-path generation mirrors
//! `GenerateCachePath` (relative path's first segment must be `js` or
//! `modules`, cache lives under `<app_root>/.code_cache/<relative>.jscc`).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, error};

use crate::assets::AssetRootIndex;

/// A source file ready to be compiled by the VM, with an optional cached
/// compiled blob to pass as a compile hint.
#[derive(Debug, Clone)]
pub struct SourceHandle {
    /// Absolute path the source was read from.
    pub path: PathBuf,
    /// UTF-8 source text.
    pub source_bytes: String,
    /// Previously compiled bytecode, if the on-disk cache was still valid.
    /// The caller must treat this as a *hint*, not owned storage — it is a
    /// clone of the entry's buffer.
    pub compiled_bytes: Option<Vec<u8>>,
}

/// Errors raised while loading or storing a cache entry.
#[derive(Error, Debug)]
pub enum CodeCacheError {
    /// The path was empty.
    #[error("empty file name passed for a script file")]
    EmptyPath,

    /// The extension was not `.js` or `.mjs`.
    #[error("unsupported file extension, only .js/.mjs allowed: {0}")]
    UnsupportedExtension(PathBuf),

    /// The source file does not exist.
    #[error("script file does not exist: {0}")]
    NotFound(PathBuf),

    /// The source file's relative path doesn't start under `js` or `modules`.
    #[error("script file is not in the js or modules directories: {0}")]
    OutsideKnownRoots(PathBuf),

    /// An I/O error occurred reading or writing cache files.
    #[error("I/O error in code cache: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Default)]
struct CodeCacheEntry {
    cache_path: PathBuf,
    source_bytes: String,
    compiled_bytes: Option<Vec<u8>>,
    compiled_len: usize,
    last_compiled_mtime: Option<SystemTime>,
}

/// `(source-path) <-> (on-disk compiled-cache path)` with mtime-driven
/// invalidation, exposed by App.
#[derive(Debug, Default)]
pub struct CodeCache {
    entries: HashMap<PathBuf, CodeCacheEntry>,
}

impl CodeCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or revalidate) the source at `path`, consulting the on-disk
    /// `.jscc` cache when its mtime is at least as new as `path`'s.
    pub fn load_script_source(
        &mut self,
        path: impl AsRef<Path>,
        asset_roots: &AssetRootIndex,
    ) -> Result<SourceHandle, CodeCacheError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            error!("empty file name passed for a script file");
            return Err(CodeCacheError::EmptyPath);
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if ext != "js" && ext != "mjs" {
            error!(path = %path.display(), "unsupported script extension");
            return Err(CodeCacheError::UnsupportedExtension(path.to_path_buf()));
        }
        if !path.exists() {
            error!(path = %path.display(), "script file does not exist");
            return Err(CodeCacheError::NotFound(path.to_path_buf()));
        }

        let cache_path = generate_cache_path(path, asset_roots)?;
        let source_mtime = fs::metadata(path)?.modified()?;

        if !self.entries.contains_key(path) {
            let source_bytes = fs::read_to_string(path)?;
            let mut entry = CodeCacheEntry {
                cache_path: cache_path.clone(),
                source_bytes,
                compiled_bytes: None,
                compiled_len: 0,
                last_compiled_mtime: None,
            };
            if cache_path.exists() {
                let cache_mtime = fs::metadata(&cache_path)?.modified()?;
                if cache_mtime >= source_mtime {
                    let compiled = fs::read(&cache_path)?;
                    if !compiled.is_empty() {
                        entry.compiled_len = compiled.len();
                        entry.compiled_bytes = Some(compiled);
                    }
                    entry.last_compiled_mtime = Some(cache_mtime);
                }
            }
            self.entries.insert(path.to_path_buf(), entry);
        }

        let entry = self.entries.get_mut(path).expect("entry just inserted");
        let stale = match entry.last_compiled_mtime {
            Some(cached) => cached < source_mtime,
            None => true,
        };
        if stale {
            entry.compiled_bytes = None;
            entry.compiled_len = 0;
            entry.source_bytes = fs::read_to_string(path)?;
        }

        debug!(
            path = %path.display(),
            cached = entry.compiled_bytes.is_some(),
            "loaded script source"
        );

        Ok(SourceHandle {
            path: path.to_path_buf(),
            source_bytes: entry.source_bytes.clone(),
            compiled_bytes: entry.compiled_bytes.clone(),
        })
    }

    /// Persist freshly compiled bytecode for `path`, creating the cache
    /// entry if one doesn't exist yet.
    pub fn store_compiled(
        &mut self,
        path: impl AsRef<Path>,
        bytes: &[u8],
        asset_roots: &AssetRootIndex,
    ) -> Result<(), CodeCacheError> {
        let path = path.as_ref();
        if !self.entries.contains_key(path) {
            let cache_path = generate_cache_path(path, asset_roots)?;
            let source_bytes = fs::read_to_string(path).unwrap_or_default();
            self.entries.insert(
                path.to_path_buf(),
                CodeCacheEntry {
                    cache_path,
                    source_bytes,
                    compiled_bytes: None,
                    compiled_len: 0,
                    last_compiled_mtime: None,
                },
            );
        }
        let entry = self.entries.get_mut(path).expect("entry just inserted");

        if let Some(parent) = entry.cache_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&entry.cache_path, bytes)?;

        entry.compiled_bytes = Some(bytes.to_vec());
        entry.compiled_len = bytes.len();
        entry.last_compiled_mtime = Some(fs::metadata(&entry.cache_path)?.modified()?);
        debug!(path = %path.display(), bytes = bytes.len(), "stored compiled cache");
        Ok(())
    }
}

fn generate_cache_path(path: &Path, asset_roots: &AssetRootIndex) -> Result<PathBuf, CodeCacheError> {
    let relative = asset_roots.make_relative_to_app_root(path);
    let first_segment = relative
        .components()
        .next()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .unwrap_or_default();
    if first_segment != crate::assets::asset_root_index::ROOT_JS
        && first_segment != crate::assets::asset_root_index::ROOT_MODULES
    {
        error!(path = %path.display(), "script file is not in the js or modules directories");
        return Err(CodeCacheError::OutsideKnownRoots(path.to_path_buf()));
    }
    let app_root = asset_roots
        .app_root()
        .expect("asset roots must be set before generating a cache path");
    Ok(app_root.join(".code_cache").join(relative).with_extension("jscc"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, AssetRootIndex) {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("js")).unwrap();
        std::fs::create_dir(dir.path().join("resources")).unwrap();
        std::fs::create_dir(dir.path().join("modules")).unwrap();
        let mut roots = AssetRootIndex::new();
        roots.set_app_root(dir.path()).unwrap();
        (dir, roots)
    }

    #[test]
    fn rejects_unsupported_extension() {
        let (dir, roots) = fixture();
        let path = dir.path().join("js/main.txt");
        std::fs::write(&path, "x").unwrap();
        let mut cache = CodeCache::new();
        assert!(matches!(
            cache.load_script_source(&path, &roots),
            Err(CodeCacheError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn rejects_paths_outside_js_or_modules() {
        let (dir, roots) = fixture();
        let path = dir.path().join("resources/main.js");
        std::fs::write(&path, "1;").unwrap();
        let mut cache = CodeCache::new();
        assert!(matches!(
            cache.load_script_source(&path, &roots),
            Err(CodeCacheError::OutsideKnownRoots(_))
        ));
    }

    #[test]
    fn loads_source_with_no_cache_present() {
        let (dir, roots) = fixture();
        let path = dir.path().join("js/main.js");
        std::fs::write(&path, "const x = 1;").unwrap();
        let mut cache = CodeCache::new();
        let handle = cache.load_script_source(&path, &roots).unwrap();
        assert_eq!(handle.source_bytes, "const x = 1;");
        assert!(handle.compiled_bytes.is_none());
    }

    #[test]
    fn store_then_load_reuses_compiled_bytes() {
        let (dir, roots) = fixture();
        let path = dir.path().join("js/main.js");
        std::fs::write(&path, "const x = 1;").unwrap();
        let mut cache = CodeCache::new();
        cache.load_script_source(&path, &roots).unwrap();
        cache.store_compiled(&path, b"fake-bytecode", &roots).unwrap();

        let mut reloaded = CodeCache::new();
        let handle = reloaded.load_script_source(&path, &roots).unwrap();
        assert_eq!(handle.compiled_bytes.as_deref(), Some(&b"fake-bytecode"[..]));
    }

    #[test]
    fn stale_source_invalidates_compiled_bytes() {
        let (dir, roots) = fixture();
        let path = dir.path().join("js/main.js");
        std::fs::write(&path, "const x = 1;").unwrap();
        let mut cache = CodeCache::new();
        cache.load_script_source(&path, &roots).unwrap();
        cache.store_compiled(&path, b"fake-bytecode", &roots).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&path, "const x = 2;").unwrap();

        let handle = cache.load_script_source(&path, &roots).unwrap();
        assert!(handle.compiled_bytes.is_none());
        assert_eq!(handle.source_bytes, "const x = 2;");
    }
}
