//! The app asset-root index, spec.md §4.I.
//!
//! Grounded in `original_source/libs/core/src/Assets/AppAssetRoots.cc`:
//! `set_app_root` is `SetAppRootPath`/`FindAssetRoots`, `replace_tokens` is
//! `ReplaceTokens`, and the module-root scan (including the latest-version
//! tracking) is the `FindAssetRoots` module loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error};

use crate::assets::version::Version;

/// Well-known directory name for first-party JS sources under the app root.
pub const ROOT_JS: &str = "js";
/// Well-known directory name for versioned native/JS modules under the app root.
pub const ROOT_MODULES: &str = "modules";
/// Well-known directory name for non-code resources under the app root.
pub const ROOT_RESOURCES: &str = "resources";

const TOKEN_APP_ROOT: &str = "@app-root@";
const TOKEN_JS: &str = "@js@";
const TOKEN_MODULES: &str = "@modules@";
const TOKEN_RESOURCES: &str = "@resources@";

/// Errors raised by [`AssetRootIndex`] operations.
#[derive(Error, Debug)]
pub enum AssetRootError {
    /// `set_app_root` was called on an index that already has one.
    #[error("app root has already been set")]
    AlreadySet,

    /// The candidate path does not exist or is not a directory.
    #[error("app root path does not exist or is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// One of the three well-known directories was missing under the root.
    #[error("app root is missing the required '{0}' directory")]
    MissingWellKnownDirectory(&'static str),

    /// An I/O error occurred while scanning the app root.
    #[error("I/O error scanning app root: {0}")]
    Io(#[from] std::io::Error),
}

/// Maps symbolic module names to filesystem roots, tracks the latest
/// version per bare module name, and resolves `@token@`-prefixed paths
/// against the app root. Populated once via [`AssetRootIndex::set_app_root`].
#[derive(Debug, Default)]
pub struct AssetRootIndex {
    app_root: Option<PathBuf>,
    module_roots: HashMap<String, PathBuf>,
    latest_version: HashMap<String, Version>,
}

impl AssetRootIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// The app root, once set.
    pub fn app_root(&self) -> Option<&Path> {
        self.app_root.as_deref()
    }

    /// Set the app root. Succeeds only once, and only when `path` is an
    /// existing directory that contains `js`, `modules`, and `resources`
    /// subdirectories. On success, scans `modules/<name>/<version>` and
    /// populates the module-root and latest-version tables.
    pub fn set_app_root(&mut self, path: impl AsRef<Path>) -> Result<(), AssetRootError> {
        if self.app_root.is_some() {
            return Err(AssetRootError::AlreadySet);
        }
        let path = path.as_ref();
        if !path.is_dir() {
            error!(path = %path.display(), "app root path does not exist or is not a directory");
            return Err(AssetRootError::NotADirectory(path.to_path_buf()));
        }
        let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.find_asset_roots(&absolute)?;
        self.app_root = Some(absolute);
        Ok(())
    }

    fn find_asset_roots(&mut self, root: &Path) -> Result<(), AssetRootError> {
        let mut found_js = false;
        let mut found_modules = false;
        let mut found_resources = false;

        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_string_lossy().as_ref() {
                ROOT_JS => found_js = true,
                ROOT_MODULES => found_modules = true,
                ROOT_RESOURCES => found_resources = true,
                _ => {}
            }
        }

        for (found, name) in [
            (found_js, ROOT_JS),
            (found_modules, ROOT_MODULES),
            (found_resources, ROOT_RESOURCES),
        ] {
            if !found {
                error!(directory = name, "app root is missing a required directory");
                return Err(AssetRootError::MissingWellKnownDirectory(name));
            }
        }

        self.module_roots.insert(ROOT_JS.to_string(), root.join(ROOT_JS));
        self.module_roots.insert(ROOT_RESOURCES.to_string(), root.join(ROOT_RESOURCES));

        let modules_dir = root.join(ROOT_MODULES);
        for entry in std::fs::read_dir(&modules_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let module_name = entry.file_name().to_string_lossy().into_owned();
            if module_name == ROOT_JS || module_name == ROOT_RESOURCES {
                continue;
            }
            let module_dir = entry.path();
            for version_entry in std::fs::read_dir(&module_dir)? {
                let version_entry = version_entry?;
                if !version_entry.file_type()?.is_dir() {
                    continue;
                }
                let version_name = version_entry.file_name().to_string_lossy().into_owned();
                let version = Version::parse(&version_name);
                if !version.is_valid() {
                    continue;
                }
                let qualified = format!("{module_name}/{version_name}");
                self.module_roots.insert(qualified, version_entry.path());
                match self.latest_version.get(&module_name) {
                    Some(latest) if *latest >= version => {}
                    _ => {
                        self.latest_version.insert(module_name.clone(), version);
                    }
                }
            }
        }

        debug!(
            modules = self.module_roots.len(),
            versions = self.latest_version.len(),
            "asset roots indexed"
        );
        Ok(())
    }

    /// Insert a module root by name. Returns `false` if the name is already
    /// present.
    pub fn add_module_root(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> bool {
        match self.module_roots.entry(name.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(path.into());
                true
            }
        }
    }

    /// Look up a module root's filesystem path by name.
    pub fn find_module_root(&self, name: &str) -> Option<&Path> {
        self.module_roots.get(name).map(PathBuf::as_path)
    }

    /// The latest seen [`Version`] for a bare module name, if any.
    pub fn latest_version(&self, name: &str) -> Option<&Version> {
        self.latest_version.get(name)
    }

    /// Expand a path that starts with one of the recognized tokens
    /// (`@app-root@`, `@js@`, `@modules@`, `@resources@`) into an absolute
    /// path rooted at the app root. Paths without a recognized token are
    /// returned unchanged.
    pub fn replace_tokens(&self, path: impl AsRef<Path>) -> PathBuf {
        let Some(app_root) = &self.app_root else {
            return path.as_ref().to_path_buf();
        };
        let raw = path.as_ref().to_string_lossy();

        let (strip_len, literal) = if raw.starts_with(TOKEN_APP_ROOT) {
            (TOKEN_APP_ROOT.len(), None)
        } else if raw.starts_with(TOKEN_JS) {
            (TOKEN_JS.len(), Some(ROOT_JS))
        } else if raw.starts_with(TOKEN_MODULES) {
            (TOKEN_MODULES.len(), Some(ROOT_MODULES))
        } else if raw.starts_with(TOKEN_RESOURCES) {
            (TOKEN_RESOURCES.len(), Some(ROOT_RESOURCES))
        } else {
            return path.as_ref().to_path_buf();
        };

        let remainder = raw[strip_len..].trim_start_matches(['/', '\\']);
        let mut result = app_root.clone();
        if let Some(literal) = literal {
            result.push(literal);
        }
        if !remainder.is_empty() {
            result.push(remainder);
        }
        result
    }

    /// Token-expand `path`, then compute it relative to the app root.
    pub fn make_relative_to_app_root(&self, path: impl AsRef<Path>) -> PathBuf {
        let expanded = self.replace_tokens(path);
        match &self.app_root {
            Some(root) => expanded.strip_prefix(root).map(Path::to_path_buf).unwrap_or(expanded),
            None => expanded,
        }
    }

    /// Token-expand `path`, then make it absolute under the app root if it
    /// is not already.
    pub fn make_absolute_to_app_root(&self, path: impl AsRef<Path>) -> PathBuf {
        let expanded = self.replace_tokens(path);
        if expanded.is_absolute() {
            return expanded;
        }
        match &self.app_root {
            Some(root) => root.join(expanded),
            None => expanded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn build_fixture() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join(ROOT_JS)).unwrap();
        std::fs::create_dir(dir.path().join(ROOT_RESOURCES)).unwrap();
        let modules = dir.path().join(ROOT_MODULES);
        std::fs::create_dir(&modules).unwrap();
        std::fs::create_dir_all(modules.join("widgets/1.0.0")).unwrap();
        std::fs::create_dir_all(modules.join("widgets/1.2.0")).unwrap();
        dir
    }

    #[test]
    fn set_app_root_requires_well_known_directories() {
        let dir = tempdir().unwrap();
        let mut index = AssetRootIndex::new();
        assert!(matches!(
            index.set_app_root(dir.path()),
            Err(AssetRootError::MissingWellKnownDirectory(_))
        ));
    }

    #[test]
    fn set_app_root_scans_module_versions_and_tracks_latest() {
        let dir = build_fixture();
        let mut index = AssetRootIndex::new();
        index.set_app_root(dir.path()).unwrap();

        assert!(index.find_module_root("widgets/1.0.0").is_some());
        assert!(index.find_module_root("widgets/1.2.0").is_some());
        assert_eq!(index.latest_version("widgets").unwrap(), &Version::parse("1.2.0"));
    }

    #[test]
    fn set_app_root_is_once_only() {
        let dir = build_fixture();
        let mut index = AssetRootIndex::new();
        index.set_app_root(dir.path()).unwrap();
        assert!(matches!(index.set_app_root(dir.path()), Err(AssetRootError::AlreadySet)));
    }

    #[test]
    fn replace_tokens_rebases_under_app_root() {
        let dir = build_fixture();
        let mut index = AssetRootIndex::new();
        index.set_app_root(dir.path()).unwrap();

        let expanded = index.replace_tokens("@js@/main.js");
        assert_eq!(expanded, index.app_root().unwrap().join("js").join("main.js"));

        let expanded_modules = index.replace_tokens("@modules@/widgets/1.0.0/index.js");
        assert_eq!(
            expanded_modules,
            index.app_root().unwrap().join("modules").join("widgets/1.0.0/index.js")
        );
    }

    #[test]
    fn replace_tokens_rebases_app_root_token() {
        let dir = build_fixture();
        let mut index = AssetRootIndex::new();
        index.set_app_root(dir.path()).unwrap();

        let expanded = index.replace_tokens("@app-root@/resources/icon.png");
        assert_eq!(expanded, index.app_root().unwrap().join("resources/icon.png"));
    }

    #[test]
    fn replace_tokens_leaves_untokenized_paths_alone() {
        let dir = build_fixture();
        let mut index = AssetRootIndex::new();
        index.set_app_root(dir.path()).unwrap();
        assert_eq!(index.replace_tokens("plain/path.js"), PathBuf::from("plain/path.js"));
    }

    #[test]
    fn add_module_root_rejects_duplicate_names() {
        let mut index = AssetRootIndex::new();
        assert!(index.add_module_root("foo", "/tmp/foo"));
        assert!(!index.add_module_root("foo", "/tmp/bar"));
    }
}
