// File: src/module.rs
//
// Module loading for `import` statements.
// Resolution is textual: `import foo` maps to `foo.can` in the directory
// of the file that issued the import. The loader owns the cache that makes
// each path execute at most once; the VM drives the actual execution.

use crate::errors::{ErrorKind, RuntimeError};
use crate::value::Value;
use ahash::AHashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Tracks loaded modules by absolute path.
///
/// The module value is inserted *before* its body runs, so a cyclic import
/// resolves to the partially-populated module instead of recursing.
#[derive(Default)]
pub struct ModuleLoader {
    cache: AHashMap<PathBuf, Value>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// The file a module name resolves to, relative to the importing file's
    /// directory (or the working directory when there is none).
    pub fn resolve(source_dir: Option<&Rc<PathBuf>>, name: &str) -> PathBuf {
        let file = format!("{}.can", name);
        match source_dir {
            Some(dir) => dir.join(file),
            None => PathBuf::from(file),
        }
    }

    /// Canonical cache key for a path; falls back to the given path when the
    /// file does not exist yet (the read will produce the error).
    pub fn cache_key(path: &Path) -> PathBuf {
        fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    pub fn cached(&self, key: &Path) -> Option<Value> {
        self.cache.get(key).cloned()
    }

    pub fn insert(&mut self, key: PathBuf, module: Value) {
        self.cache.insert(key, module);
    }

    /// Read a module's source, mapping I/O failure to the importer's
    /// runtime error.
    pub fn read_source(path: &Path) -> Result<String, RuntimeError> {
        fs::read_to_string(path).map_err(|_| {
            RuntimeError::plain(
                ErrorKind::ImportError,
                format!("Could not open file {}.", path.display()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolves_relative_to_importing_file() {
        let dir = Rc::new(PathBuf::from("/proj/scripts"));
        assert_eq!(
            ModuleLoader::resolve(Some(&dir), "point"),
            PathBuf::from("/proj/scripts/point.can")
        );
        assert_eq!(ModuleLoader::resolve(None, "point"), PathBuf::from("point.can"));
    }

    #[test]
    fn cache_returns_inserted_module() {
        let mut loader = ModuleLoader::new();
        let key = PathBuf::from("/proj/point.can");
        assert!(loader.cached(&key).is_none());
        loader.insert(key.clone(), Value::Null);
        assert!(loader.cached(&key).is_some());
    }

    #[test]
    fn missing_file_reports_could_not_open() {
        let err = ModuleLoader::read_source(Path::new("no/such/module.can"))
            .expect_err("read should fail");
        assert_eq!(err.kind, ErrorKind::ImportError);
        assert!(err.message.starts_with("Could not open file"));
        assert!(err.message.ends_with("no/such/module.can."));
    }
}
