//! Virtual file system for `require` / `load`
//!
//! The core never touches the disk directly; hosts supply a [`Vfs`] with
//! the `{exists, read}` pair from the embedding contract. `exists` must
//! be pure; `read` returns the file bytes.
//!
//! Resolution: a trailing `.rse` is stripped from the request, then each
//! search path is probed for `path/stem.rse` and then the bare
//! `path/stem`; the first hit wins. `require` is idempotent per resolved
//! path; `load` re-reads every time.

use std::path::Path;

pub trait Vfs {
    /// Must be pure: same answer for the same path while the
    /// interpreter runs.
    fn exists(&self, path: &str) -> bool;
    fn read(&self, path: &str) -> Option<Vec<u8>>;
}

/// Resolve a `require`/`load` request against the search paths.
pub fn resolve(vfs: &dyn Vfs, search_paths: &[String], request: &str) -> Option<String> {
    let stem = request.strip_suffix(".rse").unwrap_or(request);
    let candidates = |dir: &str| {
        let joined = if dir.is_empty() {
            stem.to_string()
        } else {
            format!("{}/{}", dir.trim_end_matches('/'), stem)
        };
        [format!("{joined}.rse"), joined]
    };
    for dir in search_paths {
        for candidate in candidates(dir) {
            if vfs.exists(&candidate) {
                return Some(candidate);
            }
        }
    }
    // bare path, for absolute requests
    for candidate in candidates("") {
        if vfs.exists(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// In-memory file set, for tests and sandboxed hosts.
#[derive(Debug, Default)]
pub struct MemVfs {
    files: Vec<(String, Vec<u8>)>,
}

impl MemVfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.into(), content.into()));
        self
    }
}

impl Vfs for MemVfs {
    fn exists(&self, path: &str) -> bool {
        self.files.iter().any(|(p, _)| p == path)
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.files.iter().find(|(p, _)| p == path).map(|(_, c)| c.clone())
    }
}

/// Pass-through to the real file system rooted at a directory.
#[derive(Debug)]
pub struct DirVfs {
    root: std::path::PathBuf,
}

impl DirVfs {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        DirVfs { root: root.into() }
    }

    fn full(&self, path: &str) -> std::path::PathBuf {
        let rel = Path::new(path);
        if rel.is_absolute() {
            rel.to_path_buf()
        } else {
            self.root.join(rel)
        }
    }
}

impl Vfs for DirVfs {
    fn exists(&self, path: &str) -> bool {
        self.full(path).is_file()
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.full(path)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_strips_extension_and_probes_paths() {
        let vfs = MemVfs::new().add("/lib/foo.rse", "def foo\n 3\n end");
        let paths = vec!["/lib".to_string(), "/data".to_string()];
        assert_eq!(resolve(&vfs, &paths, "foo"), Some("/lib/foo.rse".to_string()));
        assert_eq!(resolve(&vfs, &paths, "foo.rse"), Some("/lib/foo.rse".to_string()));
        assert_eq!(resolve(&vfs, &paths, "missing"), None);
    }

    #[test]
    fn test_resolve_prefers_extension_then_bare() {
        let vfs = MemVfs::new().add("/lib/cfg", "x").add("/lib/cfg.rse", "y");
        let paths = vec!["/lib".to_string()];
        assert_eq!(resolve(&vfs, &paths, "cfg"), Some("/lib/cfg.rse".to_string()));
    }

    #[test]
    fn test_resolve_first_search_path_wins() {
        let vfs = MemVfs::new().add("/a/m.rse", "1").add("/b/m.rse", "2");
        let paths = vec!["/a".to_string(), "/b".to_string()];
        assert_eq!(resolve(&vfs, &paths, "m"), Some("/a/m.rse".to_string()));
    }
}
