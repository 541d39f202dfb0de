use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Shared defaults and search locations, threaded explicitly through graph
/// construction instead of living in process-global state.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// Shelf/library directories searched when a graph instance references a
    /// sub-graph by bare file name.
    pub library_paths: Vec<PathBuf>,
    /// Named default assets (fallback textures, environment maps) nodes may
    /// ask for when their own source is missing.
    pub defaults: HashMap<String, PathBuf>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_paths.push(path.into());
        self
    }

    pub fn default_asset(&self, name: &str) -> Option<&Path> {
        self.defaults.get(name).map(PathBuf::as_path)
    }

    /// Search the shelf directories for a file whose name matches `file_name`.
    ///
    /// Directory entries are visited in whatever order the OS returns them;
    /// when several shelf entries share a name the winner is
    /// filesystem-dependent.
    pub fn resolve_library(&self, file_name: &str) -> Option<PathBuf> {
        for dir in &self.library_paths {
            let direct = dir.join(file_name);
            if direct.is_file() {
                return Some(direct);
            }
            let Ok(read) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in read.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    let nested = path.join(file_name);
                    if nested.is_file() {
                        return Some(nested);
                    }
                } else if path.file_name().and_then(|n| n.to_str()) == Some(file_name) {
                    return Some(path);
                }
            }
        }
        None
    }
}
