//! Prompt recipes loaded by name from a directory.
//!
//! Call sites never embed full prompts; they ask the store for a named
//! recipe and substitute `{placeholder}` slots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{Result, SolverError};

/// Loads and renders named prompt templates from a recipe directory.
///
/// A recipe named `pdp_specs` lives at `<dir>/pdp_specs.txt`. Loaded recipes
/// are cached for the life of the store.
pub struct RecipeStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

impl RecipeStore {
    /// Create a store rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Directory this store reads from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load a recipe by name.
    pub fn load(&self, name: &str) -> Result<String> {
        if let Ok(cache) = self.cache.read() {
            if let Some(body) = cache.get(name) {
                return Ok(body.clone());
            }
        }
        let path = self.dir.join(format!("{name}.txt"));
        let body = std::fs::read_to_string(&path).map_err(|_| SolverError::RecipeNotFound {
            name: name.to_string(),
        })?;
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(name.to_string(), body.clone());
        }
        Ok(body)
    }

    /// Load a recipe and substitute `{key}` placeholders.
    pub fn render(&self, name: &str, vars: &HashMap<&str, String>) -> Result<String> {
        let mut body = self.load(name)?;
        for (key, value) in vars {
            body = body.replace(&format!("{{{key}}}"), value);
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_render() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("greet.txt"), "Hello {name}, query: {query}").unwrap();

        let store = RecipeStore::new(dir.path());
        let mut vars = HashMap::new();
        vars.insert("name", "tester".to_string());
        vars.insert("query", "gpu laptop".to_string());

        let rendered = store.render("greet", &vars).unwrap();
        assert_eq!(rendered, "Hello tester, query: gpu laptop");
    }

    #[test]
    fn test_missing_recipe_is_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecipeStore::new(dir.path());
        let err = store.load("nope").unwrap_err();
        assert!(matches!(err, SolverError::RecipeNotFound { .. }));
    }

    #[test]
    fn test_cache_survives_file_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("once.txt");
        std::fs::write(&path, "cached body").unwrap();

        let store = RecipeStore::new(dir.path());
        assert_eq!(store.load("once").unwrap(), "cached body");

        std::fs::remove_file(&path).unwrap();
        assert_eq!(store.load("once").unwrap(), "cached body");
    }
}
