//! Datafile Repository (C2)
//!
//! Loads every `*.json` file under the configured datafiles directory on
//! startup, parses it as a generic JSON tree, and keeps it keyed by its path
//! relative to that directory. Datafiles are opaque outside the known
//! `features.*.variations[*]` sub-shape (spec §3, §9).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::error::{OptimizerError, Result};
use crate::types::VARIATIONS_KEY;

/// One variant entry as it appears in a datafile's `variations` array.
#[derive(Debug, Clone)]
pub struct VariantRef {
    pub value: String,
    pub weight: f64,
}

/// A loaded, parsed datafile.
#[derive(Debug, Clone)]
pub struct Datafile {
    /// Path relative to the datafiles directory; identifies the datafile.
    pub path: String,
    /// The full parsed JSON tree.
    pub root: Value,
}

impl Datafile {
    /// Verify the minimal `features` sub-shape; everything else is opaque.
    fn sanity_check(path: &str, root: &Value) -> Result<()> {
        if !root.get("features").map(Value::is_object).unwrap_or(false) {
            return Err(OptimizerError::InvalidDatafile {
                path: path.to_string(),
                reason: "missing top-level \"features\" object".to_string(),
            });
        }
        Ok(())
    }

    /// Names of every feature that carries a variant array.
    pub fn feature_keys(&self) -> Vec<String> {
        self.root
            .get("features")
            .and_then(Value::as_object)
            .map(|features| {
                features
                    .iter()
                    .filter(|(_, v)| v.get(VARIATIONS_KEY).and_then(Value::as_array).is_some())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The ordered `(value, weight)` pairs for one feature's variants.
    pub fn variants(&self, feature: &str) -> Option<Vec<VariantRef>> {
        let variations = self
            .root
            .get("features")?
            .get(feature)?
            .get(VARIATIONS_KEY)?
            .as_array()?;

        let mut out = Vec::with_capacity(variations.len());
        for v in variations {
            let value = v.get("value")?.as_str()?.to_string();
            let weight = v.get("weight")?.as_f64()?;
            out.push(VariantRef { value, weight });
        }
        Some(out)
    }
}

/// In-memory, read-only-after-load catalogue of parsed datafiles.
///
/// Reload is an explicit, exclusive operation (spec §3: "invalidated only
/// on explicit reload"); there is no file watcher.
pub struct DatafileRepository {
    root_dir: PathBuf,
    datafiles: HashMap<String, Datafile>,
}

impl DatafileRepository {
    /// Load every `*.json` file under `root_dir` into memory.
    pub fn load(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        if !root_dir.is_dir() {
            return Err(OptimizerError::config(format!(
                "datafiles directory does not exist: {}",
                root_dir.display()
            )));
        }

        let mut datafiles = HashMap::new();
        let mut stack = vec![root_dir.clone()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let rel = path
                    .strip_prefix(&root_dir)
                    .unwrap_or(path.as_path())
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/");

                match Self::load_one(&path, &rel) {
                    Ok(df) => {
                        datafiles.insert(rel, df);
                    }
                    Err(e) => warn!("skipping unparseable datafile {}: {}", rel, e),
                }
            }
        }

        info!(
            "loaded {} datafile(s) from {}",
            datafiles.len(),
            root_dir.display()
        );

        Ok(Self { root_dir, datafiles })
    }

    fn load_one(path: &Path, rel: &str) -> Result<Datafile> {
        let bytes = std::fs::read(path)?;
        let root: Value = serde_json::from_slice(&bytes)?;
        Datafile::sanity_check(rel, &root)?;
        Ok(Datafile {
            path: rel.to_string(),
            root,
        })
    }

    /// Re-scan the datafiles directory, replacing the in-memory catalogue.
    /// Exclusive: callers must not read concurrently with a reload (spec §3).
    pub fn reload(&mut self) -> Result<()> {
        let fresh = Self::load(self.root_dir.clone())?;
        self.datafiles = fresh.datafiles;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&Datafile> {
        self.datafiles.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.datafiles.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Datafile)> {
        self.datafiles.iter()
    }

    pub fn len(&self) -> usize {
        self.datafiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datafiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_datafile(dir: &Path, rel: &str, contents: &str) {
        let full = dir.join(rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(full).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_nested_json_files() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(
            tmp.path(),
            "production/datafile-tag-all.json",
            r#"{"features":{"checkout_button":{"variations":[{"value":"A","weight":50},{"value":"B","weight":50}]}}}"#,
        );
        write_datafile(tmp.path(), "README.md", "not json");

        let repo = DatafileRepository::load(tmp.path()).unwrap();
        assert_eq!(repo.len(), 1);
        let df = repo.get("production/datafile-tag-all.json").unwrap();
        let variants = df.variants("checkout_button").unwrap();
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].value, "A");
    }

    #[test]
    fn missing_features_object_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        write_datafile(tmp.path(), "bad.json", r#"{"not_features": {}}"#);
        let repo = DatafileRepository::load(tmp.path()).unwrap();
        // sanity check failure is logged and skipped, not fatal to the load
        assert!(repo.get("bad.json").is_none());
    }

    #[test]
    fn missing_directory_errors() {
        let err = DatafileRepository::load("/nonexistent/path/does-not-exist");
        assert!(err.is_err());
    }
}
