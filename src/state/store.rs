//! Graph and feature persistence.
//!
//! [`JsonFileStore`] keeps one directory per feature under the configured
//! features dir, with `graph.json` and `feature.json` inside. Writes go to a
//! temp file first and rename into place, so a crash mid-write never leaves
//! a half-written state file. [`MemoryStore`] backs tests and embedding.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::clog_debug;
use crate::core::feature::{Feature, FeatureId};
use crate::core::graph::Graph;
use crate::error::Result;

/// Persistence seam for the orchestrator.
pub trait GraphStore: Send + Sync {
    fn load_graph(&self, feature: &FeatureId) -> Result<Option<Graph>>;
    fn save_graph(&self, feature: &FeatureId, graph: &Graph) -> Result<()>;
    fn load_feature(&self, feature: &FeatureId) -> Result<Option<Feature>>;
    fn save_feature(&self, feature: &Feature) -> Result<()>;
}

/// JSON files on disk, one directory per feature.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn feature_dir(&self, feature: &FeatureId) -> PathBuf {
        self.root.join(feature.as_str())
    }

    fn graph_path(&self, feature: &FeatureId) -> PathBuf {
        self.feature_dir(feature).join("graph.json")
    }

    fn feature_path(&self, feature: &FeatureId) -> PathBuf {
        self.feature_dir(feature).join("feature.json")
    }

    fn write_atomic(path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

impl GraphStore for JsonFileStore {
    fn load_graph(&self, feature: &FeatureId) -> Result<Option<Graph>> {
        Self::read_json(&self.graph_path(feature))
    }

    fn save_graph(&self, feature: &FeatureId, graph: &Graph) -> Result<()> {
        let path = self.graph_path(feature);
        let json = serde_json::to_string_pretty(graph)?;
        Self::write_atomic(&path, &json)?;
        clog_debug!("saved graph for {} ({} tasks)", feature, graph.len());
        Ok(())
    }

    fn load_feature(&self, feature: &FeatureId) -> Result<Option<Feature>> {
        Self::read_json(&self.feature_path(feature))
    }

    fn save_feature(&self, feature: &Feature) -> Result<()> {
        let path = self.feature_path(&feature.id);
        let json = serde_json::to_string_pretty(feature)?;
        Self::write_atomic(&path, &json)
    }
}

/// In-memory store for tests and embedding without a filesystem.
#[derive(Default)]
pub struct MemoryStore {
    graphs: Mutex<HashMap<FeatureId, Graph>>,
    features: Mutex<HashMap<FeatureId, Feature>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphStore for MemoryStore {
    fn load_graph(&self, feature: &FeatureId) -> Result<Option<Graph>> {
        let graphs = match self.graphs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(graphs.get(feature).cloned())
    }

    fn save_graph(&self, feature: &FeatureId, graph: &Graph) -> Result<()> {
        let mut graphs = match self.graphs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        graphs.insert(feature.clone(), graph.clone());
        Ok(())
    }

    fn load_feature(&self, feature: &FeatureId) -> Result<Option<Feature>> {
        let features = match self.features.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(features.get(feature).cloned())
    }

    fn save_feature(&self, feature: &Feature) -> Result<()> {
        let mut features = match self.features.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        features.insert(feature.id.clone(), feature.clone());
        Ok(())
    }
}
