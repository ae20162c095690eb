//! Memoized depset flattening.
//!
//! Depsets are shared aggressively between actions; the same node is
//! routinely reachable from many parents. Flattening therefore memoizes per
//! depset id: each node is traversed once per compilation no matter how many
//! actions ask for it. The memo cache lives in the per-invocation
//! [`DepsetFlattener`], never in module state.

use std::collections::HashMap;

use crate::error::CompileError;
use crate::graph::{ArtifactId, DepsetId};
use crate::index::ArtifactIndex;

/// Flattens validated depsets into ordered artifact lists, caching per id.
pub struct DepsetFlattener<'a> {
  index: &'a ArtifactIndex,
  cache: HashMap<DepsetId, Vec<ArtifactId>>,
}

impl<'a> DepsetFlattener<'a> {
  pub fn new(index: &'a ArtifactIndex) -> Self {
    Self { index, cache: HashMap::new() }
  }

  /// Flatten one depset in post order: each child's flattened contents in
  /// declared order, then this node's own direct artifacts.
  ///
  /// Pruned-empty ids flatten to nothing. The order is structural, so
  /// repeated calls yield identical lists.
  ///
  /// # Errors
  ///
  /// `UndefinedDepset` if the id is neither validated nor known-empty.
  pub fn flatten(&mut self, id: DepsetId) -> Result<Vec<ArtifactId>, CompileError> {
    if let Some(cached) = self.cache.get(&id) {
      return Ok(cached.clone());
    }
    if self.index.is_empty_depset(id) {
      return Ok(Vec::new());
    }
    let depset = self.index.depset(id).ok_or(CompileError::UndefinedDepset(id))?;

    let mut artifacts = Vec::new();
    for &child in &depset.children {
      artifacts.extend(self.flatten(child)?);
    }
    artifacts.extend_from_slice(&depset.direct_artifacts);

    self.cache.insert(id, artifacts.clone());
    Ok(artifacts)
  }

  /// Flatten each id in turn and resolve the artifacts to paths.
  ///
  /// Only the specialized lowerings use this; normal actions hand the
  /// caller unexpanded depset hashes instead.
  pub fn resolve_paths(&mut self, ids: &[DepsetId]) -> Result<Vec<String>, CompileError> {
    let mut paths = Vec::new();
    for &id in ids {
      for artifact in self.flatten(id)? {
        let path = self
          .index
          .artifact_path(artifact)
          .ok_or(CompileError::UndefinedArtifact(artifact))?;
        paths.push(path.to_string());
      }
    }
    Ok(paths)
  }
}
