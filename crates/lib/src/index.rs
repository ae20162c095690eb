//! Graph indexing: artifact paths, validated depsets, middleman substitution.
//!
//! This is the first compilation phase. It turns the flat id-keyed
//! collections of an [`ActionGraph`](crate::graph::ActionGraph) into lookup
//! tables the later phases consult:
//!
//! - every artifact id is eagerly resolved to its full path by walking the
//!   path-fragment parent chain;
//! - every depset is validated and rewritten: middleman artifacts are
//!   replaced by the depsets they stand for, unhandled toolchain files are
//!   dropped, and depsets left empty by that filtering are pruned;
//! - every surviving depset is assigned a content hash so identical depsets
//!   compare equal across compilations.
//!
//! All state is owned by the per-invocation [`ArtifactIndex`]; ids from one
//! dump never leak into another.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::consts::{BAZEL_TOOLS_PREFIX, MIDDLEMAN_MNEMONIC, PY3_WRAPPER_SUFFIX, RUNFILES_MANIFEST_SUFFIX};
use crate::error::CompileError;
use crate::graph::{ActionGraph, ArtifactId, DepSetOfFiles, DepsetId, PathFragment, PathFragmentId};

/// Stable, content-derived identifier of a validated depset.
///
/// A lowercase-hex SHA-256 over the depset's direct paths and its children's
/// hashes. Unlike the dump-scoped integer ids, two identical depsets from
/// different compilations get the same `ContentHash`, which lets callers
/// cache flattened results across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A depset as published to the caller: direct paths plus child hashes,
/// identified by content rather than by dump-scoped id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Depset {
  pub content_hash: ContentHash,
  pub direct_artifacts: Vec<String>,
  pub transitive_depset_hashes: Vec<ContentHash>,
}

/// A validated depset, still keyed by dump-scoped ids for internal use.
///
/// `direct_artifacts` has already been filtered (middlemen swapped out,
/// toolchain files dropped) and `children` only names non-empty, validated
/// depsets.
#[derive(Debug, Clone)]
pub struct ValidatedDepset {
  pub direct_artifacts: Vec<ArtifactId>,
  pub children: Vec<DepsetId>,
  pub content_hash: ContentHash,
}

/// Lookup tables built once per compilation from one action-graph dump.
#[derive(Debug)]
pub struct ArtifactIndex {
  artifact_paths: HashMap<ArtifactId, String>,
  depsets: HashMap<DepsetId, ValidatedDepset>,
  empty_depsets: HashSet<DepsetId>,
  /// Depset ids in the order they were first validated, for deterministic
  /// publication.
  validated_order: Vec<DepsetId>,
}

impl ArtifactIndex {
  /// Build the index from a deserialized action graph.
  ///
  /// # Errors
  ///
  /// Fails with `UndefinedPathFragment`/`PathFragmentCycle` if an artifact
  /// path cannot be expanded, `UndefinedArtifact`/`UndefinedChildDepset` if
  /// a depset references unknown ids, and `CyclicDepset` if the depset
  /// reference graph (including middleman substitutions) is not acyclic.
  pub fn new(graph: &ActionGraph) -> Result<Self, CompileError> {
    let fragments: HashMap<PathFragmentId, &PathFragment> =
      graph.path_fragments.iter().map(|fragment| (fragment.id, fragment)).collect();

    let mut artifact_paths = HashMap::with_capacity(graph.artifacts.len());
    for artifact in &graph.artifacts {
      let path = expand_path_fragment(artifact.path_fragment_id, &fragments)?;
      artifact_paths.insert(artifact.id, path);
    }

    // A middleman action's outputs are never real files: wherever one of
    // them appears as a depset input, the middleman's own input depsets are
    // substituted instead.
    let mut middleman_depsets: HashMap<ArtifactId, Vec<DepsetId>> = HashMap::new();
    for action in &graph.actions {
      if action.mnemonic == MIDDLEMAN_MNEMONIC {
        for &output in &action.output_ids {
          middleman_depsets.insert(output, action.input_dep_set_ids.clone());
        }
      }
    }

    let raw: HashMap<DepsetId, &DepSetOfFiles> =
      graph.dep_set_of_files.iter().map(|depset| (depset.id, depset)).collect();
    verify_acyclic(&raw, &middleman_depsets)?;

    let mut index = ArtifactIndex {
      artifact_paths,
      depsets: HashMap::with_capacity(raw.len()),
      empty_depsets: HashSet::new(),
      validated_order: Vec::with_capacity(raw.len()),
    };
    for depset in &graph.dep_set_of_files {
      index.validate_depset(depset, &raw, &middleman_depsets)?;
    }

    debug!(
      artifacts = index.artifact_paths.len(),
      depsets = index.depsets.len(),
      pruned_empty = index.empty_depsets.len(),
      "indexed action graph"
    );
    Ok(index)
  }

  /// Validate one depset, recursing into its children first.
  ///
  /// Filters the direct-artifact list (middleman substitution, toolchain
  /// file pruning), then records the depset either as validated with a
  /// content hash or as empty. Safe to call repeatedly; already-processed
  /// ids return immediately. The up-front acyclicity check bounds the
  /// recursion.
  fn validate_depset(
    &mut self,
    depset: &DepSetOfFiles,
    raw: &HashMap<DepsetId, &DepSetOfFiles>,
    middleman_depsets: &HashMap<ArtifactId, Vec<DepsetId>>,
  ) -> Result<(), CompileError> {
    if self.depsets.contains_key(&depset.id) || self.empty_depsets.contains(&depset.id) {
      return Ok(());
    }

    let mut children = depset.transitive_dep_set_ids.clone();
    let mut direct_artifacts = Vec::with_capacity(depset.direct_artifact_ids.len());
    let mut direct_paths = Vec::with_capacity(depset.direct_artifact_ids.len());
    for &artifact_id in &depset.direct_artifact_ids {
      let path = self
        .artifact_paths
        .get(&artifact_id)
        .ok_or(CompileError::UndefinedArtifact(artifact_id))?;
      if let Some(substitutes) = middleman_depsets.get(&artifact_id) {
        children.extend_from_slice(substitutes);
      } else if is_pruned_path(path) {
        continue;
      } else {
        direct_paths.push(path.clone());
        direct_artifacts.push(artifact_id);
      }
    }

    let mut kept_children = Vec::with_capacity(children.len());
    for child_id in children {
      let child = raw
        .get(&child_id)
        .copied()
        .ok_or(CompileError::UndefinedChildDepset { id: child_id, parent: depset.id })?;
      self.validate_depset(child, raw, middleman_depsets)?;
      if !self.empty_depsets.contains(&child_id) {
        kept_children.push(child_id);
      }
    }

    if direct_artifacts.is_empty() && kept_children.is_empty() {
      self.empty_depsets.insert(depset.id);
      return Ok(());
    }

    let content_hash = {
      let child_hashes: Vec<&ContentHash> =
        kept_children.iter().map(|child| &self.depsets[child].content_hash).collect();
      depset_content_hash(&direct_paths, &child_hashes)
    };
    self.depsets.insert(
      depset.id,
      ValidatedDepset { direct_artifacts, children: kept_children, content_hash },
    );
    self.validated_order.push(depset.id);
    Ok(())
  }

  /// Full path of an artifact, if the id is known.
  pub fn artifact_path(&self, id: ArtifactId) -> Option<&str> {
    self.artifact_paths.get(&id).map(String::as_str)
  }

  /// Validated depset for an id, if it exists and was not pruned as empty.
  pub fn depset(&self, id: DepsetId) -> Option<&ValidatedDepset> {
    self.depsets.get(&id)
  }

  /// Whether an id names a depset that was pruned as empty.
  pub fn is_empty_depset(&self, id: DepsetId) -> bool {
    self.empty_depsets.contains(&id)
  }

  /// Content hashes for an action's input depset ids.
  ///
  /// Pruned-empty ids are silently skipped. An id that is neither validated
  /// nor known-empty is an `UndefinedDepset` error.
  pub fn depset_hashes(&self, ids: &[DepsetId]) -> Result<Vec<ContentHash>, CompileError> {
    let mut hashes = Vec::with_capacity(ids.len());
    for &id in ids {
      if let Some(depset) = self.depsets.get(&id) {
        hashes.push(depset.content_hash.clone());
      } else if !self.empty_depsets.contains(&id) {
        return Err(CompileError::UndefinedDepset(id));
      }
    }
    Ok(hashes)
  }

  /// Publishable depset descriptors, in first-validated order, deduplicated
  /// by content hash.
  pub fn depset_descriptors(&self) -> Vec<Depset> {
    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(self.validated_order.len());
    for id in &self.validated_order {
      let validated = &self.depsets[id];
      if !seen.insert(&validated.content_hash) {
        continue;
      }
      descriptors.push(Depset {
        content_hash: validated.content_hash.clone(),
        direct_artifacts: validated
          .direct_artifacts
          .iter()
          .map(|artifact| self.artifact_paths[artifact].clone())
          .collect(),
        transitive_depset_hashes: validated
          .children
          .iter()
          .map(|child| self.depsets[child].content_hash.clone())
          .collect(),
      });
    }
    descriptors
  }
}

/// Paths dropped from depset direct lists: files the exported action set
/// never produces, so downstream consumers must not wait on them.
fn is_pruned_path(path: &str) -> bool {
  path.ends_with(PY3_WRAPPER_SUFFIX)
    || path.ends_with(RUNFILES_MANIFEST_SUFFIX)
    || path.starts_with(BAZEL_TOOLS_PREFIX)
}

/// Expand a path-fragment id to a full path by walking parent links.
///
/// Id 0 terminates the walk. A fragment that names itself as parent, or a
/// longer parent cycle, is a malformed-input error.
fn expand_path_fragment(
  id: PathFragmentId,
  fragments: &HashMap<PathFragmentId, &PathFragment>,
) -> Result<String, CompileError> {
  let mut labels = Vec::new();
  let mut current = id;
  while current.0 > 0 {
    let fragment = fragments
      .get(&current)
      .copied()
      .ok_or(CompileError::UndefinedPathFragment(current))?;
    labels.push(fragment.label.as_str());
    if fragment.parent_id == current || labels.len() > fragments.len() {
      return Err(CompileError::PathFragmentCycle(current));
    }
    current = fragment.parent_id;
  }
  labels.reverse();
  Ok(labels.join("/"))
}

/// Check that the depset reference graph is acyclic before any recursive
/// traversal, counting both declared children and middleman substitutions
/// as edges. References to unknown ids are reported later, during
/// validation, where the referencing depset is known.
fn verify_acyclic(
  raw: &HashMap<DepsetId, &DepSetOfFiles>,
  middleman_depsets: &HashMap<ArtifactId, Vec<DepsetId>>,
) -> Result<(), CompileError> {
  let mut graph = DiGraph::<DepsetId, ()>::new();
  let mut nodes = HashMap::with_capacity(raw.len());
  for &id in raw.keys() {
    nodes.insert(id, graph.add_node(id));
  }
  for (id, depset) in raw {
    let from = nodes[id];
    let declared = depset.transitive_dep_set_ids.iter();
    let substituted = depset
      .direct_artifact_ids
      .iter()
      .filter_map(|artifact| middleman_depsets.get(artifact))
      .flatten();
    for child in declared.chain(substituted) {
      if let Some(&to) = nodes.get(child) {
        graph.add_edge(from, to, ());
      }
    }
  }
  toposort(&graph, None)
    .map(|_| ())
    .map_err(|cycle| CompileError::CyclicDepset(graph[cycle.node_id()]))
}

/// Content hash of a depset: SHA-256 over the direct paths (newline-joined;
/// paths cannot contain newlines) followed by the children's hashes.
fn depset_content_hash(direct_paths: &[String], child_hashes: &[&ContentHash]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(direct_paths.join("\n").as_bytes());
  for hash in child_hashes {
    hasher.update(hash.0.as_bytes());
  }
  ContentHash(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::ActionGraph;

  fn index_of(json: &str) -> Result<ArtifactIndex, CompileError> {
    ArtifactIndex::new(&ActionGraph::from_json(json.as_bytes()).unwrap())
  }

  #[test]
  fn expands_nested_path_fragments() {
    let index = index_of(
      r#"{
        "artifacts": [{ "id": 1, "path_fragment_id": 3 }],
        "path_fragments": [
          { "id": 1, "label": "bazel-out" },
          { "id": 2, "label": "bin", "parent_id": 1 },
          { "id": 3, "label": "liba.so", "parent_id": 2 }]
      }"#,
    )
    .unwrap();

    assert_eq!(index.artifact_path(ArtifactId(1)), Some("bazel-out/bin/liba.so"));
  }

  #[test]
  fn undefined_parent_fragment_is_an_error() {
    let err = index_of(
      r#"{
        "artifacts": [{ "id": 1, "path_fragment_id": 2 }],
        "path_fragments": [{ "id": 2, "label": "two", "parent_id": 3 }]
      }"#,
    )
    .unwrap_err();

    assert_eq!(err.to_string(), "undefined path fragment id 3");
  }

  #[test]
  fn self_referential_fragment_is_an_error() {
    let err = index_of(
      r#"{
        "artifacts": [{ "id": 1, "path_fragment_id": 1 }],
        "path_fragments": [{ "id": 1, "label": "loop", "parent_id": 1 }]
      }"#,
    )
    .unwrap_err();

    assert!(matches!(err, CompileError::PathFragmentCycle(PathFragmentId(1))));
  }

  #[test]
  fn undefined_direct_artifact_is_an_error() {
    let err = index_of(
      r#"{
        "artifacts": [{ "id": 1, "path_fragment_id": 1 }],
        "dep_set_of_files": [{ "id": 1, "direct_artifact_ids": [1, 3] }],
        "path_fragments": [{ "id": 1, "label": "one" }]
      }"#,
    )
    .unwrap_err();

    assert_eq!(err.to_string(), "undefined artifact id 3");
  }

  #[test]
  fn undefined_child_depset_names_the_referencing_depset() {
    let err = index_of(
      r#"{
        "artifacts": [{ "id": 1, "path_fragment_id": 1 }],
        "dep_set_of_files": [
          { "id": 1, "direct_artifact_ids": [1], "transitive_dep_set_ids": [42] }],
        "path_fragments": [{ "id": 1, "label": "one" }]
      }"#,
    )
    .unwrap_err();

    assert_eq!(err.to_string(), "undefined depset id 42 (referenced by depset id 1)");
  }

  #[test]
  fn depset_cycle_is_detected() {
    let err = index_of(
      r#"{
        "artifacts": [{ "id": 1, "path_fragment_id": 1 }],
        "dep_set_of_files": [
          { "id": 1, "direct_artifact_ids": [1], "transitive_dep_set_ids": [2] },
          { "id": 2, "transitive_dep_set_ids": [1] }],
        "path_fragments": [{ "id": 1, "label": "one" }]
      }"#,
    )
    .unwrap_err();

    assert!(matches!(err, CompileError::CyclicDepset(_)));
  }

  #[test]
  fn toolchain_files_are_dropped_from_direct_lists() {
    let index = index_of(
      r#"{
        "artifacts": [
          { "id": 1, "path_fragment_id": 3 },
          { "id": 2, "path_fragment_id": 4 }],
        "dep_set_of_files": [{ "id": 1, "direct_artifact_ids": [1, 2] }],
        "path_fragments": [
          { "id": 1, "label": ".." },
          { "id": 2, "label": "bazel_tools", "parent_id": 1 },
          { "id": 3, "label": "dep1", "parent_id": 2 },
          { "id": 4, "label": "dep2", "parent_id": 1 }]
      }"#,
    )
    .unwrap();

    let descriptors = index.depset_descriptors();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].direct_artifacts, vec!["../dep2"]);
  }

  #[test]
  fn depsets_left_empty_by_pruning_are_dropped_transitively() {
    // 1111 wraps 2222, 4444 wraps 3333; both leaves hold only a toolchain
    // file. Declaration order differs on purpose: 1111 precedes its child,
    // 4444 follows its own.
    let index = index_of(
      r#"{
        "artifacts": [{ "id": 3, "path_fragment_id": 30 }],
        "dep_set_of_files": [
          { "id": 1111, "transitive_dep_set_ids": [2222] },
          { "id": 2222, "direct_artifact_ids": [3] },
          { "id": 3333, "direct_artifact_ids": [3] },
          { "id": 4444, "transitive_dep_set_ids": [3333] }],
        "path_fragments": [
          { "id": 60, "label": ".." },
          { "id": 50, "label": "bazel_tools", "parent_id": 60 },
          { "id": 30, "label": "dep", "parent_id": 50 }]
      }"#,
    )
    .unwrap();

    assert!(index.depset_descriptors().is_empty());
    for id in [1111, 2222, 3333, 4444] {
      assert!(index.is_empty_depset(DepsetId(id)));
    }
    assert!(index.depset_hashes(&[DepsetId(1111), DepsetId(4444)]).unwrap().is_empty());
  }

  #[test]
  fn wrapper_scripts_and_runfiles_manifests_are_dropped() {
    let index = index_of(
      r#"{
        "artifacts": [
          { "id": 1, "path_fragment_id": 2 },
          { "id": 2, "path_fragment_id": 4 },
          { "id": 3, "path_fragment_id": 5 }],
        "dep_set_of_files": [{ "id": 1, "direct_artifact_ids": [1, 2, 3] }],
        "path_fragments": [
          { "id": 1, "label": "tools" },
          { "id": 2, "label": "py3wrapper.sh", "parent_id": 1 },
          { "id": 3, "label": "bin.runfiles", "parent_id": 1 },
          { "id": 4, "label": "MANIFEST", "parent_id": 3 },
          { "id": 5, "label": "keep.py", "parent_id": 1 }]
      }"#,
    )
    .unwrap();

    let descriptors = index.depset_descriptors();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].direct_artifacts, vec!["tools/keep.py"]);
  }

  #[test]
  fn middleman_artifacts_become_child_depsets() {
    let index = index_of(
      r#"{
        "artifacts": [
          { "id": 1, "path_fragment_id": 1 },
          { "id": 2, "path_fragment_id": 2 },
          { "id": 3, "path_fragment_id": 3 },
          { "id": 4, "path_fragment_id": 4 }],
        "dep_set_of_files": [
          { "id": 1, "direct_artifact_ids": [1, 2] },
          { "id": 2, "direct_artifact_ids": [3, 4] }],
        "actions": [{
          "target_id": 1,
          "mnemonic": "Middleman",
          "input_dep_set_ids": [1],
          "output_ids": [3]
        }],
        "path_fragments": [
          { "id": 1, "label": "middleinput_one" },
          { "id": 2, "label": "middleinput_two" },
          { "id": 3, "label": "middleman_artifact" },
          { "id": 4, "label": "maininput" }]
      }"#,
    )
    .unwrap();

    let main = index.depset(DepsetId(2)).unwrap();
    assert_eq!(main.children, vec![DepsetId(1)]);
    let paths: Vec<&str> =
      main.direct_artifacts.iter().map(|id| index.artifact_path(*id).unwrap()).collect();
    assert_eq!(paths, vec!["maininput"]);
  }

  #[test]
  fn identical_depsets_share_a_content_hash() {
    let index = index_of(
      r#"{
        "artifacts": [
          { "id": 1, "path_fragment_id": 1 },
          { "id": 2, "path_fragment_id": 2 }],
        "dep_set_of_files": [
          { "id": 1, "direct_artifact_ids": [1, 2] },
          { "id": 2, "direct_artifact_ids": [1, 2] }],
        "path_fragments": [
          { "id": 1, "label": "a" },
          { "id": 2, "label": "b" }]
      }"#,
    )
    .unwrap();

    let first = &index.depset(DepsetId(1)).unwrap().content_hash;
    let second = &index.depset(DepsetId(2)).unwrap().content_hash;
    assert_eq!(first, second);
    // Published once despite two ids.
    assert_eq!(index.depset_descriptors().len(), 1);
  }

  #[test]
  fn undefined_action_input_depset_is_an_error() {
    let index = index_of(
      r#"{
        "artifacts": [{ "id": 1, "path_fragment_id": 1 }],
        "dep_set_of_files": [{ "id": 1, "direct_artifact_ids": [1] }],
        "path_fragments": [{ "id": 1, "label": "one" }]
      }"#,
    )
    .unwrap();

    let err = index.depset_hashes(&[DepsetId(2)]).unwrap_err();
    assert_eq!(err.to_string(), "undefined input depset id 2");
  }
}
