//! Data model of the serialized action-graph message.
//!
//! These structs mirror the action-graph dump produced by `bazel aquery
//! --output=jsonproto`: flat collections of artifacts, actions, depsets and
//! path fragments, all cross-referenced by integer ids. The ids are only
//! meaningful within a single dump; nothing here should be cached across
//! compilations.

use serde::{Deserialize, Serialize};

/// Identifies an artifact within one action-graph dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub u32);

impl std::fmt::Display for ArtifactId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Identifies a depset within one action-graph dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepsetId(pub u32);

impl std::fmt::Display for DepsetId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Identifies a path fragment within one action-graph dump.
///
/// Id 0 never names a fragment; a `parent_id` of 0 marks a path root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathFragmentId(pub u32);

impl std::fmt::Display for PathFragmentId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A single file in the action graph, named indirectly through the
/// path-fragment tree.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Artifact {
  #[serde(default)]
  pub id: ArtifactId,
  #[serde(default, alias = "pathFragmentId")]
  pub path_fragment_id: PathFragmentId,
}

/// One path segment plus a link to its parent segment.
///
/// Full paths are reconstructed by walking `parent_id` links to a root and
/// joining the labels.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathFragment {
  #[serde(default)]
  pub id: PathFragmentId,
  #[serde(default)]
  pub label: String,
  #[serde(default, alias = "parentId")]
  pub parent_id: PathFragmentId,
}

/// A node in the shared depset DAG: direct artifacts plus child depsets.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepSetOfFiles {
  #[serde(default)]
  pub id: DepsetId,
  #[serde(default, alias = "directArtifactIds")]
  pub direct_artifact_ids: Vec<ArtifactId>,
  #[serde(default, alias = "transitiveDepSetIds")]
  pub transitive_dep_set_ids: Vec<DepsetId>,
}

/// A key/value pair, used for environment variables and template
/// substitutions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuePair {
  #[serde(default)]
  pub key: String,
  #[serde(default)]
  pub value: String,
}

/// One command invocation in the action graph.
///
/// Which fields are populated depends on the mnemonic: plain command actions
/// carry `arguments`, template expansions carry `template_content` and
/// `substitutions`, file writes carry `file_contents`, and unresolved
/// symlinks carry `unresolved_symlink_target`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Action {
  #[serde(default, alias = "targetId")]
  pub target_id: u32,
  #[serde(default)]
  pub mnemonic: String,
  #[serde(default)]
  pub arguments: Vec<String>,
  #[serde(default, alias = "environmentVariables")]
  pub environment_variables: Vec<KeyValuePair>,
  #[serde(default, alias = "inputDepSetIds")]
  pub input_dep_set_ids: Vec<DepsetId>,
  #[serde(default, alias = "outputIds")]
  pub output_ids: Vec<ArtifactId>,
  #[serde(default, alias = "templateContent")]
  pub template_content: String,
  #[serde(default)]
  pub substitutions: Vec<KeyValuePair>,
  #[serde(default, alias = "fileContents")]
  pub file_contents: String,
  #[serde(default, alias = "unresolvedSymlinkTarget")]
  pub unresolved_symlink_target: String,
  #[serde(default, alias = "isExecutable")]
  pub is_executable: bool,
}

/// The build target an action belongs to. Only used to label diagnostics.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Target {
  #[serde(default)]
  pub id: u32,
  #[serde(default)]
  pub label: String,
}

/// Top-level action-graph dump.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionGraph {
  #[serde(default)]
  pub artifacts: Vec<Artifact>,
  #[serde(default)]
  pub actions: Vec<Action>,
  #[serde(default)]
  pub targets: Vec<Target>,
  #[serde(default, alias = "depSetOfFiles")]
  pub dep_set_of_files: Vec<DepSetOfFiles>,
  #[serde(default, alias = "pathFragments")]
  pub path_fragments: Vec<PathFragment>,
}

impl ActionGraph {
  /// Deserialize an action-graph dump from its JSON encoding.
  pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(bytes)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_snake_case_fields() {
    let graph = ActionGraph::from_json(
      br#"{
        "artifacts": [{ "id": 1, "path_fragment_id": 2 }],
        "actions": [{
          "target_id": 1,
          "mnemonic": "Genrule",
          "arguments": ["touch", "out"],
          "input_dep_set_ids": [1],
          "output_ids": [1]
        }],
        "dep_set_of_files": [{ "id": 1, "direct_artifact_ids": [1] }],
        "path_fragments": [{ "id": 2, "label": "out" }]
      }"#,
    )
    .unwrap();

    assert_eq!(graph.artifacts.len(), 1);
    assert_eq!(graph.artifacts[0].path_fragment_id, PathFragmentId(2));
    assert_eq!(graph.actions[0].mnemonic, "Genrule");
    assert_eq!(graph.dep_set_of_files[0].direct_artifact_ids, vec![ArtifactId(1)]);
  }

  #[test]
  fn parses_camel_case_aliases() {
    let graph = ActionGraph::from_json(
      br#"{
        "artifacts": [{ "id": 1, "pathFragmentId": 2 }],
        "actions": [{
          "targetId": 7,
          "mnemonic": "TemplateExpand",
          "templateContent": "x=%x%",
          "substitutions": [{ "key": "%x%", "value": "1" }],
          "outputIds": [1]
        }],
        "depSetOfFiles": [{ "id": 3, "transitiveDepSetIds": [4] }],
        "pathFragments": [{ "id": 2, "label": "out", "parentId": 0 }]
      }"#,
    )
    .unwrap();

    assert_eq!(graph.actions[0].target_id, 7);
    assert_eq!(graph.actions[0].template_content, "x=%x%");
    assert_eq!(graph.dep_set_of_files[0].transitive_dep_set_ids, vec![DepsetId(4)]);
  }

  #[test]
  fn missing_collections_default_to_empty() {
    let graph = ActionGraph::from_json(b"{}").unwrap();
    assert!(graph.artifacts.is_empty());
    assert!(graph.actions.is_empty());
    assert!(graph.targets.is_empty());
    assert!(graph.dep_set_of_files.is_empty());
    assert!(graph.path_fragments.is_empty());
  }
}
