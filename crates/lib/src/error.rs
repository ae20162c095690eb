//! Typed errors for action-graph compilation.
//!
//! Every error here is fatal to the compilation that raised it: a malformed
//! graph means the whole build-planning cycle must be retried upstream, so
//! there is no partial-result salvage and no internal retry.

use thiserror::Error;

use crate::graph::{ArtifactId, DepsetId, PathFragmentId};

/// Errors raised while compiling an action graph into build statements.
#[derive(Debug, Error)]
pub enum CompileError {
  /// An artifact id referenced by a depset or an action is not in the
  /// artifact table.
  #[error("undefined artifact id {0}")]
  UndefinedArtifact(ArtifactId),

  /// An action references an input depset id that is neither defined nor
  /// known to have been pruned as empty.
  #[error("undefined input depset id {0}")]
  UndefinedDepset(DepsetId),

  /// A depset's transitive-child list references an unknown depset id.
  #[error("undefined depset id {id} (referenced by depset id {parent})")]
  UndefinedChildDepset { id: DepsetId, parent: DepsetId },

  /// An artifact names a path fragment that does not exist.
  #[error("undefined path fragment id {0}")]
  UndefinedPathFragment(PathFragmentId),

  /// Following a fragment's parent links never reaches a root.
  #[error("path fragment cycle at id {0}")]
  PathFragmentCycle(PathFragmentId),

  /// The depset DAG contains a reference cycle.
  #[error("depset cycle detected at depset id {0}")]
  CyclicDepset(DepsetId),

  /// A specialized action does not satisfy its input/output cardinality.
  #[error("malformed {mnemonic} action: expected {expected}, got inputs {inputs:?} and outputs {outputs:?}")]
  MalformedAction {
    mnemonic: String,
    expected: &'static str,
    inputs: Vec<String>,
    outputs: Vec<String>,
  },

  /// More than one output of a single action has a `.d` extension.
  #[error("found multiple potential depfiles {first:?} and {second:?}")]
  MultipleDepfiles { first: String, second: String },

  /// An unspecialized action carries no argument vector to lower.
  #[error("received action with no command")]
  MissingCommand,

  /// A python zip action appeared before the stub statement it must extend.
  #[error("no stub statement found for zipper output {0:?}")]
  MissingCorrespondingAction(String),

  /// A lowering failure, annotated with the action's mnemonic and the label
  /// of its owning target.
  #[error("{source}: [{mnemonic}] [{label}]")]
  ActionFailed {
    mnemonic: String,
    label: String,
    #[source]
    source: Box<CompileError>,
  },
}
