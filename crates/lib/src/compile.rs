//! Lowering actions into build statements.
//!
//! The second compilation phase: each action in the dump is lowered, in
//! declaration order, into at most one [`BuildStatement`] the caller can
//! register with its build executor. The lowering strategy is selected by
//! mnemonic; marker actions and a few unsupported kinds are skipped without
//! error. Any failure aborts the whole compilation, since a malformed action
//! means the dump itself cannot be trusted.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::consts::{BAZEL_TOOLS_LABEL_PREFIX, MIDDLEMAN_MNEMONIC, PY3_WRAPPER_SUFFIX};
use crate::error::CompileError;
use crate::flatten::DepsetFlattener;
use crate::graph::{Action, ActionGraph, KeyValuePair};
use crate::shell;
use crate::index::{ArtifactIndex, ContentHash, Depset};

/// One concrete, executable build step lowered from a source action.
///
/// Inputs appear either as unexpanded depset hashes or as raw paths, never
/// both for the same file: statements that need concrete paths (symlinks,
/// zips) resolve them eagerly, everything else hands the caller depset
/// handles to flatten on its own schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildStatement {
  /// Shell command to run; `None` for pure data statements.
  pub command: Option<String>,
  /// The single `.d` output, split off from `output_paths`.
  pub depfile: Option<String>,
  pub output_paths: Vec<String>,
  /// Outputs that are symlinks, for the caller's symlink-farm bookkeeping.
  pub symlink_paths: Vec<String>,
  pub env: Vec<KeyValuePair>,
  /// Originating mnemonic, kept for diagnostics.
  pub mnemonic: String,
  pub input_depset_hashes: Vec<ContentHash>,
  pub input_paths: Vec<String>,
  /// Literal file contents for write-through statements.
  pub file_contents: Option<String>,
  pub is_executable: bool,
}

/// Everything one compilation produces: build statements in source-action
/// order plus the depset descriptors they reference.
#[derive(Debug, Serialize)]
pub struct CompileOutput {
  pub build_statements: Vec<BuildStatement>,
  pub depsets: Vec<Depset>,
}

/// Compile a deserialized action graph into build statements and reusable
/// depset descriptors.
///
/// All-or-nothing: the first fatal error aborts the compilation with no
/// partial output. Lowering errors are annotated with the offending action's
/// mnemonic and owning target label.
pub fn compile(graph: &ActionGraph) -> Result<CompileOutput, CompileError> {
  let index = ArtifactIndex::new(graph)?;
  let labels: HashMap<u32, &str> =
    graph.targets.iter().map(|target| (target.id, target.label.as_str())).collect();

  let mut compiler = ActionCompiler::new(&index);
  for action in &graph.actions {
    let label = labels.get(&action.target_id).copied().unwrap_or("");
    if label.starts_with(BAZEL_TOOLS_LABEL_PREFIX) {
      // Toolchain-internal files are already pruned from depsets; their
      // producing actions are dropped to match.
      trace!(mnemonic = %action.mnemonic, label, "skipping toolchain-internal action");
      continue;
    }
    compiler.lower(action).map_err(|source| CompileError::ActionFailed {
      mnemonic: action.mnemonic.clone(),
      label: label.to_string(),
      source: Box::new(source),
    })?;
  }

  let build_statements = compiler.statements;
  debug!(actions = graph.actions.len(), statements = build_statements.len(), "lowered actions");
  Ok(CompileOutput { build_statements, depsets: index.depset_descriptors() })
}

/// How an action is lowered, keyed by mnemonic.
enum Strategy {
  /// No statement and no error.
  Skip,
  /// Single-file symlink creation.
  Symlink,
  /// Template expansion with substitutions (only when no argument vector).
  TemplateExpand,
  /// Python zip assembly plus runfiles layout.
  PythonZipper,
  /// Literal content write-through.
  FileWrite,
  /// Symlink to a target that is not an artifact in the graph.
  UnresolvedSymlink,
  /// Anything else with an argument vector.
  Normal,
}

fn strategy_for(action: &Action) -> Strategy {
  match action.mnemonic.as_str() {
    // Fully consumed while building the index.
    MIDDLEMAN_MNEMONIC => Strategy::Skip,
    // Runfiles-tree construction is not representable as a discrete
    // buildable unit here; the zipper lowering covers the python case.
    "SymlinkTree" | "SourceSymlinkManifest" => Strategy::Skip,
    // Placeholder actions.
    "Fail" | "BaselineCoverage" => Strategy::Skip,
    "Symlink" | "SolibSymlink" | "ExecutableSymlink" => Strategy::Symlink,
    "TemplateExpand" if action.arguments.is_empty() => Strategy::TemplateExpand,
    "PythonZipper" => Strategy::PythonZipper,
    "FileWrite" => Strategy::FileWrite,
    "UnresolvedSymlink" => Strategy::UnresolvedSymlink,
    _ => Strategy::Normal,
  }
}

/// Substitution values forced regardless of what the dump specifies. The
/// wrapper script the dump names for `%python_binary%` is pruned from the
/// graph, so the system interpreter is substituted instead.
const TEMPLATE_OVERRIDES: &[(&str, &str)] = &[("%python_binary%", "python3")];

/// Matches whole command-line tokens ending in the wrapper-script name.
static PY3_WRAPPER_TOKEN_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"\S*/py3wrapper\.sh").unwrap());

/// Per-invocation lowering state.
///
/// Actions are lowered independently; the only cross-action state is the
/// append-only statement list, which the zipper lowering also scans to patch
/// its stub statement.
struct ActionCompiler<'a> {
  index: &'a ArtifactIndex,
  flattener: DepsetFlattener<'a>,
  statements: Vec<BuildStatement>,
}

impl<'a> ActionCompiler<'a> {
  fn new(index: &'a ArtifactIndex) -> Self {
    Self { index, flattener: DepsetFlattener::new(index), statements: Vec::new() }
  }

  fn lower(&mut self, action: &Action) -> Result<(), CompileError> {
    let statement = match strategy_for(action) {
      Strategy::Skip => {
        trace!(mnemonic = %action.mnemonic, "skipping action");
        return Ok(());
      }
      Strategy::Symlink => self.symlink_statement(action)?,
      Strategy::TemplateExpand => self.template_expand_statement(action)?,
      Strategy::PythonZipper => self.python_zipper_statement(action)?,
      Strategy::FileWrite => self.file_write_statement(action)?,
      Strategy::UnresolvedSymlink => self.unresolved_symlink_statement(action)?,
      Strategy::Normal => {
        if action.arguments.is_empty() {
          return Err(CompileError::MissingCommand);
        }
        self.normal_statement(action)?
      }
    };
    self.statements.push(statement);
    Ok(())
  }

  /// Resolve an action's outputs, splitting off the depfile.
  ///
  /// An output whose extension is exactly `.d` becomes the statement's
  /// depfile; a second one is a `MultipleDepfiles` error.
  fn output_paths(&self, action: &Action) -> Result<(Vec<String>, Option<String>), CompileError> {
    let mut outputs = Vec::with_capacity(action.output_ids.len());
    let mut depfile: Option<String> = None;
    for &id in &action.output_ids {
      let path = self.index.artifact_path(id).ok_or(CompileError::UndefinedArtifact(id))?;
      if Path::new(path).extension() == Some(OsStr::new("d")) {
        if let Some(first) = depfile {
          return Err(CompileError::MultipleDepfiles { first, second: path.to_string() });
        }
        depfile = Some(path.to_string());
      } else {
        outputs.push(path.to_string());
      }
    }
    Ok((outputs, depfile))
  }

  fn normal_statement(&mut self, action: &Action) -> Result<BuildStatement, CompileError> {
    let command = shell::join_args(&action.arguments);
    let input_depset_hashes = self.index.depset_hashes(&action.input_dep_set_ids)?;
    let (output_paths, depfile) = self.output_paths(action)?;
    Ok(BuildStatement {
      command: Some(command),
      depfile,
      output_paths,
      input_depset_hashes,
      env: action.environment_variables.clone(),
      mnemonic: action.mnemonic.clone(),
      ..Default::default()
    })
  }

  fn symlink_statement(&mut self, action: &Action) -> Result<BuildStatement, CompileError> {
    let (output_paths, depfile) = self.output_paths(action)?;
    let input_paths = self.flattener.resolve_paths(&action.input_dep_set_ids)?;
    if input_paths.len() != 1 || output_paths.len() != 1 {
      return Err(CompileError::MalformedAction {
        mnemonic: action.mnemonic.clone(),
        expected: "1 input and 1 output",
        inputs: input_paths,
        outputs: output_paths,
      });
    }
    let output = &output_paths[0];
    // The link source is anchored at $PWD: consumers of this command run it
    // from arbitrary working directories and mishandle relative targets.
    let command = format!(
      "mkdir -p {dir} && rm -f {out} && ln -sf $PWD/{input} {out}",
      dir = shell::escape(parent_dir(output)),
      out = shell::escape(output),
      input = shell::escape(&input_paths[0]),
    );
    Ok(BuildStatement {
      command: Some(command),
      depfile,
      output_paths: output_paths.clone(),
      symlink_paths: output_paths,
      input_paths,
      env: action.environment_variables.clone(),
      mnemonic: action.mnemonic.clone(),
      ..Default::default()
    })
  }

  fn template_expand_statement(&mut self, action: &Action) -> Result<BuildStatement, CompileError> {
    let (output_paths, depfile) = self.output_paths(action)?;
    if output_paths.len() != 1 {
      return Err(CompileError::MalformedAction {
        mnemonic: action.mnemonic.clone(),
        expected: "exactly 1 output",
        inputs: Vec::new(),
        outputs: output_paths,
      });
    }
    let output = &output_paths[0];
    // Newlines in the expanded content are emitted as literal `\n` and
    // restored by sed, so the command line itself stays single-line.
    let command = format!(
      r#"/bin/bash -c 'echo "{content}" | sed "s/\\\\n/\\n/g" > {output} && chmod a+x {output}'"#,
      content = shell::escape_for_double_quotes(&expand_template(action)),
    );
    let input_depset_hashes = self.index.depset_hashes(&action.input_dep_set_ids)?;
    Ok(BuildStatement {
      command: Some(command),
      depfile,
      output_paths,
      input_depset_hashes,
      env: action.environment_variables.clone(),
      mnemonic: action.mnemonic.clone(),
      ..Default::default()
    })
  }

  fn file_write_statement(&mut self, action: &Action) -> Result<BuildStatement, CompileError> {
    let (output_paths, _) = self.output_paths(action)?;
    let input_depset_hashes = self.index.depset_hashes(&action.input_dep_set_ids)?;
    Ok(BuildStatement {
      output_paths,
      input_depset_hashes,
      env: action.environment_variables.clone(),
      mnemonic: action.mnemonic.clone(),
      file_contents: Some(action.file_contents.clone()),
      is_executable: action.is_executable,
      ..Default::default()
    })
  }

  fn unresolved_symlink_statement(&mut self, action: &Action) -> Result<BuildStatement, CompileError> {
    let (output_paths, depfile) = self.output_paths(action)?;
    if !action.input_dep_set_ids.is_empty() || output_paths.len() != 1 {
      return Err(CompileError::MalformedAction {
        mnemonic: action.mnemonic.clone(),
        expected: "no inputs and exactly 1 output",
        inputs: action.input_dep_set_ids.iter().map(|id| id.to_string()).collect(),
        outputs: output_paths,
      });
    }
    let target = action.unresolved_symlink_target.as_str();
    if target.is_empty() || !is_clean_relative(target) {
      return Err(CompileError::MalformedAction {
        mnemonic: action.mnemonic.clone(),
        expected: "a clean, relative unresolved_symlink_target",
        inputs: vec![target.to_string()],
        outputs: output_paths,
      });
    }
    let output = &output_paths[0];
    let command = format!(
      "mkdir -p {dir} && rm -f {out} && ln -sf {target} {out}",
      dir = shell::escape(parent_dir(output)),
      out = shell::escape(output),
      target = shell::escape(target),
    );
    Ok(BuildStatement {
      command: Some(command),
      depfile,
      output_paths: output_paths.clone(),
      symlink_paths: output_paths,
      env: action.environment_variables.clone(),
      mnemonic: action.mnemonic.clone(),
      ..Default::default()
    })
  }

  /// Lower a python zip action.
  ///
  /// Relies on the dump listing the stub script's template expansion before
  /// the zipper action: the stub statement must already exist so the zip can
  /// be recorded as one of its inputs (the stub is not runnable without it,
  /// an edge the dump omits). A zipper with no preceding stub fails with
  /// `MissingCorrespondingAction`.
  fn python_zipper_statement(&mut self, action: &Action) -> Result<BuildStatement, CompileError> {
    let (output_paths, depfile) = self.output_paths(action)?;
    let input_paths = self.flattener.resolve_paths(&action.input_dep_set_ids)?;
    if input_paths.is_empty() || output_paths.len() != 1 {
      return Err(CompileError::MalformedAction {
        mnemonic: action.mnemonic.clone(),
        expected: "at least 1 input and exactly 1 output",
        inputs: input_paths,
        outputs: output_paths,
      });
    }

    // The wrapper script is claimed as an input but never produced; drop it
    // from the input list and from the command line.
    let input_paths: Vec<String> =
      input_paths.into_iter().filter(|path| !path.ends_with(PY3_WRAPPER_SUFFIX)).collect();
    let command = shell::join_args(&action.arguments);
    let command = PY3_WRAPPER_TOKEN_RE.replace_all(&command, "").into_owned();
    if input_paths.is_empty() {
      return Err(CompileError::MalformedAction {
        mnemonic: action.mnemonic.clone(),
        expected: "at least 1 non-wrapper input",
        inputs: input_paths,
        outputs: output_paths,
      });
    }

    // The stub script expects an unpacked runfiles tree next to the zip,
    // with the workspace reachable as `__main__`. The dump carries no
    // action for that layout, so it is appended here.
    let zip = &output_paths[0];
    let stem = zip.strip_suffix(".zip").unwrap_or(zip);
    let runfiles_dir = format!("{stem}.runfiles");
    let command = format!(
      "{command} && {zipper} x {zip} -d {dir} && ln -sf runfiles {dir}/__main__",
      zipper = shell::escape(&input_paths[0]),
      zip = shell::escape(zip),
      dir = shell::escape(&runfiles_dir),
    );

    let mut stub_found = false;
    for statement in &mut self.statements {
      if statement.output_paths.len() == 1 && statement.output_paths[0] == stem {
        statement.input_paths.push(zip.clone());
        stub_found = true;
      }
    }
    if !stub_found {
      return Err(CompileError::MissingCorrespondingAction(zip.clone()));
    }

    Ok(BuildStatement {
      command: Some(command),
      depfile,
      output_paths: output_paths.clone(),
      input_paths,
      env: action.environment_variables.clone(),
      mnemonic: action.mnemonic.clone(),
      ..Default::default()
    })
  }
}

/// Apply an action's substitution pairs to its template content, honoring
/// the override table.
fn expand_template(action: &Action) -> String {
  let mut content = action.template_content.clone();
  for pair in &action.substitutions {
    let value = TEMPLATE_OVERRIDES
      .iter()
      .find(|(token, _)| *token == pair.key)
      .map(|(_, forced)| *forced)
      .unwrap_or(pair.value.as_str());
    content = content.replace(&pair.key, value);
  }
  content
}

/// Directory portion of a slash-separated path (`.` when there is none).
fn parent_dir(path: &str) -> &str {
  match path.rsplit_once('/') {
    Some(("", _)) => "/",
    Some((dir, _)) => dir,
    None => ".",
  }
}

/// A relative path with no empty or `.` segments and `..` only leading.
fn is_clean_relative(target: &str) -> bool {
  if target.starts_with('/') {
    return false;
  }
  let mut past_leading_dotdots = false;
  for segment in target.split('/') {
    if segment.is_empty() || segment == "." {
      return false;
    }
    if segment == ".." {
      if past_leading_dotdots {
        return false;
      }
    } else {
      past_leading_dotdots = true;
    }
  }
  true
}
