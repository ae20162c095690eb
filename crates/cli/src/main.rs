use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::{Term, style};
use mixbuild_lib::{ActionGraph, CompileOutput, compile};
use tracing_subscriber::EnvFilter;

/// mixbuild - compile Bazel aquery action graphs into build statements
#[derive(Parser)]
#[command(name = "mixbuild")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Compile an aquery JSON dump and print the build statements
  Compile {
    /// Path to the aquery jsonproto dump
    graph: PathBuf,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,

    /// Include depset descriptors in the output
    #[arg(long)]
    depsets: bool,
  },

  /// Print summary statistics for a compiled graph
  Stats {
    /// Path to the aquery jsonproto dump
    graph: PathBuf,
  },
}

fn main() -> Result<()> {
  // Initialize logging
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .without_time()
    .init();

  let cli = Cli::parse();

  match cli.command {
    Commands::Compile { graph, pretty, depsets } => cmd_compile(&graph, pretty, depsets, cli.verbose),
    Commands::Stats { graph } => cmd_stats(&graph),
  }
}

/// Load and compile a dump, reporting failures on stderr with exit code 1.
fn compile_file(term: &Term, path: &Path) -> Result<CompileOutput> {
  if !path.exists() {
    term.write_line(&format!(
      "{} Graph file not found: {}",
      style("error:").red().bold(),
      path.display()
    ))?;
    std::process::exit(1);
  }

  let bytes = fs::read(path)?;
  let graph = match ActionGraph::from_json(&bytes) {
    Ok(graph) => graph,
    Err(e) => {
      term.write_line(&format!(
        "{} Failed to parse action graph: {}",
        style("error:").red().bold(),
        e
      ))?;
      std::process::exit(1);
    }
  };

  match compile(&graph) {
    Ok(output) => Ok(output),
    Err(e) => {
      term.write_line(&format!("{} Failed to compile action graph: {}", style("error:").red().bold(), e))?;
      std::process::exit(1);
    }
  }
}

fn cmd_compile(path: &Path, pretty: bool, depsets: bool, verbose: bool) -> Result<()> {
  let term = Term::stderr();
  let output = compile_file(&term, path)?;

  term.write_line(&format!(
    "{} Compiled {} build statement(s), {} depset(s)",
    style("::").cyan().bold(),
    output.build_statements.len(),
    output.depsets.len()
  ))?;

  if verbose {
    for statement in &output.build_statements {
      term.write_line(&format!(
        "  {} {} {}",
        style("+").green().bold(),
        statement.output_paths.join(" "),
        style(format!("({})", statement.mnemonic)).dim()
      ))?;
    }
  }

  let json = if depsets {
    if pretty {
      serde_json::to_string_pretty(&output)?
    } else {
      serde_json::to_string(&output)?
    }
  } else if pretty {
    serde_json::to_string_pretty(&output.build_statements)?
  } else {
    serde_json::to_string(&output.build_statements)?
  };
  println!("{}", json);

  Ok(())
}

fn cmd_stats(path: &Path) -> Result<()> {
  let term = Term::stderr();
  let output = compile_file(&term, path)?;

  let commands = output.build_statements.iter().filter(|s| s.command.is_some()).count();
  let symlinks = output.build_statements.iter().filter(|s| !s.symlink_paths.is_empty()).count();
  let depfiles = output.build_statements.iter().filter(|s| s.depfile.is_some()).count();

  term.write_line(&format!("{} mixbuild v{}", style("::").cyan().bold(), env!("CARGO_PKG_VERSION")))?;
  term.write_line("")?;
  term.write_line(&format!("  Build statements: {}", output.build_statements.len()))?;
  term.write_line(&format!("  With commands:    {}", commands))?;
  term.write_line(&format!("  Symlink farms:    {}", symlinks))?;
  term.write_line(&format!("  With depfiles:    {}", depfiles))?;
  term.write_line(&format!("  Depsets:          {}", output.depsets.len()))?;

  Ok(())
}
