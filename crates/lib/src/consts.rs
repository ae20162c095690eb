//! Constants shared across the compilation pipeline.

/// Mnemonic of the marker action whose outputs stand in for other depsets.
pub const MIDDLEMAN_MNEMONIC: &str = "Middleman";

/// Path suffix of the python wrapper script. Python zip actions claim it as
/// an input, but no exported action produces it.
pub const PY3_WRAPPER_SUFFIX: &str = "/py3wrapper.sh";

/// Path suffix of generated runfiles manifests. No exported action writes
/// them, so depsets must not promise them to consumers.
pub const RUNFILES_MANIFEST_SUFFIX: &str = ".runfiles/MANIFEST";

/// Prefix of toolchain-internal files shipped with the external build tool.
/// Their timestamps are unreliable and their producing actions are never
/// exported.
pub const BAZEL_TOOLS_PREFIX: &str = "../bazel_tools";

/// Label prefix of toolchain-internal targets whose actions are skipped
/// outright.
pub const BAZEL_TOOLS_LABEL_PREFIX: &str = "@bazel_tools//";
