#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod engine;
mod error;
mod ext;
mod graph;
pub mod hex;
mod io;
mod task;

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use camino::Utf8Path;

pub use crate::engine::execute;
pub use crate::error::{AggregateError, BuildError, HexError};
pub use crate::ext::{build, GlobToExtContext, GlobToExtTask};
pub use crate::graph::TaskGraph;
pub use crate::task::{BuildTask, BuildTaskContext, BuildTaskResult};

/// Name of the cache directory kept under the base directory by
/// [`run_build`].
pub const DEFAULT_META_DIR: &str = ".bud";

/// Run a set of build tasks against `base_dir`.
///
/// Sources are read relative to `base_dir`, the overlay of all task outputs
/// lands back under `base_dir`, and cached outputs live in
/// `base_dir/.bud`. Pass `.` to build in the process working directory.
/// Progress lines go to `stdout`.
pub fn run_build(
    tasks: &[Arc<dyn BuildTask>],
    stdout: &mut dyn Write,
    base_dir: impl AsRef<Utf8Path>,
) -> Result<(), BuildError> {
    let base_dir = base_dir.as_ref();
    run_build_with_meta(tasks, stdout, base_dir, &base_dir.join(DEFAULT_META_DIR))
}

/// [`run_build`] with an explicit cache directory, for callers that keep the
/// cache outside the source tree.
pub fn run_build_with_meta(
    tasks: &[Arc<dyn BuildTask>],
    stdout: &mut dyn Write,
    base_dir: impl AsRef<Utf8Path>,
    meta_dir: impl AsRef<Utf8Path>,
) -> Result<(), BuildError> {
    let s = Instant::now();
    let base_dir = base_dir.as_ref();

    writeln!(stdout, "Building {} task(s)...", tasks.len())?;
    execute(base_dir, base_dir, meta_dir.as_ref(), tasks)?;
    writeln!(stdout, "Build finished {}", io::as_overhead(s))?;

    Ok(())
}
