//! The task capability everything else builds on.
//!
//! A [`BuildTask`] is a named unit of work: it declares the tasks it depends
//! on, digests its inputs into a signature, and writes its outputs into a
//! directory handed to it by the engine. Tasks are shared as
//! `Arc<dyn BuildTask>`; two handles to the same allocation are the same task
//! for memoisation purposes, which is what lets a task reachable through
//! several dependents run exactly once.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

/// A named unit of build work.
pub trait BuildTask: Send + Sync {
    /// Human-readable identity, used in clash diagnostics.
    fn name(&self) -> String;

    /// Upstream tasks that must complete before this one runs, in a stable
    /// order. Their results are handed to [`BuildTask::signature`] in the
    /// same order.
    fn dependencies(&self) -> Vec<Arc<dyn BuildTask>> {
        Vec::new()
    }

    /// Digest everything that affects this task's output: the bytes of every
    /// consumed source file, the upstream signatures, and a constant
    /// identifying the task's own algorithm (bump it whenever the rules
    /// change, or stale cache entries will be reused).
    ///
    /// The result keys the output cache and doubles as a directory name, so
    /// it must be deterministic across processes and hosts and must be a safe
    /// filename; uppercase hex of a strong digest is the expected form. The
    /// `source_dir` locates the inputs and must not itself be digested.
    fn signature(
        &self,
        source_dir: &Utf8Path,
        dependencies: &[Arc<BuildTaskResult>],
    ) -> anyhow::Result<String>;

    /// Produce this task's outputs. `context.output_dir` is fresh and empty;
    /// everything the task creates must stay inside it.
    fn execute(&self, context: &BuildTaskContext) -> anyhow::Result<()>;
}

/// What a task sees while executing.
#[derive(Debug, Clone)]
pub struct BuildTaskContext {
    /// Where all produced files must go.
    pub output_dir: Utf8PathBuf,
    /// Root of the input tree.
    pub source_dir: Utf8PathBuf,
}

/// The outcome of one task in one build, threaded to its dependents.
#[derive(Debug, Clone)]
pub struct BuildTaskResult {
    /// The task's display name.
    pub name: String,
    /// The signature the task executed (or was skipped) under.
    pub signature: String,
    /// The published output directory for that signature.
    pub output_dir: Utf8PathBuf,
    /// Upstream results, ordered like the task's dependency list.
    pub dependencies: Vec<Arc<BuildTaskResult>>,
}

/// Pointer identity of an `Arc<dyn BuildTask>` allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId(usize);

pub(crate) fn task_id(task: &Arc<dyn BuildTask>) -> TaskId {
    TaskId(Arc::as_ptr(task) as *const () as usize)
}
