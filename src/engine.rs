//! The execution engine: signed, isolated output directories per task.
//!
//! Every task executes into a private directory named by its signature, a
//! digest of everything that can affect its output. Executing is therefore
//! skippable: if the directory for the current signature already exists, the
//! task's outputs are already on disk from an earlier run. Publication is a
//! single atomic rename from a `.partial` staging directory into the `.done`
//! store, so other tasks only ever observe complete output sets.
//!
//! ```text
//! meta_dir/.done/<signature>/...      completed outputs, immutable
//! meta_dir/.partial/<signature>/...   in progress, never read
//! ```
//!
//! After the graph settles the engine checks that no two tasks produced the
//! same relative path and synchronises the build directory with the union of
//! the referenced `.done` trees.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::sync::{Arc, Mutex, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::{AggregateError, BuildError};
use crate::graph::TaskGraph;
use crate::io;
use crate::task::{task_id, BuildTask, BuildTaskContext, BuildTaskResult, TaskId};

const DONE_DIR: &str = ".done";
const PARTIAL_DIR: &str = ".partial";

/// State shared by all task steps of one build.
struct ExecutionState {
    source_dir: Utf8PathBuf,
    done_dir: Utf8PathBuf,
    partial_dir: Utf8PathBuf,
    /// One result per task, written by the node that ran it, read by its
    /// dependents after the scheduler's happens-before edge.
    results: RwLock<HashMap<TaskId, Arc<BuildTaskResult>>>,
    /// First writer wins; a second distinct task landing on the same
    /// signature is a specification clash.
    owners: Mutex<HashMap<String, Arc<dyn BuildTask>>>,
    progress: ProgressBar,
}

/// Run `tasks` (and everything they depend on) against `source_dir`,
/// caching per-task outputs under `meta_dir` and assembling the overlay of
/// all outputs into `build_dir`.
pub fn execute(
    source_dir: &Utf8Path,
    build_dir: &Utf8Path,
    meta_dir: &Utf8Path,
    tasks: &[Arc<dyn BuildTask>],
) -> Result<(), BuildError> {
    eprintln!("DEBUG execute start");
    let done_dir = meta_dir.join(DONE_DIR);
    let partial_dir = meta_dir.join(PARTIAL_DIR);
    fs::create_dir_all(&done_dir)?;
    fs::create_dir_all(&partial_dir)?;
    eprintln!("DEBUG dirs created");

    let progress = ProgressBar::new(0);
    eprintln!("DEBUG progress created");
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("invalid progress bar template")
            .progress_chars("#>-"),
    );

    let state = Arc::new(ExecutionState {
        source_dir: source_dir.to_owned(),
        done_dir,
        partial_dir,
        results: RwLock::new(HashMap::new()),
        owners: Mutex::new(HashMap::new()),
        progress,
    });

    // Graph construction is single-threaded; one node per task identity.
    let mut nodes: HashMap<TaskId, Arc<TaskGraph>> = HashMap::new();
    let mut in_progress: HashSet<TaskId> = HashSet::new();
    let mut roots = Vec::with_capacity(tasks.len());
    for task in tasks {
        roots.push(node_for(task, &state, &mut nodes, &mut in_progress)?);
    }
    eprintln!("DEBUG nodes built: {}", nodes.len());
    state.progress.set_length(nodes.len() as u64);
    let root = TaskGraph::aggregate(roots);

    eprintln!("DEBUG about to run");
    let outcome = root.run();
    eprintln!("DEBUG run finished");
    state.progress.finish_and_clear();
    outcome.map_err(AggregateError::into_first)?;

    let union = validate(&state)?;
    assemble(build_dir, source_dir, &union)
}

/// Recursively build (and memoise) the scheduler node for `task`.
///
/// `in_progress` holds the tasks currently being expanded further up the
/// recursion; meeting one of them again means the declarations are cyclic.
fn node_for(
    task: &Arc<dyn BuildTask>,
    state: &Arc<ExecutionState>,
    nodes: &mut HashMap<TaskId, Arc<TaskGraph>>,
    in_progress: &mut HashSet<TaskId>,
) -> Result<Arc<TaskGraph>, BuildError> {
    let id = task_id(task);
    if let Some(node) = nodes.get(&id) {
        return Ok(node.clone());
    }
    if !in_progress.insert(id) {
        return Err(BuildError::CyclicDependency(task.name()));
    }

    let mut upstream = Vec::new();
    for dependency in task.dependencies() {
        upstream.push(node_for(&dependency, state, nodes, in_progress)?);
    }
    in_progress.remove(&id);

    let node = {
        let name = task.name();
        let state = state.clone();
        let task = task.clone();
        TaskGraph::new(name, move || run_step(&state, &task), upstream)
    };
    nodes.insert(id, node.clone());
    Ok(node)
}

/// The action behind every work node: sign, claim, execute or skip, publish,
/// record.
fn run_step(state: &ExecutionState, task: &Arc<dyn BuildTask>) -> Result<(), BuildError> {
    state.progress.set_message(task.name());

    let dependencies: Vec<Arc<BuildTaskResult>> = {
        let results = state.results.read().unwrap();
        task.dependencies()
            .iter()
            .map(|dependency| {
                results
                    .get(&task_id(dependency))
                    .expect("upstream task finished without a recorded result")
                    .clone()
            })
            .collect()
    };

    let signature = task
        .signature(&state.source_dir, &dependencies)
        .map_err(|error| BuildError::TaskFailed(task.name(), error))?;

    claim_signature(state, task, &signature)?;

    let done = state.done_dir.join(&signature);
    if !done.exists() {
        let partial = state.partial_dir.join(&signature);
        if partial.exists() {
            // Debris from a crashed or failed run; start fresh.
            fs::remove_dir_all(&partial)?;
        }
        fs::create_dir_all(&partial)?;

        let context = BuildTaskContext {
            output_dir: partial.clone(),
            source_dir: state.source_dir.clone(),
        };
        task.execute(&context)
            .map_err(|error| BuildError::TaskFailed(task.name(), error))?;

        if let Err(error) = fs::rename(&partial, &done) {
            if done.exists() {
                // Lost the publication race; the existing directory is
                // authoritative and holds the same content.
                fs::remove_dir_all(&partial)?;
            } else {
                return Err(error.into());
            }
        }
    }

    let result = Arc::new(BuildTaskResult {
        name: task.name(),
        signature,
        output_dir: done,
        dependencies,
    });
    state.results.write().unwrap().insert(task_id(task), result);
    state.progress.inc(1);
    Ok(())
}

fn claim_signature(
    state: &ExecutionState,
    task: &Arc<dyn BuildTask>,
    signature: &str,
) -> Result<(), BuildError> {
    let mut owners = state.owners.lock().unwrap();
    match owners.entry(signature.to_owned()) {
        Entry::Vacant(slot) => {
            slot.insert(task.clone());
            Ok(())
        }
        Entry::Occupied(slot) => {
            if Arc::ptr_eq(slot.get(), task) {
                return Ok(());
            }
            let first = slot.get().name();
            let second = task.name();
            if first == second {
                // Identical display names mean identical specifications.
                Err(BuildError::DuplicateTaskSpec { first, second })
            } else {
                Err(BuildError::SignatureClash {
                    first,
                    second,
                    signature: signature.to_owned(),
                })
            }
        }
    }
}

/// Check that no relative output path is produced by two different tasks and
/// return the overlay union, keyed by `/`-joined relative path.
///
/// Signatures are visited in sorted order so a given input set reproduces
/// the same clash report.
fn validate(state: &ExecutionState) -> Result<BTreeMap<String, Utf8PathBuf>, BuildError> {
    let owners = state.owners.lock().unwrap();
    let mut claimed: Vec<(&String, &Arc<dyn BuildTask>)> = owners.iter().collect();
    claimed.sort_by(|a, b| a.0.cmp(b.0));

    let mut union = BTreeMap::new();
    let mut owner_of: HashMap<String, String> = HashMap::new();
    for (signature, task) in claimed {
        let done = state.done_dir.join(signature);
        for rel in io::walk_rel(&done)? {
            let key = io::rel_key(&rel);
            if let Some(first) = owner_of.get(&key) {
                return Err(BuildError::OutputClash {
                    first: first.clone(),
                    second: task.name(),
                    file: key,
                });
            }
            owner_of.insert(key.clone(), task.name());
            union.insert(key, done.join(&rel));
        }
    }
    Ok(union)
}

/// Synchronise `build_dir` with the overlay union.
///
/// Unchanged files are left alone so a no-op rebuild does not touch their
/// modification times. The union's top-level entries delimit what the engine
/// owns inside `build_dir`; stale files inside them are pruned. When the
/// build directory is distinct from the source root it is engine-owned
/// entirely, so foreign top-level entries are removed as well.
fn assemble(
    build_dir: &Utf8Path,
    source_dir: &Utf8Path,
    union: &BTreeMap<String, Utf8PathBuf>,
) -> Result<(), BuildError> {
    let top_levels: BTreeSet<&str> = union
        .keys()
        .filter_map(|key| key.split('/').next())
        .collect();

    fs::create_dir_all(build_dir)?;

    if build_dir != source_dir {
        for entry in build_dir.read_dir_utf8()? {
            let entry = entry?;
            if !top_levels.contains(entry.file_name()) {
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(entry.path())?;
                } else {
                    fs::remove_file(entry.path())?;
                }
            }
        }
    }

    for top in &top_levels {
        let root = build_dir.join(top);
        if root.is_dir() {
            prune(&root, top, union)?;
        }
    }

    for (key, source) in union {
        let target = build_dir.join(key);
        if !io::files_equal(source, &target)? {
            io::copy_file(source, &target)?;
        }
    }
    Ok(())
}

/// Remove files under `dir` that the union no longer produces, then drop
/// directories left empty.
fn prune(
    dir: &Utf8Path,
    prefix: &str,
    union: &BTreeMap<String, Utf8PathBuf>,
) -> Result<(), BuildError> {
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        let key = format!("{prefix}/{}", entry.file_name());
        if entry.file_type()?.is_dir() {
            prune(entry.path(), &key, union)?;
            if entry.path().read_dir_utf8()?.next().is_none() {
                fs::remove_dir(entry.path())?;
            }
        } else if !union.contains_key(&key) {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Scripted task: fixed signature fragment, fixed output files,
    /// dependencies settable after construction (needed for the cycle test).
    struct FakeTask {
        name: String,
        sig: String,
        files: Vec<(String, String)>,
        deps: Mutex<Vec<Arc<dyn BuildTask>>>,
        runs: AtomicUsize,
    }

    impl FakeTask {
        fn new(name: &str, sig: &str, files: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                sig: sig.to_string(),
                files: files
                    .iter()
                    .map(|(rel, contents)| (rel.to_string(), contents.to_string()))
                    .collect(),
                deps: Mutex::new(Vec::new()),
                runs: AtomicUsize::new(0),
            })
        }
    }

    impl BuildTask for FakeTask {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn dependencies(&self) -> Vec<Arc<dyn BuildTask>> {
            self.deps.lock().unwrap().clone()
        }

        fn signature(
            &self,
            _source_dir: &Utf8Path,
            dependencies: &[Arc<BuildTaskResult>],
        ) -> anyhow::Result<String> {
            let mut signature = self.sig.clone();
            for dependency in dependencies {
                signature.push('-');
                signature.push_str(&dependency.signature);
            }
            Ok(signature)
        }

        fn execute(&self, context: &BuildTaskContext) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            for (rel, contents) in &self.files {
                let path = context.output_dir.join(rel);
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                fs::write(path, contents)?;
            }
            Ok(())
        }
    }

    struct Dirs {
        _keep: TempDir,
        source: Utf8PathBuf,
        build: Utf8PathBuf,
        meta: Utf8PathBuf,
    }

    fn dirs() -> Dirs {
        let keep = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(keep.path().to_path_buf()).unwrap();
        let dirs = Dirs {
            source: root.join("source"),
            build: root.join("out"),
            meta: root.join("meta"),
            _keep: keep,
        };
        fs::create_dir_all(&dirs.source).unwrap();
        dirs
    }

    #[test]
    fn dedicated_build_dir_contains_exactly_the_overlay() {
        let dirs = dirs();
        let a: Arc<dyn BuildTask> = FakeTask::new("a", "AAAA", &[("one/a.txt", "a")]);
        let b: Arc<dyn BuildTask> = FakeTask::new("b", "BBBB", &[("two/b.txt", "b")]);

        execute(&dirs.source, &dirs.build, &dirs.meta, &[a, b]).unwrap();
        assert_eq!(fs::read_to_string(dirs.build.join("one/a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dirs.build.join("two/b.txt")).unwrap(), "b");

        // A later run referencing different outputs replaces the old ones.
        let c: Arc<dyn BuildTask> = FakeTask::new("c", "CCCC", &[("three/c.txt", "c")]);
        execute(&dirs.source, &dirs.build, &dirs.meta, &[c]).unwrap();
        assert!(!dirs.build.join("one").exists());
        assert!(!dirs.build.join("two").exists());
        assert_eq!(fs::read_to_string(dirs.build.join("three/c.txt")).unwrap(), "c");
    }

    #[test]
    fn done_store_skips_execution_on_the_second_run() {
        let dirs = dirs();
        let task = FakeTask::new("a", "AAAA", &[("out/a.txt", "a")]);

        let handle: Arc<dyn BuildTask> = task.clone();
        execute(&dirs.source, &dirs.build, &dirs.meta, &[handle.clone()]).unwrap();
        assert!(dirs.meta.join(".done/AAAA/out/a.txt").exists());

        // Fresh instance, same signature: outputs come from the done store.
        let again = FakeTask::new("a", "AAAA", &[("out/a.txt", "a")]);
        let again_handle: Arc<dyn BuildTask> = again.clone();
        execute(&dirs.source, &dirs.build, &dirs.meta, &[again_handle]).unwrap();
        assert_eq!(again.runs.load(Ordering::SeqCst), 0);
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn partial_debris_from_a_crashed_run_is_tolerated() {
        let dirs = dirs();
        let debris = dirs.meta.join(".partial/AAAA");
        fs::create_dir_all(&debris).unwrap();
        fs::write(debris.join("junk"), "half-written").unwrap();

        let task: Arc<dyn BuildTask> = FakeTask::new("a", "AAAA", &[("out/a.txt", "a")]);
        execute(&dirs.source, &dirs.build, &dirs.meta, &[task]).unwrap();

        assert!(!dirs.meta.join(".done/AAAA/junk").exists());
        assert!(!dirs.meta.join(".partial/AAAA").exists());
        assert_eq!(fs::read_to_string(dirs.build.join("out/a.txt")).unwrap(), "a");
    }

    #[test]
    fn distinct_tasks_with_the_same_signature_clash() {
        let dirs = dirs();
        let one = FakeTask::new("one", "FFFF", &[("one.txt", "1")]);
        let two = FakeTask::new("two", "FFFF", &[("two.txt", "2")]);
        // Chain them so the claim order is deterministic.
        two.deps.lock().unwrap().push(one.clone());
        // A dependency contribution would change the signature; pin it.
        struct Pinned(Arc<FakeTask>);
        impl BuildTask for Pinned {
            fn name(&self) -> String {
                self.0.name()
            }
            fn dependencies(&self) -> Vec<Arc<dyn BuildTask>> {
                self.0.dependencies()
            }
            fn signature(
                &self,
                _source_dir: &Utf8Path,
                _dependencies: &[Arc<BuildTaskResult>],
            ) -> anyhow::Result<String> {
                Ok(self.0.sig.clone())
            }
            fn execute(&self, context: &BuildTaskContext) -> anyhow::Result<()> {
                self.0.execute(context)
            }
        }

        let two: Arc<dyn BuildTask> = Arc::new(Pinned(two));
        let error = execute(&dirs.source, &dirs.build, &dirs.meta, &[two]).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Tasks 'one' and 'two' are clashing. They have the same signature 'FFFF'."
        );
    }

    #[test]
    fn tasks_producing_the_same_file_clash() {
        let dirs = dirs();
        let a: Arc<dyn BuildTask> = FakeTask::new("a", "AAAA", &[("shared/x.txt", "from a")]);
        let b: Arc<dyn BuildTask> = FakeTask::new("b", "BBBB", &[("shared/x.txt", "from b")]);

        let error = execute(&dirs.source, &dirs.build, &dirs.meta, &[a, b]).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Tasks 'a' and 'b' are clashing. They produced the same file 'shared/x.txt'."
        );
    }

    #[test]
    fn cyclic_dependencies_are_rejected_during_construction() {
        let dirs = dirs();
        let a = FakeTask::new("a", "AAAA", &[]);
        let b = FakeTask::new("b", "BBBB", &[]);
        a.deps.lock().unwrap().push(b.clone());
        b.deps.lock().unwrap().push(a.clone());

        let a: Arc<dyn BuildTask> = a;
        let error = execute(&dirs.source, &dirs.build, &dirs.meta, &[a]).unwrap_err();
        assert!(matches!(error, BuildError::CyclicDependency(_)));
    }

    #[test]
    fn upstream_results_reach_dependents_in_order() {
        let dirs = dirs();
        let first = FakeTask::new("first", "AAAA", &[("a/a.txt", "a")]);
        let second = FakeTask::new("second", "BBBB", &[("b/b.txt", "b")]);
        let last = FakeTask::new("last", "CCCC", &[("c/c.txt", "c")]);
        last.deps.lock().unwrap().push(first.clone());
        last.deps.lock().unwrap().push(second.clone());

        let last_handle: Arc<dyn BuildTask> = last.clone();
        execute(&dirs.source, &dirs.build, &dirs.meta, &[last_handle]).unwrap();

        // The dependent's signature folded both upstream signatures in
        // declaration order, which is where its done directory got published.
        assert!(dirs.meta.join(".done/CCCC-AAAA-BBBB").exists());
        assert_eq!(first.runs.load(Ordering::SeqCst), 1);
        assert_eq!(second.runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shared_dependency_executes_once() {
        let dirs = dirs();
        let shared = FakeTask::new("shared", "AAAA", &[("s/s.txt", "s")]);
        let left = FakeTask::new("left", "BBBB", &[("l/l.txt", "l")]);
        let right = FakeTask::new("right", "CCCC", &[("r/r.txt", "r")]);
        left.deps.lock().unwrap().push(shared.clone());
        right.deps.lock().unwrap().push(shared.clone());

        let left_handle: Arc<dyn BuildTask> = left;
        let right_handle: Arc<dyn BuildTask> = right;
        execute(
            &dirs.source,
            &dirs.build,
            &dirs.meta,
            &[left_handle, right_handle],
        )
        .unwrap();
        assert_eq!(shared.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_task_leaves_its_partial_for_inspection() {
        let dirs = dirs();

        struct Failing;
        impl BuildTask for Failing {
            fn name(&self) -> String {
                "failing".to_string()
            }
            fn signature(
                &self,
                _source_dir: &Utf8Path,
                _dependencies: &[Arc<BuildTaskResult>],
            ) -> anyhow::Result<String> {
                Ok("DEAD".to_string())
            }
            fn execute(&self, context: &BuildTaskContext) -> anyhow::Result<()> {
                fs::write(context.output_dir.join("half.txt"), "half")?;
                anyhow::bail!("gave up halfway")
            }
        }

        let task: Arc<dyn BuildTask> = Arc::new(Failing);
        let error = execute(&dirs.source, &dirs.build, &dirs.meta, &[task]).unwrap_err();

        assert!(matches!(error, BuildError::TaskFailed(..)));
        assert!(
            dirs.meta.join(".partial/DEAD/half.txt").exists(),
            "failed partials stay on disk for post-mortem"
        );
        assert!(!dirs.meta.join(".done/DEAD").exists());
    }
}
