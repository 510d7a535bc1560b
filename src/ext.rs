//! A build task that maps every file with one extension onto a sibling file
//! with another, via a user-supplied command.
//!
//! The task globs `source_dir/**/*<source_ext>` under the build's source
//! root, digests the parameters and every matched file into its signature,
//! and at execution time hands the command a [`GlobToExtContext`] describing
//! where to read from and write to. The command owns the actual
//! transformation; one output file per source, named by swapping the
//! extension, is the expected shape.

use std::fmt::{self, Debug};
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::hex;
use crate::io::rel_key;
use crate::task::{BuildTask, BuildTaskContext, BuildTaskResult};

/// Identifies this task class and the layout of its digest input. Bump when
/// either changes, so cache entries from older rules stop matching.
const SIGNATURE_VERSION: &[u8] = b"glob-to-ext/1";

type CommandFnPtr = Arc<dyn Fn(&GlobToExtContext) -> anyhow::Result<()> + Send + Sync>;

/// Factory for the common case; see [`GlobToExtTask::new`].
pub fn build(
    command: impl Fn(&GlobToExtContext) -> anyhow::Result<()> + Send + Sync + 'static,
    source_dir: impl Into<Utf8PathBuf>,
    source_ext: impl Into<String>,
    output_dir: impl Into<Utf8PathBuf>,
    output_ext: impl Into<String>,
) -> Arc<dyn BuildTask> {
    Arc::new(GlobToExtTask::new(
        command, source_dir, source_ext, output_dir, output_ext,
    ))
}

/// What a glob-to-ext command sees while executing.
pub struct GlobToExtContext {
    /// Absolute root the sources were discovered under.
    pub source_dir: Utf8PathBuf,
    /// Absolute root the outputs must be written under. Already created,
    /// including subdirectories for every expected output.
    pub output_dir: Utf8PathBuf,
    /// Extension of the discovered sources, e.g. `.txt`.
    pub source_ext: String,
    /// Extension the outputs must carry, e.g. `.nospace`.
    pub output_ext: String,
    /// The source files, absolute, in deterministic order.
    pub sources: Vec<Utf8PathBuf>,
}

impl GlobToExtContext {
    /// Where the output for `source` belongs: the same path relative to
    /// [`source_dir`](Self::source_dir), re-rooted under
    /// [`output_dir`](Self::output_dir) with the extension swapped.
    pub fn output_file(&self, source: &Utf8Path) -> Utf8PathBuf {
        let rel = source.strip_prefix(&self.source_dir).unwrap_or(source);
        self.output_dir
            .join(swap_ext(rel, &self.source_ext, &self.output_ext))
    }
}

/// Transforms `source_dir/**/*<source_ext>` into
/// `output_dir/**/*<output_ext>`.
pub struct GlobToExtTask {
    command: CommandFnPtr,
    source_dir: Utf8PathBuf,
    source_ext: String,
    output_dir: Utf8PathBuf,
    output_ext: String,
    sources: Option<Vec<Utf8PathBuf>>,
}

impl GlobToExtTask {
    /// `source_dir` and `output_dir` are relative to the build's source and
    /// output roots; extensions carry their leading dot.
    pub fn new(
        command: impl Fn(&GlobToExtContext) -> anyhow::Result<()> + Send + Sync + 'static,
        source_dir: impl Into<Utf8PathBuf>,
        source_ext: impl Into<String>,
        output_dir: impl Into<Utf8PathBuf>,
        output_ext: impl Into<String>,
    ) -> Self {
        Self {
            command: Arc::new(command),
            source_dir: source_dir.into(),
            source_ext: source_ext.into(),
            output_dir: output_dir.into(),
            output_ext: output_ext.into(),
            sources: None,
        }
    }

    /// Use an explicit source list (paths relative to the task's
    /// `source_dir`) instead of globbing. The list is sorted into the same
    /// order discovery would produce, so signatures do not depend on how the
    /// sources were named.
    pub fn with_sources(mut self, sources: Vec<Utf8PathBuf>) -> Self {
        self.sources = Some(sources);
        self
    }

    /// Discover `(relative, absolute)` source pairs in deterministic order.
    fn discover(&self, source_root: &Utf8Path) -> anyhow::Result<Vec<(Utf8PathBuf, Utf8PathBuf)>> {
        let root = source_root.join(&self.source_dir);
        let mut found = Vec::new();

        match &self.sources {
            Some(list) => {
                for rel in list {
                    found.push((rel.clone(), root.join(rel)));
                }
            }
            None => {
                let pattern = format!("{root}/**/*{}", self.source_ext);
                for entry in glob::glob(&pattern)? {
                    let path = Utf8PathBuf::from_path_buf(entry?).map_err(|path| {
                        anyhow::anyhow!("source path is not valid UTF-8: {}", path.display())
                    })?;
                    if !path.is_file() {
                        continue;
                    }
                    let rel = path.strip_prefix(&root)?.to_owned();
                    found.push((rel, path));
                }
            }
        }

        found.sort_by_key(|(rel, _)| rel_key(rel));
        Ok(found)
    }

    /// Output path for a relative source, relative to the task's output
    /// directory root.
    fn output_rel(&self, rel: &Utf8Path) -> Utf8PathBuf {
        self.output_dir
            .join(swap_ext(rel, &self.source_ext, &self.output_ext))
    }
}

impl BuildTask for GlobToExtTask {
    fn name(&self) -> String {
        format!(
            "{}/**/*{} -> {}/**/*{}",
            self.source_dir, self.source_ext, self.output_dir, self.output_ext
        )
    }

    fn signature(
        &self,
        source_dir: &Utf8Path,
        dependencies: &[Arc<BuildTaskResult>],
    ) -> anyhow::Result<String> {
        let mut hasher = blake3::Hasher::new();
        update_field(&mut hasher, SIGNATURE_VERSION);
        update_field(&mut hasher, self.source_dir.as_str().as_bytes());
        update_field(&mut hasher, self.source_ext.as_bytes());
        update_field(&mut hasher, self.output_dir.as_str().as_bytes());
        update_field(&mut hasher, self.output_ext.as_bytes());

        for dependency in dependencies {
            update_field(&mut hasher, dependency.signature.as_bytes());
        }

        for (rel, path) in self.discover(source_dir)? {
            update_field(&mut hasher, rel_key(&rel).as_bytes());
            update_field(&mut hasher, &fs::read(&path)?);
        }

        Ok(hex::to_hex(hasher.finalize().as_bytes()))
    }

    fn execute(&self, context: &BuildTaskContext) -> anyhow::Result<()> {
        let sources = self.discover(&context.source_dir)?;

        let output_root = context.output_dir.join(&self.output_dir);
        fs::create_dir_all(&output_root)?;
        for (rel, _) in &sources {
            if let Some(dir) = context.output_dir.join(self.output_rel(rel)).parent() {
                fs::create_dir_all(dir)?;
            }
        }

        let command_context = GlobToExtContext {
            source_dir: context.source_dir.join(&self.source_dir),
            output_dir: output_root,
            source_ext: self.source_ext.clone(),
            output_ext: self.output_ext.clone(),
            sources: sources.into_iter().map(|(_, path)| path).collect(),
        };
        (self.command)(&command_context)
    }
}

impl Debug for GlobToExtTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobToExtTask({})", self.name())
    }
}

/// Replace the trailing `source_ext` of a relative path with `output_ext`,
/// comparing on the `/`-joined form so the result is OS-invariant.
fn swap_ext(rel: &Utf8Path, source_ext: &str, output_ext: &str) -> Utf8PathBuf {
    let rel = rel_key(rel);
    let stem = rel.strip_suffix(source_ext).unwrap_or(&rel);
    Utf8PathBuf::from(format!("{stem}{output_ext}"))
}

fn update_field(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
