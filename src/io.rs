use std::fmt::Display;
use std::fs;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// A path rendered with `/` separators regardless of host OS, used wherever
/// relative paths are compared, sorted, or hashed.
pub(crate) fn rel_key(path: &Utf8Path) -> String {
    path.components()
        .map(|component| component.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

/// List every file under `root` as a path relative to it, sorted by
/// [`rel_key`] so the order is reproducible across hosts.
pub(crate) fn walk_rel(root: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    collect_rel(root, Utf8Path::new(""), &mut files)?;
    files.sort_by_key(|path| rel_key(path));
    Ok(files)
}

fn collect_rel(
    dir: &Utf8Path,
    prefix: &Utf8Path,
    acc: &mut Vec<Utf8PathBuf>,
) -> std::io::Result<()> {
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        let rel = prefix.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            collect_rel(entry.path(), &rel, acc)?;
        } else {
            acc.push(rel);
        }
    }
    Ok(())
}

/// Copy `src` to `dst`, creating parent directories as needed. A directory
/// left at `dst` by an earlier run is replaced.
pub(crate) fn copy_file(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    if let Some(dir) = dst.parent() {
        fs::create_dir_all(dir)?;
    }
    if dst.is_dir() {
        fs::remove_dir_all(dst)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

/// Whether `b` exists as a regular file with exactly the bytes of `a`.
pub(crate) fn files_equal(a: &Utf8Path, b: &Utf8Path) -> std::io::Result<bool> {
    let Ok(meta_b) = fs::metadata(b) else {
        return Ok(false);
    };
    if !meta_b.is_file() || fs::metadata(a)?.len() != meta_b.len() {
        return Ok(false);
    }
    Ok(fs::read(a)? == fs::read(b)?)
}
