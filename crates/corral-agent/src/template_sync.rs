use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use sha1::{Digest, Sha1};

use crate::workload::HashMapping;

/// Guards recursive walks against symlink loops.
pub const MAX_TREE_DEPTH: usize = 25;

/// Modification time stamped on files merged from the global overlay into a
/// static instance. A file carrying it has already received the overlay.
pub const STATIC_OVERLAY_MTIME_MS: u64 = 1_482_773_874_000;

pub fn static_overlay_mtime() -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(STATIC_OVERLAY_MTIME_MS)
}

/// Maps a directory to `relative path -> content hash`.
pub trait TreeHasher: Send + Sync {
    fn hash_tree(&self, dir: &Path) -> anyhow::Result<HashMapping>;
}

/// Hex SHA-1 of every regular file. A missing directory hashes to nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1TreeHasher;

impl TreeHasher for Sha1TreeHasher {
    fn hash_tree(&self, dir: &Path) -> anyhow::Result<HashMapping> {
        let mut out = HashMapping::new();
        if !dir.is_dir() {
            return Ok(out);
        }
        hash_into(dir, "", &mut out, 1)?;
        Ok(out)
    }
}

fn hash_into(dir: &Path, prefix: &str, out: &mut HashMapping, depth: usize) -> anyhow::Result<()> {
    if depth > MAX_TREE_DEPTH {
        anyhow::bail!(
            "too many directory levels, possibly a symlink loop: {}",
            dir.display()
        );
    }
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let meta = fs::metadata(&path).with_context(|| format!("stat {}", path.display()))?;
        if meta.is_dir() {
            hash_into(&path, &rel, out, depth + 1)?;
        } else if meta.is_file() {
            let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            out.insert(rel, hex::encode(Sha1::digest(&bytes)));
        }
    }
    Ok(())
}

/// Paths whose hash differs or that exist on one side only, sorted.
pub fn diff(expected: &HashMapping, actual: &HashMapping) -> Vec<String> {
    let mut out = BTreeSet::new();
    for (path, hash) in expected {
        if actual.get(path) != Some(hash) {
            out.insert(path.clone());
        }
    }
    for path in actual.keys() {
        if !expected.contains_key(path) {
            out.insert(path.clone());
        }
    }
    out.into_iter().collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Differences {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub template_differences: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub map_differences: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub global_differences: Vec<String>,
}

impl Differences {
    pub fn is_empty(&self) -> bool {
        self.template_differences.is_empty()
            && self.map_differences.is_empty()
            && self.global_differences.is_empty()
    }
}

/// On-disk trees a workload is built from.
#[derive(Debug, Clone)]
pub struct TemplateTrees {
    pub template: PathBuf,
    pub map: Option<PathBuf>,
    pub global: PathBuf,
}

pub struct ExpectedHashes<'a> {
    pub template: &'a HashMapping,
    pub map: Option<&'a HashMapping>,
    pub global: &'a HashMapping,
}

pub fn check(
    hasher: &dyn TreeHasher,
    trees: &TemplateTrees,
    expected: ExpectedHashes<'_>,
) -> anyhow::Result<Differences> {
    let template_differences = diff(
        expected.template,
        &hasher
            .hash_tree(&trees.template)
            .context("hash template tree")?,
    );

    let map_differences = match (expected.map, &trees.map) {
        (Some(want), Some(dir)) => diff(want, &hasher.hash_tree(dir).context("hash map tree")?),
        _ => Vec::new(),
    };

    let global_differences = diff(
        expected.global,
        &hasher.hash_tree(&trees.global).context("hash global tree")?,
    );

    Ok(Differences {
        template_differences,
        map_differences,
        global_differences,
    })
}

/// Copies `src` over `dst`, overwriting files that already exist. `src` must be a directory.
pub fn copy_dir(src: &Path, dst: &Path) -> anyhow::Result<()> {
    if !src.is_dir() {
        anyhow::bail!("source directory {} does not exist", src.display());
    }
    copy_dir_at(src, dst, 1)
}

fn copy_dir_at(src: &Path, dst: &Path, depth: usize) -> anyhow::Result<()> {
    if depth > MAX_TREE_DEPTH {
        anyhow::bail!(
            "too many directory levels, possibly a symlink loop: {}",
            dst.display()
        );
    }
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read dir {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        // Follows symlinks.
        let meta = fs::metadata(&src_path)
            .with_context(|| format!("failed to resolve {}", src_path.display()))?;
        if meta.is_dir() {
            copy_dir_at(&src_path, &dst_path, depth + 1)?;
        } else if meta.is_file() {
            fs::copy(&src_path, &dst_path).with_context(|| {
                format!("copy {} -> {}", src_path.display(), dst_path.display())
            })?;
        }
    }
    Ok(())
}

/// Idempotent overlay copy: a file is copied only when the destination is
/// missing or does not carry `stamp`, and is then stamped with it.
pub fn copy_dir_carefully(src: &Path, dst: &Path, stamp: SystemTime) -> anyhow::Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    copy_carefully_at(src, dst, stamp, 1)
}

fn copy_carefully_at(src: &Path, dst: &Path, stamp: SystemTime, depth: usize) -> anyhow::Result<()> {
    if depth > MAX_TREE_DEPTH {
        anyhow::bail!(
            "too many directory levels, possibly a symlink loop: {}",
            dst.display()
        );
    }
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read dir {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let meta = fs::metadata(&src_path)
            .with_context(|| format!("failed to resolve {}", src_path.display()))?;
        if meta.is_dir() {
            copy_carefully_at(&src_path, &dst_path, stamp, depth + 1)?;
            continue;
        }
        if !meta.is_file() {
            continue;
        }

        if let Ok(existing) = fs::metadata(&dst_path)
            && existing.modified().ok() == Some(stamp)
        {
            continue;
        }

        fs::copy(&src_path, &dst_path)
            .with_context(|| format!("copy {} -> {}", src_path.display(), dst_path.display()))?;
        fs::File::options()
            .write(true)
            .open(&dst_path)
            .and_then(|f| f.set_modified(stamp))
            .with_context(|| format!("stamp {}", dst_path.display()))?;
    }
    Ok(())
}

pub fn remove_dir(dir: &Path) {
    if !dir.exists() {
        return;
    }
    if let Err(e) = fs::remove_dir_all(dir) {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to delete directory");
    }
}

/// Rebuilds a fresh scratch directory: global overlay, then template, then map.
pub fn materialize_ephemeral(trees: &TemplateTrees, instance_dir: &Path) -> anyhow::Result<()> {
    remove_dir(instance_dir);
    // The global overlay is optional.
    if trees.global.is_dir() {
        copy_dir(&trees.global, instance_dir).context("copy global overlay")?;
    }
    copy_dir(&trees.template, instance_dir).context("copy template")?;
    if let Some(map) = &trees.map {
        copy_dir(map, instance_dir).context("copy map")?;
    }
    Ok(())
}

/// Static instances run inside their template; only the global overlay is merged in.
pub fn merge_static(trees: &TemplateTrees, instance_dir: &Path) -> anyhow::Result<()> {
    copy_dir_carefully(&trees.global, instance_dir, static_overlay_mtime())
        .context("merge global overlay")
}
