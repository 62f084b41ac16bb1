//! Streaming enumeration of buckets, keys and objects.
//!
//! Partitions can hold millions of files, so the walk keeps an explicit
//! work stack and expands one directory per step instead of collecting the
//! tree up front. Directory listings are sorted and pushed in reverse, so
//! ops pop in ascending encoded order; the encoding preserves byte order,
//! so emission is sorted by `(bucket, key)`.
//!
//! Enumeration is approximate by contract: entries that vanish or fail to
//! read mid-walk are skipped, not surfaced.

use std::collections::HashSet;
use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use tracing::debug;
use tsumiki_common::is_block_bucket;
use tsumiki_types::BlockKey;

use crate::err::Result;
use crate::layout::FileLayout;
use crate::path::decode;

enum FoldOp {
    GlobBuckets,
    GlobBucketLevel { level: usize, dir: PathBuf },
    GlobBucket { dir: PathBuf },
    GlobKeyLevel { bucket: Vec<u8>, level: usize, dir: PathBuf },
    GlobKeyFile { bucket: Vec<u8>, dir: PathBuf },
    KeyFile { bucket: Vec<u8>, path: PathBuf },
    BKey { bucket: Vec<u8>, key: BlockKey },
}

pub(crate) enum FoldEntry<'a> {
    Bucket(&'a [u8]),
    Key { bucket: &'a [u8], key: &'a [u8] },
    Object { bucket: &'a [u8], key: &'a [u8], value: Vec<u8> },
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum FoldMode {
    Buckets,
    Keys,
    Objects,
}

/// Names a directory's children sorted ascending, hidden entries skipped.
/// A directory that cannot be listed contributes nothing.
fn list_sorted(dir: &Path) -> Vec<(String, PathBuf)> {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(e) => {
            debug!("skipping unlistable dir {}: {e}", dir.display());
            return vec![];
        }
    };
    let mut entries: Vec<(String, PathBuf)> = reader
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            if name.starts_with('.') {
                return None;
            }
            Some((name, entry.path()))
        })
        .collect();
    entries.sort();
    entries
}

pub(crate) fn walk(
    layout: &FileLayout,
    mode: FoldMode,
    visit: &mut dyn FnMut(FoldEntry<'_>) -> ControlFlow<()>,
) -> Result<()> {
    let mut stack = vec![FoldOp::GlobBuckets];

    while let Some(op) = stack.pop() {
        match op {
            FoldOp::GlobBuckets => {
                let dir = layout.partition_dir().to_path_buf();
                if layout.b_depth() == 0 {
                    stack.push(FoldOp::GlobBucket { dir });
                } else {
                    stack.push(FoldOp::GlobBucketLevel { level: 0, dir });
                }
            }
            FoldOp::GlobBucketLevel { level, dir } => {
                for (_, child) in list_sorted(&dir).into_iter().rev() {
                    if level + 1 == layout.b_depth() {
                        stack.push(FoldOp::GlobBucket { dir: child });
                    } else {
                        stack.push(FoldOp::GlobBucketLevel {
                            level: level + 1,
                            dir: child,
                        });
                    }
                }
            }
            FoldOp::GlobBucket { dir } => {
                for (name, child) in list_sorted(&dir).into_iter().rev() {
                    let bucket = match decode(&name) {
                        Ok(bucket) => bucket,
                        Err(_) => {
                            debug!("skipping undecodable bucket dir {name:?}");
                            continue;
                        }
                    };
                    if mode == FoldMode::Buckets {
                        if visit(FoldEntry::Bucket(&bucket)).is_break() {
                            return Ok(());
                        }
                    } else if layout.k_depth() == 0 {
                        stack.push(FoldOp::GlobKeyFile { bucket, dir: child });
                    } else {
                        stack.push(FoldOp::GlobKeyLevel {
                            bucket,
                            level: 0,
                            dir: child,
                        });
                    }
                }
            }
            FoldOp::GlobKeyLevel { bucket, level, dir } => {
                for (_, child) in list_sorted(&dir).into_iter().rev() {
                    if level + 1 == layout.k_depth() {
                        stack.push(FoldOp::GlobKeyFile {
                            bucket: bucket.clone(),
                            dir: child,
                        });
                    } else {
                        stack.push(FoldOp::GlobKeyLevel {
                            bucket: bucket.clone(),
                            level: level + 1,
                            dir: child,
                        });
                    }
                }
            }
            FoldOp::GlobKeyFile { bucket, dir } => {
                for (_, child) in list_sorted(&dir).into_iter().rev() {
                    stack.push(FoldOp::KeyFile {
                        bucket: bucket.clone(),
                        path: child,
                    });
                }
            }
            FoldOp::KeyFile { bucket, path } => {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let key = match decode(name) {
                    Ok(key) => key,
                    Err(_) => {
                        debug!("skipping undecodable key file {name:?}");
                        continue;
                    }
                };
                if is_block_bucket(&bucket) {
                    let Ok(group) = BlockKey::decode(&key) else {
                        debug!("skipping malformed block key file {name:?}");
                        continue;
                    };
                    let chunks =
                        layout.enumerate_chunks_in_file(&bucket, &group.uuid, group.number)?;
                    for n in chunks.into_iter().rev() {
                        stack.push(FoldOp::BKey {
                            bucket: bucket.clone(),
                            key: BlockKey::new(group.uuid, n),
                        });
                    }
                } else {
                    let flow = match mode {
                        FoldMode::Keys => visit(FoldEntry::Key {
                            bucket: &bucket,
                            key: &key,
                        }),
                        FoldMode::Objects => match layout.plain_get(&bucket, &key) {
                            Ok(value) => visit(FoldEntry::Object {
                                bucket: &bucket,
                                key: &key,
                                value,
                            }),
                            Err(_) => ControlFlow::Continue(()),
                        },
                        FoldMode::Buckets => unreachable!("bucket folds stop at bucket dirs"),
                    };
                    if flow.is_break() {
                        return Ok(());
                    }
                }
            }
            FoldOp::BKey { bucket, key } => {
                let encoded = key.encode();
                let flow = match mode {
                    FoldMode::Keys => visit(FoldEntry::Key {
                        bucket: &bucket,
                        key: &encoded,
                    }),
                    FoldMode::Objects => match layout.read_block(&bucket, &key) {
                        Ok(value) => visit(FoldEntry::Object {
                            bucket: &bucket,
                            key: &encoded,
                            value,
                        }),
                        Err(_) => ControlFlow::Continue(()),
                    },
                    FoldMode::Buckets => unreachable!("bucket folds stop at bucket dirs"),
                };
                if flow.is_break() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// Folds every bucket once, in sorted order.
pub fn fold_buckets<A, F>(layout: &FileLayout, acc: A, mut f: F) -> Result<A>
where
    F: FnMut(&[u8], A) -> A,
{
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    let mut acc = Some(acc);
    walk(layout, FoldMode::Buckets, &mut |entry| {
        if let FoldEntry::Bucket(bucket) = entry {
            if seen.insert(bucket.to_vec()) {
                acc = Some(f(bucket, acc.take().expect("accumulator in flight")));
            }
        }
        ControlFlow::Continue(())
    })?;
    Ok(acc.expect("accumulator survives the walk"))
}

/// Folds every key of every bucket; block buckets contribute one key per
/// stored block.
pub fn fold_keys<A, F>(layout: &FileLayout, acc: A, mut f: F) -> Result<A>
where
    F: FnMut(&[u8], &[u8], A) -> A,
{
    let mut acc = Some(acc);
    walk(layout, FoldMode::Keys, &mut |entry| {
        if let FoldEntry::Key { bucket, key } = entry {
            acc = Some(f(bucket, key, acc.take().expect("accumulator in flight")));
        }
        ControlFlow::Continue(())
    })?;
    Ok(acc.expect("accumulator survives the walk"))
}

/// Folds `(bucket, key, value)` for every readable object.
pub fn fold_objects<A, F>(layout: &FileLayout, acc: A, mut f: F) -> Result<A>
where
    F: FnMut(&[u8], &[u8], Vec<u8>, A) -> A,
{
    let mut acc = Some(acc);
    walk(layout, FoldMode::Objects, &mut |entry| {
        if let FoldEntry::Object { bucket, key, value } = entry {
            acc = Some(f(
                bucket,
                key,
                value,
                acc.take().expect("accumulator in flight"),
            ));
        }
        ControlFlow::Continue(())
    })?;
    Ok(acc.expect("accumulator survives the walk"))
}

/// True when the walk emits nothing; stops at the first key.
pub fn is_empty(layout: &FileLayout) -> Result<bool> {
    let mut found = false;
    walk(layout, FoldMode::Keys, &mut |entry| {
        if matches!(entry, FoldEntry::Key { .. }) {
            found = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    })?;
    Ok(!found)
}
