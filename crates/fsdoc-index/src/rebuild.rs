//! Rebuilding the global index from the files on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use fsdoc_store::Repository;
use fsdoc_types::{ContentDigest, EntityId, EntityType};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::element::IndexElement;
use crate::error::{IndexError, IndexResult};
use crate::global::GlobalIndex;

/// What a probe learns about a file without materializing a full entity
/// graph.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Probe {
    /// Id stored in the file, if any. Files without one get an id derived
    /// from their path.
    pub id: Option<EntityId>,
    pub natural_id: Option<String>,
}

/// How a registered entity type takes ownership of files during a rebuild.
pub trait FileClaim: Send + Sync {
    fn entity_type(&self) -> EntityType;

    /// Whether this type's persister recognizes the file as its own.
    fn recognizes(&self, path: &Path) -> bool;

    /// Parse just enough of a claimed file to index it.
    fn probe(&self, path: &Path, bytes: &[u8]) -> IndexResult<Probe>;
}

/// Outcome counts of a rebuild.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Files that produced an index element.
    pub indexed: usize,
    /// Files no registered type claimed.
    pub skipped: usize,
    /// Claimed files that could not be read or parsed, or that repeated an
    /// id already indexed.
    pub failed: usize,
    /// Paths of the failed files.
    pub failures: Vec<PathBuf>,
}

enum Outcome {
    Indexed(IndexElement),
    Skipped,
    Failed(PathBuf),
}

impl GlobalIndex {
    /// Replace the index content with one element per parseable entity file.
    ///
    /// Files are matched against `claims` in order (first match wins) and
    /// probed on a dedicated pool of `workers` threads (`None` lets rayon
    /// pick). Per-file failures are logged and counted; only enumeration
    /// and pool creation failures abort the rebuild. Blocks until every
    /// file is processed.
    pub fn rebuild(
        &self,
        repo: &Repository,
        claims: &[Arc<dyn FileClaim>],
        workers: Option<usize>,
    ) -> IndexResult<RebuildReport> {
        let started = Instant::now();
        let files = repo.files()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.unwrap_or(0))
            .thread_name(|i| format!("fsdoc-rebuild-{i}"))
            .build()
            .map_err(|e| IndexError::Pool(e.to_string()))?;

        let outcomes: Vec<Outcome> = pool.install(|| {
            files
                .par_iter()
                .map(|path| index_file(repo, claims, path))
                .collect()
        });

        let mut report = RebuildReport::default();
        self.clear();
        for outcome in outcomes {
            match outcome {
                Outcome::Indexed(element) => {
                    if self.contains(&element.id) {
                        warn!(
                            path = %element.path.display(),
                            id = %element.id.short_hex(),
                            "duplicate entity id; keeping the first file"
                        );
                        report.failed += 1;
                        report.failures.push(element.path);
                        continue;
                    }
                    self.add(element);
                    report.indexed += 1;
                }
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed(path) => {
                    report.failed += 1;
                    report.failures.push(path);
                }
            }
        }

        info!(
            indexed = report.indexed,
            skipped = report.skipped,
            failed = report.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "global index rebuilt"
        );
        Ok(report)
    }
}

fn index_file(repo: &Repository, claims: &[Arc<dyn FileClaim>], path: &Path) -> Outcome {
    let Some(claim) = claims.iter().find(|c| c.recognizes(path)) else {
        debug!(path = %path.display(), "no registered type claims file; skipping");
        return Outcome::Skipped;
    };

    match probe_file(repo, claim.as_ref(), path) {
        Ok(element) => Outcome::Indexed(element),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to index file");
            Outcome::Failed(path.to_path_buf())
        }
    }
}

fn probe_file(repo: &Repository, claim: &dyn FileClaim, path: &Path) -> IndexResult<IndexElement> {
    let io_err = |e: std::io::Error| IndexError::Probe {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let bytes = fs::read(path).map_err(io_err)?;
    let modified = fs::metadata(path).and_then(|m| m.modified()).map_err(io_err)?;
    let probe = claim.probe(path, &bytes)?;

    let id = match probe.id {
        Some(id) => id,
        None => EntityId::derive(&repo.relative_posix(path)?),
    };

    Ok(IndexElement::new(
        id,
        claim.entity_type(),
        probe.natural_id,
        path,
        ContentDigest::of(&bytes),
        modified,
    ))
}
