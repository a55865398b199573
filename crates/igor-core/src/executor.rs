//! The build executor (spec.md Section 4.4): ties the git facade, the
//! build-source resolver, and the spec/report values together into the
//! worker's per-order execution pipeline.

use std::path::{Path, PathBuf};

use git2::Oid;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::build::{BuildReport, BuildSpec, ReportError, SpecError};
use crate::git::{peel, GitError, Repository};
use crate::order::Order;
use crate::source::{self, SourceError};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("failed to create scoped checkout directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Stable 64-bit fingerprint of a spec URI, used to derive the cache path
/// `/tmp/igor<fingerprint>` (spec.md Section 6, Section 9 design note:
/// "do not use a non-stable hash").
pub fn uri_fingerprint(uri: &str) -> u64 {
    let normalised = normalise_uri(uri);
    let digest = Sha256::digest(normalised.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 digest is 32 bytes"))
}

fn normalise_uri(uri: &str) -> String {
    let path = Path::new(uri);
    if path.is_relative() && !uri.contains("://") {
        std::fs::canonicalize(path)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| uri.to_string())
    } else {
        uri.to_string()
    }
}

/// Deterministic local cache path for a spec URI under `cache_root`
/// (normally `/tmp`).
pub fn cache_path(cache_root: &Path, spec_uri: &str) -> PathBuf {
    cache_root.join(format!("igor{}", uri_fingerprint(spec_uri)))
}

/// Execute `order` end-to-end: open/clone+fetch the spec repo, resolve the
/// spec commit, check out the source, run the spec's steps, and publish
/// the resulting report via the CAS push loop.
///
/// `worker_id` becomes the order's `worker` field when it is assigned.
/// `cache_root` is normally `/tmp`; overridable for tests.
pub fn execute_order(order: &Order, worker_id: &str, cache_root: &Path) -> Result<BuildReport> {
    let assigned = order.assign(worker_id).unwrap_or_else(|_| order.clone());

    let spec_path = cache_path(cache_root, &order.spec_uri);
    let spec_repo = Repository::clone_or_open(&order.spec_uri, &spec_path)?;
    spec_repo.fetch()?;

    let spec_obj = spec_repo.revparse_single(&order.spec_ref)?;
    let spec_commit = peel(spec_obj, git2::ObjectType::Commit)?
        .into_commit()
        .expect("peeled to commit");
    let spec_oid = spec_commit.id();
    let spec = BuildSpec::from_commit(&spec_repo, tail_name(&order.spec_ref), spec_oid)?;

    let source_uri = &order.source_uri;
    let source_is_spec = source_uri == &order.spec_uri;

    let checkout_dir = tempfile::Builder::new()
        .prefix("igor-checkout-")
        .tempdir()?;

    let source_oid = if source_is_spec {
        spec_repo.fetch()?;
        Some(spec_oid)
    } else {
        let source = source::resolve(source_uri, &order.source_args)?;
        source.checkout(checkout_dir.path())?
    };

    info!(order = %assigned.id, "executing build steps");
    let completed = spec.execute(&assigned, source_oid, checkout_dir.path())?;

    publish_report(&spec_repo, &order.spec_ref, &completed)
}

fn tail_name(spec_ref: &str) -> &str {
    spec_ref.rsplit('/').next().unwrap_or(spec_ref)
}

/// CAS loop: fetch, resolve the current tip (or the null report), write a
/// new commit, force-update the local ref, push; retry on a normal
/// rejection (spec.md Section 4.4 step 7).
fn publish_report(repo: &Repository, spec_ref: &str, report: &BuildReport) -> Result<BuildReport> {
    let report_ref = crate::build::report_ref_for_spec_ref(spec_ref);

    loop {
        repo.fetch()?;
        let prev = repo
            .resolve_commit(&report_ref)
            .map(Ok)
            .unwrap_or_else(|| repo.null_report())?;

        let new_oid = report.write(repo, prev)?;
        repo.update_ref(&report_ref, new_oid)?;

        match repo.push(&report_ref) {
            Ok(true) => return Ok(report.clone()),
            Ok(false) => {
                warn!(report_ref = %report_ref, "report push rejected, retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_across_calls() {
        let a = uri_fingerprint("git://example.org/foo");
        let b = uri_fingerprint("git://example.org/foo");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_for_different_uris() {
        let a = uri_fingerprint("git://example.org/foo");
        let b = uri_fingerprint("git://example.org/bar");
        assert_ne!(a, b);
    }

    #[test]
    fn cache_path_includes_fingerprint() {
        let p = cache_path(Path::new("/tmp"), "git://example.org/foo");
        assert_eq!(
            p,
            Path::new("/tmp").join(format!("igor{}", uri_fingerprint("git://example.org/foo")))
        );
    }
}
