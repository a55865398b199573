//! Git repository facade (spec.md Section 4.5).
//!
//! A thin, CI-shaped surface over `git2`, mirroring `igor/git.py`'s
//! `Repository` subclass of `pygit2.Repository`: CI-only fetch refspecs,
//! a deterministic null-report commit, extended-SHA `revparse_single`
//! heuristics, and a generic `peel`.

use std::path::Path;

use git2::{
    Commit, FetchOptions, Object, ObjectType, Oid, PushOptions, Reference, RemoteCallbacks,
    Repository as Git2Repository, Signature, Time, Tree,
};
use thiserror::Error;

/// Committer/author identity for every commit igor-ci creates
/// (spec.md Section 6, "External Interfaces").
pub const SIGNATURE_NAME: &str = "Igor CI";
pub const SIGNATURE_EMAIL: &str = "igor-ci@frase.id.au";

/// Message of the deterministic null-report commit (spec.md Section 3,
/// invariant 4).
pub const NULL_REPORT_MESSAGE: &str = "[NULL] null build report";

/// The two CI-only fetch refspecs configured on every cloned repo
/// (spec.md Section 6, "Git layout").
pub const SPEC_REFSPEC: &str = "+refs/ci/spec/*:refs/ci/spec/*";
pub const REPORT_REFSPEC: &str = "+refs/ci/report/*:refs/ci/report/*";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("revision {0:?} not found")]
    RevisionNotFound(String),
    #[error("can't peel {0:?} to {1:?}")]
    CannotPeel(ObjectType, ObjectType),
    #[error("push was rejected (non-fast-forward): {0}")]
    PushRejected(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// A git repository with igor-ci's conventions layered on top.
pub struct Repository {
    pub(crate) inner: Git2Repository,
}

impl Repository {
    /// Igor's fixed committer signature. `epoch` pins the time to the
    /// UNIX epoch, used only for the deterministic null-report commit.
    pub fn signature(epoch: bool) -> Result<Signature<'static>> {
        let time = if epoch {
            Time::new(0, 0)
        } else {
            Time::new(now_unix(), 0)
        };
        Ok(Signature::new(SIGNATURE_NAME, SIGNATURE_EMAIL, &time)?)
    }

    /// Clone `source` into `dest` with the CI-only refspecs, init+fetch
    /// rather than a full clone so the refspecs can be restricted before
    /// anything is transferred (matches `Repository.clone` in git.py).
    pub fn clone(source: &str, dest: &Path) -> Result<Self> {
        let repo = Git2Repository::init_bare(dest)?;
        repo.remote("origin", source)?;
        {
            let mut config = repo.config()?;
            config.remove_multivar("remote.origin.fetch", ".*").ok();
            config.set_multivar("remote.origin.fetch", "^$", SPEC_REFSPEC)?;
            config.set_multivar("remote.origin.fetch", "^$", REPORT_REFSPEC)?;
        }
        let repo = Self { inner: repo };
        repo.fetch()?;
        Ok(repo)
    }

    /// Open the repo at `dest` if it exists, otherwise clone it.
    pub fn clone_or_open(source: &str, dest: &Path) -> Result<Self> {
        match Git2Repository::open(dest) {
            Ok(inner) => Ok(Self { inner }),
            Err(_) => Self::clone(source, dest),
        }
    }

    /// Fetch the `origin` remote using its configured refspecs.
    pub fn fetch(&self) -> Result<()> {
        let mut remote = self.inner.find_remote("origin")?;
        let mut opts = FetchOptions::new();
        remote.fetch(&[] as &[&str], Some(&mut opts), None)?;
        Ok(())
    }

    /// Push `refspec` to `origin`.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` on a normal rejection
    /// (non-fast-forward — the caller should retry), and `Err` only for
    /// abnormal/transport failures (spec.md Section 4.4).
    pub fn push(&self, refspec: &str) -> Result<bool> {
        let mut remote = self.inner.find_remote("origin")?;
        let mut rejection: Option<String> = None;
        {
            let mut callbacks = RemoteCallbacks::new();
            callbacks.push_update_reference(|_refname, status| {
                if let Some(msg) = status {
                    rejection = Some(msg.to_string());
                }
                Ok(())
            });
            let mut opts = PushOptions::new();
            opts.remote_callbacks(callbacks);
            remote.push(&[refspec], Some(&mut opts))?;
        }
        Ok(rejection.is_none())
    }

    /// OID of the empty tree.
    pub fn null_tree(&self) -> Result<Oid> {
        Ok(self.inner.treebuilder(None)?.write()?)
    }

    /// Create (or reuse) the deterministic null-report commit. No ref is
    /// created or updated; the object id is stable because the signature,
    /// message, tree and parents are all fixed.
    pub fn null_report(&self) -> Result<Oid> {
        let tree_oid = self.null_tree()?;
        self.create_commit(None, NULL_REPORT_MESSAGE, tree_oid, &[], true)
    }

    /// Create a commit, optionally updating `update_ref`. `epoch` pins
    /// both author and committer time to the UNIX epoch.
    pub fn create_commit(
        &self,
        update_ref: Option<&str>,
        message: &str,
        tree_oid: Oid,
        parents: &[Oid],
        epoch: bool,
    ) -> Result<Oid> {
        let sig = Self::signature(epoch)?;
        let tree = self.inner.find_tree(tree_oid)?;
        let parent_commits: Vec<Commit> = parents
            .iter()
            .map(|oid| self.inner.find_commit(*oid))
            .collect::<std::result::Result<_, _>>()?;
        let parent_refs: Vec<&Commit> = parent_commits.iter().collect();
        Ok(self
            .inner
            .commit(update_ref, &sig, &sig, message, &tree, &parent_refs)?)
    }

    /// Create a blob and return its oid.
    pub fn create_blob(&self, data: &[u8]) -> Result<Oid> {
        Ok(self.inner.blob(data)?)
    }

    /// Read a blob's bytes.
    pub fn blob_data(&self, oid: Oid) -> Result<Vec<u8>> {
        Ok(self.inner.find_blob(oid)?.content().to_vec())
    }

    /// Force the local ref to point at `oid`.
    pub fn update_ref(&self, name: &str, oid: Oid) -> Result<()> {
        self.inner.reference(name, oid, true, "igor-ci")?;
        Ok(())
    }

    /// Parse `rev` with igor's extended rules: try verbatim, then with
    /// `ci/`, `ci/spec/`, `ci/report/` prefixes in that order, preferring
    /// the spec namespace (matches `Repository.revparse_single`).
    pub fn revparse_single(&self, rev: &str) -> Result<Object<'_>> {
        let candidates = [
            rev.to_string(),
            format!("ci/{rev}"),
            format!("ci/spec/{rev}"),
            format!("ci/report/{rev}"),
        ];
        for candidate in &candidates {
            if let Ok(obj) = self.inner.revparse_single(candidate) {
                return Ok(obj);
            }
        }
        Err(GitError::RevisionNotFound(rev.to_string()))
    }

    /// Resolve `report_ref` to a commit oid if it exists and is a commit.
    pub fn resolve_commit(&self, report_ref: &str) -> Option<Oid> {
        let obj = self.revparse_single(report_ref).ok()?;
        obj.into_commit().ok().map(|c| c.id())
    }

    pub fn find_commit(&self, oid: Oid) -> Result<Commit<'_>> {
        Ok(self.inner.find_commit(oid)?)
    }

    pub fn find_tree(&self, oid: Oid) -> Result<Tree<'_>> {
        Ok(self.inner.find_tree(oid)?)
    }

    /// Does this repository contain the given object?
    pub fn contains(&self, oid: Oid) -> bool {
        self.inner.find_object(oid, None).is_ok()
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn inner(&self) -> &Git2Repository {
        &self.inner
    }
}

/// Peel `obj` until it is of type `target` (spec.md Section 4.5).
///
/// References resolve to their target, commits peel to their tree, tags
/// peel to their target; blobs/trees/commits are terminal.
pub fn peel<'repo>(obj: Object<'repo>, target: ObjectType) -> Result<Object<'repo>> {
    if obj.kind() == Some(target) {
        return Ok(obj);
    }
    match obj.kind() {
        Some(ObjectType::Tag) => {
            let tag = obj.into_tag().expect("kind checked above");
            let target_obj = tag.target()?;
            peel(target_obj, target)
        }
        Some(ObjectType::Commit) if target == ObjectType::Tree => {
            let commit = obj.into_commit().expect("kind checked above");
            Ok(commit.tree()?.into_object())
        }
        kind => Err(GitError::CannotPeel(kind.unwrap_or(ObjectType::Any), target)),
    }
}

/// Peel a reference to an object of the given type.
pub fn peel_reference<'repo>(
    reference: Reference<'repo>,
    target: ObjectType,
) -> Result<Object<'repo>> {
    let resolved = reference.resolve()?;
    let obj = resolved.peel(target)?;
    Ok(obj)
}

/// Split a ref name into its `/`-separated components.
pub fn split_ref(ref_name: &str) -> Vec<&str> {
    ref_name.split('/').collect()
}

/// The last component of a ref name.
pub fn tail_ref(ref_name: &str) -> &str {
    split_ref(ref_name).last().copied().unwrap_or(ref_name)
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bare_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempdir().unwrap();
        let inner = Git2Repository::init_bare(dir.path()).unwrap();
        (dir, Repository { inner })
    }

    #[test]
    fn null_report_is_deterministic_across_repos() {
        let (_d1, r1) = bare_repo();
        let (_d2, r2) = bare_repo();
        assert_eq!(r1.null_report().unwrap(), r2.null_report().unwrap());
    }

    #[test]
    fn null_report_creation_is_idempotent() {
        let (_d, r) = bare_repo();
        let a = r.null_report().unwrap();
        let b = r.null_report().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tail_ref_returns_last_component() {
        assert_eq!(tail_ref("refs/ci/spec/build0"), "build0");
    }

    #[test]
    fn revparse_prefers_spec_namespace_over_report() {
        let (_d, r) = bare_repo();
        let tree_oid = r.null_tree().unwrap();
        let spec_oid = r
            .create_commit(
                Some("refs/ci/spec/build0"),
                "spec",
                tree_oid,
                &[],
                true,
            )
            .unwrap();
        r.create_commit(Some("refs/ci/report/build0"), "report", tree_oid, &[], true)
            .unwrap();

        let resolved = r.revparse_single("build0").unwrap();
        assert_eq!(resolved.id(), spec_oid);
    }
}
