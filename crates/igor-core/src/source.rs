//! Build source resolution (spec.md Section 3, "source").
//!
//! A `BuildSource` fetches the tree to build into a working directory and
//! reports the git oid it checked out, if any. Implementations register
//! themselves in a small ordered table, mirroring `igor/build_source.py`'s
//! `BuildSource.impls` registry; the first to claim a URI wins.

use std::path::Path;
use std::process::{Command, Stdio};

use git2::Oid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no build source available for {0:?}")]
    NoSourceForUri(String),
    #[error("source command failed: {0}")]
    Command(#[from] std::io::Error),
    #[error("`git clone` exited with status {0}")]
    CloneFailed(std::process::ExitStatus),
    #[error("`git checkout` exited with status {0}")]
    CheckoutFailed(std::process::ExitStatus),
    #[error(transparent)]
    Git(#[from] git2::Error),
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// A mechanism for fetching the tree to build.
pub trait BuildSource {
    /// Declare whether this source will handle the given URI.
    fn handles_uri(uri: &str) -> bool
    where
        Self: Sized;

    /// Check out the source into `dest`, returning the git oid checked
    /// out, if this source deals in git commits.
    fn checkout(&self, dest: &Path) -> Result<Option<Oid>>;
}

/// A Git build source, checked out with the system `git` binary (spec.md
/// Section 4.4, step 5: "clone --quiet" / "checkout --quiet").
pub struct GitBuildSource {
    url: String,
    rev: Option<String>,
}

impl GitBuildSource {
    pub fn new(url: impl Into<String>, args: &[String]) -> Self {
        Self {
            url: url.into(),
            rev: args.first().cloned(),
        }
    }
}

impl BuildSource for GitBuildSource {
    /// Probe with `git ls-remote`; a zero exit means a git repo lives at
    /// `uri`.
    fn handles_uri(uri: &str) -> bool {
        Command::new("git")
            .args(["ls-remote", uri])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn checkout(&self, dest: &Path) -> Result<Option<Oid>> {
        let status = Command::new("git")
            .args(["clone", "--quiet", &self.url])
            .arg(dest)
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(SourceError::CloneFailed(status));
        }

        if let Some(rev) = &self.rev {
            let status = Command::new("git")
                .args(["checkout", "--quiet", rev])
                .current_dir(dest)
                .status()?;
            if !status.success() {
                return Err(SourceError::CheckoutFailed(status));
            }
        }

        let repo = git2::Repository::open(dest)?;
        let head = repo.head()?;
        Ok(head.target())
    }
}

/// Find a source implementation able to handle `uri` and instantiate it
/// against `args`. `git` is currently the only registered implementation
/// (spec.md Non-goals: additional source backends are out of scope).
pub fn resolve(uri: &str, args: &[String]) -> Result<GitBuildSource> {
    if GitBuildSource::handles_uri(uri) {
        Ok(GitBuildSource::new(uri.to_string(), args))
    } else {
        Err(SourceError::NoSourceForUri(uri.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn git_source_checks_out_head_and_reports_its_oid() {
        let origin_dir = tempdir().unwrap();
        let origin = git2::Repository::init(origin_dir.path()).unwrap();
        let sig = git2::Signature::now("t", "t@example.org").unwrap();
        let tree_oid = origin.treebuilder(None).unwrap().write().unwrap();
        let tree = origin.find_tree(tree_oid).unwrap();
        let commit_oid = origin
            .commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();

        let dest_dir = tempdir().unwrap();
        let dest = dest_dir.path().join("checkout");
        let source = GitBuildSource::new(
            origin_dir.path().to_str().unwrap().to_string(),
            &[],
        );
        let oid = source.checkout(&dest).unwrap();
        assert_eq!(oid, Some(commit_oid));
    }

    #[test]
    fn resolve_rejects_a_uri_with_no_git_repo() {
        let dir = tempdir().unwrap();
        let not_a_repo = dir.path().join("nothing");
        std::fs::create_dir(&not_a_repo).unwrap();
        let err = resolve(not_a_repo.to_str().unwrap(), &[]).unwrap_err();
        assert!(matches!(err, SourceError::NoSourceForUri(_)));
    }
}
