//! Build specification, step and report value types (spec.md Section 3).
//!
//! Execution order of steps is never stored explicitly: `BuildSpec::steps`
//! and `BuildReport::step_reports` are `BTreeMap`s, so iteration is always
//! in ascending lexicographic order of the step name, matching
//! `igor/build.py`'s `for name in sorted(self.steps)`.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use git2::{ObjectType, Oid};
use thiserror::Error;
use tracing::debug;

use crate::git::{tail_ref, GitError, Repository};
use crate::json;
use crate::order::{Order, OrderError};

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("order must be assigned and incomplete")]
    OrderNotAssignedOrAlreadyComplete,
    #[error("spec tree has no steps/ entry")]
    MissingSteps,
    #[error("env/ and artifacts/ subtrees are not yet implemented")]
    NotImplemented,
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("failed to run build step: {0}")]
    Io(#[from] std::io::Error),
    #[error("order error: {0}")]
    Order(#[from] OrderError),
    #[error(transparent)]
    Json(#[from] crate::json::JsonError),
}

pub type Result<T> = std::result::Result<T, SpecError>;

/// A single shell script, fed to `/bin/sh` on stdin (spec.md Section 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    script: Vec<u8>,
}

impl BuildStep {
    pub fn new(script: Vec<u8>) -> Self {
        Self { script }
    }

    pub fn from_blob(repo: &Repository, oid: Oid) -> Result<Self> {
        Ok(Self::new(repo.blob_data(oid)?))
    }

    pub fn script(&self) -> &[u8] {
        &self.script
    }

    /// Execute this step, returning its report.
    ///
    /// Spawns `/bin/sh` with the given environment and working directory,
    /// pipes the script to stdin, and captures stdout/stderr and the exit
    /// code with wall-clock start/finish timestamps.
    pub fn execute(
        &self,
        env: &BTreeMap<String, String>,
        cwd: &Path,
    ) -> std::io::Result<BuildStepReport> {
        let t_start = unix_time();
        let mut child = Command::new("/bin/sh")
            .current_dir(cwd)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        child
            .stdin
            .take()
            .expect("stdin piped")
            .write_all(&self.script)?;

        let output = child.wait_with_output()?;
        let t_finish = unix_time();

        Ok(BuildStepReport {
            exit: output.status.code().unwrap_or(-1),
            t_start,
            t_finish,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// A build specification loaded from a `steps/` tree (spec.md Section 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub name: String,
    pub oid: Oid,
    pub env: BTreeMap<String, String>,
    pub steps: BTreeMap<String, BuildStep>,
    pub artifacts: Vec<String>,
}

impl BuildSpec {
    /// Resolve `name` to a commit via `Repository::revparse_single` and
    /// load the spec from its tree.
    pub fn from_ref(repo: &Repository, name: &str) -> Result<Self> {
        let obj = repo.revparse_single(name)?;
        let commit_obj = crate::git::peel(obj, ObjectType::Commit)?;
        let commit = commit_obj.into_commit().expect("peeled to commit");
        Self::from_commit(repo, name, commit.id())
    }

    pub fn from_commit(repo: &Repository, name: &str, commit_oid: Oid) -> Result<Self> {
        let commit = repo.find_commit(commit_oid)?;
        Self::from_tree(repo, name, commit_oid, commit.tree_id())
    }

    pub fn from_tree(repo: &Repository, name: &str, commit_oid: Oid, tree_oid: Oid) -> Result<Self> {
        let tree = repo.find_tree(tree_oid)?;

        if tree.get_name("env").is_some() {
            return Err(SpecError::NotImplemented);
        }
        if tree.get_name("artifacts").is_some() {
            return Err(SpecError::NotImplemented);
        }

        let steps_entry = tree.get_name("steps").ok_or(SpecError::MissingSteps)?;
        let steps_tree = repo.find_tree(steps_entry.id())?;

        let mut steps = BTreeMap::new();
        for entry in steps_tree.iter() {
            let step_name = entry.name().unwrap_or_default().to_string();
            steps.insert(step_name, BuildStep::from_blob(repo, entry.id())?);
        }

        Ok(Self {
            name: name.to_string(),
            oid: commit_oid,
            env: BTreeMap::new(),
            steps,
            artifacts: Vec::new(),
        })
    }

    /// Execute the spec against an assigned, incomplete order.
    ///
    /// Runs steps in ascending name order, stopping at the first non-zero
    /// exit, and returns a `BuildReport` for a *completed* order.
    pub fn execute(
        &self,
        order: &Order,
        source_oid: Option<Oid>,
        cwd: &Path,
    ) -> Result<BuildReport> {
        if !order.is_assigned() || order.is_completed() {
            return Err(SpecError::OrderNotAssignedOrAlreadyComplete);
        }

        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        for (k, v) in &self.env {
            env.insert(k.clone(), v.clone());
        }
        for (k, v) in &order.env {
            env.insert(k.clone(), v.clone());
        }

        let mut step_reports = BTreeMap::new();
        for (name, step) in &self.steps {
            debug!(step = %name, "executing build step");
            let report = step.execute(&env, cwd)?;
            let ok = report.ok();
            step_reports.insert(name.clone(), report);
            if !ok {
                break;
            }
        }

        Ok(BuildReport {
            spec_oid: self.oid,
            source_oid,
            name: self.name.clone(),
            order: order.complete()?,
            env,
            step_reports,
        })
    }
}

/// Report of a single step's execution (spec.md Section 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStepReport {
    pub exit: i32,
    pub t_start: u64,
    pub t_finish: u64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl BuildStepReport {
    pub fn ok(&self) -> bool {
        self.exit == 0
    }

    pub fn from_tree(repo: &Repository, tree_oid: Oid) -> Result<Self> {
        let tree = repo.find_tree(tree_oid)?;
        let get = |name: &str| -> Result<Vec<u8>> {
            let entry = tree.get_name(name).ok_or(SpecError::MissingSteps)?;
            Ok(repo.blob_data(entry.id())?)
        };

        let exit_bytes = get("exit")?;
        let exit = parse_trimmed(&exit_bytes);
        let t_start = parse_trimmed(&get("t_start")?);
        let t_finish = parse_trimmed(&get("t_finish")?);

        Ok(Self {
            exit,
            t_start,
            t_finish,
            stdout: get("stdout")?,
            stderr: get("stderr")?,
        })
    }

    /// Write this report as a tree, returning its oid.
    pub fn write(&self, repo: &Repository) -> Result<Oid> {
        let exit_oid = repo.create_blob(format!("{}\n", self.exit).as_bytes())?;
        let t_start_oid = repo.create_blob(format!("{}\n", self.t_start).as_bytes())?;
        let t_finish_oid = repo.create_blob(format!("{}\n", self.t_finish).as_bytes())?;
        let stdout_oid = repo.create_blob(&self.stdout)?;
        let stderr_oid = repo.create_blob(&self.stderr)?;

        let mut tb = repo.inner().treebuilder(None).map_err(GitError::from)?;
        tb.insert("exit", exit_oid, git2::FileMode::Blob.into())
            .map_err(GitError::from)?;
        tb.insert("t_start", t_start_oid, git2::FileMode::Blob.into())
            .map_err(GitError::from)?;
        tb.insert("t_finish", t_finish_oid, git2::FileMode::Blob.into())
            .map_err(GitError::from)?;
        tb.insert("stdout", stdout_oid, git2::FileMode::Blob.into())
            .map_err(GitError::from)?;
        tb.insert("stderr", stderr_oid, git2::FileMode::Blob.into())
            .map_err(GitError::from)?;
        Ok(tb.write().map_err(GitError::from)?)
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("order must be complete")]
    OrderNotComplete,
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Json(#[from] crate::json::JsonError),
    #[error("report commit has no spec parent")]
    MissingSpecParent,
    #[error("malformed commit message")]
    MalformedMessage,
}

/// Report of a full build (spec.md Section 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub spec_oid: Oid,
    pub source_oid: Option<Oid>,
    pub name: String,
    pub order: Order,
    pub env: BTreeMap<String, String>,
    pub step_reports: BTreeMap<String, BuildStepReport>,
}

impl BuildReport {
    /// Build a report. `order` must already be completed.
    pub fn new(
        spec_oid: Oid,
        source_oid: Option<Oid>,
        name: String,
        order: Order,
        env: BTreeMap<String, String>,
        step_reports: BTreeMap<String, BuildStepReport>,
    ) -> std::result::Result<Self, ReportError> {
        if !order.is_completed() {
            return Err(ReportError::OrderNotComplete);
        }
        Ok(Self {
            spec_oid,
            source_oid,
            name,
            order,
            env,
            step_reports,
        })
    }

    pub fn ok(&self) -> bool {
        self.step_reports.values().all(BuildStepReport::ok)
    }

    pub fn result(&self) -> &'static str {
        if self.ok() {
            "PASS"
        } else {
            "FAIL"
        }
    }

    pub fn message(&self) -> String {
        format!("[{}] {}", self.result(), self.name)
    }

    fn write_tree(&self, repo: &Repository) -> std::result::Result<Oid, ReportError> {
        let mut tb = repo.inner().treebuilder(None).map_err(GitError::from)?;

        let order_blob = repo.create_blob(&json::to_canonical_bytes(&self.order)?)?;
        tb.insert("order", order_blob, git2::FileMode::Blob.into())
            .map_err(GitError::from)?;

        let env_blob = repo.create_blob(&json::to_canonical_bytes(&self.env)?)?;
        tb.insert("env", env_blob, git2::FileMode::Blob.into())
            .map_err(GitError::from)?;

        let result_blob = repo.create_blob(self.result().as_bytes())?;
        tb.insert("result", result_blob, git2::FileMode::Blob.into())
            .map_err(GitError::from)?;

        let mut steps_tb = repo.inner().treebuilder(None).map_err(GitError::from)?;
        for (name, report) in &self.step_reports {
            let step_tree_oid = report.write(repo)?;
            steps_tb
                .insert(name, step_tree_oid, git2::FileMode::Tree.into())
                .map_err(GitError::from)?;
        }
        let steps_oid = steps_tb.write().map_err(GitError::from)?;
        tb.insert("steps", steps_oid, git2::FileMode::Tree.into())
            .map_err(GitError::from)?;

        Ok(tb.write().map_err(GitError::from)?)
    }

    /// Write this report to `repo` as a commit whose first parent is
    /// `prev_oid`. Does not update any ref; the caller owns that (spec.md
    /// Section 4.4).
    pub fn write(&self, repo: &Repository, prev_oid: Oid) -> std::result::Result<Oid, ReportError> {
        let mut parents = vec![prev_oid, self.spec_oid];
        if let Some(source_oid) = self.source_oid {
            if repo.contains(source_oid) {
                parents.push(source_oid);
            }
        }
        let tree_oid = self.write_tree(repo)?;
        Ok(repo.create_commit(None, &self.message(), tree_oid, &parents, false)?)
    }

    /// Read a report back from the commit it was written to.
    pub fn from_commit(repo: &Repository, oid: Oid) -> std::result::Result<Self, ReportError> {
        let commit = repo.find_commit(oid)?;
        let parents: Vec<Oid> = commit.parent_ids().collect();
        let spec_oid = *parents.get(1).ok_or(ReportError::MissingSpecParent)?;
        let source_oid = parents.get(2).copied();

        let name = commit
            .message()
            .and_then(|m| m.splitn(2, ' ').nth(1))
            .ok_or(ReportError::MalformedMessage)?
            .to_string();

        let tree = commit.tree().map_err(GitError::from)?;
        let order_oid = tree.get_name("order").ok_or(ReportError::MalformedMessage)?.id();
        let order: Order = json::from_bytes_typed(&repo.blob_data(order_oid)?)?;

        let env_oid = tree.get_name("env").ok_or(ReportError::MalformedMessage)?.id();
        let env: BTreeMap<String, String> = json::from_bytes_typed(&repo.blob_data(env_oid)?)?;

        let steps_entry = tree.get_name("steps").ok_or(ReportError::MalformedMessage)?;
        let steps_tree = repo.find_tree(steps_entry.id())?;
        let mut step_reports = BTreeMap::new();
        for entry in steps_tree.iter() {
            let step_name = entry.name().unwrap_or_default().to_string();
            step_reports.insert(step_name, BuildStepReport::from_tree(repo, entry.id())?);
        }

        Ok(Self {
            spec_oid,
            source_oid,
            name,
            order,
            env,
            step_reports,
        })
    }
}

/// Report ref name for a given spec ref (spec.md Section 4.4).
pub fn report_ref_for_spec_ref(spec_ref: &str) -> String {
    format!("refs/ci/report/{}", tail_ref(spec_ref))
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parse_trimmed<T: std::str::FromStr + Default>(bytes: &[u8]) -> T {
    std::str::from_utf8(bytes)
        .ok()
        .map(str::trim)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository as Git2Repository;
    use tempfile::tempdir;

    fn repo() -> (tempfile::TempDir, Repository) {
        let dir = tempdir().unwrap();
        let inner = Git2Repository::init_bare(dir.path()).unwrap();
        (dir, Repository { inner })
    }

    fn completed_order() -> Order {
        Order::new(crate::order::NewOrder {
            id: None,
            desc: "t".into(),
            spec_uri: "u".into(),
            spec_ref: "build0".into(),
            source_uri: "u".into(),
            source_args: vec![],
            env: BTreeMap::new(),
        })
        .assign("bob")
        .unwrap()
        .complete()
        .unwrap()
    }

    #[test]
    fn two_steps_both_pass() {
        let (_d, r) = repo();
        let step_report = BuildStepReport {
            exit: 0,
            t_start: 1,
            t_finish: 2,
            stdout: b"ok".to_vec(),
            stderr: vec![],
        };
        let mut steps = BTreeMap::new();
        steps.insert("1".to_string(), step_report.clone());
        steps.insert("2".to_string(), step_report);

        let spec_oid = r.null_report().unwrap();
        let report = BuildReport::new(
            spec_oid,
            None,
            "demo".into(),
            completed_order(),
            BTreeMap::new(),
            steps,
        )
        .unwrap();

        assert!(report.ok());
        assert_eq!(report.result(), "PASS");
        assert_eq!(report.message(), "[PASS] demo");
    }

    #[test]
    fn second_step_failing_marks_report_fail() {
        let mut steps = BTreeMap::new();
        steps.insert(
            "1".to_string(),
            BuildStepReport {
                exit: 0,
                t_start: 1,
                t_finish: 2,
                stdout: vec![],
                stderr: vec![],
            },
        );
        steps.insert(
            "2".to_string(),
            BuildStepReport {
                exit: 1,
                t_start: 2,
                t_finish: 3,
                stdout: vec![],
                stderr: vec![],
            },
        );
        let (_d, r) = repo();
        let spec_oid = r.null_report().unwrap();
        let report = BuildReport::new(
            spec_oid,
            None,
            "demo".into(),
            completed_order(),
            BTreeMap::new(),
            steps,
        )
        .unwrap();
        assert!(!report.ok());
        assert_eq!(report.result(), "FAIL");
    }

    #[test]
    fn execute_merges_process_spec_and_order_env_in_precedence_order() {
        std::env::set_var("IGOR_TEST_ENV_MERGE", "from-process");
        let (_d, r) = repo();

        let mut spec_env = BTreeMap::new();
        spec_env.insert("IGOR_TEST_ENV_MERGE".to_string(), "from-spec".to_string());
        spec_env.insert("FOO".to_string(), "BAR".to_string());
        let spec = BuildSpec {
            name: "demo".into(),
            oid: r.null_report().unwrap(),
            env: spec_env,
            steps: BTreeMap::new(),
            artifacts: Vec::new(),
        };

        let mut order_env = BTreeMap::new();
        order_env.insert("IGOR_TEST_ENV_MERGE".to_string(), "from-order".to_string());
        let order = Order::new(crate::order::NewOrder {
            id: None,
            desc: "t".into(),
            spec_uri: "u".into(),
            spec_ref: "build0".into(),
            source_uri: "u".into(),
            source_args: vec![],
            env: order_env,
        })
        .assign("bob")
        .unwrap();

        let tmp = tempdir().unwrap();
        let report = spec.execute(&order, None, tmp.path()).unwrap();

        // order env wins over the spec overlay, which wins over the
        // inherited process env.
        assert_eq!(
            report.env.get("IGOR_TEST_ENV_MERGE").map(String::as_str),
            Some("from-order")
        );
        // the spec overlay is still present when the order doesn't touch it.
        assert_eq!(report.env.get("FOO").map(String::as_str), Some("BAR"));
        std::env::remove_var("IGOR_TEST_ENV_MERGE");
    }

    #[test]
    fn report_from_incomplete_order_is_an_error() {
        let order = Order::new(crate::order::NewOrder {
            id: None,
            desc: "t".into(),
            spec_uri: "u".into(),
            spec_ref: "r".into(),
            source_uri: "u".into(),
            source_args: vec![],
            env: BTreeMap::new(),
        });
        let err = BuildReport::new(
            Oid::zero(),
            None,
            "demo".into(),
            order,
            BTreeMap::new(),
            BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ReportError::OrderNotComplete));
    }

    #[test]
    fn write_then_read_back_round_trips() {
        let (_d, r) = repo();
        let mut steps = BTreeMap::new();
        steps.insert(
            "1".to_string(),
            BuildStepReport {
                exit: 0,
                t_start: 10,
                t_finish: 20,
                stdout: b"hi".to_vec(),
                stderr: b"".to_vec(),
            },
        );
        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "BAR".to_string());

        let spec_tree = r.null_tree().unwrap();
        let spec_oid = r
            .create_commit(None, "spec", spec_tree, &[], true)
            .unwrap();

        let report = BuildReport::new(
            spec_oid,
            None,
            "demo".into(),
            completed_order(),
            env,
            steps,
        )
        .unwrap();

        let prev = r.null_report().unwrap();
        let commit_oid = report.write(&r, prev).unwrap();
        let read_back = BuildReport::from_commit(&r, commit_oid).unwrap();

        assert_eq!(read_back.spec_oid, report.spec_oid);
        assert_eq!(read_back.name, report.name);
        assert_eq!(read_back.order, report.order);
        assert_eq!(read_back.env, report.env);
        assert_eq!(read_back.step_reports, report.step_reports);
    }

    #[test]
    fn step_report_write_read_round_trips() {
        let (_d, r) = repo();
        let step = BuildStepReport {
            exit: 7,
            t_start: 100,
            t_finish: 200,
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
        };
        let tree_oid = step.write(&r).unwrap();
        let back = BuildStepReport::from_tree(&r, tree_oid).unwrap();
        assert_eq!(step, back);
    }
}
