//! Version control operations used by workers and the merge coordinator.
//!
//! [`GitVcs`] works directly on the object database through git2: merges
//! are computed with `merge_commits` and written as commits without touching
//! any checkout, and each worker slot gets its own worktree on branch
//! `hive/<feature>/<worker-id>`.

use super::record::{BranchMerge, BranchOutcome};
use crate::errors::MergeError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, IndexAddOption, Oid, Repository, ResetType, Signature, StatusOptions,
    WorktreeAddOptions, WorktreePruneOptions,
};
use std::fs;
use std::path::{Path, PathBuf};

/// A worker slot's checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub branch: String,
    pub path: PathBuf,
}

/// The ephemeral branch a level is merged into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integration {
    pub level: u32,
    pub branch: String,
    pub path: PathBuf,
    pub base_commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub merges: Vec<BranchMerge>,
    /// Integration tip after the last successful merge.
    pub head: String,
}

impl MergeResult {
    pub fn conflict(&self) -> Option<&BranchMerge> {
        self.merges.iter().find(|m| m.is_conflict())
    }
}

#[async_trait]
pub trait Vcs: Send + Sync {
    fn base_branch(&self) -> &str;

    /// Branch name owned by a worker slot.
    fn worker_branch(&self, worker_id: &str) -> String;

    /// Ensure the slot's branch and worktree exist.
    async fn prepare_worktree(&self, worker_id: &str) -> Result<WorktreeInfo, MergeError>;

    /// The subset of `candidates` that carries commits not yet in the base.
    async fn collect_branches(
        &self,
        level: u32,
        candidates: &[String],
    ) -> Result<Vec<String>, MergeError>;

    /// Create (or recreate) the level's integration branch from the base.
    async fn create_integration(&self, level: u32) -> Result<Integration, MergeError>;

    /// Merge `branches` into the integration branch in order, stopping at
    /// the first conflict.
    async fn merge(
        &self,
        branches: &[String],
        into: &Integration,
    ) -> Result<MergeResult, MergeError>;

    async fn tag(&self, commit: &str, name: &str) -> Result<(), MergeError>;

    /// Fast-forward the base branch to `commit`.
    async fn advance_base(&self, commit: &str) -> Result<(), MergeError>;

    /// Merge `commit` into a worker branch and refresh its worktree. Used
    /// to bring slots forward after a level merge and to seed a slot with a
    /// checkpoint left on another slot's branch.
    async fn bring_forward(
        &self,
        level: u32,
        worker_branch: &str,
        commit: &str,
    ) -> Result<(), MergeError>;

    /// Point a worker branch (and its worktree) at `commit`, discarding
    /// whatever the branch held that `commit` does not.
    async fn reset_branch(&self, worker_branch: &str, commit: &str) -> Result<(), MergeError>;

    /// Remove the integration worktree; the branch is kept.
    async fn cleanup_integration(&self, level: u32) -> Result<(), MergeError>;
}

pub struct GitVcs {
    repo_path: PathBuf,
    feature: String,
    base_branch: String,
    worktree_root: PathBuf,
}

impl GitVcs {
    /// Open the repository at `repo_path`. Without an explicit base branch
    /// the currently checked-out branch is used.
    pub fn open(
        repo_path: &Path,
        feature: &str,
        base_branch: Option<String>,
        worktree_root: PathBuf,
    ) -> Result<Self> {
        let repo = Repository::open(repo_path).context("Failed to open git repository")?;
        let base_branch = match base_branch {
            Some(b) => b,
            None => {
                let head = repo
                    .head()
                    .context("Repository has no commits; create an initial commit first")?;
                head.shorthand()
                    .filter(|_| head.is_branch())
                    .map(str::to_string)
                    .context("HEAD is detached; set merge.base_branch in hive.toml")?
            }
        };
        repo.find_branch(&base_branch, BranchType::Local)
            .with_context(|| format!("Base branch '{}' does not exist", base_branch))?;
        exclude_hive_dir(&repo)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            feature: feature.to_string(),
            base_branch,
            worktree_root,
        })
    }

    fn repo(&self) -> Result<Repository, MergeError> {
        Ok(Repository::open(&self.repo_path)?)
    }

    fn signature() -> Result<Signature<'static>, MergeError> {
        Ok(Signature::now("hive", "hive@localhost")?)
    }

    /// Move `branch` to `oid` and force the slot's worktree onto it.
    fn move_branch(
        &self,
        repo: &Repository,
        branch: &str,
        oid: Oid,
        log: &str,
    ) -> Result<(), MergeError> {
        repo.reference(&format!("refs/heads/{}", branch), oid, true, log)?;
        if let Some(slot) = branch.rsplit('/').next()
            && let Ok(checkout) = Repository::open(self.worktree_root.join(slot))
        {
            checkout.checkout_head(Some(CheckoutBuilder::new().force()))?;
        }
        Ok(())
    }

    fn worktree_name(&self, slot: &str) -> String {
        let feature: String = self
            .feature
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("hive-{}-{}", feature, slot)
    }

    pub fn integration_branch(&self, level: u32) -> String {
        format!("hive/{}/integration-L{}", self.feature, level)
    }

    pub fn level_tag(&self, level: u32) -> String {
        format!("hive/{}/level-{}", self.feature, level)
    }

    fn branch_tip<'r>(repo: &'r Repository, branch: &str) -> Result<Commit<'r>, MergeError> {
        let reference = repo.find_reference(&format!("refs/heads/{}", branch))?;
        Ok(reference.peel_to_commit()?)
    }

    fn add_worktree(
        &self,
        repo: &Repository,
        name: &str,
        branch: &str,
        path: &Path,
    ) -> Result<(), MergeError> {
        remove_worktree(repo, name, path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MergeError::Vcs(e.to_string()))?;
        }
        let reference = repo.find_reference(&format!("refs/heads/{}", branch))?;
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(name, path, Some(&opts))?;
        Ok(())
    }
}

fn remove_worktree(repo: &Repository, name: &str, path: &Path) -> Result<(), MergeError> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|e| MergeError::Vcs(e.to_string()))?;
    }
    if let Ok(worktree) = repo.find_worktree(name) {
        let mut opts = WorktreePruneOptions::new();
        opts.valid(true).locked(false).working_tree(true);
        worktree.prune(Some(&mut opts))?;
    }
    Ok(())
}

/// Keep `.hive/` out of `git status` in the main checkout.
fn exclude_hive_dir(repo: &Repository) -> Result<()> {
    let info = repo.path().join("info");
    let exclude = info.join("exclude");
    let current = fs::read_to_string(&exclude).unwrap_or_default();
    if current.lines().any(|l| l.trim() == ".hive/") {
        return Ok(());
    }
    fs::create_dir_all(&info).context("Failed to create .git/info")?;
    let mut content = current;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(".hive/\n");
    fs::write(&exclude, content).context("Failed to update .git/info/exclude")?;
    Ok(())
}

fn conflict_paths(index: &git2::Index) -> Result<Vec<String>, MergeError> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
            paths.push(String::from_utf8_lossy(&entry.path).to_string());
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

#[async_trait]
impl Vcs for GitVcs {
    fn base_branch(&self) -> &str {
        &self.base_branch
    }

    fn worker_branch(&self, worker_id: &str) -> String {
        format!("hive/{}/{}", self.feature, worker_id)
    }

    async fn prepare_worktree(&self, worker_id: &str) -> Result<WorktreeInfo, MergeError> {
        let repo = self.repo()?;
        let branch = self.worker_branch(worker_id);
        let path = self.worktree_root.join(worker_id);
        if repo.find_branch(&branch, BranchType::Local).is_err() {
            let base = Self::branch_tip(&repo, &self.base_branch)?;
            repo.branch(&branch, &base, false)?;
            tracing::debug!(branch = %branch, "Created worker branch");
        }
        if Repository::open(&path).is_err() {
            self.add_worktree(&repo, &self.worktree_name(worker_id), &branch, &path)?;
            tracing::debug!(path = %path.display(), "Created worker worktree");
        }
        Ok(WorktreeInfo { branch, path })
    }

    async fn collect_branches(
        &self,
        level: u32,
        candidates: &[String],
    ) -> Result<Vec<String>, MergeError> {
        let repo = self.repo()?;
        let base = Self::branch_tip(&repo, &self.base_branch)?.id();
        let mut branches = Vec::new();
        for candidate in candidates {
            let Ok(tip) = Self::branch_tip(&repo, candidate) else {
                tracing::warn!(level, branch = %candidate, "Worker branch missing; skipping");
                continue;
            };
            let tip = tip.id();
            if tip != base && !repo.graph_descendant_of(base, tip)? {
                branches.push(candidate.clone());
            }
        }
        Ok(branches)
    }

    async fn create_integration(&self, level: u32) -> Result<Integration, MergeError> {
        let repo = self.repo()?;
        let branch = self.integration_branch(level);
        let name = self.worktree_name(&format!("integration-L{}", level));
        let path = self.worktree_root.join(format!("integration-L{}", level));
        remove_worktree(&repo, &name, &path)?;
        let base = Self::branch_tip(&repo, &self.base_branch)?;
        repo.branch(&branch, &base, true)?;
        self.add_worktree(&repo, &name, &branch, &path)?;
        Ok(Integration {
            level,
            branch,
            path,
            base_commit: base.id().to_string(),
        })
    }

    async fn merge(
        &self,
        branches: &[String],
        into: &Integration,
    ) -> Result<MergeResult, MergeError> {
        let repo = self.repo()?;
        let sig = Self::signature()?;
        let mut head = Self::branch_tip(&repo, &into.branch)?;
        let mut merges = Vec::with_capacity(branches.len());

        for branch in branches {
            let theirs = Self::branch_tip(&repo, branch)?;
            let outcome = if head.id() == theirs.id()
                || repo.graph_descendant_of(head.id(), theirs.id())?
            {
                BranchOutcome::UpToDate
            } else if repo.graph_descendant_of(theirs.id(), head.id())? {
                head = theirs;
                BranchOutcome::Merged {
                    commit: head.id().to_string(),
                }
            } else {
                let mut index = repo.merge_commits(&head, &theirs, None)?;
                if index.has_conflicts() {
                    let paths = conflict_paths(&index)?;
                    merges.push(BranchMerge {
                        branch: branch.clone(),
                        outcome: BranchOutcome::Conflict { paths },
                    });
                    break;
                }
                let tree_id = index.write_tree_to(&repo)?;
                let tree = repo.find_tree(tree_id)?;
                let oid = repo.commit(
                    None,
                    &sig,
                    &sig,
                    &format!("[hive] merge {} into level {}", branch, into.level),
                    &tree,
                    &[&head, &theirs],
                )?;
                head = repo.find_commit(oid)?;
                BranchOutcome::Merged {
                    commit: oid.to_string(),
                }
            };
            merges.push(BranchMerge {
                branch: branch.clone(),
                outcome,
            });
        }

        repo.reference(
            &format!("refs/heads/{}", into.branch),
            head.id(),
            true,
            "hive: level merge",
        )?;
        let checkout = Repository::open(&into.path)?;
        checkout.checkout_head(Some(CheckoutBuilder::new().force()))?;

        Ok(MergeResult {
            merges,
            head: head.id().to_string(),
        })
    }

    async fn tag(&self, commit: &str, name: &str) -> Result<(), MergeError> {
        let repo = self.repo()?;
        let object = repo.find_object(Oid::from_str(commit)?, None)?;
        repo.tag_lightweight(name, &object, true)?;
        Ok(())
    }

    async fn advance_base(&self, commit: &str) -> Result<(), MergeError> {
        let repo = self.repo()?;
        let oid = Oid::from_str(commit)?;
        let target = repo.find_commit(oid)?;
        let base_ref = format!("refs/heads/{}", self.base_branch);
        let current = repo.find_reference(&base_ref)?.peel_to_commit()?.id();
        if current == oid {
            return Ok(());
        }
        if !repo.graph_descendant_of(oid, current)? {
            return Err(MergeError::Vcs(format!(
                "Base branch '{}' moved during the run; cannot fast-forward to {}",
                self.base_branch, commit
            )));
        }
        let base_checked_out = !repo.is_bare()
            && repo
                .head()
                .ok()
                .and_then(|h| h.name().map(str::to_string))
                .as_deref()
                == Some(base_ref.as_str());
        if base_checked_out {
            repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().safe()))?;
        }
        repo.reference(&base_ref, oid, true, "hive: advance base")?;
        Ok(())
    }

    async fn bring_forward(
        &self,
        level: u32,
        worker_branch: &str,
        commit: &str,
    ) -> Result<(), MergeError> {
        let repo = self.repo()?;
        let onto = repo.find_commit(Oid::from_str(commit)?)?;
        let tip = Self::branch_tip(&repo, worker_branch)?;
        if tip.id() == onto.id() || repo.graph_descendant_of(tip.id(), onto.id())? {
            return Ok(());
        }
        let new_tip = if repo.graph_descendant_of(onto.id(), tip.id())? {
            onto.id()
        } else {
            let mut index = repo.merge_commits(&tip, &onto, None)?;
            if index.has_conflicts() {
                return Err(MergeError::Conflict {
                    level,
                    branch: worker_branch.to_string(),
                    paths: conflict_paths(&index)?,
                });
            }
            let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
            let sig = Self::signature()?;
            repo.commit(
                None,
                &sig,
                &sig,
                &format!("[hive] bring {} forward", worker_branch),
                &tree,
                &[&tip, &onto],
            )?
        };
        self.move_branch(&repo, worker_branch, new_tip, "hive: bring forward")
    }

    async fn reset_branch(&self, worker_branch: &str, commit: &str) -> Result<(), MergeError> {
        let repo = self.repo()?;
        let oid = repo.find_commit(Oid::from_str(commit)?)?.id();
        self.move_branch(&repo, worker_branch, oid, "hive: reset slot branch")
    }

    async fn cleanup_integration(&self, level: u32) -> Result<(), MergeError> {
        let repo = self.repo()?;
        let name = self.worktree_name(&format!("integration-L{}", level));
        let path = self.worktree_root.join(format!("integration-L{}", level));
        remove_worktree(&repo, &name, &path)
    }
}

/// Stage everything in `worktree` and commit it. Returns the new commit id,
/// or `None` when there was nothing to commit.
pub fn commit_all(worktree: &Path, message: &str) -> Result<Option<String>> {
    let repo = Repository::open(worktree).context("Failed to open worktree")?;
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;
    let tree_id = index.write_tree()?;

    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    if let Some(parent) = &parent
        && parent.tree_id() == tree_id
    {
        return Ok(None);
    }
    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now("hive", "hive@localhost")?;
    let parents: Vec<&Commit<'_>> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(Some(oid.to_string()))
}

/// Discard uncommitted and untracked changes in `worktree`.
pub fn clean_worktree(worktree: &Path) -> Result<()> {
    let repo = Repository::open(worktree).context("Failed to open worktree")?;
    let head = repo.head()?.peel_to_commit()?;
    repo.reset(head.as_object(), ResetType::Hard, None)?;

    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;
    for entry in statuses.iter() {
        if entry.status().is_wt_new()
            && let Some(path) = entry.path()
        {
            let full = worktree.join(path);
            if full.is_dir() {
                fs::remove_dir_all(&full).ok();
            } else {
                fs::remove_file(&full).ok();
            }
        }
    }
    Ok(())
}

/// Current HEAD commit of a checkout.
pub fn head_commit(worktree: &Path) -> Result<Option<String>> {
    let repo = Repository::open(worktree).context("Failed to open worktree")?;
    Ok(repo
        .head()
        .ok()
        .and_then(|h| h.peel_to_commit().ok())
        .map(|c| c.id().to_string()))
}
