use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{BranchType, ErrorCode, IndexAddOption, Oid, Repository, Signature};

use crate::Result;

/// Result of folding one branch into another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Target already contains the source.
    UpToDate { commit: String },
    FastForward { commit: String },
    Merged { commit: String },
    /// Nothing was changed; these paths conflict.
    Conflict { paths: Vec<String> },
}

impl MergeOutcome {
    /// Commit the target points at after a successful merge.
    pub fn commit(&self) -> Option<&str> {
        match self {
            MergeOutcome::UpToDate { commit }
            | MergeOutcome::FastForward { commit }
            | MergeOutcome::Merged { commit } => Some(commit),
            MergeOutcome::Conflict { .. } => None,
        }
    }
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        tracing::debug!(path = %repo_path.display(), "GitOps::new");
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("conductor", "conductor@localhost"))?)
    }

    /// Create `branch` at the tip of `base` and check it out in a new
    /// worktree at `worktree_path`. Returns the base commit id.
    pub fn create_worktree(&self, branch: &str, base: &str, worktree_path: &Path) -> Result<String> {
        tracing::debug!(
            branch,
            base,
            path = %worktree_path.display(),
            "GitOps::create_worktree"
        );
        let repo = self.repo()?;
        let commit = repo.revparse_single(base)?.peel_to_commit()?;
        let branch_ref = repo.branch(branch, &commit, false)?.into_reference();

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the worktree is named after its folder.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        tracing::debug!(branch, base_commit = %commit.id(), "worktree created");
        Ok(commit.id().to_string())
    }

    /// Remove a worktree directory and its admin entry. Missing pieces are
    /// skipped, so this is safe on a half-created or already removed
    /// worktree.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        tracing::debug!(path = %worktree_path.display(), "GitOps::remove_worktree");
        let repo = self.repo()?;
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        let worktrees = repo.worktrees()?;
        let known = worktrees.iter().flatten().find(|name| {
            Some(*name) == folder_name.as_deref()
                || repo
                    .find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
        });

        if let Some(name) = known {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    tracing::warn!(worktree = name, error = %e, "worktree prune failed");
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // While the admin dir exists git still treats the branch as checked out.
        if let Some(name) = folder_name {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                std::fs::remove_dir_all(&admin_dir)?;
            }
        }
        Ok(())
    }

    /// Delete a local branch. A missing branch is not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        tracing::debug!(branch, "GitOps::delete_branch");
        let repo = self.repo()?;
        let result = match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => branch_ref.delete().map_err(Into::into),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };
        result
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    /// Stage and commit everything in the worktree. Returns the commit the
    /// worktree's HEAD points at afterwards; with nothing to commit that is
    /// the existing HEAD.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<String> {
        tracing::debug!(path = %worktree_path.display(), "GitOps::commit_all");
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(parent) = &parent {
            if parent.tree_id() == tree_id {
                return Ok(parent.id().to_string());
            }
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        tracing::debug!(commit = %commit_id, "commit created");
        Ok(commit_id.to_string())
    }

    /// Short name of the checked-out branch.
    pub fn current_branch(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        match head.shorthand() {
            Some(name) if head.is_branch() => Ok(name.to_string()),
            _ => Err(crate::Error::Validation(
                "repository HEAD is detached; set target_branch explicitly".into(),
            )),
        }
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Lines added plus lines removed between two revisions.
    pub fn diff_size(&self, from: &str, to: &str) -> Result<usize> {
        let repo = self.repo()?;
        let old = repo.revparse_single(from)?.peel_to_tree()?;
        let new = repo.revparse_single(to)?.peel_to_tree()?;
        let diff = repo.diff_tree_to_tree(Some(&old), Some(&new), None)?;
        let stats = diff.stats()?;
        Ok(stats.insertions() + stats.deletions())
    }

    /// Fold `source` into `target` without switching branches.
    ///
    /// Fast-forwards when possible, otherwise writes a merge commit. When
    /// `target` is the checked-out branch its working tree is updated with
    /// a safe checkout, which refuses to overwrite local modifications.
    pub fn merge_branch(&self, source: &str, target: &str, message: &str) -> Result<MergeOutcome> {
        tracing::debug!(source, target, "GitOps::merge_branch");
        let repo = self.repo()?;
        let source_commit = repo
            .find_branch(source, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let mut target_ref = repo.find_branch(target, BranchType::Local)?.into_reference();
        let target_commit = target_ref.peel_to_commit()?;

        if source_commit.id() == target_commit.id()
            || repo.graph_descendant_of(target_commit.id(), source_commit.id())?
        {
            return Ok(MergeOutcome::UpToDate {
                commit: target_commit.id().to_string(),
            });
        }

        let fast_forward = repo.graph_descendant_of(source_commit.id(), target_commit.id())?;
        let new_id: Oid = if fast_forward {
            source_commit.id()
        } else {
            let mut index = repo.merge_commits(&target_commit, &source_commit, None)?;
            if index.has_conflicts() {
                let paths = index
                    .conflicts()?
                    .flatten()
                    .filter_map(|c| c.our.or(c.their).or(c.ancestor))
                    .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                    .collect();
                return Ok(MergeOutcome::Conflict { paths });
            }
            let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
            let sig = Self::signature(&repo)?;
            repo.commit(
                None,
                &sig,
                &sig,
                message,
                &tree,
                &[&target_commit, &source_commit],
            )?
        };

        let head_is_target = match repo.head() {
            Ok(head) => head.is_branch() && head.shorthand() == Some(target),
            Err(_) => false,
        };
        if head_is_target {
            let new_commit = repo.find_commit(new_id)?;
            let mut checkout = CheckoutBuilder::new();
            checkout.safe();
            repo.checkout_tree(new_commit.as_object(), Some(&mut checkout))?;
        }

        target_ref.set_target(new_id, message)?;
        let commit = new_id.to_string();
        tracing::debug!(source, target, commit = %commit, fast_forward, "branch merged");
        Ok(if fast_forward {
            MergeOutcome::FastForward { commit }
        } else {
            MergeOutcome::Merged { commit }
        })
    }
}
