//! Worktree manager: one git worktree per run, isolated under
//! `<dataDir>/worktrees/<runId>`, cloned/fetched from a shared bare mirror
//! under `<dataDir>/repos/<repoId>`. Built on `git2` directly rather than
//! shelling out to the `git` binary.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use git2::{BranchType, Repository};
use rusqlite::Connection;

use crate::config::Config;
use crate::errors::{ConductorError, StorageError, ValidationError};
use crate::storage::models::Worktree;
use crate::storage::worktrees as storage;

const MAX_REF_NAME_LEN: usize = 250;

/// Validates a would-be git ref name against the rules git itself enforces
/// (`git check-ref-format`), since branch names here are agent/operator
/// controlled.
pub fn validate_ref_name(name: &str) -> Result<(), ConductorError> {
    let invalid = name.is_empty()
        || name.len() > MAX_REF_NAME_LEN
        || name.starts_with('-')
        || name.starts_with('.')
        || name.ends_with('.')
        || name.ends_with(".lock")
        || name.contains("..")
        || name.contains("//")
        || name.contains("@{")
        || name.contains(['~', '^', ':', '?', '*', '[', ']', '\\'])
        || name.chars().any(|c| c.is_control());

    if invalid {
        return Err(ValidationError::InvalidRefName(name.to_string()).into());
    }
    Ok(())
}

/// Resolution order: explicit config, then the clone's remote HEAD, then a
/// local `main`/`master` preference, then a literal `"main"` fallback.
pub fn resolve_base_branch(repo: &Repository, configured: Option<&str>) -> String {
    if let Some(branch) = configured {
        return branch.to_string();
    }

    if let Some(branch) = remote_default_branch(repo) {
        return branch;
    }

    for candidate in ["main", "master"] {
        if repo.find_branch(candidate, BranchType::Local).is_ok() {
            return candidate.to_string();
        }
    }

    "main".to_string()
}

fn remote_default_branch(repo: &Repository) -> Option<String> {
    let remote = repo.find_remote("origin").ok()?;
    let head = remote.default_branch().ok()?;
    let name = head.as_str()?;
    Some(name.rsplit('/').next().unwrap_or(name).to_string())
}

pub struct ClonedRepo {
    pub clone_path: PathBuf,
    pub was_existing: bool,
}

/// Clones (or fetches, if already present) a bare mirror of `clone_url`
/// into `<dataDir>/repos/<repoId>`, guarded by an `fs2` advisory lock keyed
/// on `repoId` so concurrent runs against the same repo serialize instead
/// of racing the on-disk clone.
pub fn clone_or_fetch_repo(config: &Config, repo_id: &str, clone_url: &str) -> Result<ClonedRepo, ConductorError> {
    let lock_path = config.locks_dir().join(format!("{repo_id}.lock"));
    let lock_file = File::create(&lock_path)
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to open repo lock {}: {e}", lock_path.display())))?;
    lock_file
        .lock_exclusive()
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to acquire repo lock: {e}")))?;

    let clone_path = config.repos_dir().join(repo_id);
    let was_existing = clone_path.join("HEAD").exists();

    if was_existing {
        let repo = Repository::open_bare(&clone_path)
            .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to open mirror: {e}")))?;
        fetch_all(&repo)?;
    } else {
        fs::create_dir_all(&clone_path)
            .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to create {}: {e}", clone_path.display())))?;
        Repository::init_bare(&clone_path)
            .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to init mirror: {e}")))?
            .remote_with_fetch("origin", clone_url, "+refs/heads/*:refs/heads/*")
            .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to configure origin: {e}")))?;
        let repo = Repository::open_bare(&clone_path)
            .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to reopen mirror: {e}")))?;
        fetch_all(&repo)?;
    }

    fs2::FileExt::unlock(&lock_file).ok();

    Ok(ClonedRepo {
        clone_path,
        was_existing,
    })
}

fn fetch_all(repo: &Repository) -> Result<(), ConductorError> {
    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("missing origin remote: {e}")))?;
    remote
        .fetch(&["+refs/heads/*:refs/heads/*"], None, None)
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("fetch failed: {e}")))?;
    Ok(())
}

pub struct CreateWorktree<'a> {
    pub run_id: &'a str,
    pub project_id: &'a str,
    pub repo_id: &'a str,
    pub mirror_path: &'a Path,
    pub branch: &'a str,
    pub base_branch: &'a str,
}

/// Idempotent: a second call for the same `run_id` returns the existing
/// active worktree row rather than creating another checkout.
pub fn create_worktree(conn: &Connection, config: &Config, input: CreateWorktree<'_>) -> Result<Worktree, ConductorError> {
    if let Some(existing) = storage::get_worktree_for_run(conn, input.run_id)? {
        return Ok(existing);
    }

    validate_ref_name(input.branch)?;

    let worktree_path = config.worktrees_dir().join(input.run_id);
    let mirror = Repository::open_bare(input.mirror_path)
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to open mirror: {e}")))?;

    let base_oid = mirror
        .find_branch(input.base_branch, BranchType::Local)
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("base branch {} not found: {e}", input.base_branch)))?
        .get()
        .target()
        .ok_or_else(|| ConductorError::Other(anyhow::anyhow!("base branch {} has no target", input.base_branch)))?;

    let git_worktree = mirror
        .worktree(
            input.run_id,
            &worktree_path,
            Some(git2::WorktreeAddOptions::new().reference(None)),
        )
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to add worktree: {e}")))?;

    let wt_repo = Repository::open(git_worktree.path())
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to open worktree repo: {e}")))?;
    let base_commit = wt_repo
        .find_commit(base_oid)
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to resolve base commit: {e}")))?;
    let mut branch = wt_repo
        .branch(input.branch, &base_commit, false)
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to create branch: {e}")))?;
    wt_repo
        .set_head(branch.get().name().unwrap_or(input.branch))
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to set HEAD: {e}")))?;
    wt_repo
        .checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to checkout: {e}")))?;
    let _ = branch.set_upstream(None);

    let row = storage::insert_worktree(
        conn,
        storage::NewWorktree {
            run_id: input.run_id,
            project_id: input.project_id,
            repo_id: input.repo_id,
            path: worktree_path.to_string_lossy().as_ref(),
            branch: input.branch,
            base_commit: &base_oid.to_string(),
        },
    )?;

    Ok(row)
}

pub fn heartbeat(conn: &Connection, worktree_id: &str) -> Result<(), StorageError> {
    storage::update_heartbeat(conn, worktree_id)
}

pub struct AllocatedPort {
    pub lease_id: String,
    pub port: i64,
}

pub fn allocate_port(
    conn: &Connection,
    config: &Config,
    project_id: &str,
    worktree_id: &str,
    purpose: &str,
) -> Result<AllocatedPort, ConductorError> {
    let lease = storage::allocate_port(
        conn,
        project_id,
        worktree_id,
        purpose,
        config.port_range.0 as i64,
        config.port_range.1 as i64,
        config.lease_timeout_hours as i64,
    )?
    .ok_or_else(|| ConductorError::Other(anyhow::anyhow!("no_ports_available")))?;

    Ok(AllocatedPort {
        lease_id: lease.id,
        port: lease.port,
    })
}

/// Destroys a worktree checkout and releases its ports. Tolerates the
/// on-disk directory already being gone (the janitor may race a manual
/// cleanup).
pub fn destroy_worktree(conn: &Connection, mirror_path: &Path, worktree: &Worktree) -> Result<(), ConductorError> {
    storage::release_worktree_ports(conn, &worktree.id)?;

    if let Ok(mirror) = Repository::open_bare(mirror_path)
        && let Ok(mut git_worktree) = mirror.find_worktree(&worktree.id)
    {
        let _ = git_worktree.prune(Some(git2::WorktreePruneOptions::new().working_tree(true)));
    }
    if Path::new(&worktree.path).exists() {
        fs::remove_dir_all(&worktree.path)
            .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to remove worktree dir: {e}")))?;
    }

    storage::mark_destroyed(conn, &worktree.id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_leading_dash() {
        assert!(validate_ref_name("-evil").is_err());
    }

    #[test]
    fn rejects_dotdot() {
        assert!(validate_ref_name("feature/../x").is_err());
    }

    #[test]
    fn rejects_lock_suffix() {
        assert!(validate_ref_name("refs/heads/foo.lock").is_err());
    }

    #[test]
    fn accepts_normal_branch_name() {
        assert!(validate_ref_name("conductor/run_abc123").is_ok());
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(validate_ref_name("foo;rm -rf ~").is_err());
        assert!(validate_ref_name("foo*bar").is_err());
    }
}
