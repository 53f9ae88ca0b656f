//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function here shells out to the system `git` binary against a bare
//! checkout.  Network commands are bounded by a timeout and take their
//! credentials as a [`Credentials`] value, so authenticated URLs never leave
//! this module.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, instrument};

use crate::credentials::Credentials;
use crate::error::{RepoError, RepoResult};
use crate::model::FileStat;

/// Refspecs mirrored by every fetch: branches as remote-tracking refs, tags
/// as themselves.
const FETCH_REFSPECS: [&str; 2] = [
    "+refs/heads/*:refs/remotes/origin/*",
    "+refs/tags/*:refs/tags/*",
];

// ---------------------------------------------------------------------------
// Plumbing
// ---------------------------------------------------------------------------

fn git(repo_path: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(repo_path)
        .arg("-c")
        .arg("core.quotePath=false");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd
}

async fn output(mut cmd: Command, command: &str) -> RepoResult<Output> {
    cmd.output().await.map_err(|e| RepoError::Git {
        command: command.to_string(),
        stderr: format!("failed to spawn git: {e}"),
    })
}

fn failure(command: &str, output: &Output) -> RepoError {
    RepoError::Git {
        command: command.to_string(),
        stderr: format!(
            "status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

/// Run a local command and return its stdout, failing on non-zero exit.
async fn run(cmd: Command, command: &str) -> RepoResult<String> {
    let out = output(cmd, command).await?;
    if !out.status.success() {
        return Err(failure(command, &out));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Whether `path` is a directory with a `HEAD` file.
pub async fn is_bare_repo(path: &Path) -> bool {
    tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

#[instrument(fields(path = %path.display()))]
pub async fn init_bare(path: &Path) -> RepoResult<()> {
    let mut cmd = Command::new("git");
    cmd.arg("init").arg("--bare").arg("--quiet").arg(path);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    run(cmd, "init").await?;
    debug!("bare checkout initialised");
    Ok(())
}

/// Point `origin` at `url`.  The stored URL never carries credentials.
pub async fn set_origin(repo_path: &Path, url: &str) -> RepoResult<()> {
    let mut add = git(repo_path);
    add.args(["remote", "add", "origin", url]);
    let out = output(add, "remote add").await?;
    if out.status.success() {
        return Ok(());
    }
    if !String::from_utf8_lossy(&out.stderr).contains("already exists") {
        return Err(failure("remote add", &out));
    }

    let mut set = git(repo_path);
    set.args(["remote", "set-url", "origin", url]);
    run(set, "remote set-url").await?;
    Ok(())
}

pub async fn config_set(repo_path: &Path, key: &str, value: &str) -> RepoResult<()> {
    let mut cmd = git(repo_path);
    cmd.args(["config", key, value]);
    run(cmd, "config").await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Summary of a `git fetch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub refs_updated: usize,
}

impl FetchOutcome {
    pub fn updated(&self) -> bool {
        self.refs_updated > 0
    }
}

/// Fetch branches and tags from `url` into the checkout at `repo_path`.
///
/// On failure the returned reason has any password redacted.  An elapsed
/// `timeout` kills the child process.
#[instrument(skip(credentials), fields(repo = %repo_path.display(), %url))]
pub async fn fetch(
    repo_path: &Path,
    url: &str,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<FetchOutcome, String> {
    let remote_url = credentials.remote_url(url).map_err(|e| e.to_string())?;

    let mut cmd = git(repo_path);
    cmd.args(["fetch", "--prune", "--force", "--no-progress"])
        .arg(remote_url)
        .args(FETCH_REFSPECS);
    for (key, value) in credentials.git_env() {
        cmd.env(key, value);
    }
    cmd.kill_on_drop(true);

    debug!("spawning git fetch");
    let out = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => return Err(format!("failed to spawn git fetch: {e}")),
        Err(_) => return Err(format!("git fetch timed out after {}s", timeout.as_secs())),
    };

    let stderr = credentials.redact(&String::from_utf8_lossy(&out.stderr));
    if !out.status.success() {
        return Err(format!("status {}: {}", out.status, stderr.trim()));
    }

    let refs_updated = count_updated_refs(&stderr);
    debug!(refs_updated, "git fetch complete");
    Ok(FetchOutcome { refs_updated })
}

/// Count ref-update lines (`old..new  main -> origin/main`) in fetch stderr.
fn count_updated_refs(stderr: &str) -> usize {
    stderr
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.contains("->") && !trimmed.starts_with("From")
        })
        .count()
}

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

/// Resolve `rev` to a commit hash, `None` when it does not name a commit.
pub async fn resolve_commit(repo_path: &Path, rev: &str) -> RepoResult<Option<String>> {
    let mut cmd = git(repo_path);
    cmd.args(["rev-parse", "--verify", "--quiet"])
        .arg(format!("{rev}^{{commit}}"));
    let out = output(cmd, "rev-parse").await?;
    match out.status.code() {
        Some(0) => Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string())),
        Some(1) => Ok(None),
        _ => Err(failure("rev-parse", &out)),
    }
}

/// Hashes reachable from `rev`, head first, at most `max` of them.
pub async fn rev_list(repo_path: &Path, rev: &str, max: usize) -> RepoResult<Vec<String>> {
    let mut cmd = git(repo_path);
    cmd.arg("rev-list")
        .arg(format!("--max-count={max}"))
        .arg(rev)
        .arg("--");
    let stdout = run(cmd, "rev-list").await?;
    Ok(stdout.lines().map(str::to_string).collect())
}

/// Parents of `hash` in recorded order (first parent first).
pub async fn parents(repo_path: &Path, hash: &str) -> RepoResult<Vec<String>> {
    let mut cmd = git(repo_path);
    cmd.args(["rev-list", "--parents", "--max-count=1"])
        .arg(hash)
        .arg("--");
    let stdout = run(cmd, "rev-list --parents").await?;
    Ok(stdout
        .split_whitespace()
        .skip(1)
        .map(str::to_string)
        .collect())
}

/// All best common ancestors of `a` and `b`.  Disjoint histories yield none.
pub async fn merge_bases(repo_path: &Path, a: &str, b: &str) -> RepoResult<Vec<String>> {
    let mut cmd = git(repo_path);
    cmd.args(["merge-base", "--all", a, b]);
    let out = output(cmd, "merge-base").await?;
    match out.status.code() {
        Some(0) => Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect()),
        Some(1) => Ok(Vec::new()),
        _ => Err(failure("merge-base", &out)),
    }
}

/// Raw `git log` output for exactly `hashes`, in the given order.
///
/// Fields are separated by `\x1f` and records by `\x1e`; see
/// [`super::log::parse_log`].
pub async fn log_records(repo_path: &Path, hashes: &[String]) -> RepoResult<String> {
    if hashes.is_empty() {
        return Ok(String::new());
    }
    let mut cmd = git(repo_path);
    cmd.args([
        "log",
        "--no-walk=unsorted",
        "--name-only",
        "--diff-merges=first-parent",
        "--format=%x1e%H%x1f%an <%ae>%x1f%aI%x1f%B%x1f",
    ])
    .args(hashes)
    .arg("--");
    run(cmd, "log").await
}

/// Commit hash -> tag name, for every tag (annotated tags are peeled).
pub async fn tags_by_commit(repo_path: &Path) -> RepoResult<HashMap<String, String>> {
    let mut cmd = git(repo_path);
    cmd.args([
        "for-each-ref",
        "--format=%(objectname)%09%(*objectname)%09%(refname:strip=2)",
        "refs/tags",
    ]);
    let stdout = run(cmd, "for-each-ref").await?;
    Ok(parse_tag_lines(&stdout))
}

fn parse_tag_lines(stdout: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for line in stdout.lines() {
        let mut parts = line.split('\t');
        let (Some(object), Some(peeled), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let commit = if peeled.is_empty() { object } else { peeled };
        tags.entry(commit.to_string()).or_insert_with(|| name.to_string());
    }
    tags
}

// ---------------------------------------------------------------------------
// Tree diff
// ---------------------------------------------------------------------------

/// Per-path additions/deletions between the trees of `old` and `new`.
pub async fn numstat(repo_path: &Path, old: &str, new: &str) -> RepoResult<Vec<FileStat>> {
    let mut cmd = git(repo_path);
    cmd.args(["diff", "--numstat", "--no-renames", old, new, "--"]);
    let stdout = run(cmd, "diff --numstat").await?;
    Ok(parse_numstat(&stdout))
}

fn parse_numstat(stdout: &str) -> Vec<FileStat> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let additions = parts.next()?;
            let deletions = parts.next()?;
            let path = parts.next()?;
            // Binary files report `-` for both counts.
            Some(FileStat {
                path: path.to_string(),
                additions: additions.parse().unwrap_or(0),
                deletions: deletions.parse().unwrap_or(0),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
