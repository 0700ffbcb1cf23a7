//! Shallow Git retrieval of workspace configuration.

use crate::error::ConfigRetrievalError;
use git2::{
    build::CheckoutBuilder, Cred, Direction, FetchOptions, RemoteCallbacks, Repository,
};
use std::cell::Cell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Repository holding a workspace's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSource {
    pub url: String,
    /// Folder inside the repository holding devcontainer.json.
    pub config_folder: String,
    /// Branch to fetch. The remote's default branch when `None`.
    pub branch: Option<String>,
}

impl GitSource {
    pub fn is_https(&self) -> bool {
        self.url.starts_with("https://") || self.url.starts_with("http://")
    }
}

#[derive(Clone, Default)]
pub enum GitAuth {
    #[default]
    None,
    /// SSH key pair stored for the workspace owner.
    SshKey { private_key: String },
}

impl std::fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitAuth::None => f.write_str("None"),
            GitAuth::SshKey { .. } => f.write_str("SshKey { .. }"),
        }
    }
}

/// Shared flag used to abort an in-flight clone.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives condensed, human readable progress lines while a fetch runs.
pub type ProgressSink<'a> = &'a dyn Fn(&str);

/// Fetches the tip of a branch into `dest`.
///
/// Implementations block; callers are expected to run them on a blocking
/// worker thread.
pub trait GitFetcher: Send + Sync {
    fn fetch(
        &self,
        source: &GitSource,
        auth: &GitAuth,
        dest: &Path,
        cancel: &CancelFlag,
        progress: ProgressSink<'_>,
    ) -> Result<(), ConfigRetrievalError>;
}

/// libgit2 backed fetcher doing depth 1, single branch clones.
#[derive(Debug, Clone)]
pub struct Git2Fetcher {
    timeout: Duration,
}

impl Git2Fetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for Git2Fetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

enum Abort {
    Cancelled,
    TimedOut,
}

/// Quarters of the object transfer reported to the sink.
const PROGRESS_STEPS: usize = 4;

/// The line to report for a transfer, if it crossed a new quarter since
/// `reported`. Returns the quarter reached along with the line.
fn condensed_progress(
    received: usize,
    total: usize,
    bytes: usize,
    reported: usize,
) -> Option<(usize, String)> {
    if total == 0 {
        return None;
    }
    let step = received.min(total) * PROGRESS_STEPS / total;
    if step <= reported {
        return None;
    }
    Some((
        step,
        format!(
            "received {received}/{total} objects ({} KiB)",
            bytes / 1024
        ),
    ))
}

struct Progress<'a> {
    cancel: CancelFlag,
    deadline: Instant,
    sink: ProgressSink<'a>,
    reported: Cell<usize>,
}

impl Progress<'_> {
    fn transfer(&self, stats: &git2::Progress<'_>) -> bool {
        if let Some((step, line)) = condensed_progress(
            stats.received_objects(),
            stats.total_objects(),
            stats.received_bytes(),
            self.reported.get(),
        ) {
            self.reported.set(step);
            (self.sink)(line.as_str());
        }
        self.check().is_none()
    }

    fn check(&self) -> Option<Abort> {
        if self.cancel.is_cancelled() {
            Some(Abort::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(Abort::TimedOut)
        } else {
            None
        }
    }
}

fn callbacks<'a>(auth: &'a GitAuth, progress: &'a Progress<'a>) -> RemoteCallbacks<'a> {
    let mut cb = RemoteCallbacks::new();
    if let GitAuth::SshKey { private_key } = auth {
        cb.credentials(move |_url, username, _allowed| {
            Cred::ssh_key_from_memory(username.unwrap_or("git"), None, private_key, None)
        });
    }
    cb.transfer_progress(move |stats| progress.transfer(&stats));
    cb.sideband_progress(move |_data| progress.check().is_none());
    cb
}

impl Git2Fetcher {
    fn fetch_inner(
        &self,
        source: &GitSource,
        auth: &GitAuth,
        dest: &Path,
        progress: &Progress<'_>,
    ) -> Result<(), git2::Error> {
        let repo = Repository::init(dest)?;
        let mut remote = repo.remote("origin", &source.url)?;

        let branch = match &source.branch {
            Some(branch) => branch.clone(),
            None => {
                let connection =
                    remote.connect_auth(Direction::Fetch, Some(callbacks(auth, progress)), None)?;
                let head = connection.default_branch()?;
                let head = head.as_str().unwrap_or("refs/heads/main");
                head.strip_prefix("refs/heads/").unwrap_or(head).to_string()
            }
        };
        debug!(url = %source.url, %branch, "fetching configuration branch");

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks(auth, progress)).depth(1);
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        remote.fetch(&[refspec.as_str()], Some(&mut options), None)?;

        let commit = repo
            .find_reference(&format!("refs/remotes/origin/{branch}"))?
            .peel_to_commit()?;
        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
        repo.set_head_detached(commit.id())?;

        info!(url = %source.url, %branch, commit = %commit.id(), "fetched configuration");
        Ok(())
    }
}

impl GitFetcher for Git2Fetcher {
    fn fetch(
        &self,
        source: &GitSource,
        auth: &GitAuth,
        dest: &Path,
        cancel: &CancelFlag,
        progress: ProgressSink<'_>,
    ) -> Result<(), ConfigRetrievalError> {
        let progress = Progress {
            cancel: cancel.clone(),
            deadline: Instant::now() + self.timeout,
            sink: progress,
            reported: Cell::new(0),
        };

        self.fetch_inner(source, auth, dest, &progress)
            .map_err(|e| match progress.check() {
                Some(Abort::Cancelled) => ConfigRetrievalError::Cancelled,
                Some(Abort::TimedOut) => ConfigRetrievalError::TimedOut(self.timeout.as_secs()),
                None if source.is_https() => ConfigRetrievalError::HttpsClone(e.message().to_string()),
                None => ConfigRetrievalError::SshAuthentication(e.message().to_string()),
            })
    }
}
