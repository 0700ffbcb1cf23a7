//! In-process stand-ins for Git retrieval.

use crate::error::ConfigRetrievalError;
use crate::git::{CancelFlag, GitAuth, GitFetcher, GitSource, ProgressSink};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Serves a local directory as if it were the checked out repository.
pub struct LocalDirFetcher {
    root: PathBuf,
    clones: AtomicUsize,
    delay: Option<Duration>,
    failure: Mutex<Option<String>>,
}

impl LocalDirFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clones: AtomicUsize::new(0),
            delay: None,
            failure: Mutex::new(None),
        }
    }

    /// Makes each fetch sleep first, to widen race windows in tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes subsequent fetches fail as an HTTPS clone error.
    pub fn fail_with(&self, message: impl Into<String>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(message.into());
        }
    }

    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }
}

impl GitFetcher for LocalDirFetcher {
    fn fetch(
        &self,
        _source: &GitSource,
        _auth: &GitAuth,
        dest: &Path,
        cancel: &CancelFlag,
        progress: ProgressSink<'_>,
    ) -> Result<(), ConfigRetrievalError> {
        self.clones.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if cancel.is_cancelled() {
            return Err(ConfigRetrievalError::Cancelled);
        }
        if let Some(message) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(ConfigRetrievalError::HttpsClone(message));
        }

        let files = copy_dir_all(&self.root, dest)
            .map_err(|e| ConfigRetrievalError::HttpsClone(e.to_string()))?;
        progress(format!("received {files}/{files} objects").as_str());
        Ok(())
    }
}

/// Copies `src` into `dst`, returning the number of files copied.
fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<usize> {
    fs::create_dir_all(dst)?;
    let mut files = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            files += copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
            files += 1;
        }
    }
    Ok(files)
}
