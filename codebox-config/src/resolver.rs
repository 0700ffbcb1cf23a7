//! Resolution of a workspace's Git source into a cached configuration archive.

use crate::archive;
use crate::devcontainer::DevcontainerConfig;
use crate::error::{ConfigRetrievalError, Result};
use crate::git::{CancelFlag, GitAuth, GitFetcher, GitSource, ProgressSink};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

const ARCHIVE_DIR: &str = "workspace-configs";

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Root of the server's data directory; archives live below it.
    pub data_dir: PathBuf,
}

impl ResolverSettings {
    pub fn archive_path(&self, workspace_id: i64) -> PathBuf {
        self.data_dir
            .join(ARCHIVE_DIR)
            .join(format!("workspace_{workspace_id}.tar.gz"))
    }
}

#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub workspace_id: i64,
    pub source: GitSource,
    pub auth: GitAuth,
    /// Archive path currently recorded on the workspace, if any.
    pub cached_archive: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub archive_path: PathBuf,
    /// False when an existing archive was reused.
    pub freshly_fetched: bool,
}

impl ResolvedConfig {
    /// Extracts the archive into `working_dir` and loads the descriptor from it.
    pub fn materialize(&self, working_dir: &Path) -> Result<DevcontainerConfig> {
        archive::unpack(&self.archive_path, working_dir)?;
        Ok(DevcontainerConfig::load(working_dir)?)
    }
}

pub struct ConfigResolver {
    settings: ResolverSettings,
    fetcher: Arc<dyn GitFetcher>,
}

impl ConfigResolver {
    pub fn new(settings: ResolverSettings, fetcher: Arc<dyn GitFetcher>) -> Self {
        Self { settings, fetcher }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Returns the workspace's configuration archive, fetching and packing it
    /// first if the workspace has none yet.
    ///
    /// Blocking: clones and writes to disk.
    pub fn resolve(&self, request: &ResolveRequest, cancel: &CancelFlag) -> Result<ResolvedConfig> {
        self.resolve_with_progress(request, cancel, &|_| {})
    }

    /// [`resolve`](Self::resolve), passing clone progress lines to `progress`.
    #[instrument(skip(self, request, cancel, progress), fields(workspace_id = request.workspace_id))]
    pub fn resolve_with_progress(
        &self,
        request: &ResolveRequest,
        cancel: &CancelFlag,
        progress: ProgressSink<'_>,
    ) -> Result<ResolvedConfig> {
        if let Some(cached) = &request.cached_archive {
            if cached.is_file() {
                debug!(archive = %cached.display(), "reusing cached configuration");
                return Ok(ResolvedConfig {
                    archive_path: cached.clone(),
                    freshly_fetched: false,
                });
            }
        }

        let relative = config_folder(&request.source.config_folder)?;

        // Removed on drop, whether or not the fetch succeeds.
        let clone_dir = tempfile::Builder::new().prefix("codebox-clone-").tempdir()?;

        self.fetcher
            .fetch(&request.source, &request.auth, clone_dir.path(), cancel, progress)?;

        let folder = clone_dir.path().join(&relative);
        if !folder.exists() {
            return Err(ConfigRetrievalError::MissingConfigFolder {
                path: relative,
                reason: "does not exist in the repository".to_string(),
            }
            .into());
        }
        if !folder.is_dir() {
            return Err(ConfigRetrievalError::MissingConfigFolder {
                path: relative,
                reason: "is not a directory".to_string(),
            }
            .into());
        }

        let archive_path = self.settings.archive_path(request.workspace_id);
        archive::pack_dir(&folder, &archive_path)?;
        info!(archive = %archive_path.display(), "stored configuration archive");

        Ok(ResolvedConfig {
            archive_path,
            freshly_fetched: true,
        })
    }

    /// Deletes the workspace's archive so the next resolve fetches again.
    pub fn discard(&self, archive_path: &Path) -> Result<()> {
        match fs::remove_file(archive_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Normalizes the in-repository folder, refusing paths that leave the clone.
fn config_folder(raw: &str) -> std::result::Result<PathBuf, ConfigRetrievalError> {
    let mut path = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ConfigRetrievalError::MissingConfigFolder {
                    path: PathBuf::from(raw),
                    reason: "points outside the repository".to_string(),
                })
            }
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, ConfigParseError};
    use crate::test_helpers::LocalDirFetcher;
    use tempfile::TempDir;

    struct Fixture {
        _repo: TempDir,
        data: TempDir,
        fetcher: Arc<LocalDirFetcher>,
        resolver: ConfigResolver,
    }

    fn fixture(descriptor: &str) -> Fixture {
        let repo = TempDir::new().unwrap();
        fs::create_dir(repo.path().join(".devcontainer")).unwrap();
        fs::write(repo.path().join(".devcontainer/devcontainer.json"), descriptor).unwrap();
        fs::write(repo.path().join("README.md"), "not a folder").unwrap();

        let data = TempDir::new().unwrap();
        let fetcher = Arc::new(LocalDirFetcher::new(repo.path()));
        let resolver = ConfigResolver::new(
            ResolverSettings {
                data_dir: data.path().to_path_buf(),
            },
            fetcher.clone(),
        );
        Fixture {
            _repo: repo,
            data,
            fetcher,
            resolver,
        }
    }

    fn request(folder: &str, cached: Option<PathBuf>) -> ResolveRequest {
        ResolveRequest {
            workspace_id: 42,
            source: GitSource {
                url: "https://git.example.com/team/project.git".to_string(),
                config_folder: folder.to_string(),
                branch: None,
            },
            auth: GitAuth::None,
            cached_archive: cached,
        }
    }

    #[test]
    fn test_resolve_then_reuse() {
        let f = fixture(r#"{ "image": "ubuntu" }"#);
        let first = f
            .resolver
            .resolve(&request(".devcontainer", None), &CancelFlag::new())
            .unwrap();
        assert!(first.freshly_fetched);
        assert_eq!(
            first.archive_path,
            f.data.path().join("workspace-configs/workspace_42.tar.gz")
        );

        let second = f
            .resolver
            .resolve(
                &request(".devcontainer", Some(first.archive_path.clone())),
                &CancelFlag::new(),
            )
            .unwrap();
        assert!(!second.freshly_fetched);
        assert_eq!(second.archive_path, first.archive_path);
        assert_eq!(f.fetcher.clone_count(), 1);
    }

    #[test]
    fn test_progress_reported_only_when_fetching() {
        let f = fixture(r#"{ "image": "ubuntu" }"#);
        let lines = std::cell::RefCell::new(Vec::new());
        let record = |line: &str| lines.borrow_mut().push(line.to_string());

        let first = f
            .resolver
            .resolve_with_progress(&request(".devcontainer", None), &CancelFlag::new(), &record)
            .unwrap();
        // devcontainer.json and README.md
        assert_eq!(*lines.borrow(), vec!["received 2/2 objects".to_string()]);

        f.resolver
            .resolve_with_progress(
                &request(".devcontainer", Some(first.archive_path)),
                &CancelFlag::new(),
                &record,
            )
            .unwrap();
        assert_eq!(lines.borrow().len(), 1);
    }

    #[test]
    fn test_stale_cached_path_is_refetched() {
        let f = fixture(r#"{ "image": "ubuntu" }"#);
        let resolved = f
            .resolver
            .resolve(
                &request(".devcontainer", Some(PathBuf::from("/gone/workspace_42.tar.gz"))),
                &CancelFlag::new(),
            )
            .unwrap();
        assert!(resolved.freshly_fetched);
        assert_eq!(f.fetcher.clone_count(), 1);
    }

    #[test]
    fn test_missing_and_non_directory_folder() {
        let f = fixture("{}");
        for folder in ["missing", "README.md", "../outside"] {
            let err = f
                .resolver
                .resolve(&request(folder, None), &CancelFlag::new())
                .unwrap_err();
            assert!(
                matches!(
                    err,
                    ConfigError::Retrieval(ConfigRetrievalError::MissingConfigFolder { .. })
                ),
                "{folder}: {err}"
            );
        }
    }

    #[test]
    fn test_materialize_parses_descriptor() {
        let f = fixture(r#"{ "image": "ubuntu", /* tolerant */ "workspaceFolder": "/src", }"#);
        let resolved = f
            .resolver
            .resolve(&request("/.devcontainer/", None), &CancelFlag::new())
            .unwrap();

        let work = TempDir::new().unwrap();
        let config = resolved.materialize(work.path()).unwrap();
        assert_eq!(config.workspace_folder().unwrap(), "/src");
    }

    #[test]
    fn test_materialize_reports_bad_descriptor() {
        let f = fixture(r#"{ "image": "#);
        let resolved = f
            .resolver
            .resolve(&request(".devcontainer", None), &CancelFlag::new())
            .unwrap();

        let work = TempDir::new().unwrap();
        let err = resolved.materialize(work.path()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Parse(ConfigParseError::InvalidSyntax { .. })
        ));
    }

    #[test]
    fn test_cancelled_fetch() {
        let f = fixture("{}");
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = f
            .resolver
            .resolve(&request(".devcontainer", None), &cancel)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Retrieval(ConfigRetrievalError::Cancelled)
        ));
    }

    #[test]
    fn test_discard_is_idempotent() {
        let f = fixture("{}");
        let resolved = f
            .resolver
            .resolve(&request(".devcontainer", None), &CancelFlag::new())
            .unwrap();
        f.resolver.discard(&resolved.archive_path).unwrap();
        assert!(!resolved.archive_path.exists());
        f.resolver.discard(&resolved.archive_path).unwrap();
    }
}
