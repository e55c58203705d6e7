use std::fs;
use std::path::Path;
use std::sync::Arc;

use fsdoc_index::{GlobalIndex, RebuildReport};
use fsdoc_session::{Registry, Session, SessionOptions, SessionResult};
use fsdoc_store::{NoopSearchIndex, Repository, SearchDocument, SearchIndex, StoreResult};
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::{SdkError, SdkResult};

/// An open document store: repository, global index and entity registry.
///
/// Cloning is cheap and clones share everything. The store is `Send + Sync`;
/// sessions are not, so every thread opens its own with [`Store::session`].
#[derive(Clone)]
pub struct Store {
    config: Arc<StoreConfig>,
    repo: Arc<Repository>,
    index: Arc<GlobalIndex>,
    registry: Arc<Registry>,
}

impl Store {
    /// Open the store described by `config` without a search index.
    pub fn open(config: StoreConfig, registry: Registry) -> SdkResult<Self> {
        Self::open_with_search(config, registry, |_| {
            Ok(Arc::new(NoopSearchIndex) as Arc<dyn SearchIndex>)
        })
    }

    /// Open the store, letting `search_factory` open the search index in the
    /// reserved index directory.
    pub fn open_with_search<F>(
        config: StoreConfig,
        registry: Registry,
        search_factory: F,
    ) -> SdkResult<Self>
    where
        F: FnOnce(&Path) -> StoreResult<Arc<dyn SearchIndex>>,
    {
        config.validate()?;
        let repo = Repository::open_with(&config.root, &config.index_dir, search_factory)?;
        let store = Self {
            config: Arc::new(config),
            repo: Arc::new(repo),
            index: Arc::new(GlobalIndex::new()),
            registry: Arc::new(registry),
        };
        if store.config.rebuild_on_open {
            store.rebuild_index()?;
        }
        Ok(store)
    }

    /// Start a unit of work on the calling thread.
    pub fn session(&self) -> SdkResult<Session> {
        self.ensure_open()?;
        Ok(Session::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.index),
            Arc::clone(&self.registry),
            SessionOptions {
                sync_writes: self.config.sync_writes,
            },
        ))
    }

    /// Run `work` in a fresh session and commit it. The session is rolled
    /// back if `work` or the commit fails.
    pub fn run<R>(&self, work: impl FnOnce(&Session) -> SessionResult<R>) -> SdkResult<R> {
        let session = self.session()?;
        let outcome = work(&session).and_then(|value| session.commit().map(|()| value));
        match outcome {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Err(rollback) = session.rollback() {
                    warn!(error = %rollback, "rollback after failed unit of work");
                }
                Err(e.into())
            }
        }
    }

    /// Rebuild the global index from the files on disk, then feed the
    /// search index from the rebuilt catalog.
    pub fn rebuild_index(&self) -> SdkResult<RebuildReport> {
        self.ensure_open()?;
        let report =
            self.index
                .rebuild(&self.repo, &self.registry.claims(), self.config.rebuild_workers)?;

        let docs: Vec<SearchDocument> = self
            .index
            .snapshot()
            .into_iter()
            .filter_map(|element| match fs::read(&element.path) {
                Ok(content) => Some(SearchDocument {
                    id: element.id,
                    entity_type: element.entity_type,
                    natural_id: element.natural_id,
                    path: element.path,
                    content,
                }),
                Err(e) => {
                    warn!(path = %element.path.display(), error = %e, "file vanished before search reindex");
                    None
                }
            })
            .collect();
        let documents = docs.len();
        self.repo.search().rebuild(docs)?;
        info!(
            indexed = report.indexed,
            skipped = report.skipped,
            failed = report.failed,
            documents,
            "store index rebuilt"
        );
        Ok(report)
    }

    /// Close the repository and its search index. Sessions opened earlier
    /// keep working against the global index; new ones are refused.
    pub fn close(&self) -> SdkResult<()> {
        self.repo.close()?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.repo.is_closed()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn index(&self) -> &Arc<GlobalIndex> {
        &self.index
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn ensure_open(&self) -> SdkResult<()> {
        if self.repo.is_closed() {
            return Err(SdkError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.repo.root())
            .field("entities", &self.index.len())
            .field("types", &self.registry.len())
            .field("closed", &self.repo.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{open, registry, Note};
    use fsdoc_session::{handle, Entity, SessionError};
    use fsdoc_store::InMemorySearchIndex;

    #[test]
    fn open_rebuilds_from_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store
                .run(|s| s.persist(&handle(Note::new("a", "alpha"))))
                .unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.index().len(), 1);
        assert!(store
            .index()
            .get_by_natural_id(Note::TYPE, "a")
            .is_some());
    }

    #[test]
    fn run_rolls_back_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let err = store
            .run(|s| {
                s.persist(&handle(Note::new("a", "")))?;
                Err::<(), _>(SessionError::Persist("refused".into()))
            })
            .unwrap_err();
        assert!(matches!(err, SdkError::Session(SessionError::Persist(_))));
        assert!(store.repository().files().unwrap().is_empty());
        assert!(store.index().is_empty());
    }

    #[test]
    fn search_index_follows_commits_and_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let search = Arc::new(InMemorySearchIndex::new());
        let factory_search = Arc::clone(&search);
        let store = Store::open_with_search(
            StoreConfig::new(dir.path()).with_sync_writes(false),
            registry(),
            move |_| Ok(factory_search as Arc<dyn SearchIndex>),
        )
        .unwrap();

        let note = handle(Note::new("groceries", "buy oat milk"));
        store.run(|s| s.persist(&note)).unwrap();
        let id = note.borrow().meta().id().unwrap();
        assert_eq!(search.search("oat"), vec![id]);

        store.run(|s| {
            let found = s.find_by_id::<Note>(&id)?;
            if let Some(n) = found {
                s.remove(&n)?;
            }
            Ok(())
        })
        .unwrap();
        assert!(search.is_empty());

        store.run(|s| s.persist(&handle(Note::new("chores", "sweep")))).unwrap();
        search.rebuild(Vec::new()).unwrap();
        store.rebuild_index().unwrap();
        assert_eq!(search.len(), 1);
    }

    #[test]
    fn closed_store_refuses_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.close().unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.session(), Err(SdkError::Closed)));
        assert!(matches!(store.rebuild_index(), Err(SdkError::Closed)));
    }

    #[test]
    fn invalid_config_is_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("never");
        let err = Store::open(StoreConfig::new(&root).with_rebuild_workers(0), registry()).unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
        assert!(!root.exists());
    }
}
