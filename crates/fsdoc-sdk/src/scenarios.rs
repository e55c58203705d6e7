//! End-to-end behaviour of a store under the write protocol.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;

use fsdoc_session::{handle, Entity, SessionError};
use fsdoc_store::{DELETE_SUFFIX, STAGING_SUFFIX};
use fsdoc_types::{EntityId, Version};
use walkdir::WalkDir;

use crate::error::SdkError;
use crate::store::Store;
use crate::testing::{open, Album, Counter, Note, Person, Photo, Tag};

/// Every regular file below `root` except the search-index directory.
fn all_files(store: &Store) -> Vec<PathBuf> {
    let index_dir = store.repository().index_dir().to_path_buf();
    let mut files: Vec<PathBuf> = WalkDir::new(store.repository().root())
        .into_iter()
        .filter_entry(|e| e.path() != index_dir)
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

fn rel(store: &Store, path: &Path) -> String {
    store.repository().relative_posix(path).unwrap()
}

#[test]
fn insert_id_is_derived_once_and_survives_rename_and_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let note = handle(Note::new("test", "first"));
    store.run(|s| s.persist(&note)).unwrap();
    let id = note.borrow().meta().id().unwrap();
    assert_eq!(id, EntityId::derive("Note/test.json"));

    note.borrow_mut().title = "huhu".into();
    store.run(|s| s.persist(&note)).unwrap();
    assert_eq!(note.borrow().meta().id(), Some(id));

    drop(store);
    let store = open(dir.path());
    let element = store.index().get(&id).unwrap();
    assert_eq!(rel(&store, &element.path), "Note/huhu.json");
    assert_eq!(element.natural_id.as_deref(), Some("huhu"));
    assert!(store.index().get_by_natural_id(Note::TYPE, "test").is_none());
}

#[test]
fn natural_id_and_id_lookups_share_one_instance() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    store
        .run(|s| s.persist(&handle(Person::new("ada"))))
        .unwrap();

    let session = store.session().unwrap();
    let a = session.find_by_natural_id::<Person>("ada").unwrap().unwrap();
    let b = session.find_by_natural_id::<Person>("ada").unwrap().unwrap();
    let id = a.borrow().meta().id().unwrap();
    let c = session.find_by_id::<Person>(&id).unwrap().unwrap();
    assert!(Rc::ptr_eq(&a, &b));
    assert!(Rc::ptr_eq(&a, &c));

    let other = store.session().unwrap();
    let d = other.find_by_id::<Person>(&id).unwrap().unwrap();
    assert!(!Rc::ptr_eq(&a, &d));
}

#[test]
fn entity_round_trips_through_disk_with_relations() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let note = handle(Note::new("plan", "line one\nline two"));
    let author = handle(Person::new("grace"));
    note.borrow_mut().author.set(Rc::clone(&author));
    note.borrow_mut().tags.push(handle(Tag::new("work")));
    note.borrow_mut().tags.push(handle(Tag::new("urgent")));
    store.run(|s| s.persist(&note)).unwrap();

    let store = open(dir.path());
    let session = store.session().unwrap();
    let loaded = session.find_by_natural_id::<Note>("plan").unwrap().unwrap();
    let loaded = loaded.borrow();
    assert_eq!(loaded.body, "line one\nline two");
    assert_eq!(loaded.meta().version(), Version::new(1));
    assert_eq!(loaded.author.id(), author.borrow().meta().id());
    let person = loaded.author.resolve().unwrap().unwrap();
    assert_eq!(person.borrow().name, "grace");
    let labels: Vec<String> = loaded
        .tags
        .resolve()
        .unwrap()
        .iter()
        .map(|t| t.borrow().label.clone())
        .collect();
    assert_eq!(labels, ["work", "urgent"]);
}

#[test]
fn persisting_twice_writes_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let session = store.session().unwrap();
    let note = handle(Note::new("once", ""));
    for _ in 0..3 {
        session.persist(&note).unwrap();
    }
    assert_eq!(session.pending_actions().unwrap().len(), 1);
    session.commit().unwrap();
    assert_eq!(all_files(&store).len(), 1);
    assert_eq!(note.borrow().meta().version(), Version::new(1));
}

#[test]
fn second_writer_fails_with_stale_state_and_succeeds_on_retry() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    store.run(|s| s.persist(&handle(Note::new("shared", "v1")))).unwrap();

    let first = store.session().unwrap();
    let second = store.session().unwrap();
    let mine = first.find_by_natural_id::<Note>("shared").unwrap().unwrap();
    let theirs = second.find_by_natural_id::<Note>("shared").unwrap().unwrap();

    mine.borrow_mut().body = "from first".into();
    first.commit().unwrap();

    theirs.borrow_mut().body = "from second".into();
    let err = second.commit().unwrap_err();
    assert!(matches!(err, SessionError::StaleObjectState { .. }));
    assert!(err.is_retryable());
    second.rollback().unwrap();

    store
        .run(|s| {
            if let Some(note) = s.find_by_natural_id::<Note>("shared")? {
                note.borrow_mut().body = "from second".into();
            }
            Ok(())
        })
        .unwrap();

    let session = store.session().unwrap();
    let note = session.find_by_natural_id::<Note>("shared").unwrap().unwrap();
    assert_eq!(note.borrow().body, "from second");
    assert_eq!(note.borrow().meta().version(), Version::new(3));
    assert_eq!(note.borrow().edits, 2);
}

#[test]
fn crash_between_prepare_and_commit_leaves_only_invisible_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    store.run(|s| s.persist(&handle(Note::new("kept", "")))).unwrap();
    store.run(|s| s.persist(&handle(Note::new("doomed", "")))).unwrap();

    let session = store.session().unwrap();
    session.persist(&handle(Note::new("crash", ""))).unwrap();
    let doomed = session.find_by_natural_id::<Note>("doomed").unwrap().unwrap();
    session.remove(&doomed).unwrap();
    session.prepare().unwrap();
    // No rollback runs: the process "dies" here.
    std::mem::forget(session);

    let names: Vec<String> = all_files(&store)
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names.contains(&format!(".crash.json{STAGING_SUFFIX}")));
    assert!(names.contains(&format!("doomed.json{DELETE_SUFFIX}")));

    let store = open(dir.path());
    let report = store.rebuild_index().unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.failed, 0);
    assert!(store.index().get_by_natural_id(Note::TYPE, "kept").is_some());
    assert!(store.index().get_by_natural_id(Note::TYPE, "crash").is_none());

    // The orphaned staging file blocks the same target until it is cleared.
    let err = store
        .run(|s| s.persist(&handle(Note::new("crash", ""))))
        .unwrap_err();
    assert!(matches!(err, SdkError::Session(SessionError::StaleObjectFile(_))));
    std::fs::remove_file(
        store
            .repository()
            .root()
            .join(format!("Note/.crash.json{STAGING_SUFFIX}")),
    )
    .unwrap();
    store.run(|s| s.persist(&handle(Note::new("crash", "")))).unwrap();
}

#[test]
fn natural_id_with_delete_suffix_survives_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let album = handle(Album::new("archive_del"));
    album.borrow_mut().photos.push(handle(Photo::new("scan")));
    store.run(|s| s.persist(&album)).unwrap();
    let id = album.borrow().meta().id().unwrap();

    drop(store);
    let store = open(dir.path());
    assert_eq!(store.index().len(), 2);
    let element = store.index().get(&id).unwrap();
    assert_eq!(rel(&store, &element.path), "Album/archive_del_/archive_del_.json");
    assert_eq!(element.natural_id.as_deref(), Some("archive_del"));

    let session = store.session().unwrap();
    let found = session.find_by_natural_id::<Album>("archive_del").unwrap().unwrap();
    assert_eq!(found.borrow().meta().id(), Some(id));
    session.remove(&found).unwrap();
    session.commit().unwrap();
    assert!(all_files(&store).is_empty());
    assert!(store.index().is_empty());
}

#[test]
fn rename_test_to_huhu_moves_the_single_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    store.run(|s| s.persist(&handle(Note::new("test", "x")))).unwrap();

    let session = store.session().unwrap();
    let note = session.find_by_natural_id::<Note>("test").unwrap().unwrap();
    note.borrow_mut().title = "huhu".into();
    session.commit().unwrap();

    let files: Vec<String> = all_files(&store).iter().map(|p| rel(&store, p)).collect();
    assert_eq!(files, ["Note/huhu.json"]);
    assert_eq!(store.index().len(), 1);
    let again = session.find_by_natural_id::<Note>("huhu").unwrap().unwrap();
    assert!(Rc::ptr_eq(&note, &again));
    assert!(session.find_by_natural_id::<Note>("test").unwrap().is_none());
}

#[test]
fn rollback_after_prepare_leaves_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let session = store.session().unwrap();
    let album = handle(Album::new("trip"));
    album.borrow_mut().photos.push(handle(Photo::new("sunset")));
    session.persist(&album).unwrap();
    for i in 0..5 {
        session.persist(&handle(Note::new(&format!("n{i}"), ""))).unwrap();
    }
    session.prepare().unwrap();
    assert!(!all_files(&store).is_empty());

    session.rollback().unwrap();
    assert!(all_files(&store).is_empty());
    assert!(store.index().is_empty());
    assert_eq!(album.borrow().meta().id(), None);
    assert_eq!(album.borrow().meta().version(), Version::INITIAL);
}

#[test]
fn deleting_an_owner_deletes_its_children() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let album = handle(Album::new("summer"));
    for caption in ["beach", "pier", "dunes"] {
        album.borrow_mut().photos.push(handle(Photo::new(caption)));
    }
    let note = handle(Note::new("list", ""));
    note.borrow_mut().tags.push(handle(Tag::new("a")));
    note.borrow_mut().tags.push(handle(Tag::new("b")));
    store
        .run(|s| {
            s.persist(&album)?;
            s.persist(&note)
        })
        .unwrap();
    assert_eq!(store.index().len(), 7);
    assert!(store.repository().root().join("Album/summer/Photo/pier.json").exists());

    store
        .run(|s| {
            if let Some(album) = s.find_by_natural_id::<Album>("summer")? {
                s.remove(&album)?;
            }
            if let Some(note) = s.find_by_natural_id::<Note>("list")? {
                s.remove(&note)?;
            }
            Ok(())
        })
        .unwrap();

    assert!(!store.repository().root().join("Album/summer").exists());
    assert!(all_files(&store).is_empty());
    assert!(store.index().is_empty());
}

#[test]
fn concurrent_sessions_keep_counts_exact() {
    const THREADS: usize = 8;
    const INSERTS: usize = 20;
    const BUMPS: u64 = 10;

    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    store.run(|s| s.persist(&handle(Counter::new("hits")))).unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..INSERTS {
                    store
                        .run(|s| s.persist(&handle(Note::new(&format!("t{t}-{i}"), ""))))
                        .unwrap();
                }
                let mut retries = 0;
                for _ in 0..BUMPS {
                    loop {
                        let outcome = store.run(|s| {
                            let counter = s.find_by_natural_id::<Counter>("hits")?.unwrap();
                            counter.borrow_mut().value += 1;
                            Ok(())
                        });
                        match outcome {
                            Ok(()) => break,
                            Err(SdkError::Session(e)) if e.is_retryable() => retries += 1,
                            Err(e) => panic!("unexpected failure: {e}"),
                        }
                        assert!(retries < 100_000, "no progress");
                    }
                }
                retries
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let expected = THREADS * INSERTS + 1;
    assert_eq!(store.index().len(), expected);
    assert_eq!(all_files(&store).len(), expected);

    let session = store.session().unwrap();
    let counter = session.find_by_natural_id::<Counter>("hits").unwrap().unwrap();
    assert_eq!(counter.borrow().value, THREADS as u64 * BUMPS);
    assert_eq!(
        counter.borrow().meta().version(),
        Version::new(THREADS as u64 * BUMPS + 1)
    );

    let report = store.rebuild_index().unwrap();
    assert_eq!(report.indexed, expected);
    assert_eq!(store.index().len(), expected);
}
