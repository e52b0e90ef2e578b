//! End-to-end document lifecycle tests: create, update, delete, sweep
//! idempotence, and cancellation.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use common::{TestRepo, TestStack};
use pocketrag::pipeline::{DocPipe, DocState};

#[test]
fn test_create_update_delete_cycle() {
    let fixture = TestRepo::new();

    // Create.
    fixture.write("a.md", "# Title\nHello world\n");
    fixture.sweep();

    let store = fixture.store();
    assert_eq!(store.document_count().unwrap(), 1);
    let chunks_after_create = store.chunk_count().unwrap();
    assert!(chunks_after_create >= 1);

    let hits = fixture.repo.text_index().search("Hello", 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].similarity > 0.0);
    assert!(hits[0].content.contains("<mark>Hello</mark>"));

    // Update: stale chunks replaced, new content searchable.
    std::thread::sleep(std::time::Duration::from_millis(1100)); // mtime tick
    fixture.write("a.md", "# Title\nGoodbye\n");
    fixture.sweep();

    assert!(fixture.repo.text_index().search("Hello", 10).unwrap().is_empty());
    let hits = fixture.repo.text_index().search("Goodbye", 10).unwrap();
    assert_eq!(hits.len(), 1);
    let results = fixture.repo.search("Goodbye", 5).unwrap();
    assert!(!results[0].is_empty());

    // Delete: everything unwound.
    fixture.remove("a.md");
    fixture.sweep();
    assert_eq!(store.document_count().unwrap(), 0);
    assert_eq!(store.chunk_count().unwrap(), 0);
    assert!(fixture.repo.text_index().search("Goodbye", 10).unwrap().is_empty());
    assert!(fixture.repo.search("Goodbye", 5).unwrap()[0].is_empty());
}

#[test]
fn test_sweep_is_idempotent() {
    let fixture = TestRepo::new();
    fixture.write("notes.md", "# Notes\n\nSome stable content that will not change.\n");
    fixture.sweep();

    let store = fixture.store();
    let before: Vec<i64> = {
        let row = store.document_by_name("notes.md").unwrap().unwrap();
        store.chunk_ids_for_document(row.id).unwrap()
    };

    // Further sweeps must not touch the index.
    for _ in 0..3 {
        fixture.sweep();
    }
    let after: Vec<i64> = {
        let row = store.document_by_name("notes.md").unwrap().unwrap();
        store.chunk_ids_for_document(row.id).unwrap()
    };
    assert_eq!(before, after, "quiescent sweeps must not churn chunk ids");
}

#[test]
fn test_unchanged_document_check_is_noop() {
    let stack = TestStack::new(256);
    let path = stack.file("doc.txt", "stable plain text content for the pipeline\n");

    let mut pipe = DocPipe::new(path.clone(), &stack.store, &stack.bindings).unwrap();
    assert_eq!(pipe.check().unwrap(), DocState::Created);
    let stop = AtomicBool::new(false);
    pipe.process(None, &stop).unwrap();

    let mut pipe = DocPipe::new(path, &stack.store, &stack.bindings).unwrap();
    assert_eq!(pipe.check().unwrap(), DocState::Unchanged);
    let chunks_before = stack.store.chunk_count().unwrap();
    pipe.process(None, &stop).unwrap();
    assert_eq!(stack.store.chunk_count().unwrap(), chunks_before);
}

#[test]
fn test_every_chunk_has_text_and_vector_rows() {
    let stack = TestStack::new(64);
    let body: String = (0..40)
        .map(|i| format!("Paragraph number {} with a bit of padding text here.\n\n", i))
        .collect();
    let path = stack.file("doc.md", &format!("# Big\n\n{}", body));

    let mut pipe = DocPipe::new(path, &stack.store, &stack.bindings).unwrap();
    pipe.check().unwrap();
    let stop = AtomicBool::new(false);
    pipe.process(None, &stop).unwrap();

    let doc = stack.store.document_by_name("doc.md").unwrap().unwrap();
    let chunk_ids = stack.store.chunk_ids_for_document(doc.id).unwrap();
    assert!(chunk_ids.len() > 1);

    let table = &stack.bindings[0].table;
    for chunk_id in chunk_ids {
        // Lexical row present...
        stack.text_index.get_content(chunk_id).unwrap();
        // ...and exactly one live vector under the same id.
        let v = table.reconstruct(chunk_id).unwrap();
        assert_eq!(v.len(), 32);
    }
    assert!(table.invalid_ids().unwrap().is_empty());
}

#[test]
fn test_cancellation_stops_at_commit_boundary() {
    let stack = TestStack::new(48);
    // Enough short paragraphs to produce several hundred chunks.
    let body: String = (0..600)
        .map(|i| format!("Unique sentence number {} padded for length.\n\n", i))
        .collect();
    let path = stack.file("huge.txt", &body);

    let mut pipe = DocPipe::new(path, &stack.store, &stack.bindings).unwrap();
    assert_eq!(pipe.check().unwrap(), DocState::Created);

    // Trip the stop flag from the progress callback once ingestion is
    // well underway.
    let stop = AtomicBool::new(false);
    let calls = AtomicUsize::new(0);
    let cb = |_p: f64| {
        if calls.fetch_add(1, Ordering::Relaxed) == 250 {
            stop.store(true, Ordering::Relaxed);
        }
    };
    pipe.process(Some(&cb), &stop).unwrap();

    let total = stack.store.chunk_count().unwrap();
    assert!(total > 0, "some chunks must have committed before the stop");

    // Every committed chunk is complete: text row + live vector.
    let doc = stack.store.document_by_name("huge.txt").unwrap().unwrap();
    let table = &stack.bindings[0].table;
    for chunk_id in stack.store.chunk_ids_for_document(doc.id).unwrap() {
        stack.text_index.get_content(chunk_id).unwrap();
        table.reconstruct(chunk_id).unwrap();
    }

    // The document row was never finalized, so the next check resumes.
    let mut pipe = DocPipe::new(
        stack.dir.path().join("huge.txt"),
        &stack.store,
        &stack.bindings,
    )
    .unwrap();
    assert_eq!(pipe.check().unwrap(), DocState::Modified);

    let stop = AtomicBool::new(false);
    pipe.process(None, &stop).unwrap();
    let finished = stack.store.chunk_count().unwrap();
    assert!(finished >= total);

    let mut pipe = DocPipe::new(
        stack.dir.path().join("huge.txt"),
        &stack.store,
        &stack.bindings,
    )
    .unwrap();
    assert_eq!(pipe.check().unwrap(), DocState::Unchanged);
}

#[test]
fn test_reindex_preserves_chunk_ids_for_moved_content() {
    let stack = TestStack::new(64);
    let path = stack.file(
        "moves.md",
        "# Doc\n\nAlpha paragraph stays the same forever and ever.\n\nBeta paragraph also stays identical over time.\n",
    );

    let mut pipe = DocPipe::new(path.clone(), &stack.store, &stack.bindings).unwrap();
    pipe.check().unwrap();
    let stop = AtomicBool::new(false);
    pipe.process(None, &stop).unwrap();

    let doc = stack.store.document_by_name("moves.md").unwrap().unwrap();
    let before = stack
        .store
        .chunks_for(doc.id, stack.bindings[0].handle.id)
        .unwrap();

    // Swap the two paragraphs; content hashes are unchanged, so rows are
    // reindexed rather than re-embedded.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    stack.file(
        "moves.md",
        "# Doc\n\nBeta paragraph also stays identical over time.\n\nAlpha paragraph stays the same forever and ever.\n",
    );
    let mut pipe = DocPipe::new(path, &stack.store, &stack.bindings).unwrap();
    assert_eq!(pipe.check().unwrap(), DocState::Modified);
    pipe.process(None, &stop).unwrap();

    let after = stack
        .store
        .chunks_for(doc.id, stack.bindings[0].handle.id)
        .unwrap();
    let before_ids: std::collections::HashSet<i64> =
        before.iter().map(|r| r.chunk_id).collect();
    let after_ids: std::collections::HashSet<i64> = after.iter().map(|r| r.chunk_id).collect();
    assert_eq!(before_ids, after_ids, "moved content must keep its chunk ids");
    assert!(after.iter().all(|r| r.chunk_index.is_some()));
}

#[test]
fn test_file_missing_and_unknown_is_ignored() {
    let stack = TestStack::new(64);
    let mut pipe = DocPipe::new(
        stack.dir.path().join("ghost.md"),
        &stack.store,
        &stack.bindings,
    )
    .unwrap();
    assert_eq!(pipe.check().unwrap(), DocState::Unchanged);
}
