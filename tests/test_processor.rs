mod common;

use std::sync::Arc;
use std::time::Duration;

use std::sync::atomic::Ordering;

use common::{FailingEmbedder, Harness, NanEmbedder, SlowEmbedder};
use doc_analyzer::models::{Task, TaskStatus, EMBEDDING_DIM};
use doc_analyzer::queue::{Job, JobHandle, JobQueue, JobStatus, QueueConfig};
use doc_analyzer::reaper::start_reaper_task;
use doc_analyzer::worker::{run_worker, JobOutcome, ProcessorConfig};
use tokio::sync::watch;

fn assert_timestamps_ordered(task: &Task) {
    let started = task.started_at.expect("started_at");
    let completed = task.completed_at.expect("completed_at");
    assert!(task.created_at <= started);
    assert!(started <= completed);
}

#[tokio::test]
async fn test_process_completes_with_metrics_and_embedding() {
    let h = Harness::new();
    let task_id = h.upload("alice", "notes.txt", "a b\na b c\n").await;

    let queued = h.db.get_task(&task_id).unwrap().unwrap();
    assert_eq!(queued.status(), TaskStatus::Queued);
    assert!(queued.job_id.is_some());

    let job = h.next_job().await;
    let outcome = h.processor.process(&job).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed { embedded: true });

    let task = h.db.get_task(&task_id).unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    let result = task.result().unwrap();
    assert_eq!(result.metrics.file_size, 10);
    assert_eq!(result.metrics.line_count, 2);
    assert_eq!(result.metrics.word_count, 5);
    assert_eq!(result.metrics.character_count, 10);
    assert_eq!(result.content_preview.as_deref(), Some("a b\na b c"));
    assert_eq!(task.embedding().unwrap().len(), EMBEDDING_DIM);
    assert_timestamps_ordered(&task);
}

#[tokio::test]
async fn test_embedding_failure_still_completes() {
    let h = Harness::with_embedder(Arc::new(FailingEmbedder));
    let task_id = h.upload("alice", "notes.txt", "hello world").await;

    let job = h.next_job().await;
    let outcome = h.processor.process(&job).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed { embedded: false });

    let task = h.db.get_task(&task_id).unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(task.result().unwrap().metrics.word_count, 2);
    assert!(task.embedding().is_none());
}

#[tokio::test]
async fn test_blank_file_completes_without_embedding() {
    let h = Harness::new();
    let task_id = h.upload("alice", "blank.txt", "   \n\n").await;

    let job = h.next_job().await;
    let outcome = h.processor.process(&job).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed { embedded: false });

    let task = h.db.get_task(&task_id).unwrap().unwrap();
    let result = task.result().unwrap();
    assert_eq!(result.metrics.word_count, 0);
    assert!(result.content_preview.is_none());
}

#[tokio::test]
async fn test_missing_input_fails_task_without_leaking_reference() {
    let h = Harness::new();
    let input_ref = h.storage.store("secret.txt", b"classified").await.unwrap();
    tokio::fs::remove_file(h.storage.root().join(&input_ref))
        .await
        .unwrap();
    let task_id = h
        .gateway
        .submit("alice", "secret.txt", 10, &input_ref)
        .await
        .unwrap();

    let job = h.next_job().await;
    let error = match h.processor.process(&job).await.unwrap() {
        JobOutcome::Failed { error } => error,
        other => panic!("expected failure, got {other:?}"),
    };
    assert_eq!(error, "Input file not found");

    let task = h.db.get_task(&task_id).unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Failed);
    let stored = task.error().unwrap();
    assert_eq!(stored, "Input file not found");
    assert!(!stored.contains(&input_ref));
    assert!(!stored.contains(&task_id));
    assert!(task.result().is_none());
    assert_timestamps_ordered(&task);
}

#[tokio::test]
async fn test_bad_reference_fails_with_generic_message() {
    let h = Harness::new();
    let task_id = h
        .gateway
        .submit("alice", "x.txt", 1, "../outside.txt")
        .await
        .unwrap();

    let job = h.next_job().await;
    h.processor.process(&job).await.unwrap();

    let task = h.db.get_task(&task_id).unwrap().unwrap();
    assert_eq!(task.error(), Some("Invalid input reference"));
}

#[tokio::test]
async fn test_redelivery_after_completion_is_redundant() {
    let h = Harness::new();
    let task_id = h.upload("alice", "notes.txt", "one two three").await;

    let job = h.next_job().await;
    h.processor.process(&job).await.unwrap();
    let before = h.db.get_task(&task_id).unwrap().unwrap();

    let outcome = h.processor.process(&job).await.unwrap();
    assert_eq!(outcome, JobOutcome::Redundant(TaskStatus::Completed));

    let after = h.db.get_task(&task_id).unwrap().unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_abandoned_attempt_is_rerun() {
    let h = Harness::new();
    let task_id = h.upload("alice", "notes.txt", "one two three").await;

    // A previous worker got as far as marking the task and then died
    h.db.mark_task_processing(&task_id).unwrap();
    let first_start = h.db.get_task(&task_id).unwrap().unwrap().started_at.unwrap();

    let job = h.next_job().await;
    let outcome = h.processor.process(&job).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed { embedded: true });

    let task = h.db.get_task(&task_id).unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert!(task.started_at.unwrap() >= first_start);
    assert_timestamps_ordered(&task);
}

#[tokio::test]
async fn test_job_for_unknown_task_is_reported() {
    let h = Harness::new();
    let job = Job {
        handle: JobHandle::new("orphan"),
        task_id: "no-such-task".to_string(),
        input_ref: "whatever.txt".to_string(),
        attempt: 1,
    };
    assert_eq!(
        h.processor.process(&job).await.unwrap(),
        JobOutcome::MissingTask
    );
}

#[tokio::test]
async fn test_lifecycle_is_audited() {
    let h = Harness::new();
    let mut live = h.events.subscribe();
    let task_id = h.upload_and_process("alice", "notes.txt", "hello there").await;

    let events = h.db.audit_events_for_task(&task_id).unwrap();
    let categories: Vec<&str> = events.iter().map(|(c, _)| c.as_str()).collect();
    assert_eq!(
        categories,
        vec!["file_uploads", "task_processing", "task_processing"]
    );
    assert_eq!(events[0].1["status"], "queued");
    assert_eq!(events[1].1["status"], "processing");
    assert_eq!(events[2].1["status"], "completed");
    assert_eq!(events[2].1["detail"]["embedded"], true);

    let first = live.recv().await.unwrap();
    assert_eq!(first.category, "file_uploads");
    assert_eq!(first.event.task_id, task_id);
}

#[tokio::test]
async fn test_worker_loop_settles_jobs_and_stops() {
    let h = Harness::new();
    let ok_id = h.upload("alice", "ok.txt", "some words here").await;
    let bad_id = h
        .gateway
        .submit("alice", "gone.txt", 1, "missing.txt")
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(run_worker(
        "w1".to_string(),
        h.queue.clone(),
        h.processor.clone(),
        shutdown_rx,
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let ok = h.db.get_task(&ok_id).unwrap().unwrap().status();
        let bad = h.db.get_task(&bad_id).unwrap().unwrap().status();
        if ok.is_terminal() && bad.is_terminal() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "worker did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();

    let ok = h.db.get_task(&ok_id).unwrap().unwrap();
    let bad = h.db.get_task(&bad_id).unwrap().unwrap();
    assert_eq!(ok.status(), TaskStatus::Completed);
    assert_eq!(bad.status(), TaskStatus::Failed);

    let ok_job = JobHandle::new(ok.job_id.unwrap());
    let bad_job = JobHandle::new(bad.job_id.unwrap());
    assert_eq!(h.queue.status(&ok_job).await.unwrap(), JobStatus::Finished);
    assert_eq!(h.queue.status(&bad_job).await.unwrap(), JobStatus::Failed);
}

#[tokio::test]
async fn test_non_finite_embedding_is_dropped() {
    let h = Harness::with_embedder(Arc::new(NanEmbedder));
    let task_id = h.upload("alice", "notes.txt", "hello world").await;

    let job = h.next_job().await;
    let outcome = h.processor.process(&job).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed { embedded: false });

    let task = h.db.get_task(&task_id).unwrap().unwrap();
    assert!(task.embedding().is_none());
    // The owner's listings still load
    assert_eq!(h.db.list_tasks("alice", 10, 0).unwrap().1, 1);
    assert!(h.db.embedded_tasks("alice", "other").unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_embedding_times_out_into_degraded_completion() {
    let h = Harness::build(
        Arc::new(SlowEmbedder::new(Duration::from_secs(5))),
        QueueConfig {
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(20),
        },
        ProcessorConfig {
            embed_timeout: Duration::from_millis(50),
            ..ProcessorConfig::default()
        },
    );
    let task_id = h.upload("alice", "notes.txt", "hello world").await;

    let job = h.next_job().await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), h.processor.process(&job))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, JobOutcome::Completed { embedded: false });
    assert!(h.db.get_task(&task_id).unwrap().unwrap().embedding().is_none());
}

#[tokio::test]
async fn test_long_attempt_keeps_its_lease() {
    let embedder = Arc::new(SlowEmbedder::new(Duration::from_millis(500)));
    let h = Harness::build(
        embedder.clone(),
        QueueConfig {
            lease: Duration::from_millis(150),
            poll_interval: Duration::from_millis(10),
        },
        ProcessorConfig::default(),
    );
    let task_id = h.upload("alice", "notes.txt", "slow document").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for name in ["w1", "w2"] {
        handles.push(tokio::spawn(run_worker(
            name.to_string(),
            h.queue.clone(),
            h.processor.clone(),
            shutdown_rx.clone(),
        )));
    }
    handles.push(tokio::spawn(start_reaper_task(
        h.queue.clone(),
        Duration::from_millis(10),
        shutdown_rx.clone(),
    )));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = h.db.get_task(&task_id).unwrap().unwrap();
        let job = JobHandle::new(task.job_id.clone().unwrap());
        if task.status().is_terminal()
            && h.queue.status(&job).await.unwrap() == JobStatus::Finished
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(embedder.peak_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    let task = h.db.get_task(&task_id).unwrap().unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert!(task.embedding().is_some());
}
