//! SQLite database tests.

use std::collections::HashMap;
use std::path::PathBuf;

use farmhand::database::DatabaseError;
use farmhand::database::SqliteDatabase;
use farmhand_engine::ExecutionId;
use farmhand_engine::PairStore;
use farmhand_engine::store::Benchmark;
use farmhand_engine::store::Configuration;
use farmhand_engine::store::Job;
use farmhand_engine::store::JobPair;
use farmhand_engine::store::JobStatus;
use farmhand_engine::store::PairStatus;
use farmhand_engine::store::PostProcessingItem;
use farmhand_engine::store::Processor;
use farmhand_engine::store::ResourceLimits;
use farmhand_engine::store::ResourceUsage;
use farmhand_engine::store::Solver;
use farmhand_engine::store::Stage;
use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use sqlx::SqlitePool;

/// Creates an unsaved pair of the given benchmark with one stage per solver.
fn pair(bench: &str, solvers: &[&str]) -> JobPair {
    JobPair {
        id: 0,
        job_id: 0,
        user_id: 0,
        queue: String::new(),
        limits: ResourceLimits::default(),
        post_processor: None,
        benchmark: Benchmark {
            id: 0,
            name: bench.to_string(),
            path: PathBuf::from(format!("/bench/{bench}.cnf")),
        },
        stages: solvers
            .iter()
            .map(|solver| Stage {
                number: 0,
                solver: Solver {
                    id: 0,
                    name: solver.to_string(),
                    path: PathBuf::from(format!("/solvers/{solver}")),
                },
                configuration: Configuration {
                    id: 0,
                    name: String::from("default"),
                },
            })
            .collect(),
        status: PairStatus::Created,
        execution_id: None,
        usage: None,
    }
}

/// Creates an unsaved job of a user on a queue.
fn job(user_id: i64, queue: &str, pairs: Vec<JobPair>) -> Job {
    Job {
        id: 0,
        user_id,
        name: format!("job-of-{user_id}"),
        queue: queue.to_string(),
        limits: ResourceLimits {
            wallclock_timeout: 600,
            cpu_timeout: 600,
            max_memory: 1 << 30,
        },
        pre_processor: None,
        post_processor: None,
        pairs,
        status: JobStatus::Pending,
    }
}

/// Stores a job and submits its pairs with consecutive handles.
async fn enqueue(db: &SqliteDatabase, job: Job, first_handle: i64) -> Job {
    let job = db.add_job(job).await.unwrap();
    for (i, pair) in job.pairs.iter().enumerate() {
        assert!(
            db.set_pair_status(pair.id, PairStatus::Enqueued)
                .await
                .unwrap()
        );
        db.record_execution_handle(pair.id, ExecutionId::new(first_handle + i as i64))
            .await
            .unwrap();
    }
    job
}

#[sqlx::test]
async fn add_and_get_job(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();

    let job = db
        .add_job(job(
            7,
            "all.q",
            vec![pair("php", &["minisat", "glucose"]), pair("urquhart", &["minisat"])],
        ))
        .await
        .unwrap();

    assert!(job.id > 0);
    assert_eq!(job.pairs.len(), 2);
    assert!(job.pairs.iter().all(|p| p.job_id == job.id));

    let stored = db.get_pair(job.pairs[0].id).await.unwrap().unwrap();
    assert_eq!(stored, job.pairs[0]);
    assert_eq!(stored.user_id, 7);
    assert_eq!(stored.queue, "all.q");
    assert_eq!(stored.limits.wallclock_timeout, 600);
    assert_eq!(
        stored.stages.iter().map(|s| s.number).collect::<Vec<_>>(),
        [1, 2]
    );
    assert_eq!(stored.stages[1].solver.name, "glucose");

    assert_eq!(db.get_pair(job.pairs[1].id + 100).await.unwrap(), None);
}

#[sqlx::test]
async fn invalid_jobs_are_rejected(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();

    let error = db
        .add_job(job(1, "all.q", vec![pair("php", &[])]))
        .await
        .unwrap_err();
    assert!(matches!(
        error.downcast_ref::<DatabaseError>(),
        Some(DatabaseError::Validation(_))
    ));

    let mut unnamed = job(1, "all.q", vec![pair("php", &["minisat"])]);
    unnamed.name = String::new();
    assert!(db.add_job(unnamed).await.is_err());

    assert!(
        db.get_eligible_pairs_for_dispatch()
            .await
            .unwrap()
            .is_empty()
    );
}

#[sqlx::test]
async fn eligible_pairs_in_insertion_order(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();

    let first = db
        .add_job(job(1, "all.q", vec![pair("a", &["minisat"]), pair("b", &["minisat"])]))
        .await
        .unwrap();
    let second = db
        .add_job(job(2, "all.q", vec![pair("c", &["minisat"])]))
        .await
        .unwrap();

    // An enqueued pair without a handle is retried.
    assert!(
        db.set_pair_status(first.pairs[0].id, PairStatus::Enqueued)
            .await
            .unwrap()
    );

    // A submitted pair is not.
    db.set_pair_status(first.pairs[1].id, PairStatus::Enqueued)
        .await
        .unwrap();
    db.record_execution_handle(first.pairs[1].id, ExecutionId::new(42))
        .await
        .unwrap();

    let eligible: Vec<_> = db
        .get_eligible_pairs_for_dispatch()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(eligible, [first.pairs[0].id, second.pairs[0].id]);
}

#[sqlx::test]
async fn status_only_moves_forward(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();
    let job = db
        .add_job(job(1, "all.q", vec![pair("a", &["minisat"])]))
        .await
        .unwrap();
    let id = job.pairs[0].id;

    assert!(db.set_pair_status(id, PairStatus::Running).await.unwrap());
    assert!(!db.set_pair_status(id, PairStatus::Enqueued).await.unwrap());
    assert!(db.set_pair_status(id, PairStatus::Killed).await.unwrap());
    assert!(!db.set_pair_status(id, PairStatus::Complete).await.unwrap());
    assert!(!db.set_pair_error(id, "too late").await.unwrap());

    let pair = db.get_pair(id).await.unwrap().unwrap();
    assert_eq!(pair.status, PairStatus::Killed);
    assert_eq!(db.get_pair_error(id).await.unwrap(), None);

    assert!(db.set_pair_status(id + 1, PairStatus::Running).await.is_err());
}

#[sqlx::test]
async fn records_errors(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();
    let job = enqueue(
        &db,
        job(1, "all.q", vec![pair("a", &["minisat"])]),
        1000,
    )
    .await;
    let id = job.pairs[0].id;

    assert!(db.set_pair_error(id, "node failure").await.unwrap());
    assert_eq!(
        db.get_pair(id).await.unwrap().unwrap().status,
        PairStatus::Error
    );
    assert_eq!(
        db.get_pair_error(id).await.unwrap().as_deref(),
        Some("node failure")
    );
    assert!(db.get_pairs_in_backend().await.unwrap().is_empty());
}

#[sqlx::test]
async fn loads_and_counts_per_queue(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();

    enqueue(
        &db,
        job(1, "all.q", vec![pair("a", &["minisat"]), pair("b", &["minisat"])]),
        1000,
    )
    .await;
    enqueue(&db, job(2, "all.q", vec![pair("c", &["minisat"])]), 2000).await;
    enqueue(&db, job(1, "fast.q", vec![pair("d", &["minisat"])]), 3000).await;

    // Not yet held by the backend.
    db.add_job(job(3, "all.q", vec![pair("e", &["minisat"])]))
        .await
        .unwrap();

    let loads = db.get_user_loads_on_queue("all.q").await.unwrap();
    assert_eq!(loads.len(), 2);
    assert_eq!(loads[&1], 1200);
    assert_eq!(loads[&2], 600);

    assert_eq!(db.count_pairs_in_queue("all.q").await.unwrap(), 3);
    assert_eq!(db.count_pairs_in_queue("fast.q").await.unwrap(), 1);
    assert_eq!(db.count_pairs_in_queue("empty.q").await.unwrap(), 0);
    assert_eq!(db.get_pairs_in_backend().await.unwrap().len(), 4);
}

#[sqlx::test]
async fn post_processing_queue(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();

    let processor = db
        .add_processor(Processor {
            id: 0,
            name: String::from("sat-result"),
            path: PathBuf::from("/processors/sat-result"),
        })
        .await
        .unwrap();
    assert_eq!(
        db.get_processor(processor.id).await.unwrap(),
        Some(processor.clone())
    );

    let mut with_processor = job(1, "all.q", vec![pair("a", &["minisat", "glucose"])]);
    with_processor.post_processor = Some(processor.id);
    let with_processor = db.add_job(with_processor).await.unwrap();
    let without = db
        .add_job(job(1, "all.q", vec![pair("b", &["minisat"])]))
        .await
        .unwrap();

    let id = with_processor.pairs[0].id;
    db.complete_stage(id, 1).await.unwrap();
    db.complete_stage(id, 1).await.unwrap();
    db.complete_stage(id, 2).await.unwrap();
    db.complete_stage(without.pairs[0].id, 1).await.unwrap();
    assert!(db.complete_stage(id + 100, 1).await.is_err());

    assert_eq!(
        db.get_pairs_awaiting_post_processing().await.unwrap(),
        [
            PostProcessingItem {
                pair_id: id,
                stage: 1,
                processor_id: processor.id,
            },
            PostProcessingItem {
                pair_id: id,
                stage: 2,
                processor_id: processor.id,
            },
        ]
    );

    db.mark_post_processed(id, 1).await.unwrap();
    assert_eq!(
        db.get_pairs_awaiting_post_processing().await.unwrap().len(),
        1
    );
}

#[sqlx::test]
async fn attributes_are_upserted(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();
    let job = db
        .add_job(job(1, "all.q", vec![pair("a", &["minisat"])]))
        .await
        .unwrap();
    let id = job.pairs[0].id;

    let mut attributes = IndexMap::new();
    attributes.insert(String::from("result"), String::from("UNKNOWN"));
    attributes.insert(String::from("time"), String::from("12.5"));
    db.add_pair_attributes(id, 1, &attributes).await.unwrap();

    let mut update = IndexMap::new();
    update.insert(String::from("result"), String::from("SAT"));
    db.add_pair_attributes(id, 1, &update).await.unwrap();

    let stored = db.get_pair_attributes(id, 1).await.unwrap();
    assert_eq!(stored.get("result").map(String::as_str), Some("SAT"));
    assert_eq!(stored.get("time").map(String::as_str), Some("12.5"));
    assert!(db.get_pair_attributes(id, 2).await.unwrap().is_empty());
}

#[sqlx::test]
async fn missing_pair_handle_is_an_error(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();
    assert!(
        db.record_execution_handle(1, ExecutionId::new(5))
            .await
            .is_err()
    );
}

#[sqlx::test]
async fn finished_pairs_record_usage_and_leave_the_backend(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();
    let job = enqueue(
        &db,
        job(1, "all.q", vec![pair("a", &["minisat"]), pair("b", &["minisat"])]),
        1000,
    )
    .await;
    let (first, second) = (job.pairs[0].id, job.pairs[1].id);

    let usage = ResourceUsage {
        cpu_time_ms: 1250,
        wallclock_ms: 100_001,
        max_memory: 3 << 20,
    };
    assert!(db.finish_pair(first, Some(usage)).await.unwrap());
    assert!(!db.finish_pair(first, None).await.unwrap());

    let stored = db.get_pair(first).await.unwrap().unwrap();
    assert_eq!(stored.usage, Some(usage));
    assert_eq!(stored.status, PairStatus::Enqueued);

    let held: Vec<_> = db
        .get_pairs_in_backend()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(held, [second]);
    assert_eq!(db.count_pairs_in_queue("all.q").await.unwrap(), 1);
    assert_eq!(
        db.get_user_loads_on_queue("all.q").await.unwrap(),
        HashMap::from([(1, 600)])
    );

    // Finishing without measurements records nothing
    assert!(db.finish_pair(second, None).await.unwrap());
    assert_eq!(db.get_pair(second).await.unwrap().unwrap().usage, None);
    assert!(db.finish_pair(second + 100, None).await.is_err());
}

#[sqlx::test]
async fn load_credits_are_taken_once(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();
    let first = enqueue(
        &db,
        job(1, "all.q", vec![pair("a", &["minisat"]), pair("b", &["minisat"])]),
        1000,
    )
    .await;
    let second = enqueue(&db, job(2, "all.q", vec![pair("c", &["minisat"])]), 2000).await;
    let other = enqueue(&db, job(1, "fast.q", vec![pair("d", &["minisat"])]), 3000).await;

    let ran_for = |secs: u64| ResourceUsage {
        wallclock_ms: secs * 1000,
        ..Default::default()
    };
    for pair in &first.pairs {
        db.finish_pair(pair.id, Some(ran_for(100))).await.unwrap();
    }
    // Past the timeout there is nothing to return
    db.finish_pair(second.pairs[0].id, Some(ran_for(700)))
        .await
        .unwrap();
    db.finish_pair(other.pairs[0].id, Some(ran_for(0)))
        .await
        .unwrap();

    assert_eq!(
        db.take_load_credits("all.q").await.unwrap(),
        HashMap::from([(1, 1000), (2, 0)])
    );
    assert!(db.take_load_credits("all.q").await.unwrap().is_empty());
    assert_eq!(
        db.take_load_credits("fast.q").await.unwrap(),
        HashMap::from([(1, 600)])
    );
}

#[sqlx::test]
async fn job_status_is_aggregated(pool: SqlitePool) {
    let db = SqliteDatabase::from_pool(pool).await.unwrap();
    let job = db
        .add_job(job(
            4,
            "all.q",
            vec![pair("a", &["minisat"]), pair("b", &["minisat"])],
        ))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    let (first, second) = (job.pairs[0].id, job.pairs[1].id);

    let (db, id) = (&db, job.id);
    let status = move || async move { db.get_job(id).await.unwrap().unwrap().status };
    assert_eq!(status().await, JobStatus::Pending);

    db.set_pair_status(first, PairStatus::Running).await.unwrap();
    assert_eq!(status().await, JobStatus::Running);

    db.set_pair_status(first, PairStatus::Complete).await.unwrap();
    assert_eq!(status().await, JobStatus::Running);

    db.set_pair_status(second, PairStatus::Killed).await.unwrap();
    assert_eq!(status().await, JobStatus::Killed);

    let stored = db.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.name, "job-of-4");
    assert_eq!(stored.limits.wallclock_timeout, 600);
    assert_eq!(
        stored.pairs.iter().map(|p| p.id).collect::<Vec<_>>(),
        [first, second]
    );
    assert_eq!(stored.pairs[1].stages[0].solver.name, "minisat");
    assert_eq!(db.get_job(job.id + 100).await.unwrap(), None);
}
