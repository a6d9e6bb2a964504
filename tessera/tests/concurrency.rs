//! Transactions racing each other and the lifecycle worker

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rand::Rng;
use tessera::{
    Activities, ColumnDef, DataType, Database, DatabaseConfig, Filter, Query, TableSchema, Value,
};

fn open(config: DatabaseConfig) -> Database {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = Database::open(config).unwrap();
    db.create_table(
        TableSchema::new(
            "orders",
            vec![
                ColumnDef::new("worker", DataType::Int64),
                ColumnDef::new("seq", DataType::Int64),
            ],
        )
        .unwrap(),
    )
    .unwrap();
    db
}

fn small_blocks() -> DatabaseConfig {
    DatabaseConfig::default()
        .with_max_block_size(512)
        .with_max_in_memory_rows(32)
        .with_max_in_memory_meta_rows(4)
        .with_max_log_blocks(4)
        .with_tombstone_budget(8)
        .with_batch_window(std::time::Duration::from_millis(1))
}

#[test]
fn test_parallel_writers_with_background_lifecycle() {
    const WORKERS: i64 = 6;
    const COMMITS: i64 = 60;

    let db = open(small_blocks());
    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let db = db.clone();
            thread::spawn(move || {
                let mut ids = Vec::new();
                for seq in 0..COMMITS {
                    let id = db
                        .transaction(|txn| {
                            txn.append("orders", &[Value::Int64(worker), Value::Int64(seq)])
                        })
                        .unwrap();
                    ids.push(id);
                }
                ids
            })
        })
        .collect();

    let mut all_ids = HashSet::new();
    for handle in handles {
        let ids = handle.join().unwrap();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        for id in ids {
            assert!(all_ids.insert(id), "record id {} handed out twice", id);
        }
    }

    db.run_lifecycle(Activities::ALL).unwrap();
    let txn = db.begin_read_only().unwrap();
    assert_eq!(txn.count("orders", Filter::all()).unwrap(), (WORKERS * COMMITS) as usize);
    for worker in 0..WORKERS {
        assert_eq!(
            txn.count("orders", Filter::eq("worker", worker)).unwrap(),
            COMMITS as usize
        );
    }
    let ids: HashSet<_> = txn
        .query_with_ids(&Query::new("orders"))
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(ids, all_ids);
}

#[test]
fn test_writers_and_deleters_against_forced_passes() {
    let db = open(small_blocks().with_background_lifecycle(false));
    let stop = Arc::new(AtomicBool::new(false));

    let lifecycle = {
        let db = db.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut passes = 0;
            while !stop.load(Ordering::SeqCst) {
                db.run_lifecycle(Activities::ALL).unwrap();
                passes += 1;
            }
            passes
        })
    };

    let writers: Vec<_> = (0..4)
        .map(|worker| {
            let db = db.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for seq in 0..100i64 {
                    db.transaction(|txn| {
                        txn.append("orders", &[Value::Int64(worker), Value::Int64(seq)])
                    })
                    .unwrap();
                    if seq % 10 == 9 {
                        // drop an odd row among this worker's earlier ones
                        let victim = rng.gen_range(0..=seq / 2) * 2 + 1;
                        db.transaction(|txn| {
                            txn.delete(
                                "orders",
                                Filter::eq("worker", worker).and(Filter::eq("seq", victim)),
                            )
                        })
                        .unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    assert!(lifecycle.join().unwrap() > 0);

    db.run_lifecycle(Activities::ALL).unwrap();
    let txn = db.begin_read_only().unwrap();
    for worker in 0..4 {
        let even = txn
            .query(&Query::new("orders").filter(Filter::eq("worker", worker)))
            .unwrap()
            .into_iter()
            .filter(|row| row[1].as_i64().map_or(false, |seq| seq % 2 == 0))
            .count();
        assert_eq!(even, 50);
    }
    txn.commit().unwrap();

    let stats = db.statistics().unwrap();
    assert_eq!(stats.in_memory_tombstones, 0);
    assert_eq!(stats.active_transactions, 0);
}

#[test]
fn test_racing_deletes_of_one_record() {
    let db = open(DatabaseConfig::default().with_background_lifecycle(false));
    db.transaction(|txn| {
        txn.append_many(
            "orders",
            (0..4).map(|seq| vec![Value::Int64(0), Value::Int64(seq)]),
        )
    })
    .unwrap();
    db.run_lifecycle(Activities::PERSIST_ALL).unwrap();

    let mut first = db.begin().unwrap();
    let mut second = db.begin().unwrap();
    assert_eq!(first.delete("orders", Filter::eq("seq", 2)).unwrap(), 1);
    assert_eq!(second.delete("orders", Filter::eq("seq", 2)).unwrap(), 1);
    first.commit().unwrap();
    second.commit().unwrap();

    assert_eq!(db.table_statistics("orders").unwrap().tombstones, 1);
    assert_eq!(db.statistics().unwrap().in_memory_tombstones, 2);
    let txn = db.begin_read_only().unwrap();
    assert_eq!(txn.count("orders", Filter::all()).unwrap(), 3);
    txn.commit().unwrap();

    db.run_lifecycle(Activities::HARD_DELETE_ALL).unwrap();
    let stats = db.statistics().unwrap();
    assert_eq!(stats.in_memory_tombstones, 0);
    assert_eq!(stats.records_hard_deleted, 1);
    let seqs: Vec<i64> = db
        .query(&Query::new("orders").select(["seq"]))
        .unwrap()
        .into_iter()
        .filter_map(|row| row[0].as_i64())
        .collect();
    assert_eq!(seqs, vec![0, 1, 3]);
}

#[test]
fn test_snapshot_survives_concurrent_commits() {
    let db = open(small_blocks().with_background_lifecycle(false));
    db.transaction(|txn| {
        txn.append_many(
            "orders",
            (0..20).map(|seq| vec![Value::Int64(9), Value::Int64(seq)]),
        )
    })
    .unwrap();

    let reader = db.begin_read_only().unwrap();
    let before = reader.query(&Query::new("orders")).unwrap();

    let writer = {
        let db = db.clone();
        thread::spawn(move || {
            for seq in 20..60 {
                db.transaction(|txn| {
                    txn.append("orders", &[Value::Int64(9), Value::Int64(seq)])
                })
                .unwrap();
            }
            db.transaction(|txn| txn.delete("orders", Filter::lt("seq", 10)))
                .unwrap();
            db.run_lifecycle(Activities::ALL).unwrap();
        })
    };
    writer.join().unwrap();

    assert_eq!(reader.query(&Query::new("orders")).unwrap(), before);
    reader.commit().unwrap();
    assert_eq!(db.query(&Query::new("orders")).unwrap().len(), 50);
}
