//! End-to-end engine tests.

use std::sync::Arc;

use tempfile::TempDir;

use crate::array::ArrayImpl;
use crate::block::Block;
use crate::calendar::Calendar;
use crate::catalog::{ColumnCatalog, ColumnKeyExpression, TableSchema};
use crate::options::StorageOptions;
use crate::part::PartRef;
use crate::part_reader::PartReader;
use crate::pruner::{AlwaysTrue, KeyRange};
use crate::storage::{MergeTreeStorage, TableStream};
use crate::types::{DataType, DataValue};
use crate::StorageError;

fn calendar() -> Arc<Calendar> {
    Arc::new(Calendar::new())
}

fn day(y: i32, m: u32, d: u32) -> u16 {
    Calendar::new().from_ymd(y, m, d)
}

/// `(date: UInt16, v: Int32)`, primary key `v`.
async fn open_plain(options: StorageOptions) -> MergeTreeStorage {
    let schema = TableSchema::new(
        vec![
            ColumnCatalog::new("date", DataType::UInt16),
            ColumnCatalog::new("v", DataType::Int32),
        ],
        "date",
    )
    .unwrap();
    let key = Arc::new(ColumnKeyExpression::new(vec![ColumnCatalog::new(
        "v",
        DataType::Int32,
    )]));
    MergeTreeStorage::open(options, schema, key, calendar())
        .await
        .unwrap()
}

fn plain_options(dir: &TempDir) -> StorageOptions {
    StorageOptions::default_for_test(dir.path().join("table"))
}

fn plain_block(rows: &[(u16, i32)]) -> Block {
    Block::from_columns([
        (
            "date".to_string(),
            ArrayImpl::from(rows.iter().map(|r| r.0).collect::<Vec<_>>()),
        ),
        (
            "v".to_string(),
            ArrayImpl::from(rows.iter().map(|r| r.1).collect::<Vec<_>>()),
        ),
    ])
}

fn drain_plain(streams: Vec<TableStream>) -> Vec<(u16, i32)> {
    let mut rows = vec![];
    for mut stream in streams {
        while let Some(block) = stream.next_block().unwrap() {
            let dates = block.by_name("date").unwrap();
            let values = block.by_name("v").unwrap();
            for i in 0..block.rows() {
                let DataValue::UInt16(date) = dates.get(i) else {
                    panic!("date is not UInt16")
                };
                let DataValue::Int32(v) = values.get(i) else {
                    panic!("v is not Int32")
                };
                rows.push((date, v));
            }
        }
    }
    rows
}

fn check_active_invariants(parts: &[PartRef]) {
    for part in parts {
        assert_eq!(
            part.left_month, part.right_month,
            "part {} spans months",
            part.name
        );
        assert!(part.left <= part.right);
    }
    for pair in parts.windows(2) {
        if pair[0].left_month == pair[1].left_month {
            assert!(
                pair[0].right < pair[1].left,
                "parts {} and {} overlap",
                pair[0].name,
                pair[1].name
            );
        }
    }
}

#[tokio::test]
async fn test_ingest_part_names() {
    let dir = tempfile::tempdir().unwrap();
    // Forbid merging so the level-0 parts stay observable.
    let mut options = plain_options(&dir);
    options.max_rows_to_merge_parts = 0;
    let storage = open_plain(options).await;

    let sink = storage.write();
    sink.write_block(plain_block(&[
        (day(2024, 1, 3), 10),
        (day(2024, 1, 1), 30),
        (day(2024, 1, 2), 20),
    ]))
    .await
    .unwrap();
    sink.write_block(plain_block(&[(day(2024, 1, 4), 40), (day(2024, 1, 5), 50)]))
        .await
        .unwrap();
    storage.shutdown().await;

    let names: Vec<String> = storage
        .active_parts()
        .iter()
        .map(|p| p.name.clone())
        .collect();
    assert_eq!(
        names,
        vec!["20240101_20240103_1_1_0", "20240104_20240105_2_2_0"]
    );
    check_active_invariants(&storage.active_parts());
}

#[tokio::test]
async fn test_single_month_merge() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_plain(plain_options(&dir)).await;

    let sink = storage.write();
    sink.write_block(plain_block(&[
        (day(2024, 1, 3), 10),
        (day(2024, 1, 1), 30),
        (day(2024, 1, 2), 20),
    ]))
    .await
    .unwrap();
    sink.write_block(plain_block(&[(day(2024, 1, 4), 40), (day(2024, 1, 5), 50)]))
        .await
        .unwrap();

    storage.shutdown().await;
    storage.merge(1, true).await;

    let parts = storage.active_parts();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].name, "20240101_20240105_1_2_1");
    assert_eq!(parts[0].level, 1);
    check_active_invariants(&parts);

    let streams = storage
        .read(&["date", "v"], &AlwaysTrue, &AlwaysTrue, 1024, 1)
        .await
        .unwrap();
    let rows = drain_plain(streams);
    // Primary-key order within the part.
    assert_eq!(
        rows.iter().map(|r| r.1).collect::<Vec<_>>(),
        vec![10, 20, 30, 40, 50]
    );
    assert_eq!(rows[0].0, day(2024, 1, 3));
}

#[tokio::test]
async fn test_cross_month_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_plain(plain_options(&dir)).await;

    let sink = storage.write();
    sink.write_block(plain_block(&[(day(2024, 1, 31), 1), (day(2024, 2, 1), 2)]))
        .await
        .unwrap();
    storage.shutdown().await;
    storage.merge(0, true).await;

    // One part per month, and they never merge with each other.
    let names: Vec<String> = storage
        .active_parts()
        .iter()
        .map(|p| p.name.clone())
        .collect();
    assert_eq!(
        names,
        vec!["20240131_20240131_1_1_0", "20240201_20240201_2_2_0"]
    );
    check_active_invariants(&storage.active_parts());

    let rows = drain_plain(
        storage
            .read(&["date", "v"], &AlwaysTrue, &AlwaysTrue, 1024, 1)
            .await
            .unwrap(),
    );
    let mut values: Vec<i32> = rows.iter().map(|r| r.1).collect();
    values.sort();
    assert_eq!(values, vec![1, 2]);
}

#[tokio::test]
async fn test_pruning() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_plain(plain_options(&dir)).await;

    let sink = storage.write();
    sink.write_block(plain_block(&[
        (day(2024, 1, 3), 10),
        (day(2024, 1, 1), 30),
        (day(2024, 1, 2), 20),
    ]))
    .await
    .unwrap();
    sink.write_block(plain_block(&[(day(2024, 1, 4), 40), (day(2024, 1, 5), 50)]))
        .await
        .unwrap();
    storage.shutdown().await;
    storage.merge(1, true).await;

    let condition = KeyRange {
        min: vec![DataValue::Int32(25)],
        max: vec![DataValue::Int32(45)],
    };
    let rows = drain_plain(
        storage
            .read(&["date", "v"], &AlwaysTrue, &condition, 1024, 2)
            .await
            .unwrap(),
    );
    let values: Vec<i32> = rows.iter().map(|r| r.1).collect();
    // Over-approximation is allowed, dropping a match is not.
    for needed in [30, 40] {
        assert!(values.contains(&needed), "pruned away {needed}");
    }
    for value in &values {
        assert!([10, 20, 30, 40, 50].contains(value));
    }

    // Date pruning drops parts wholesale.
    let offcut = KeyRange {
        min: vec![DataValue::UInt16(day(2025, 6, 1))],
        max: vec![DataValue::UInt16(day(2025, 6, 30))],
    };
    let streams = storage
        .read(&["date", "v"], &offcut, &AlwaysTrue, 1024, 2)
        .await
        .unwrap();
    assert!(streams.is_empty());
}

#[tokio::test]
async fn test_missing_column_reads_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let options = plain_options(&dir);

    {
        let schema = TableSchema::new(
            vec![
                ColumnCatalog::new("date", DataType::UInt16),
                ColumnCatalog::new("a", DataType::Int32),
            ],
            "date",
        )
        .unwrap();
        let key = Arc::new(ColumnKeyExpression::new(vec![ColumnCatalog::new(
            "a",
            DataType::Int32,
        )]));
        let storage = MergeTreeStorage::open(options.clone(), schema, key, calendar())
            .await
            .unwrap();
        let block = Block::from_columns([
            ("date".to_string(), ArrayImpl::from(vec![day(2024, 1, 1); 3])),
            ("a".to_string(), ArrayImpl::from(vec![1, 2, 3])),
        ]);
        storage.write().write_block(block).await.unwrap();
        storage.shutdown().await;
    }

    // Reopen with column `b` appended to the schema.
    let schema = TableSchema::new(
        vec![
            ColumnCatalog::new("date", DataType::UInt16),
            ColumnCatalog::new("a", DataType::Int32),
            ColumnCatalog::new("b", DataType::Int64),
        ],
        "date",
    )
    .unwrap();
    let key = Arc::new(ColumnKeyExpression::new(vec![ColumnCatalog::new(
        "a",
        DataType::Int32,
    )]));
    let storage = MergeTreeStorage::open(options, schema, key, calendar())
        .await
        .unwrap();

    let mut streams = storage
        .read(&["a", "b"], &AlwaysTrue, &AlwaysTrue, 1024, 1)
        .await
        .unwrap();
    assert_eq!(streams.len(), 1);
    let block = streams[0].next_block().unwrap().unwrap();
    assert_eq!(block.by_name("a").unwrap(), &ArrayImpl::from(vec![1, 2, 3]));
    assert_eq!(
        block.by_name("b").unwrap(),
        &ArrayImpl::from(vec![0i64, 0, 0])
    );

    // A read that wants only missing columns is an error.
    let mut streams = storage
        .read(&["b"], &AlwaysTrue, &AlwaysTrue, 1024, 1)
        .await
        .unwrap();
    let err = streams[0].next_block().unwrap_err();
    assert!(matches!(
        err.kind(),
        StorageError::AllRequestedColumnsAreMissing
    ));

    storage.drop_storage().await.unwrap();
}

fn signed_block(rows: &[(u16, i32, i8)]) -> Block {
    Block::from_columns([
        (
            "date".to_string(),
            ArrayImpl::from(rows.iter().map(|r| r.0).collect::<Vec<_>>()),
        ),
        (
            "v".to_string(),
            ArrayImpl::from(rows.iter().map(|r| r.1).collect::<Vec<_>>()),
        ),
        (
            "s".to_string(),
            ArrayImpl::from(rows.iter().map(|r| r.2).collect::<Vec<_>>()),
        ),
    ])
}

async fn open_signed(options: StorageOptions) -> MergeTreeStorage {
    let schema = TableSchema::new(
        vec![
            ColumnCatalog::new("date", DataType::UInt16),
            ColumnCatalog::new("v", DataType::Int32),
            ColumnCatalog::new("s", DataType::Int8),
        ],
        "date",
    )
    .unwrap();
    let key = Arc::new(ColumnKeyExpression::new(vec![ColumnCatalog::new(
        "v",
        DataType::Int32,
    )]));
    MergeTreeStorage::open(options, schema, key, calendar())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_collapsing_merge() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = plain_options(&dir);
    options.sign_column = Some("s".to_string());
    let storage = open_signed(options).await;

    let sink = storage.write();
    sink.write_block(signed_block(&[(1, 7, 1), (1, 8, 1)]))
        .await
        .unwrap();
    sink.write_block(signed_block(&[(1, 7, -1)])).await.unwrap();
    storage.shutdown().await;
    storage.merge(1, true).await;

    let parts = storage.active_parts();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].level, 1);

    let mut streams = storage
        .read(&["v", "s"], &AlwaysTrue, &AlwaysTrue, 1024, 1)
        .await
        .unwrap();
    let block = streams[0].next_block().unwrap().unwrap();
    assert_eq!(block.by_name("v").unwrap(), &ArrayImpl::from(vec![8]));
    assert_eq!(block.by_name("s").unwrap(), &ArrayImpl::from(vec![1i8]));
    assert!(streams[0].next_block().unwrap().is_none());
}

#[tokio::test]
async fn test_collapsing_to_nothing_keeps_sources() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = plain_options(&dir);
    options.sign_column = Some("s".to_string());
    let storage = open_signed(options).await;

    let sink = storage.write();
    sink.write_block(signed_block(&[(1, 7, 1)])).await.unwrap();
    sink.write_block(signed_block(&[(1, 7, -1)])).await.unwrap();
    storage.shutdown().await;
    // Everything cancels: the merge would write an empty part, which is a
    // fault. The worker swallows it and the sources stay active and
    // retryable.
    storage.merge(1, true).await;

    let parts = storage.active_parts();
    assert_eq!(parts.len(), 2);
    for part in &parts {
        assert!(!part.is_merging());
    }
}

#[tokio::test]
async fn test_recovery_retires_contained_part() {
    let dir = tempfile::tempdir().unwrap();
    let options = plain_options(&dir);

    {
        let mut options = options.clone();
        options.max_rows_to_merge_parts = 0;
        let storage = open_plain(options).await;
        let sink = storage.write();
        sink.write_block(plain_block(&[(day(2024, 1, 1), 1)]))
            .await
            .unwrap();
        sink.write_block(plain_block(&[(day(2024, 1, 2), 2)]))
            .await
            .unwrap();
        storage.shutdown().await;
    }

    // Masquerade the two directories as a merged part and a leftover it
    // absorbed.
    let root = options.path.clone();
    std::fs::rename(
        root.join("20240101_20240101_1_1_0"),
        root.join("20240101_20240110_1_5_2"),
    )
    .unwrap();
    std::fs::rename(
        root.join("20240102_20240102_2_2_0"),
        root.join("20240102_20240109_2_4_1"),
    )
    .unwrap();

    let storage = open_plain(options).await;
    let active: Vec<String> = storage
        .active_parts()
        .iter()
        .map(|p| p.name.clone())
        .collect();
    assert_eq!(active, vec!["20240101_20240110_1_5_2"]);
    let all: Vec<String> = storage.all_parts().iter().map(|p| p.name.clone()).collect();
    assert_eq!(
        all,
        vec!["20240101_20240110_1_5_2", "20240102_20240109_2_4_1"]
    );

    let removed = storage.reclaim().unwrap();
    assert_eq!(removed, 1);
    assert!(!root.join("20240102_20240109_2_4_1").exists());
    assert!(root.join("20240101_20240110_1_5_2").exists());
    assert_eq!(storage.all_parts().len(), 1);
}

#[tokio::test]
async fn test_mark_seek_matches_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = plain_options(&dir);
    options.max_rows_to_merge_parts = 0;
    let storage = open_plain(options.clone()).await;

    let rows: Vec<(u16, i32)> = (0..9).map(|i| (day(2024, 1, 1), i * 10)).collect();
    storage.write().write_block(plain_block(&rows)).await.unwrap();
    storage.shutdown().await;

    let part = storage.active_parts()[0].clone();
    assert_eq!(part.size, 5);

    let columns = vec![
        ColumnCatalog::new("date", DataType::UInt16),
        ColumnCatalog::new("v", DataType::Int32),
    ];
    for mark in 0..part.size {
        let mut reader = PartReader::new(
            part.clone(),
            &options.path,
            columns.clone(),
            mark,
            usize::MAX,
            3,
            options.index_granularity,
        );
        let mut values = vec![];
        while let Some(block) = reader.next_block().unwrap() {
            let array = block.by_name("v").unwrap();
            for i in 0..block.rows() {
                values.push(array.get(i));
            }
        }
        let expected: Vec<DataValue> = (mark * options.index_granularity..9)
            .map(|i| DataValue::Int32(i as i32 * 10))
            .collect();
        assert_eq!(values, expected, "wrong suffix from mark {mark}");
    }
}

#[tokio::test]
async fn test_snapshot_isolation_and_reclamation_safety() {
    let dir = tempfile::tempdir().unwrap();
    // Keep the planner idle so the merge below is the only one.
    let mut options = plain_options(&dir);
    options.max_rows_to_merge_parts = 0;
    let storage = open_plain(options.clone()).await;

    let sink = storage.write();
    sink.write_block(plain_block(&[(day(2024, 1, 1), 1), (day(2024, 1, 2), 2)]))
        .await
        .unwrap();
    sink.write_block(plain_block(&[(day(2024, 1, 3), 3)]))
        .await
        .unwrap();
    storage.shutdown().await;

    // Open a read over the level-0 parts, then let a merge retire them.
    let streams = storage
        .read(&["date", "v"], &AlwaysTrue, &AlwaysTrue, 1024, 1)
        .await
        .unwrap();
    let old_parts = storage.active_parts();
    let old_names: Vec<String> = old_parts.iter().map(|p| p.name.clone()).collect();
    assert_eq!(old_names.len(), 2);

    crate::merge::merge_parts(storage.inner(), &old_parts).unwrap();
    drop(old_parts);
    assert_eq!(storage.active_parts().len(), 1);
    assert_eq!(storage.all_parts().len(), 3);

    // Retired parts must stay on disk while the readers hold them.
    storage.reclaim().unwrap();
    for name in &old_names {
        assert!(options.path.join(name).exists(), "{name} reclaimed too early");
    }

    // The query still sees the snapshot it started from.
    let rows = drain_plain(streams);
    let mut values: Vec<i32> = rows.iter().map(|r| r.1).collect();
    values.sort();
    assert_eq!(values, vec![1, 2, 3]);

    // With the readers gone, reclamation may proceed.
    assert_eq!(storage.reclaim().unwrap(), 2);
    for name in &old_names {
        assert!(!options.path.join(name).exists());
    }
    assert_eq!(storage.all_parts().len(), 1);
}

#[tokio::test]
async fn test_merges_do_not_change_visible_rows() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_plain(plain_options(&dir)).await;

    let mut expected = vec![];
    let sink = storage.write();
    for batch in 0..6 {
        let rows: Vec<(u16, i32)> = (0u32..5)
            .map(|i| (day(2024, 1, 1 + (i % 3)), batch * 100 + i as i32))
            .collect();
        expected.extend(rows.iter().map(|r| r.1));
        sink.write_block(plain_block(&rows)).await.unwrap();
    }
    storage.shutdown().await;
    storage.merge(0, true).await;

    check_active_invariants(&storage.active_parts());

    let rows = drain_plain(
        storage
            .read(&["date", "v"], &AlwaysTrue, &AlwaysTrue, 7, 3)
            .await
            .unwrap(),
    );
    let mut values: Vec<i32> = rows.iter().map(|r| r.1).collect();
    values.sort();
    expected.sort();
    assert_eq!(values, expected);
}

#[tokio::test]
async fn test_array_column_roundtrip_through_merge() {
    let dir = tempfile::tempdir().unwrap();
    let options = plain_options(&dir);
    let schema = TableSchema::new(
        vec![
            ColumnCatalog::new("date", DataType::UInt16),
            ColumnCatalog::new("v", DataType::Int32),
            ColumnCatalog::new("tags", DataType::Array(Box::new(DataType::Int64))),
        ],
        "date",
    )
    .unwrap();
    let key = Arc::new(ColumnKeyExpression::new(vec![ColumnCatalog::new(
        "v",
        DataType::Int32,
    )]));
    let storage = MergeTreeStorage::open(options, schema, key, calendar())
        .await
        .unwrap();

    let tags_of = |vs: &[i64]| DataValue::Array(vs.iter().map(|v| DataValue::Int64(*v)).collect());
    let make_block = |rows: &[(i32, Vec<i64>)]| {
        let mut tags = ArrayImpl::new(&DataType::Array(Box::new(DataType::Int64)));
        for (_, t) in rows {
            tags.push(tags_of(t));
        }
        Block::from_columns([
            (
                "date".to_string(),
                ArrayImpl::from(vec![day(2024, 1, 1); rows.len()]),
            ),
            (
                "v".to_string(),
                ArrayImpl::from(rows.iter().map(|r| r.0).collect::<Vec<_>>()),
            ),
            ("tags".to_string(), tags),
        ])
    };

    let sink = storage.write();
    sink.write_block(make_block(&[(3, vec![3, 33]), (1, vec![1])]))
        .await
        .unwrap();
    sink.write_block(make_block(&[(2, vec![]), (4, vec![4, 44, 444])]))
        .await
        .unwrap();
    storage.shutdown().await;
    storage.merge(1, true).await;
    assert_eq!(storage.active_parts().len(), 1);

    let mut streams = storage
        .read(&["v", "tags"], &AlwaysTrue, &AlwaysTrue, 1024, 1)
        .await
        .unwrap();
    let mut got = vec![];
    while let Some(block) = streams[0].next_block().unwrap() {
        let vs = block.by_name("v").unwrap();
        let tags = block.by_name("tags").unwrap();
        for i in 0..block.rows() {
            got.push((vs.get(i), tags.get(i)));
        }
    }
    assert_eq!(
        got,
        vec![
            (DataValue::Int32(1), tags_of(&[1])),
            (DataValue::Int32(2), tags_of(&[])),
            (DataValue::Int32(3), tags_of(&[3, 33])),
            (DataValue::Int32(4), tags_of(&[4, 44, 444])),
        ]
    );

    // Seeking into the part replays the same suffix for arrays too.
    let part = storage.active_parts()[0].clone();
    let columns = vec![
        ColumnCatalog::new("v", DataType::Int32),
        ColumnCatalog::new("tags", DataType::Array(Box::new(DataType::Int64))),
    ];
    let mut reader = PartReader::new(
        part.clone(),
        &plain_options(&dir).path,
        columns,
        1,
        usize::MAX,
        1024,
        2,
    );
    let block = reader.next_block().unwrap().unwrap();
    assert_eq!(block.by_name("v").unwrap(), &ArrayImpl::from(vec![3, 4]));
    assert_eq!(block.by_name("tags").unwrap().get(0), tags_of(&[3, 33]));
    assert_eq!(block.by_name("tags").unwrap().get(1), tags_of(&[4, 44, 444]));
}

#[tokio::test]
async fn test_drop_storage_removes_directory() {
    let dir = tempfile::tempdir().unwrap();
    let options = plain_options(&dir);
    let storage = open_plain(options.clone()).await;
    storage
        .write()
        .write_block(plain_block(&[(day(2024, 1, 1), 1)]))
        .await
        .unwrap();
    storage.drop_storage().await.unwrap();
    assert!(!options.path.exists());
}
