//! Gap-aware coverage tracking. Every fetched range is recorded per
//! `(data_type, sub_key)`; ranges merge on insert so that, after any
//! sequence of writes, `find_gaps` answers with the exact complement of
//! the recorded union inside the queried window.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::warn;

use super::SymbolStore;
use crate::error::Result;
use crate::types::DataType;

/// Two ranges closer than this merge into one (millisecond timeline).
const ADJACENCY_MS: i64 = 1;

/// Above this many overlapping rows for one query window the ledger is
/// considered fragmented and gets consolidated before answering.
const FRAGMENTATION_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRange {
    pub data_type: String,
    pub sub_key: String,
    pub range_start: i64,
    pub range_end: i64,
    pub is_complete: bool,
}

impl SymbolStore {
    /// Record that `[start, end]` is present locally, merging with every
    /// existing range that overlaps or sits within 1ms of either endpoint.
    /// The merged range is complete only if all merged inputs were.
    pub async fn add_coverage(
        &self,
        data_type: DataType,
        sub_key: &str,
        start: i64,
        end: i64,
        is_complete: bool,
    ) -> Result<()> {
        debug_assert!(start <= end);
        let mut tx = self.pool().begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, range_start, range_end, is_complete
            FROM data_coverage
            WHERE data_type = ? AND sub_key = ?
              AND range_start <= ? AND range_end >= ?
            "#,
        )
        .bind(data_type.table_key())
        .bind(sub_key)
        .bind(end + ADJACENCY_MS)
        .bind(start - ADJACENCY_MS)
        .fetch_all(&mut *tx)
        .await?;

        let mut merged_start = start;
        let mut merged_end = end;
        let mut merged_complete = is_complete;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            ids.push(row.get::<i64, _>("id"));
            merged_start = merged_start.min(row.get::<i64, _>("range_start"));
            merged_end = merged_end.max(row.get::<i64, _>("range_end"));
            merged_complete = merged_complete && row.get::<i64, _>("is_complete") == 1;
        }

        for id in ids {
            sqlx::query("DELETE FROM data_coverage WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO data_coverage
                (data_type, sub_key, range_start, range_end, is_complete, last_updated)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(data_type.table_key())
        .bind(sub_key)
        .bind(merged_start)
        .bind(merged_end)
        .bind(if merged_complete { 1 } else { 0 })
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Minimal disjoint list of uncovered sub-ranges inside `[start, end]`.
    pub async fn find_gaps(
        &self,
        data_type: DataType,
        sub_key: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<(i64, i64)>> {
        if start > end {
            return Ok(Vec::new());
        }
        let mut ranges = self
            .overlapping_ranges(data_type, sub_key, start, end)
            .await?;

        if ranges.len() > FRAGMENTATION_LIMIT {
            warn!(
                "{} coverage rows overlap [{start}, {end}] for {}/{sub_key}; consolidating",
                ranges.len(),
                data_type
            );
            self.consolidate(data_type, sub_key).await?;
            ranges = self
                .overlapping_ranges(data_type, sub_key, start, end)
                .await?;
        }

        let mut gaps = Vec::new();
        let mut cursor = start;
        for (range_start, range_end) in ranges {
            if range_start > cursor {
                gaps.push((cursor, range_start - 1));
            }
            cursor = cursor.max(range_end + 1);
            if cursor > end {
                break;
            }
        }
        if cursor <= end {
            gaps.push((cursor, end));
        }
        Ok(gaps)
    }

    pub async fn is_fully_covered(
        &self,
        data_type: DataType,
        sub_key: &str,
        start: i64,
        end: i64,
    ) -> Result<bool> {
        Ok(self.find_gaps(data_type, sub_key, start, end).await?.is_empty())
    }

    /// Rewrite all ranges for one `(data_type, sub_key)` into the
    /// canonical non-overlapping minimal cover.
    pub async fn consolidate(&self, data_type: DataType, sub_key: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT range_start, range_end, is_complete
            FROM data_coverage
            WHERE data_type = ? AND sub_key = ?
            ORDER BY range_start ASC
            "#,
        )
        .bind(data_type.table_key())
        .bind(sub_key)
        .fetch_all(&mut *tx)
        .await?;

        let mut merged: Vec<(i64, i64, bool)> = Vec::new();
        for row in rows {
            let (s, e, complete) = (
                row.get::<i64, _>("range_start"),
                row.get::<i64, _>("range_end"),
                row.get::<i64, _>("is_complete") == 1,
            );
            match merged.last_mut() {
                Some(last) if s <= last.1 + ADJACENCY_MS => {
                    last.1 = last.1.max(e);
                    last.2 = last.2 && complete;
                }
                _ => merged.push((s, e, complete)),
            }
        }

        sqlx::query("DELETE FROM data_coverage WHERE data_type = ? AND sub_key = ?")
            .bind(data_type.table_key())
            .bind(sub_key)
            .execute(&mut *tx)
            .await?;

        let now = Utc::now().to_rfc3339();
        for (s, e, complete) in merged {
            sqlx::query(
                r#"
                INSERT INTO data_coverage
                    (data_type, sub_key, range_start, range_end, is_complete, last_updated)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(data_type.table_key())
            .bind(sub_key)
            .bind(s)
            .bind(e)
            .bind(if complete { 1 } else { 0 })
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Drop incomplete ranges overlapping `[start, end]` so the fetcher
    /// re-requests intervals that were recorded while still in progress.
    pub async fn prune_incomplete(
        &self,
        data_type: DataType,
        sub_key: &str,
        start: i64,
        end: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM data_coverage
            WHERE data_type = ? AND sub_key = ? AND is_complete = 0
              AND range_start <= ? AND range_end >= ?
            "#,
        )
        .bind(data_type.table_key())
        .bind(sub_key)
        .bind(end)
        .bind(start)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// All recorded ranges for a key, ascending; `data_type = None` lists
    /// the whole ledger (CLI coverage report).
    pub async fn coverage_ranges(
        &self,
        data_type: Option<DataType>,
    ) -> Result<Vec<CoverageRange>> {
        let rows = match data_type {
            Some(dt) => {
                sqlx::query(
                    r#"
                    SELECT data_type, sub_key, range_start, range_end, is_complete
                    FROM data_coverage WHERE data_type = ?
                    ORDER BY data_type, sub_key, range_start
                    "#,
                )
                .bind(dt.table_key())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT data_type, sub_key, range_start, range_end, is_complete
                    FROM data_coverage
                    ORDER BY data_type, sub_key, range_start
                    "#,
                )
                .fetch_all(self.pool())
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|row| CoverageRange {
                data_type: row.get("data_type"),
                sub_key: row.get("sub_key"),
                range_start: row.get("range_start"),
                range_end: row.get("range_end"),
                is_complete: row.get::<i64, _>("is_complete") == 1,
            })
            .collect())
    }

    async fn overlapping_ranges(
        &self,
        data_type: DataType,
        sub_key: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT range_start, range_end
            FROM data_coverage
            WHERE data_type = ? AND sub_key = ?
              AND range_start <= ? AND range_end >= ?
            ORDER BY range_start ASC
            "#,
        )
        .bind(data_type.table_key())
        .bind(sub_key)
        .bind(end)
        .bind(start)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("range_start"), row.get("range_end")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: DataType = DataType::Candles;
    const KEY: &str = "1h:spot";

    async fn store() -> SymbolStore {
        SymbolStore::open_in_memory("BTCUSDT").await.unwrap()
    }

    #[tokio::test]
    async fn single_range_complement() {
        let s = store().await;
        s.add_coverage(DT, KEY, 100, 200, true).await.unwrap();

        let gaps = s.find_gaps(DT, KEY, 0, 300).await.unwrap();
        assert_eq!(gaps, vec![(0, 99), (201, 300)]);
        assert!(s.is_fully_covered(DT, KEY, 100, 200).await.unwrap());
        assert!(!s.is_fully_covered(DT, KEY, 100, 201).await.unwrap());
    }

    #[tokio::test]
    async fn adjacent_ranges_merge_within_one_ms() {
        let s = store().await;
        s.add_coverage(DT, KEY, 0, 100, true).await.unwrap();
        s.add_coverage(DT, KEY, 101, 200, true).await.unwrap();

        let ranges = s.coverage_ranges(Some(DT)).await.unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].range_start, ranges[0].range_end), (0, 200));

        // Two ms apart: stays separate.
        s.add_coverage(DT, KEY, 203, 300, true).await.unwrap();
        let ranges = s.coverage_ranges(Some(DT)).await.unwrap();
        assert_eq!(ranges.len(), 2);
    }

    #[tokio::test]
    async fn merge_bridges_multiple_ranges() {
        let s = store().await;
        s.add_coverage(DT, KEY, 0, 100, true).await.unwrap();
        s.add_coverage(DT, KEY, 300, 400, true).await.unwrap();
        s.add_coverage(DT, KEY, 50, 350, true).await.unwrap();

        let ranges = s.coverage_ranges(Some(DT)).await.unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].range_start, ranges[0].range_end), (0, 400));
        assert!(ranges[0].is_complete);
    }

    #[tokio::test]
    async fn merge_keeps_weakest_completeness() {
        let s = store().await;
        s.add_coverage(DT, KEY, 0, 100, true).await.unwrap();
        s.add_coverage(DT, KEY, 90, 200, false).await.unwrap();

        let ranges = s.coverage_ranges(Some(DT)).await.unwrap();
        assert_eq!(ranges.len(), 1);
        assert!(!ranges[0].is_complete);
    }

    #[tokio::test]
    async fn gap_complement_invariant_random_order() {
        let s = store().await;
        // Insert in shuffled order; union is [10,19] ∪ [30,59] ∪ [80,80].
        s.add_coverage(DT, KEY, 40, 59, true).await.unwrap();
        s.add_coverage(DT, KEY, 10, 19, true).await.unwrap();
        s.add_coverage(DT, KEY, 80, 80, true).await.unwrap();
        s.add_coverage(DT, KEY, 30, 45, true).await.unwrap();

        let gaps = s.find_gaps(DT, KEY, 0, 100).await.unwrap();
        assert_eq!(gaps, vec![(0, 9), (20, 29), (60, 79), (81, 100)]);
    }

    #[tokio::test]
    async fn sub_keys_are_independent() {
        let s = store().await;
        s.add_coverage(DT, "1h:spot", 0, 100, true).await.unwrap();
        s.add_coverage(DT, "1m:spot", 500, 600, true).await.unwrap();

        assert_eq!(
            s.find_gaps(DT, "1h:spot", 0, 100).await.unwrap(),
            Vec::<(i64, i64)>::new()
        );
        assert_eq!(
            s.find_gaps(DT, "1m:spot", 0, 100).await.unwrap(),
            vec![(0, 100)]
        );
    }

    #[tokio::test]
    async fn consolidate_rewrites_minimal_cover() {
        let s = store().await;
        // Bypass merge-on-insert by writing raw rows.
        for i in 0..10i64 {
            sqlx::query(
                r#"
                INSERT INTO data_coverage
                    (data_type, sub_key, range_start, range_end, is_complete, last_updated)
                VALUES (?, ?, ?, ?, 1, '')
                "#,
            )
            .bind(DT.table_key())
            .bind(KEY)
            .bind(i * 10)
            .bind(i * 10 + 10)
            .execute(s.pool())
            .await
            .unwrap();
        }

        s.consolidate(DT, KEY).await.unwrap();
        let ranges = s.coverage_ranges(Some(DT)).await.unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].range_start, ranges[0].range_end), (0, 100));
    }

    #[tokio::test]
    async fn prune_incomplete_reopens_in_progress_ranges() {
        let s = store().await;
        s.add_coverage(DT, KEY, 0, 100, true).await.unwrap();
        s.add_coverage(DT, KEY, 200, 300, false).await.unwrap();

        s.prune_incomplete(DT, KEY, 0, 400).await.unwrap();
        let gaps = s.find_gaps(DT, KEY, 0, 400).await.unwrap();
        assert_eq!(gaps, vec![(101, 400)]);
    }
}
