use std::fs::File;
use std::path::Path;

use arrow_array::{Array, Int64Array, RecordBatch, StringArray, TimestampMillisecondArray};
use arrow_cast::cast;
use arrow_schema::{DataType, TimeUnit};
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Serialize;
use tracing::{info, warn};

use super::models::{parse_result, Market, RecordViolation, Trade};
use super::{DatasetError, DatasetLayout, Table};

/// Violations kept per table in the report; the total is always counted.
const MAX_REPORTED_VIOLATIONS: usize = 20;
const READ_BATCH_SIZE: usize = 8_192;

#[derive(Clone, Debug, Serialize)]
pub struct ViolationRecord {
    /// Ticker or trade id of the offending row.
    pub key: String,
    pub violation: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct TableCheck {
    pub table: String,
    pub partitions: usize,
    pub rows_checked: usize,
    pub violation_count: usize,
    pub violations: Vec<ViolationRecord>,
}

impl TableCheck {
    fn new(table: Table, partitions: usize) -> Self {
        Self {
            table: table.to_string(),
            partitions,
            rows_checked: 0,
            violation_count: 0,
            violations: Vec::new(),
        }
    }

    fn record(&mut self, key: &str, outcome: Result<(), RecordViolation>) {
        self.rows_checked += 1;
        if let Err(v) = outcome {
            self.violation_count += 1;
            if self.violations.len() < MAX_REPORTED_VIOLATIONS {
                self.violations.push(ViolationRecord {
                    key: key.to_string(),
                    violation: v.to_string(),
                });
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    pub markets: TableCheck,
    pub trades: TableCheck,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.markets.violation_count == 0 && self.trades.violation_count == 0
    }
}

/// Check record invariants on up to `sample` rows of each table.
///
/// Rows are read in partition order, so the same dataset always yields the same sample.
pub fn verify(layout: &DatasetLayout, sample: usize) -> Result<VerifyReport, DatasetError> {
    let market_files = layout.partitions(Table::Markets)?;
    let mut markets = TableCheck::new(Table::Markets, market_files.len());
    for_each_batch(&market_files, sample, |batch, limit| {
        for (row, key) in decode_markets(batch, limit)? {
            markets.record(&key, row.and_then(|m| m.check()));
        }
        Ok(())
    })?;

    let trade_files = layout.partitions(Table::Trades)?;
    let mut trades = TableCheck::new(Table::Trades, trade_files.len());
    for_each_batch(&trade_files, sample, |batch, limit| {
        for (row, key) in decode_trades(batch, limit)? {
            trades.record(&key, row.and_then(|t| t.check()));
        }
        Ok(())
    })?;

    for check in [&markets, &trades] {
        if check.violation_count > 0 {
            warn!(
                target: "dataset",
                table = %check.table,
                rows = check.rows_checked,
                violations = check.violation_count,
                "record invariants violated"
            );
        } else {
            info!(
                target: "dataset",
                table = %check.table,
                partitions = check.partitions,
                rows = check.rows_checked,
                "record invariants hold"
            );
        }
    }

    Ok(VerifyReport { markets, trades })
}

/// Feed record batches from `files`, in order, to `f` until `sample` rows have been handed out.
///
/// `f` receives the batch and the number of its rows it may consume.
fn for_each_batch<F>(files: &[impl AsRef<Path>], sample: usize, mut f: F) -> Result<(), DatasetError>
where
    F: FnMut(&RecordBatch, usize) -> Result<(), DatasetError>,
{
    let mut remaining = sample;
    for path in files {
        if remaining == 0 {
            break;
        }
        let path = path.as_ref();
        let parquet_err = |source| DatasetError::Parquet {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(|source| DatasetError::Io {
            context: format!("opening {}", path.display()),
            source,
        })?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(parquet_err)?
            .with_batch_size(remaining.min(READ_BATCH_SIZE))
            .build()
            .map_err(parquet_err)?;

        for batch in reader {
            if remaining == 0 {
                break;
            }
            let batch = batch?;
            let take = batch.num_rows().min(remaining);
            f(&batch, take)?;
            remaining -= take;
        }
    }
    Ok(())
}

type Decoded<T> = Vec<(Result<T, RecordViolation>, String)>;

fn decode_trades(batch: &RecordBatch, limit: usize) -> Result<Decoded<Trade>, DatasetError> {
    let trade_id = utf8_column(batch, "trade_id")?;
    let ticker = utf8_column(batch, "ticker")?;
    let count = int64_column(batch, "count")?;
    let yes_price = int64_column(batch, "yes_price")?;
    let no_price = int64_column(batch, "no_price")?;
    let taker_side = utf8_column(batch, "taker_side")?;
    let created_time = timestamp_column(batch, "created_time")?;
    let fetched_at = optional(timestamp_column(batch, "_fetched_at"))?;

    let mut rows = Vec::with_capacity(limit);
    for i in 0..limit {
        let key = str_at(&trade_id, i).unwrap_or_default().to_string();
        let row = (|| -> Result<Trade, RecordViolation> {
            Ok(Trade {
                trade_id: required("trade_id", str_at(&trade_id, i))?.to_string(),
                ticker: required("ticker", str_at(&ticker, i))?.to_string(),
                count: required("count", i64_at(&count, i))?,
                yes_price: required("yes_price", i64_at(&yes_price, i))?,
                no_price: required("no_price", i64_at(&no_price, i))?,
                taker_side: required("taker_side", str_at(&taker_side, i))?.parse()?,
                created_time: required("created_time", ts_at(&created_time, i, "created_time")?)?,
                fetched_at: match &fetched_at {
                    Some(col) => ts_at(col, i, "_fetched_at")?,
                    None => None,
                },
            })
        })();
        rows.push((row, key));
    }
    Ok(rows)
}

fn decode_markets(batch: &RecordBatch, limit: usize) -> Result<Decoded<Market>, DatasetError> {
    let ticker = utf8_column(batch, "ticker")?;
    let event_ticker = utf8_column(batch, "event_ticker")?;
    let title = optional(utf8_column(batch, "title"))?;
    let status = utf8_column(batch, "status")?;
    let yes_bid = int64_column(batch, "yes_bid")?;
    let yes_ask = int64_column(batch, "yes_ask")?;
    let no_bid = int64_column(batch, "no_bid")?;
    let no_ask = int64_column(batch, "no_ask")?;
    let last_price = optional(int64_column(batch, "last_price"))?;
    let volume = optional(int64_column(batch, "volume"))?;
    let volume_24h = optional(int64_column(batch, "volume_24h"))?;
    let open_interest = optional(int64_column(batch, "open_interest"))?;
    let result = utf8_column(batch, "result")?;
    let created_time = optional(timestamp_column(batch, "created_time"))?;
    let open_time = optional(timestamp_column(batch, "open_time"))?;
    let close_time = optional(timestamp_column(batch, "close_time"))?;
    let fetched_at = optional(timestamp_column(batch, "_fetched_at"))?;

    let opt_i64 = |col: &Option<Int64Array>, i| col.as_ref().and_then(|c| i64_at(c, i));
    let opt_ts = |col: &Option<TimestampMillisecondArray>, i, field| match col {
        Some(c) => ts_at(c, i, field),
        None => Ok(None),
    };

    let mut rows = Vec::with_capacity(limit);
    for i in 0..limit {
        let key = str_at(&ticker, i).unwrap_or_default().to_string();
        let row = (|| -> Result<Market, RecordViolation> {
            Ok(Market {
                ticker: required("ticker", str_at(&ticker, i))?.to_string(),
                event_ticker: required("event_ticker", str_at(&event_ticker, i))?.to_string(),
                title: title
                    .as_ref()
                    .and_then(|c| str_at(c, i))
                    .unwrap_or_default()
                    .to_string(),
                status: required("status", str_at(&status, i))?.parse()?,
                yes_bid: i64_at(&yes_bid, i),
                yes_ask: i64_at(&yes_ask, i),
                no_bid: i64_at(&no_bid, i),
                no_ask: i64_at(&no_ask, i),
                last_price: opt_i64(&last_price, i),
                volume: opt_i64(&volume, i).unwrap_or(0),
                volume_24h: opt_i64(&volume_24h, i).unwrap_or(0),
                open_interest: opt_i64(&open_interest, i).unwrap_or(0),
                result: parse_result(str_at(&result, i).unwrap_or_default())?,
                created_time: opt_ts(&created_time, i, "created_time")?,
                open_time: opt_ts(&open_time, i, "open_time")?,
                close_time: opt_ts(&close_time, i, "close_time")?,
                fetched_at: opt_ts(&fetched_at, i, "_fetched_at")?,
            })
        })();
        rows.push((row, key));
    }
    Ok(rows)
}

fn required<T>(field: &'static str, value: Option<T>) -> Result<T, RecordViolation> {
    value.ok_or(RecordViolation::MissingValue { field })
}

/// Turn a missing-column error into `None`; other errors pass through.
fn optional<T>(column: Result<T, DatasetError>) -> Result<Option<T>, DatasetError> {
    match column {
        Ok(c) => Ok(Some(c)),
        Err(DatasetError::MissingColumn { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn cast_column(
    batch: &RecordBatch,
    name: &str,
    to: &DataType,
) -> Result<std::sync::Arc<dyn Array>, DatasetError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| DatasetError::MissingColumn {
            column: name.to_string(),
        })?;
    Ok(cast(column.as_ref(), to)?)
}

fn downcast<T: Array + Clone + 'static>(
    array: &dyn Array,
    name: &str,
) -> Result<T, DatasetError> {
    array
        .as_any()
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| DatasetError::Column {
            column: name.to_string(),
            reason: format!("unexpected type {}", array.data_type()),
        })
}

fn int64_column(batch: &RecordBatch, name: &str) -> Result<Int64Array, DatasetError> {
    let array = cast_column(batch, name, &DataType::Int64)?;
    downcast(array.as_ref(), name)
}

fn utf8_column(batch: &RecordBatch, name: &str) -> Result<StringArray, DatasetError> {
    let array = cast_column(batch, name, &DataType::Utf8)?;
    downcast(array.as_ref(), name)
}

fn timestamp_column(
    batch: &RecordBatch,
    name: &str,
) -> Result<TimestampMillisecondArray, DatasetError> {
    let array = cast_column(
        batch,
        name,
        &DataType::Timestamp(TimeUnit::Millisecond, None),
    )?;
    downcast(array.as_ref(), name)
}

fn str_at(col: &StringArray, i: usize) -> Option<&str> {
    col.is_valid(i).then(|| col.value(i))
}

fn i64_at(col: &Int64Array, i: usize) -> Option<i64> {
    col.is_valid(i).then(|| col.value(i))
}

fn ts_at(
    col: &TimestampMillisecondArray,
    i: usize,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, RecordViolation> {
    if !col.is_valid(i) {
        return Ok(None);
    }
    let millis = col.value(i);
    DateTime::from_timestamp_millis(millis)
        .map(Some)
        .ok_or(RecordViolation::BadTimestamp {
            field,
            value: millis,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow_array::Int32Array;
    use arrow_schema::{Field, Schema};

    fn trades_batch() -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("trade_id", DataType::Utf8, false),
            Field::new("ticker", DataType::Utf8, false),
            Field::new("count", DataType::Int32, false),
            Field::new("yes_price", DataType::Int32, false),
            Field::new("no_price", DataType::Int32, true),
            Field::new("taker_side", DataType::Utf8, false),
            Field::new(
                "created_time",
                DataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec!["a", "b", "c"])),
                Arc::new(StringArray::from(vec!["T1", "T1", "T2"])),
                Arc::new(Int32Array::from(vec![5, 1, 3])),
                Arc::new(Int32Array::from(vec![40, 55, 12])),
                Arc::new(Int32Array::from(vec![Some(60), Some(44), None])),
                Arc::new(StringArray::from(vec!["yes", "no", "yes"])),
                Arc::new(arrow_array::TimestampMicrosecondArray::from(vec![
                    1_700_000_000_000_000i64,
                    1_700_000_001_000_000,
                    1_700_000_002_000_000,
                ])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn decodes_trades_with_widened_types() {
        let rows = decode_trades(&trades_batch(), 3).unwrap();
        assert_eq!(rows.len(), 3);

        let (first, key) = &rows[0];
        assert_eq!(key, "a");
        let first = first.as_ref().unwrap();
        assert_eq!(first.yes_price + first.no_price, 100);
        assert_eq!(first.created_time.timestamp(), 1_700_000_000);
        assert!(first.fetched_at.is_none());

        let (second, _) = &rows[1];
        assert!(matches!(
            second.as_ref().unwrap().check(),
            Err(RecordViolation::PriceSum { yes: 55, no: 44 })
        ));

        let (third, _) = &rows[2];
        assert_eq!(
            third.as_ref().unwrap_err(),
            &RecordViolation::MissingValue { field: "no_price" }
        );
    }

    #[test]
    fn optional_only_absorbs_missing_columns() {
        let batch = trades_batch();
        assert!(optional(utf8_column(&batch, "_fetched_at")).unwrap().is_none());
        assert!(optional(utf8_column(&batch, "ticker")).unwrap().is_some());

        let wrong_type = optional(Err::<StringArray, _>(DatasetError::Column {
            column: "missing".to_string(),
            reason: "missing".to_string(),
        }));
        assert!(matches!(wrong_type, Err(DatasetError::Column { .. })));
    }

    #[test]
    fn decode_respects_limit() {
        let rows = decode_trades(&trades_batch(), 1).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn missing_required_column_is_an_error() {
        let batch = trades_batch();
        let err = decode_markets(&batch, 1).unwrap_err();
        assert!(matches!(err, DatasetError::MissingColumn { ref column } if column == "event_ticker"));
    }
}
