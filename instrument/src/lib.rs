//! Event tables for the housing market engine.
//!
//! The engine emits `tracing` events with a target per table (`transaction`,
//! `bid_up`, `clearing`, `tenancy`, `market_stats`). [`MarketLogSubscriber`]
//! turns each event into one row of the table named by its target; the
//! tables convert to polars DataFrames for analysis or parquet export.
//!
//! ```ignore
//! let (report, log) = instrument::capture(|| world.clear_sale_market(&mut rng, &mut ledger, &mut stats));
//! let sales = log.dataframe("transaction")?;
//! let by_quality = instrument::transaction_summary(&sales)?;
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Record};
use tracing::{Event, Id, Metadata, Subscriber};

// ============================================================================
// Tables
// ============================================================================

/// One column. Rows that lack the field hold the type's zero value.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    U64(Vec<u64>),
    I64(Vec<i64>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

/// A single field value of one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U64(u64),
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(String),
}

impl Values {
    fn empty_like(value: &Value, rows: usize) -> Self {
        match value {
            Value::U64(_) => Values::U64(vec![0; rows]),
            Value::I64(_) => Values::I64(vec![0; rows]),
            Value::F64(_) => Values::F64(vec![0.0; rows]),
            Value::Bool(_) => Values::Bool(vec![false; rows]),
            Value::Str(_) => Values::Str(vec![String::new(); rows]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Values::U64(v) => v.len(),
            Values::I64(v) => v.len(),
            Values::F64(v) => v.len(),
            Values::Bool(v) => v.len(),
            Values::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `value`, or a zero if it has the wrong type or is absent.
    fn push(&mut self, value: Option<Value>) {
        match (self, value) {
            (Values::U64(v), Some(Value::U64(x))) => v.push(x),
            (Values::I64(v), Some(Value::I64(x))) => v.push(x),
            (Values::F64(v), Some(Value::F64(x))) => v.push(x),
            (Values::Bool(v), Some(Value::Bool(x))) => v.push(x),
            (Values::Str(v), Some(Value::Str(x))) => v.push(x),
            (Values::U64(v), _) => v.push(0),
            (Values::I64(v), _) => v.push(0),
            (Values::F64(v), _) => v.push(0.0),
            (Values::Bool(v), _) => v.push(false),
            (Values::Str(v), _) => v.push(String::new()),
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            Values::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<&[u64]> {
        match self {
            Values::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&[String]> {
        match self {
            Values::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// Rows of one event target. The schema grows with the fields seen.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: BTreeMap<String, Values>,
    pub rows: usize,
}

impl Table {
    pub fn push_row(&mut self, mut fields: BTreeMap<String, Value>) {
        for (name, column) in self.columns.iter_mut() {
            column.push(fields.remove(name));
        }
        // Fields seen for the first time
        for (name, value) in fields {
            let mut column = Values::empty_like(&value, self.rows);
            column.push(Some(value));
            self.columns.insert(name, column);
        }
        self.rows += 1;
    }

    pub fn column(&self, name: &str) -> Option<&Values> {
        self.columns.get(name)
    }

    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let columns = self
            .columns
            .iter()
            .map(|(name, values)| match values {
                Values::U64(v) => Column::new(name.into(), v),
                Values::I64(v) => Column::new(name.into(), v),
                Values::F64(v) => Column::new(name.into(), v),
                Values::Bool(v) => Column::new(name.into(), v),
                Values::Str(v) => Column::new(name.into(), v),
            })
            .collect();
        DataFrame::new(columns)
    }
}

/// All tables recorded on this thread, keyed by event target.
#[derive(Debug, Clone, Default)]
pub struct MarketLog {
    pub tables: BTreeMap<String, Table>,
}

impl MarketLog {
    pub fn table(&self, target: &str) -> Option<&Table> {
        self.tables.get(target)
    }

    pub fn rows(&self, target: &str) -> usize {
        self.tables.get(target).map_or(0, |t| t.rows)
    }

    pub fn dataframe(&self, target: &str) -> PolarsResult<DataFrame> {
        self.tables
            .get(target)
            .ok_or_else(|| PolarsError::NoData(format!("no `{target}` events recorded").into()))?
            .to_dataframe()
    }

    pub fn dataframes(&self) -> PolarsResult<BTreeMap<String, DataFrame>> {
        self.tables
            .iter()
            .map(|(name, table)| Ok((name.clone(), table.to_dataframe()?)))
            .collect()
    }

    /// Write every table to `{dir}/{target}.parquet`.
    pub fn write_parquet(&self, dir: &Path) -> PolarsResult<()> {
        std::fs::create_dir_all(dir).map_err(io_error)?;
        for (name, mut df) in self.dataframes()? {
            let file =
                std::fs::File::create(dir.join(format!("{name}.parquet"))).map_err(io_error)?;
            ParquetWriter::new(file).finish(&mut df)?;
        }
        Ok(())
    }
}

fn io_error(e: std::io::Error) -> PolarsError {
    PolarsError::IO {
        error: e.into(),
        msg: None,
    }
}

thread_local! {
    static LOG: RefCell<MarketLog> = RefCell::default();
}

// ============================================================================
// Subscriber
// ============================================================================

#[derive(Default)]
struct RowVisitor {
    fields: BTreeMap<String, Value>,
}

impl RowVisitor {
    fn set(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for RowVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.set(field, Value::U64(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.set(field, Value::I64(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.set(field, Value::F64(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.set(field, Value::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field, Value::Str(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.set(field, Value::Str(format!("{value:?}")));
    }
}

/// Records info-level events into the thread-local [`MarketLog`]. Spans are ignored.
pub struct MarketLogSubscriber;

impl Subscriber for MarketLogSubscriber {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.is_event() && *metadata.level() <= tracing::Level::INFO
    }

    fn new_span(&self, _span: &Attributes<'_>) -> Id {
        Id::from_u64(1)
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut visitor = RowVisitor::default();
        event.record(&mut visitor);
        let target = event.metadata().target().to_string();
        LOG.with(|log| {
            log.borrow_mut()
                .tables
                .entry(target)
                .or_default()
                .push_row(visitor.fields)
        });
    }

    fn enter(&self, _span: &Id) {}

    fn exit(&self, _span: &Id) {}
}

/// Install [`MarketLogSubscriber`] globally. Later calls are no-ops.
pub fn install_subscriber() {
    let _ = tracing::subscriber::set_global_default(MarketLogSubscriber);
}

/// Take everything recorded on this thread so far.
pub fn drain() -> MarketLog {
    LOG.with(|log| std::mem::take(&mut *log.borrow_mut()))
}

pub fn clear() {
    LOG.with(|log| *log.borrow_mut() = MarketLog::default());
}

/// Run `f` with a scoped subscriber and return its result with the events
/// it emitted.
pub fn capture<T>(f: impl FnOnce() -> T) -> (T, MarketLog) {
    let before = drain();
    let out = tracing::subscriber::with_default(MarketLogSubscriber, f);
    let log = drain();
    LOG.with(|l| *l.borrow_mut() = before);
    (out, log)
}

// ============================================================================
// Analysis
// ============================================================================

/// Mean price, sale count and mean bid-ups per market and quality band of a
/// `transaction` table.
pub fn transaction_summary(transactions: &DataFrame) -> PolarsResult<DataFrame> {
    transactions
        .clone()
        .lazy()
        .group_by([col("market"), col("quality")])
        .agg([
            col("price").mean().alias("mean_price"),
            col("price").count().alias("sales"),
            col("bid_ups").mean().alias("mean_bid_ups"),
        ])
        .sort(["market", "quality"], Default::default())
        .collect()
}

/// Writes the log of a run to `{dir}/*.parquet` plus a `_ready` marker when
/// dropped.
pub struct RunRecorder {
    dir: PathBuf,
    log: Option<MarketLog>,
}

impl RunRecorder {
    /// Start recording globally into a fresh log.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        clear();
        install_subscriber();
        Self {
            dir: dir.into(),
            log: None,
        }
    }

    /// Stop collecting and return the log; it is still written on drop.
    pub fn log(&mut self) -> &MarketLog {
        self.log.get_or_insert_with(drain)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for RunRecorder {
    fn drop(&mut self) {
        let log = self.log.take().unwrap_or_else(drain);
        if log.tables.is_empty() {
            return;
        }
        if let Err(e) = log.write_parquet(&self.dir) {
            eprintln!("RunRecorder({}): parquet export failed: {e}", self.dir.display());
            return;
        }
        if let Err(e) = std::fs::File::create(self.dir.join("_ready")) {
            eprintln!("RunRecorder({}): could not write _ready: {e}", self.dir.display());
        }
    }
}
