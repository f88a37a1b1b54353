//! CSV ledger of harvested records, keyed by the first column.

pub mod merge;
pub mod record;

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub use merge::MergeLedger;
pub use record::{Record, RowPolicy, Schema};

use crate::error::{HarvestError, Result};

/// Where finished tasks go. Implementations batch internally; `flush` forces
/// everything pending to disk.
pub trait RecordSink {
    fn record(&mut self, record: Record) -> Result<()>;

    /// A task that could not be harvested. `error` is the text to keep.
    fn failed(&mut self, key: &str, error: &str) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

/// Header and rows of an existing ledger, or `None` when the file is missing
/// or empty.
pub(crate) fn read_table(path: &Path) -> Result<Option<(StringRecord, Vec<StringRecord>)>> {
    match fs::metadata(path) {
        Ok(m) if m.len() > 0 => {}
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut reader = ReaderBuilder::new().flexible(true).from_path(path)?;
    let header = reader.headers()?.clone();
    let rows = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Some((header, rows)))
}

/// Replace `path` with `header` plus `rows` through a sibling temp file and
/// a rename, so readers never see a half-written table.
pub(crate) fn write_table_atomic<I>(path: &Path, header: &[String], rows: I) -> Result<()>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = WriterBuilder::new().from_writer(tmp.as_file());
        writer.write_record(header)?;
        for row in rows {
            writer.write_record(&row)?;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| HarvestError::Io(e.error))?;
    Ok(())
}

/// Rewrite a ledger whose header differs from `schema`: columns are matched
/// by name, unknown ones dropped and new ones left empty. Returns whether
/// the file changed.
pub fn migrate(path: &Path, schema: &Schema) -> Result<bool> {
    let Some((header, rows)) = read_table(path)? else {
        return Ok(false);
    };
    if schema.matches_header(&header) {
        return Ok(false);
    }
    if header.get(0) != Some(schema.key()) {
        warn!(
            "Ledger key column changes from {:?} to {:?}",
            header.get(0).unwrap_or(""),
            schema.key()
        );
    }
    let remapped = rows
        .iter()
        .map(|row| Record::from_row(&header, row).to_row(schema));
    write_table_atomic(path, schema.fields(), remapped)?;
    info!(
        "Migrated {} from {} to {} columns",
        path.display(),
        header.len(),
        schema.fields().len()
    );
    Ok(true)
}

/// Make sure appended rows start on a fresh line. A hand-edited file or a
/// write cut short by a crash can end mid-row.
fn terminate_last_line(path: &Path) -> Result<()> {
    let mut file = OpenOptions::new().read(true).append(true).open(path)?;
    if file.seek(SeekFrom::End(0))? == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        warn!("{} does not end with a newline, terminating the last row", path.display());
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Append-only ledger: one row per finished task, written in batches.
pub struct AppendLedger {
    path: PathBuf,
    schema: Schema,
    error_field: Option<String>,
    batch_size: usize,
    pending: Vec<Record>,
    written: usize,
}

impl AppendLedger {
    pub fn open(
        path: &Path,
        schema: Schema,
        error_field: Option<String>,
        batch_size: usize,
    ) -> Result<Self> {
        if read_table(path)?.is_none() {
            write_table_atomic(path, schema.fields(), std::iter::empty())?;
            debug!("Wrote ledger header to {}", path.display());
        } else if !migrate(path, &schema)? {
            terminate_last_line(path)?;
        }
        Ok(AppendLedger {
            path: path.to_path_buf(),
            schema,
            error_field,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            written: 0,
        })
    }

    /// Keys already on disk. Used to resume an interrupted run.
    pub fn existing_keys(&self) -> Result<HashSet<String>> {
        let Some((_, rows)) = read_table(&self.path)? else {
            return Ok(HashSet::new());
        };
        Ok(rows
            .iter()
            .filter_map(|r| r.get(0))
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect())
    }

    fn push(&mut self, record: Record) -> Result<()> {
        self.pending.push(record);
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }
}

impl RecordSink for AppendLedger {
    fn record(&mut self, record: Record) -> Result<()> {
        self.push(record)
    }

    fn failed(&mut self, key: &str, error: &str) -> Result<()> {
        let mut rec = Record::new(key);
        if let Some(field) = &self.error_field {
            rec.set(field.as_str(), error);
        }
        self.push(rec)
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        for rec in &self.pending {
            writer.write_record(rec.to_row(&self.schema))?;
        }
        writer.flush()?;
        self.written += self.pending.len();
        info!(
            "Wrote batch of {} rows to {} ({} this run)",
            self.pending.len(),
            self.path.display(),
            self.written
        );
        self.pending.clear();
        Ok(())
    }
}

/// Task ids from the first column of an input CSV. Blank rows are ignored.
pub fn load_task_ids(path: &Path, has_headers: bool) -> Result<Vec<String>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .from_path(path)?;
    let mut ids = Vec::new();
    for row in reader.records() {
        let row = row?;
        if let Some(id) = row.get(0).map(str::trim).filter(|s| !s.is_empty()) {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

/// Drop ids before `start`. When `start` is not in the list nothing is left.
pub fn start_from(ids: Vec<String>, start: Option<&str>) -> Vec<String> {
    match start {
        None => ids,
        Some(start) => ids.into_iter().skip_while(|id| id != start).collect(),
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub rows: usize,
    pub complete: usize,
    pub incomplete: usize,
    pub terminal: usize,
}

pub fn stats(path: &Path, schema: &Schema, policy: &RowPolicy) -> Result<LedgerStats> {
    let mut s = LedgerStats::default();
    let Some((header, rows)) = read_table(path)? else {
        return Ok(s);
    };
    if !schema.matches_header(&header) {
        warn!("{} has a different header than configured; counting by name", path.display());
    }
    for row in &rows {
        let rec = Record::from_row(&header, row);
        s.rows += 1;
        if policy.is_terminal(&rec) {
            s.terminal += 1;
        } else if policy.missing(&rec).is_empty() {
            s.complete += 1;
        } else {
            s.incomplete += 1;
        }
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerSettings;

    fn schema() -> Schema {
        Schema::new(vec!["ReservationID".into(), "BillingInfo".into()]).unwrap()
    }

    #[test]
    fn append_writes_header_once_and_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let mut ledger = AppendLedger::open(&path, schema(), Some("BillingInfo".into()), 2).unwrap();
        ledger.record(Record::new("1").with("BillingInfo", "Tariff:100")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "ReservationID,BillingInfo\n");

        ledger.failed("2", "Error: timed out").unwrap();
        ledger.record(Record::new("3")).unwrap();
        ledger.flush().unwrap();

        let reopened = AppendLedger::open(&path, schema(), None, 2).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "ReservationID,BillingInfo\n1,Tariff:100\n2,Error: timed out\n3,\n"
        );
        let keys = reopened.existing_keys().unwrap();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains("2"));
    }

    #[test]
    fn unterminated_last_row_is_not_glued_to_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "ReservationID,BillingInfo\n1,x").unwrap();

        let mut ledger = AppendLedger::open(&path, schema(), None, 1).unwrap();
        ledger.record(Record::new("2").with("BillingInfo", "y")).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "ReservationID,BillingInfo\n1,x\n2,y\n"
        );
        let keys = ledger.existing_keys().unwrap();
        assert!(keys.contains("1") && keys.contains("2"));

        // a well-formed file is left alone
        AppendLedger::open(&path, schema(), None, 1).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "ReservationID,BillingInfo\n1,x\n2,y\n"
        );
    }

    #[test]
    fn quoted_values_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut ledger = AppendLedger::open(&path, schema(), None, 1).unwrap();
        ledger
            .record(Record::new("9").with("BillingInfo", "\"a,b c\""))
            .unwrap();
        let (_, rows) = read_table(&path).unwrap().unwrap();
        assert_eq!(rows[0].get(1), Some("\"a,b c\""));
    }

    #[test]
    fn migration_remaps_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "ReservationID,Old,BillingInfo\n7,x,paid\n").unwrap();

        let schema = Schema::new(vec![
            "ReservationID".into(),
            "BillingInfo".into(),
            "Status".into(),
        ])
        .unwrap();
        assert!(migrate(&path, &schema).unwrap());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "ReservationID,BillingInfo,Status\n7,paid,\n"
        );
        assert!(!migrate(&path, &schema).unwrap());
    }

    #[test]
    fn input_ids_skip_blank_rows_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.csv");
        fs::write(&path, "ReservationId,Guest\n101,A\n\n 102 ,B\n,\n103\n").unwrap();
        assert_eq!(load_task_ids(&path, true).unwrap(), vec!["101", "102", "103"]);
        assert_eq!(load_task_ids(&path, false).unwrap()[0], "ReservationId");
    }

    #[test]
    fn start_marker_drops_earlier_ids() {
        let ids: Vec<String> = ["1", "2", "3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(start_from(ids.clone(), Some("2")), vec!["2", "3"]);
        assert!(start_from(ids.clone(), Some("9")).is_empty());
        assert_eq!(start_from(ids, None).len(), 3);
    }

    #[test]
    fn stats_classify_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(
            &path,
            "ReservationId,ResStatus,ItemizedBill\n1,Confirmed,x\n2,Confirmed,\n3,Cancelled,\n",
        )
        .unwrap();
        let schema = Schema::new(vec![
            "ReservationId".into(),
            "ResStatus".into(),
            "ItemizedBill".into(),
        ])
        .unwrap();
        let policy = RowPolicy::new(&schema, &LedgerSettings::default());
        assert_eq!(
            stats(&path, &schema, &policy).unwrap(),
            LedgerStats {
                rows: 3,
                complete: 1,
                incomplete: 1,
                terminal: 1
            }
        );
    }
}
