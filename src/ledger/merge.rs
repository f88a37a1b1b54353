use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::record::{Record, RowPolicy, Schema};
use super::{migrate, read_table, write_table_atomic, RecordSink};
use crate::error::Result;

/// What an update pass has to do for a list of input ids.
#[derive(Debug, Default)]
pub struct MergePlan {
    /// Ids to harvest, with the stored row when there is one.
    pub pending: Vec<(String, Option<Record>)>,
    /// Terminal rows copied forward untouched.
    pub carried: Vec<String>,
    pub complete: usize,
}

/// In-place update of an existing ledger. The whole table is kept in memory
/// and committed by rewriting the file atomically.
pub struct MergeLedger {
    path: PathBuf,
    schema: Schema,
    policy: RowPolicy,
    rows: Vec<Record>,
    index: HashMap<String, usize>,
    batch_size: usize,
    uncommitted: usize,
}

impl MergeLedger {
    pub fn open(path: &Path, schema: Schema, policy: RowPolicy, batch_size: usize) -> Result<Self> {
        migrate(path, &schema)?;

        let mut rows: Vec<Record> = Vec::new();
        let mut index = HashMap::new();
        if let Some((header, raw)) = read_table(path)? {
            let mut collapsed = 0;
            for row in &raw {
                let rec = Record::from_row(&header, row);
                if rec.key().is_empty() {
                    continue;
                }
                match index.get(rec.key()) {
                    Some(&i) => {
                        let first: &mut Record = &mut rows[i];
                        first.fill_from(&rec);
                        collapsed += 1;
                    }
                    None => {
                        index.insert(rec.key().to_string(), rows.len());
                        rows.push(rec);
                    }
                }
            }
            if collapsed > 0 {
                warn!("Collapsed {} duplicate rows in {}", collapsed, path.display());
            }
        }
        info!("Loaded {} rows from {}", rows.len(), path.display());

        Ok(MergeLedger {
            path: path.to_path_buf(),
            schema,
            policy,
            rows,
            index,
            batch_size: batch_size.max(1),
            uncommitted: 0,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.index.get(key).map(|&i| &self.rows[i])
    }

    /// Split `ids` into work to do, terminal rows to carry and rows that are
    /// already complete. Duplicate ids are planned once.
    pub fn plan(&self, ids: &[String]) -> MergePlan {
        let mut plan = MergePlan::default();
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.get(id) {
                None => plan.pending.push((id.clone(), None)),
                Some(rec) if self.policy.is_terminal(rec) => {
                    debug!("Carrying terminal row {}", id);
                    plan.carried.push(id.clone());
                }
                Some(rec) => {
                    let missing = self.policy.missing(rec);
                    if missing.is_empty() {
                        plan.complete += 1;
                    } else {
                        debug!("Row {} missing {:?}", id, missing);
                        plan.pending.push((id.clone(), Some(rec.clone())));
                    }
                }
            }
        }
        info!(
            "{} rows to update, {} terminal rows carried, {} complete",
            plan.pending.len(),
            plan.carried.len(),
            plan.complete
        );
        plan
    }

    /// Write the full table through a temp file and rename.
    pub fn commit(&mut self) -> Result<()> {
        let schema = &self.schema;
        write_table_atomic(
            &self.path,
            schema.fields(),
            self.rows.iter().map(|r| r.to_row(schema)),
        )?;
        debug!("Committed {} rows to {}", self.rows.len(), self.path.display());
        self.uncommitted = 0;
        Ok(())
    }
}

impl RecordSink for MergeLedger {
    fn record(&mut self, record: Record) -> Result<()> {
        match self.index.get(record.key()) {
            Some(&i) => {
                let filled = self.rows[i].fill_from(&record);
                debug!("Filled {} fields of {}", filled, record.key());
            }
            None => {
                self.index.insert(record.key().to_string(), self.rows.len());
                self.rows.push(record);
            }
        }
        self.uncommitted += 1;
        if self.uncommitted >= self.batch_size {
            self.commit()?;
        }
        Ok(())
    }

    fn failed(&mut self, key: &str, error: &str) -> Result<()> {
        warn!("Keeping stored row for {} after failed update: {}", key, error);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.commit()
    }
}
