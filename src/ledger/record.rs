use std::collections::{HashMap, HashSet};

use csv::StringRecord;

use crate::config::LedgerSettings;
use crate::error::{HarvestError, Result};

/// Ordered ledger header. The first field is the record key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<String>,
}

impl Schema {
    pub fn new(fields: Vec<String>) -> Result<Self> {
        if fields.is_empty() {
            return Err(HarvestError::Ledger("schema needs at least a key field".into()));
        }
        let mut seen = HashSet::new();
        for f in &fields {
            if !seen.insert(f.as_str()) {
                return Err(HarvestError::Ledger(format!("duplicate field {:?} in schema", f)));
            }
        }
        Ok(Schema { fields })
    }

    pub fn key(&self) -> &str {
        &self.fields[0]
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Every field except the key.
    pub fn data_fields(&self) -> &[String] {
        &self.fields[1..]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f == name)
    }

    pub fn matches_header(&self, header: &StringRecord) -> bool {
        header.len() == self.fields.len() && header.iter().zip(&self.fields).all(|(a, b)| a == b)
    }
}

/// One harvested row. Fields outside the schema are dropped when the row is
/// written; schema fields never set are written empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    key: String,
    values: HashMap<String, String>,
}

impl Record {
    pub fn new(key: impl Into<String>) -> Self {
        Record {
            key: key.into(),
            values: HashMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self, field: &str) -> &str {
        self.values.get(field).map(String::as_str).unwrap_or("")
    }

    pub fn has(&self, field: &str) -> bool {
        !self.get(field).is_empty()
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn with(mut self, field: &str, value: &str) -> Self {
        self.set(field, value);
        self
    }

    /// Copy every non-empty value of `other` into fields that are empty here.
    /// Returns how many fields were filled.
    pub fn fill_from(&mut self, other: &Record) -> usize {
        let mut filled = 0;
        for (field, value) in &other.values {
            if !value.is_empty() && !self.has(field) {
                self.values.insert(field.clone(), value.clone());
                filled += 1;
            }
        }
        filled
    }

    pub fn to_row(&self, schema: &Schema) -> Vec<String> {
        let mut row = Vec::with_capacity(schema.fields().len());
        row.push(self.key.clone());
        row.extend(schema.data_fields().iter().map(|f| self.get(f).to_string()));
        row
    }

    /// Build a record from a CSV row laid out as `header`.
    pub fn from_row(header: &StringRecord, row: &StringRecord) -> Record {
        let mut rec = Record::new(row.get(0).unwrap_or("").trim());
        for (name, value) in header.iter().zip(row.iter()).skip(1) {
            if !value.is_empty() {
                rec.set(name, value);
            }
        }
        rec
    }
}

/// Decides whether a stored row is complete or terminal.
#[derive(Debug, Clone)]
pub struct RowPolicy {
    required: Vec<String>,
    terminal_field: Option<String>,
    terminal_values: Vec<String>,
}

impl RowPolicy {
    pub fn new(schema: &Schema, settings: &LedgerSettings) -> Self {
        let required = if settings.required.is_empty() {
            schema.data_fields().to_vec()
        } else {
            settings.required.clone()
        };
        RowPolicy {
            required,
            terminal_field: settings.terminal_field().map(str::to_string),
            terminal_values: settings.terminal_values.clone(),
        }
    }

    /// Terminal rows (e.g. a cancelled reservation) are carried forward and
    /// never harvested again.
    pub fn is_terminal(&self, rec: &Record) -> bool {
        match &self.terminal_field {
            Some(field) => {
                let value = rec.get(field);
                self.terminal_values.iter().any(|t| t == value)
            }
            None => false,
        }
    }

    pub fn missing<'a>(&'a self, rec: &Record) -> Vec<&'a str> {
        self.required
            .iter()
            .filter(|f| !rec.has(f))
            .map(String::as_str)
            .collect()
    }
}
