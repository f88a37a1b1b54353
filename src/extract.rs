use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::browser::{Locator, Page, WaitState};
use crate::config::ExtractSettings;
use crate::error::{HarvestError, Result};
use crate::ledger::{Record, RowPolicy};
use crate::snapshot::SnapshotStore;
use crate::ui::{sanitize, Ui};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldSource {
    #[default]
    Text,
    /// The `value` property of an input.
    Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub locator: Locator,
    #[serde(default)]
    pub source: FieldSource,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    pub index: usize,
    #[serde(default)]
    pub label: Option<String>,
}

impl ColumnSpec {
    pub fn plain(index: usize) -> Self {
        ColumnSpec { index, label: None }
    }

    pub fn labeled(index: usize, label: &str) -> Self {
        ColumnSpec {
            index,
            label: Some(label.to_string()),
        }
    }

    fn render(&self, value: &str) -> String {
        match &self.label {
            Some(label) => format!("{}: {}", label, value),
            None => value.to_string(),
        }
    }
}

fn default_cell_separator() -> String {
    " | ".into()
}

fn default_item_separator() -> String {
    " || ".into()
}

/// A table of line items flattened into one ledger field.
#[derive(Debug, Clone, Deserialize)]
pub struct TableSpec {
    pub field: String,
    /// Clicked before reading, for tables that live in a modal.
    #[serde(default)]
    pub open: Option<Locator>,
    #[serde(default)]
    pub close: Option<Locator>,
    pub table: Locator,
    /// Relative to the table.
    pub row: Locator,
    /// Relative to a row.
    pub cell: Locator,
    /// Rows with fewer cells are ignored.
    #[serde(default)]
    pub min_columns: usize,
    pub columns: Vec<ColumnSpec>,
    #[serde(default = "default_cell_separator")]
    pub cell_separator: String,
    #[serde(default = "default_item_separator")]
    pub item_separator: String,
    /// Cells of a totals row, relative to the table. Rendered as a final item.
    #[serde(default)]
    pub footer: Option<Locator>,
}

impl TableSpec {
    fn render(&self, values: &[String]) -> Option<String> {
        if values.iter().all(|v| v.is_empty()) {
            return None;
        }
        let parts: Vec<String> = self
            .columns
            .iter()
            .zip(values)
            .map(|(col, v)| col.render(v))
            .collect();
        Some(parts.join(&self.cell_separator))
    }
}

/// Reads one record off a loaded detail view.
pub struct Extractor<'a> {
    settings: &'a ExtractSettings,
    policy: &'a RowPolicy,
    snapshots: Option<&'a SnapshotStore>,
}

impl<'a> Extractor<'a> {
    pub fn new(
        settings: &'a ExtractSettings,
        policy: &'a RowPolicy,
        snapshots: Option<&'a SnapshotStore>,
    ) -> Self {
        Extractor {
            settings,
            policy,
            snapshots,
        }
    }

    pub async fn extract<P: Page>(
        &self,
        ui: &Ui<P>,
        task_id: &str,
        prior: Option<&Record>,
    ) -> Result<Record> {
        let mut rec = Record::new(task_id);
        for spec in &self.settings.fields {
            let value = match spec.source {
                FieldSource::Text => ui.read_field(&spec.locator).await?,
                FieldSource::Value => ui.read_value(&spec.locator).await?,
            };
            if value.is_empty() {
                warn!("Missing field {} for {}", spec.name, task_id);
            }
            rec.set(spec.name.as_str(), value);
        }

        let mut table_html = None;
        if let Some(table) = &self.settings.table {
            if prior.is_some_and(|p| p.has(&table.field)) {
                debug!("{} already has {}, not re-reading", task_id, table.field);
            } else if self.policy.is_terminal(&rec) || prior.is_some_and(|p| self.policy.is_terminal(p)) {
                info!("Skipping {} for terminal record {}", table.field, task_id);
            } else {
                let value = match self.table(ui, table, task_id).await {
                    Ok((value, html)) => {
                        table_html = html;
                        value
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("Could not read {} for {}: {}", table.field, task_id, e);
                        format!("Error: {}", e)
                    }
                };
                rec.set(table.field.as_str(), value);
            }
        }

        match self.snapshot(ui, task_id, table_html).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Snapshot for {} not saved: {}", task_id, e),
        }
        Ok(rec)
    }

    /// Keep the table markup when one was read, else the configured view.
    async fn snapshot<P: Page>(&self, ui: &Ui<P>, task_id: &str, table_html: Option<String>) -> Result<()> {
        let Some(store) = self.snapshots else {
            return Ok(());
        };
        let page = ui.page();
        let html = match table_html {
            Some(html) => html,
            None => match page.find_first(&self.settings.snapshot).await? {
                Some(el) => page.outer_html(&el).await?,
                None => return Err(HarvestError::NotFound(self.settings.snapshot.to_string())),
            },
        };
        let url = page.current_url().await?;
        if let Err(e) = store.save(task_id, &url, &html) {
            warn!("Snapshot for {} not saved: {}", task_id, e);
        }
        Ok(())
    }

    async fn table<P: Page>(
        &self,
        ui: &Ui<P>,
        spec: &TableSpec,
        task_id: &str,
    ) -> Result<(String, Option<String>)> {
        if let Some(open) = &spec.open {
            if !ui.click(open).await? {
                return Err(HarvestError::NotFound(format!("table link {}", open)));
            }
        }
        let result = self.read_table(ui, spec, task_id).await;
        if let Some(close) = &spec.close {
            if !ui.click(close).await? {
                warn!("Failed to close table view for {}", task_id);
            }
        }
        result
    }

    async fn read_table<P: Page>(
        &self,
        ui: &Ui<P>,
        spec: &TableSpec,
        task_id: &str,
    ) -> Result<(String, Option<String>)> {
        let timeout = ui.timeouts().default_wait();
        let table = ui
            .wait_element(&spec.table, WaitState::Present, timeout)
            .await?
            .ok_or_else(|| HarvestError::timeout(spec.table.to_string(), timeout))?;
        let page = ui.page();

        let mut items = Vec::new();
        for (i, row) in page.find_all_in(&table, &spec.row).await?.iter().enumerate() {
            match self.row_item(page, spec, row).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("Row {}: skipped ({})", i + 1, e),
            }
        }

        if let Some(footer) = &spec.footer {
            let cells = page.find_all_in(&table, footer).await?;
            if cells.len() >= spec.columns.len() {
                let mut values = Vec::with_capacity(spec.columns.len());
                for cell in cells.iter().take(spec.columns.len()) {
                    values.push(sanitize(&page.text(cell).await?));
                }
                items.extend(spec.render(&values));
            }
        }

        let html = match self.snapshots {
            Some(_) => Some(page.outer_html(&table).await?),
            None => None,
        };

        info!("Processed {} line items for {}", items.len(), task_id);
        Ok((items.join(&spec.item_separator), html))
    }

    async fn row_item<P: Page>(
        &self,
        page: &P,
        spec: &TableSpec,
        row: &P::Element,
    ) -> Result<Option<String>> {
        let cells = page.find_all_in(row, &spec.cell).await?;
        if cells.len() < spec.min_columns {
            return Ok(None);
        }
        let mut values = Vec::with_capacity(spec.columns.len());
        for col in &spec.columns {
            let text = match cells.get(col.index) {
                Some(cell) => page.text(cell).await?,
                None => String::new(),
            };
            values.push(sanitize(&text));
        }
        Ok(spec.render(&values))
    }
}
