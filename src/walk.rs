use std::time::Duration;

use tracing::{info, info_span, warn, Instrument};

use crate::browser::{Page, WaitState};
use crate::config::WalkSettings;
use crate::error::{HarvestError, Result};
use crate::grid::{GridMatch, GridRowLocator, GridSpec};
use crate::rules::applicable;
use crate::ui::{Action, Ui};

/// Items are either in the list already or not at all; no point waiting long.
const ITEM_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WalkSummary {
    pub rows: usize,
    pub saved: usize,
    pub unsaved: usize,
    /// Selected items found outside the row's add list.
    pub unexpected: usize,
}

/// Visits every grid row in ordinal order and applies the add/remove rules
/// in its editor.
pub struct GridWalk<'a, P: Page> {
    ui: &'a Ui<P>,
    grid: &'a GridSpec,
    settings: &'a WalkSettings,
}

impl<'a, P: Page> GridWalk<'a, P> {
    pub fn new(ui: &'a Ui<P>, grid: &'a GridSpec, settings: &'a WalkSettings) -> Self {
        GridWalk { ui, grid, settings }
    }

    /// Walk rows with ordinal `>= start`. Ends when the locator finds no next
    /// row within `lookahead`.
    pub async fn run(&self, start: u64, lookahead: u64) -> Result<WalkSummary> {
        let ui = self.ui;
        if let Some(url) = &self.settings.page_url {
            ui.page().goto(url).await?;
        }
        if !ui
            .wait_for(&self.settings.ready, WaitState::Present, ui.timeouts().long_wait())
            .await?
        {
            return Err(HarvestError::NotFound(format!("grid page {}", self.settings.ready)));
        }
        info!("Grid page loaded");
        ui.settle().await;

        let locator = GridRowLocator::new(ui, self.grid);
        let mut summary = WalkSummary::default();
        let mut current = start.saturating_sub(1);
        while let Some(row) = locator.find_next(current, lookahead).await? {
            summary.rows += 1;
            let span = info_span!(parent: ui.span(), "row", ordinal = row.ordinal);
            if self.process_row(&row, &mut summary).instrument(span).await? {
                summary.saved += 1;
            } else {
                summary.unsaved += 1;
            }
            current = row.ordinal;
        }
        info!(
            "No more rows after {}: {} visited, {} saved",
            current, summary.rows, summary.saved
        );
        Ok(summary)
    }

    /// Returns whether the row's editor was saved and closed.
    async fn process_row(&self, row: &GridMatch<P::Element>, summary: &mut WalkSummary) -> Result<bool> {
        let ui = self.ui;
        let s = self.settings;
        info!("Processing row {} ({})", row.ordinal, row.label);

        let opened = ui
            .retry()
            .run("open row", |_| ui.page().double_click(&row.row))
            .await;
        match opened {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Could not open row {}: {}", row.ordinal, e);
                return Ok(false);
            }
        }
        ui.settle().await;

        if let Some(tab) = &s.tab {
            if !ui.click(&s.tab_link.fill(tab)).await? {
                warn!("Skipping row {}: no {} tab", row.ordinal, tab);
                return Ok(false);
            }
            info!("Switched to {} tab", tab);
        }

        let add = applicable(&s.add, &row.label);
        for item in &add {
            let outcome = ui
                .locate_and_act(&s.available_item.fill(item), Action::DoubleClick, ITEM_TIMEOUT)
                .await?;
            if outcome.succeeded() {
                info!("Added {}", item);
            }
        }
        for item in applicable(&s.remove, &row.label) {
            let outcome = ui
                .locate_and_act(&s.selected_item.fill(item), Action::DoubleClick, ITEM_TIMEOUT)
                .await?;
            if outcome.succeeded() {
                info!("Removed {}", item);
            }
        }

        for selected in self.selected_items().await? {
            if !add.contains(&selected.as_str()) {
                info!(
                    "Row {}: '{}' is selected but not in the add list",
                    row.ordinal, selected
                );
                summary.unexpected += 1;
            }
        }

        let saved = ui
            .submit_change_and_wait_for_modal_close(&s.save, &s.modal, ui.timeouts().default_wait())
            .await?;
        ui.settle().await;
        Ok(saved)
    }

    async fn selected_items(&self) -> Result<Vec<String>> {
        let page = self.ui.page();
        let mut items = Vec::new();
        for el in page.find_all(&self.settings.selected_items).await? {
            match page.text(&el).await {
                Ok(t) if !t.trim().is_empty() => items.push(t.trim().to_string()),
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => {}
            }
        }
        Ok(items)
    }
}
