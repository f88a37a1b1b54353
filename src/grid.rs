//! Finding rows inside a virtualized list that only renders a sliding window
//! of its rows.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::browser::{Locator, Page, WaitState};
use crate::error::{HarvestError, Result};
use crate::ui::Ui;

static ORDINAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// First run of digits in a row label, e.g. `"Site 12A"` -> 12.
pub fn parse_ordinal(label: &str) -> Option<u64> {
    ORDINAL.find(label).and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GridSpec {
    pub container: Locator,
    /// Rows, relative to the container.
    pub row: Locator,
    /// Cell holding the row label, relative to a row.
    pub ordinal_cell: Locator,
    /// Element whose text carries the total row count.
    pub summary: Locator,
    pub max_attempts: u32,
    pub lookahead: u64,
}

impl Default for GridSpec {
    fn default() -> Self {
        GridSpec {
            container: Locator::xpath("//*[@id=\"MainWindow\"]/div/div[2]/div/div/div[2]/div"),
            row: Locator::xpath("./div[contains(@class, 'GridLiteRow')]"),
            ordinal_cell: Locator::xpath(".//div[contains(@class, 'GridLiteCell_Category')]"),
            summary: Locator::xpath("//*[@id='MainWindow']/div/div[1]/div[1]/label/span"),
            max_attempts: 40,
            lookahead: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GridMatch<E> {
    pub row: E,
    pub ordinal: u64,
    pub label: String,
}

enum Scan<E> {
    Found(GridMatch<E>),
    Missed(usize),
}

pub struct GridRowLocator<'a, P: Page> {
    ui: &'a Ui<P>,
    spec: &'a GridSpec,
}

impl<'a, P: Page> GridRowLocator<'a, P> {
    pub fn new(ui: &'a Ui<P>, spec: &'a GridSpec) -> Self {
        GridRowLocator { ui, spec }
    }

    /// Total row count from the summary element; 0 when it cannot be read.
    pub async fn total_count(&self) -> Result<usize> {
        let timeout = self.ui.timeouts().default_wait();
        let Some(el) = self
            .ui
            .wait_element(&self.spec.summary, WaitState::Present, timeout)
            .await?
        else {
            warn!("Grid summary {} not found, assuming 0 rows", self.spec.summary);
            return Ok(0);
        };
        let text = self.ui.page().text(&el).await?;
        Ok(parse_ordinal(&text).unwrap_or(0) as usize)
    }

    /// The first materialized row whose ordinal lies in
    /// `(current, current + lookahead]`, scrolling the container as needed.
    ///
    /// Rows are checked in the order the widget renders them, so with several
    /// candidates on screen the topmost wins, not the smallest ordinal.
    pub async fn find_next(
        &self,
        current: u64,
        lookahead: u64,
    ) -> Result<Option<GridMatch<P::Element>>> {
        let total = self.total_count().await?;
        let upper = current.saturating_add(lookahead);
        info!("Grid reports {} rows, looking for ({}, {}]", total, current, upper);

        let mut scanned = 0usize;
        for attempt in 1..=self.spec.max_attempts {
            let container = self.container().await?;
            match self.scan(&container, current, lookahead).await {
                Ok(Scan::Found(m)) => {
                    info!("Found row {} ({}) on attempt {}", m.ordinal, m.label, attempt);
                    return Ok(Some(m));
                }
                Ok(Scan::Missed(n)) => scanned += n,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Grid scan failed on attempt {}: {}", attempt, e);
                    self.ui.settle().await;
                    continue;
                }
            }

            debug!("Attempt {}/{}: scanned {} of {} rows", attempt, self.spec.max_attempts, scanned, total);
            if scanned >= total {
                info!("Scanned {} rows without a match after {}", scanned, current);
                return Ok(None);
            }

            match self.advance(&container).await {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Grid scroll failed: {}", e),
                Ok(()) => {}
            }
            self.ui.settle().await;
        }

        warn!("No row after {} within {} attempts", current, self.spec.max_attempts);
        Ok(None)
    }

    async fn container(&self) -> Result<P::Element> {
        let timeout = self.ui.timeouts().default_wait();
        self.ui
            .wait_element(&self.spec.container, WaitState::Present, timeout)
            .await?
            .ok_or_else(|| HarvestError::NotFound(format!("grid container {}", self.spec.container)))
    }

    async fn scan(
        &self,
        container: &P::Element,
        current: u64,
        lookahead: u64,
    ) -> Result<Scan<P::Element>> {
        let page = self.ui.page();
        let rows = page.find_all_in(container, &self.spec.row).await?;
        let count = rows.len();
        debug!("{} rows materialized", count);

        for (index, row) in rows.into_iter().enumerate() {
            match self.label_of(&row).await {
                Ok((label, Some(ordinal))) if ordinal > current && ordinal <= current.saturating_add(lookahead) => {
                    return Ok(Scan::Found(GridMatch { row, ordinal, label }));
                }
                Ok((label, None)) => debug!("Row {}: no ordinal in {:?}", index + 1, label),
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("Row {}: skipped ({})", index + 1, e),
            }
        }
        Ok(Scan::Missed(count))
    }

    async fn label_of(&self, row: &P::Element) -> Result<(String, Option<u64>)> {
        let page = self.ui.page();
        let cell = page
            .find_first_in(row, &self.spec.ordinal_cell)
            .await?
            .ok_or_else(|| HarvestError::NotFound(self.spec.ordinal_cell.to_string()))?;
        let label = page.text(&cell).await?;
        let ordinal = parse_ordinal(&label);
        Ok((label, ordinal))
    }

    /// Scroll half a viewport. At the end of the list, bounce back first so
    /// the widget re-renders its tail.
    async fn advance(&self, container: &P::Element) -> Result<()> {
        let page = self.ui.page();
        let metrics = page.scroll_metrics(container).await?;
        let half = (metrics.client_height / 2).max(1);
        if metrics.at_end() {
            debug!("At end of grid, bouncing");
            page.scroll_by(container, -half).await?;
            self.ui.settle().await;
        }
        page.scroll_by(container, half).await
    }
}
