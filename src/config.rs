use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::browser::Locator;
use crate::extract::{ColumnSpec, FieldSource, FieldSpec, TableSpec};
use crate::grid::GridSpec;
use crate::rules::Rule;

/// Everything a run needs. Layered as defaults, then the optional TOML file,
/// then `HARVEST__*` environment variables (`HARVEST__POOL__SIZE=8`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub webdriver_url: String,
    pub headless: bool,
    /// CSS selector for modal backdrops stripped when a click is intercepted.
    pub overlay_selector: String,
    pub login: LoginSettings,
    pub timeouts: Timeouts,
    pub retry: RetrySettings,
    pub pool: PoolSettings,
    pub ledger: LedgerSettings,
    pub navigation: Navigation,
    pub extract: ExtractSettings,
    pub grid: GridSpec,
    pub walk: WalkSettings,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        HarvestConfig {
            webdriver_url: "http://localhost:9515".into(),
            headless: false,
            overlay_selector: ".modal-backdrop".into(),
            login: LoginSettings::default(),
            timeouts: Timeouts::default(),
            retry: RetrySettings::default(),
            pool: PoolSettings::default(),
            ledger: LedgerSettings::default(),
            navigation: Navigation::default(),
            extract: ExtractSettings::default(),
            grid: GridSpec::default(),
            walk: WalkSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoginSettings {
    pub url: String,
    pub username_input: Locator,
    pub password_input: Locator,
    pub submit: Locator,
    /// Extra inputs filled before the credentials (tenant ids and the like).
    pub prefill: Vec<Prefill>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prefill {
    pub locator: Locator,
    pub value: String,
}

impl Default for LoginSettings {
    fn default() -> Self {
        LoginSettings {
            url: "https://app13.rmscloud.com/Login".into(),
            username_input: Locator::css(".username"),
            password_input: Locator::css(".pw-field"),
            submit: Locator::css("#Login"),
            prefill: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub default_secs: u64,
    pub long_secs: u64,
    pub ready_probe_ms: u64,
    pub settle_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            default_secs: 10,
            long_secs: 20,
            ready_probe_ms: 100,
            settle_ms: 500,
            poll_interval_ms: 250,
        }
    }
}

impl Timeouts {
    pub fn default_wait(&self) -> Duration {
        Duration::from_secs(self.default_secs)
    }

    pub fn long_wait(&self) -> Duration {
        Duration::from_secs(self.long_secs)
    }

    pub fn ready_probe(&self) -> Duration {
        Duration::from_millis(self.ready_probe_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub tries: u32,
    pub delay_ms: u64,
    pub backoff: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            tries: 3,
            delay_ms: 1000,
            backoff: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub size: usize,
    pub batch_size: usize,
    pub tick_ms: u64,
    /// Navigation attempts per task before it is marked failed.
    pub task_tries: u32,
    pub ready_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            size: 5,
            batch_size: 20,
            tick_ms: 500,
            task_tries: 3,
            ready_timeout_secs: 20,
        }
    }
}

impl PoolSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub path: PathBuf,
    pub snapshot_dir: Option<PathBuf>,
    /// Ordered header. The first field is the record key.
    pub fields: Vec<String>,
    /// Fields that must be non-empty for a row to count as complete.
    /// Empty means every field.
    pub required: Vec<String>,
    /// Field that receives the error text of a failed task. An empty string
    /// turns it off.
    pub error_field: Option<String>,
    /// Empty string turns terminal detection off.
    pub terminal_field: Option<String>,
    pub terminal_values: Vec<String>,
}

impl LedgerSettings {
    pub fn error_field(&self) -> Option<&str> {
        self.error_field.as_deref().filter(|f| !f.is_empty())
    }

    pub fn terminal_field(&self) -> Option<&str> {
        self.terminal_field.as_deref().filter(|f| !f.is_empty())
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        LedgerSettings {
            path: PathBuf::from("reservation_data.csv"),
            snapshot_dir: Some(PathBuf::from("bookings")),
            fields: [
                "ReservationId",
                "ResStatus",
                "ArriveDate",
                "DepartDate",
                "LegacyResId",
                "BaseRate",
                "TotalRate",
                "GuestBill",
                "ResNote",
                "ItemizedBill",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            required: Vec::new(),
            error_field: Some("ItemizedBill".into()),
            terminal_field: Some("ResStatus".into()),
            terminal_values: vec!["Cancelled".into()],
        }
    }
}

/// How a session brings a task's detail view on screen.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Navigation {
    /// Load `url_template` with `{id}` substituted; ready once `ready` exists.
    Direct {
        url_template: String,
        ready: Locator,
        #[serde(default)]
        unlock: Option<UnlockDialog>,
    },
    /// Type the id into a global search box.
    Search {
        input: Locator,
        /// Present once either the detail view or the results screen rendered.
        loaded: Locator,
        results_screen: Locator,
        id_bar: Locator,
        result_rows: Locator,
        /// Relative to a result row.
        result_anchor: Locator,
    },
}

/// A "session locked" prompt that asks for the password again mid-run.
#[derive(Debug, Clone, Deserialize)]
pub struct UnlockDialog {
    pub dialog: Locator,
    pub password_input: Locator,
    pub confirm: Locator,
}

impl Default for Navigation {
    fn default() -> Self {
        Navigation::Search {
            input: Locator::xpath("//*[@id=\"kt_quick_search_toggle\"]/div/input"),
            loaded: Locator::Class("rms-portlet-caption".into()),
            results_screen: Locator::Class("ReservationSearchScreen".into()),
            id_bar: Locator::Class("res-screen-info-bar-resid".into()),
            result_rows: Locator::xpath(
                "//*[@id=\"MainWindow\"]//div[contains(@class, \"GridLiteRow\")]",
            ),
            result_anchor: Locator::xpath(
                ".//div[contains(@class, \"GridLiteColumn\")][2]//a[@class=\"rms-a\"]",
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractSettings {
    pub fields: Vec<FieldSpec>,
    pub table: Option<TableSpec>,
    /// Saved as the snapshot when no table markup was read.
    pub snapshot: Locator,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        let text = |name: &str, xpath: &str| FieldSpec {
            name: name.into(),
            locator: Locator::xpath(xpath),
            source: FieldSource::Text,
        };
        let value = |name: &str, xpath: &str| FieldSpec {
            name: name.into(),
            locator: Locator::xpath(xpath),
            source: FieldSource::Value,
        };
        ExtractSettings {
            fields: vec![
                text("ArriveDate", "//*[@id='GridRow-Arrive']/label"),
                text("DepartDate", "//*[@id='GridRow-Depart']/label"),
                value("ResStatus", "//*[@id='GridRow-Status']/input"),
                value("LegacyResId", "//*[@id='GridRow-Spare10']/input"),
                value("BaseRate", "//*[@id='GridRow-BaseTariff']/input"),
                value("TotalRate", "//*[@id='GridRow-TotalTariff']/input"),
                value("GuestBill", "//*[@id='GridRow-Acc_General']/input"),
                FieldSpec {
                    name: "ResNote".into(),
                    locator: Locator::Id("ResNote".into()),
                    source: FieldSource::Value,
                },
            ],
            table: Some(TableSpec {
                field: "ItemizedBill".into(),
                open: Some(Locator::xpath("//*[@id=\"AcctRows\"]/div/div[1]/div[25]/label/a")),
                close: Some(Locator::xpath("//*[@id=\"AccountsButtonsRow\"]/a[13]")),
                table: Locator::Class("AccountsDataGrid".into()),
                row: Locator::xpath(
                    ".//div[contains(@class, \"GridLiteRowsContainer\")]//div[contains(@class, \"GridLiteRow\")]",
                ),
                cell: Locator::xpath(".//div[contains(@class, \"GridLiteColumn\")]"),
                min_columns: 6,
                columns: vec![
                    ColumnSpec::plain(0),
                    ColumnSpec::plain(2),
                    ColumnSpec::labeled(3, "Debit"),
                    ColumnSpec::labeled(4, "Credit"),
                    ColumnSpec::labeled(5, "Balance"),
                ],
                cell_separator: " | ".into(),
                item_separator: " || ".into(),
                footer: None,
            }),
            snapshot: Locator::css("body"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalkSettings {
    pub page_url: Option<String>,
    /// Present once the grid page rendered.
    pub ready: Locator,
    /// Tab opened after double-clicking a row, `{item}` is the tab label.
    pub tab_link: Locator,
    pub tab: Option<String>,
    /// Item cell in the available list, `{item}` is the item name.
    pub available_item: Locator,
    /// Item cell in the selected list, `{item}` is the item name.
    pub selected_item: Locator,
    /// All item cells of the selected list.
    pub selected_items: Locator,
    pub add: Vec<Rule>,
    pub remove: Vec<Rule>,
    pub save: Locator,
    pub modal: Locator,
}

const EDITOR: &str = "/html/body/div[15]/div/div/div/div/div[2]/div[2]/div[3]/div/div/div/div/div/div";

impl Default for WalkSettings {
    fn default() -> Self {
        let cell = "//div[contains(@class, 'GridLiteCell') and normalize-space(text())='{item}']";
        WalkSettings {
            page_url: Some("https://app13.rmscloud.com/#!/Setup/Category".into()),
            ready: Locator::xpath("//*[@id=\"MainWindow\"]/div/div[2]/div/div/div[2]"),
            tab_link: Locator::xpath("//a[contains(@class, 'kt-widget__item')]/span[text()='{item}']"),
            tab: Some("Attributes".into()),
            available_item: Locator::xpath(format!(
                "{}/div[1]/div/div[2]/div/div/div[2]/div{}",
                EDITOR, cell
            )),
            selected_item: Locator::xpath(format!(
                "{}/div[2]/div/div[2]/div/div/div[2]/div{}",
                EDITOR, cell
            )),
            selected_items: Locator::xpath(format!(
                "{}/div[2]/div/div[2]/div/div/div[2]/div//div[contains(@class, 'GridLiteCell')]",
                EDITOR
            )),
            add: Vec::new(),
            remove: Vec::new(),
            save: Locator::css(".icon > .fa-floppy-disk-circle-xmark"),
            modal: Locator::xpath("//div[contains(@class, 'modal-dialog')]"),
        }
    }
}

impl HarvestConfig {
    /// Load the layered configuration. A missing file is only an error when
    /// the path was given explicitly.
    pub fn load(path: &Path, explicit: bool) -> Result<Self> {
        if explicit && !path.exists() {
            bail!("config file {} does not exist", path.display());
        }
        let settings = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("HARVEST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("reading configuration from {}", path.display()))?;

        let cfg: HarvestConfig = settings
            .try_deserialize()
            .context("invalid configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Cross-field checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let ledger = &self.ledger;
        if ledger.fields.is_empty() {
            bail!("ledger.fields must name at least the key field");
        }
        let known = |name: &str| ledger.fields.iter().any(|f| f == name);

        for name in &ledger.required {
            if !known(name) {
                bail!("ledger.required names unknown field {:?}", name);
            }
        }
        for name in ledger.error_field().into_iter().chain(ledger.terminal_field()) {
            if !known(name) {
                bail!("ledger field {:?} is not part of ledger.fields", name);
            }
        }
        for spec in &self.extract.fields {
            if !known(&spec.name) {
                bail!("extract field {:?} is not part of ledger.fields", spec.name);
            }
        }
        if let Some(table) = &self.extract.table {
            if !known(&table.field) {
                bail!("table field {:?} is not part of ledger.fields", table.field);
            }
        }
        if let Navigation::Direct { url_template, .. } = &self.navigation {
            if !url_template.contains("{id}") {
                bail!("navigation.url_template must contain {{id}}");
            }
        }
        if self.pool.size == 0 || self.pool.batch_size == 0 {
            bail!("pool.size and pool.batch_size must be at least 1");
        }
        Ok(())
    }
}
