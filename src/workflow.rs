//! Per-site navigation: how a session gets from "task assigned" to "detail
//! view on screen", and what it reads once there.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::browser::{Locator, Page, WaitState};
use crate::config::{LoginSettings, Navigation, UnlockDialog};
use crate::error::{HarvestError, Result};
use crate::extract::Extractor;
use crate::ledger::Record;
use crate::scheduler::Task;
use crate::ui::Ui;

#[async_trait]
pub trait Workflow<P: Page>: Send + Sync {
    /// Issue the navigation for `task`. One attempt; the scheduler retries.
    async fn start(&self, ui: &Ui<P>, task: &Task) -> Result<()>;

    /// Short, non-blocking check that the task's detail view is loaded.
    async fn probe_ready(&self, ui: &Ui<P>, task: &Task) -> Result<bool>;

    async fn extract(&self, ui: &Ui<P>, task: &Task) -> Result<Record>;
}

/// Build the workflow named by the navigation settings. `password` answers
/// a locked-session prompt when one is configured.
pub fn from_settings<'a, P: Page + 'a>(
    navigation: &'a Navigation,
    extractor: Extractor<'a>,
    password: &'a str,
) -> Box<dyn Workflow<P> + 'a> {
    match navigation {
        Navigation::Direct {
            url_template,
            ready,
            unlock,
        } => Box::new(DirectWorkflow {
            url_template,
            ready,
            unlock: unlock.as_ref().map(|dialog| (dialog, password)),
            extractor,
        }),
        Navigation::Search {
            input,
            loaded,
            results_screen,
            id_bar,
            result_rows,
            result_anchor,
        } => Box::new(SearchWorkflow {
            input,
            loaded,
            results_screen,
            id_bar,
            result_rows,
            result_anchor,
            extractor,
        }),
    }
}

/// Loads a per-task URL.
pub struct DirectWorkflow<'a> {
    pub url_template: &'a str,
    pub ready: &'a Locator,
    pub unlock: Option<(&'a UnlockDialog, &'a str)>,
    pub extractor: Extractor<'a>,
}

impl DirectWorkflow<'_> {
    pub fn url_for(&self, id: &str) -> String {
        self.url_template.replace("{id}", id)
    }

    async fn unlock_session<P: Page>(&self, ui: &Ui<P>) -> Result<()> {
        let Some((unlock, password)) = self.unlock else {
            return Ok(());
        };
        if ui.element_in_state(&unlock.dialog, WaitState::Visible).await?.is_none() {
            return Ok(());
        }
        info!("Session locked, entering password again");
        if ui.type_into(&unlock.password_input, password, false).await? && ui.click(&unlock.confirm).await? {
            ui.wait_for(&unlock.dialog, WaitState::Invisible, ui.timeouts().default_wait())
                .await?;
        } else {
            warn!("Could not answer the locked session dialog");
        }
        Ok(())
    }
}

#[async_trait]
impl<'a, P: Page> Workflow<P> for DirectWorkflow<'a> {
    async fn start(&self, ui: &Ui<P>, task: &Task) -> Result<()> {
        let url = self.url_for(&task.id);
        debug!("Loading {}", url);
        ui.page().goto(&url).await
    }

    async fn probe_ready(&self, ui: &Ui<P>, _task: &Task) -> Result<bool> {
        self.unlock_session(ui).await?;
        ui.wait_for(self.ready, WaitState::Present, ui.timeouts().ready_probe())
            .await
    }

    async fn extract(&self, ui: &Ui<P>, task: &Task) -> Result<Record> {
        self.extractor.extract(ui, &task.id, task.prior.as_ref()).await
    }
}

/// Finds a task through the application's global search box. A search can
/// land on the detail view directly or on a results list that needs one more
/// click.
pub struct SearchWorkflow<'a> {
    pub input: &'a Locator,
    pub loaded: &'a Locator,
    pub results_screen: &'a Locator,
    pub id_bar: &'a Locator,
    pub result_rows: &'a Locator,
    pub result_anchor: &'a Locator,
    pub extractor: Extractor<'a>,
}

impl SearchWorkflow<'_> {
    async fn shows_task<P: Page>(&self, ui: &Ui<P>, id: &str) -> Result<bool> {
        let Some(bar) = ui.element_in_state(self.id_bar, WaitState::Present).await? else {
            return Ok(false);
        };
        Ok(mentions(&ui.page().text(&bar).await?, id))
    }

    /// Click the result whose anchor mentions `id`. Returns whether one was found.
    async fn open_result<P: Page>(&self, ui: &Ui<P>, id: &str) -> Result<bool> {
        let page = ui.page();
        let rows = page.find_all(self.result_rows).await?;
        debug!("{} rows in search results", rows.len());
        for row in &rows {
            let anchor = match page.find_first_in(row, self.result_anchor).await {
                Ok(Some(a)) => a,
                Ok(None) => continue,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!("Skipping result row: {}", e);
                    continue;
                }
            };
            let text = match page.text(&anchor).await {
                Ok(t) => t,
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => continue,
            };
            if mentions(&text, id) {
                info!("Opening search result {}", text.trim());
                page.click(&anchor).await?;
                ui.settle().await;
                return Ok(true);
            }
        }
        warn!("{} not found in search results", id);
        Ok(false)
    }
}

#[async_trait]
impl<'a, P: Page> Workflow<P> for SearchWorkflow<'a> {
    /// One attempt only: the scheduler retries navigation as a whole.
    async fn start(&self, ui: &Ui<P>, task: &Task) -> Result<()> {
        let timeout = ui.timeouts().default_wait();
        let input = ui
            .wait_element(self.input, WaitState::Visible, timeout)
            .await?
            .ok_or_else(|| HarvestError::NotFound(format!("search box {}", self.input)))?;
        ui.page().type_text(&input, &task.id, true).await
    }

    async fn probe_ready(&self, ui: &Ui<P>, task: &Task) -> Result<bool> {
        if !ui
            .wait_for(self.loaded, WaitState::Present, ui.timeouts().ready_probe())
            .await?
        {
            return Ok(false);
        }
        if self.shows_task(ui, &task.id).await? {
            return Ok(true);
        }
        if ui.element_in_state(self.results_screen, WaitState::Visible).await?.is_some() {
            self.open_result(ui, &task.id).await?;
        }
        Ok(false)
    }

    async fn extract(&self, ui: &Ui<P>, task: &Task) -> Result<Record> {
        // the detail view keeps filling in for a moment after the id bar shows
        ui.settle().await;
        self.extractor.extract(ui, &task.id, task.prior.as_ref()).await
    }
}

/// Whether `id` appears in `text` as a whole word, so "881201" does not
/// match 88120.
fn mentions(text: &str, id: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric()).any(|word| word == id)
}

/// Fill the login form. Second-factor prompts are left to the operator.
pub async fn sign_in<P: Page>(
    ui: &Ui<P>,
    login: &LoginSettings,
    username: &str,
    password: &str,
) -> Result<()> {
    ui.page().goto(&login.url).await?;
    for field in &login.prefill {
        if !ui.type_into(&field.locator, &field.value, false).await? {
            return Err(HarvestError::NotFound(format!("login field {}", field.locator)));
        }
    }
    if !ui.type_into(&login.username_input, username, false).await?
        || !ui.type_into(&login.password_input, password, false).await?
    {
        return Err(HarvestError::NotFound("login form".into()));
    }
    if !ui.click(&login.submit).await? {
        return Err(HarvestError::NotFound(format!("login button {}", login.submit)));
    }
    info!("Submitted login form for {}", username);
    Ok(())
}
