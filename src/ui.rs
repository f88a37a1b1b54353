use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn, Instrument, Span};

use crate::browser::{Locator, Page, WaitState};
use crate::config::Timeouts;
use crate::error::{HarvestError, Result};
use crate::retry::{poll_until, RetryPolicy};

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Make scraped text safe for a single CSV cell: whitespace runs collapse to
/// one space, control characters go, quotes are doubled and the value is
/// quote-wrapped when it holds a comma or a quote.
pub fn sanitize(text: &str) -> String {
    let collapsed = WHITESPACE.replace_all(text, " ");
    let printable: String = collapsed.chars().filter(|c| !c.is_control()).collect();
    let mut out = printable.replace('"', "\"\"");
    if out.contains(',') || out.contains('"') {
        out = format!("\"{}\"", out);
    }
    out.trim().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Click,
    DoubleClick,
    ReadText,
    ReadValue,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Click => "click",
            Action::DoubleClick => "double-click",
            Action::ReadText => "read text of",
            Action::ReadValue => "read value of",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActOutcome {
    Done,
    Read(String),
    /// The element never reached an actionable state; carries the last error.
    Failed(String),
}

impl ActOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, ActOutcome::Failed(_))
    }
}

/// Bounded-wait interactions over one page. Only fatal errors escape; every
/// other failure is logged and reported through the return value.
pub struct Ui<P: Page> {
    page: P,
    retry: RetryPolicy,
    timeouts: Timeouts,
    span: Span,
}

impl<P: Page> Ui<P> {
    pub fn new(page: P, retry: RetryPolicy, timeouts: Timeouts, span: Span) -> Self {
        Ui {
            page,
            retry,
            timeouts,
            span,
        }
    }

    pub fn page(&self) -> &P {
        &self.page
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn settle(&self) {
        tokio::time::sleep(self.timeouts.settle()).await;
    }

    /// First element matching `locator` that is currently in `state`.
    /// `Invisible` has no element to return and is handled by [`Ui::wait_for`].
    pub async fn element_in_state(
        &self,
        locator: &Locator,
        state: WaitState,
    ) -> Result<Option<P::Element>> {
        for el in self.page.find_all(locator).await? {
            let hit = match state {
                WaitState::Present | WaitState::Invisible => true,
                WaitState::Visible => self.page.is_displayed(&el).await?,
                WaitState::Clickable => {
                    self.page.is_displayed(&el).await? && self.page.is_enabled(&el).await?
                }
            };
            if hit {
                return Ok(Some(el));
            }
        }
        Ok(None)
    }

    async fn is_gone(&self, locator: &Locator) -> Result<Option<()>> {
        for el in self.page.find_all(locator).await? {
            if self.page.is_displayed(&el).await? {
                return Ok(None);
            }
        }
        Ok(Some(()))
    }

    pub async fn wait_element(
        &self,
        locator: &Locator,
        state: WaitState,
        timeout: Duration,
    ) -> Result<Option<P::Element>> {
        poll_until(timeout, self.timeouts.poll_interval(), || {
            self.element_in_state(locator, state)
        })
        .await
    }

    /// Wait until `locator` reaches `state`. Returns false on timeout.
    pub async fn wait_for(
        &self,
        locator: &Locator,
        state: WaitState,
        timeout: Duration,
    ) -> Result<bool> {
        let reached = match state {
            WaitState::Invisible => {
                poll_until(timeout, self.timeouts.poll_interval(), || self.is_gone(locator))
                    .await?
                    .is_some()
            }
            _ => self.wait_element(locator, state, timeout).await?.is_some(),
        };
        if !reached {
            debug!("Timed out waiting for {} to be {:?}", locator, state);
        }
        Ok(reached)
    }

    async fn require(
        &self,
        locator: &Locator,
        state: WaitState,
        timeout: Duration,
    ) -> Result<P::Element> {
        self.wait_element(locator, state, timeout)
            .await?
            .ok_or_else(|| HarvestError::timeout(locator.to_string(), timeout))
    }

    async fn act(&self, el: &P::Element, action: Action) -> Result<ActOutcome> {
        match action {
            Action::Click => self.page.click(el).await?,
            Action::DoubleClick => self.page.double_click(el).await?,
            Action::ReadText => return Ok(ActOutcome::Read(self.page.text(el).await?)),
            Action::ReadValue => {
                return Ok(ActOutcome::Read(self.page.value(el).await?.unwrap_or_default()))
            }
        }
        self.settle().await;
        Ok(ActOutcome::Done)
    }

    async fn clear_overlays(&self) -> Result<()> {
        match self.page.remove_overlays().await {
            Ok(n) => debug!("Removed {} overlay(s) before retrying click", n),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => debug!("Overlay removal failed: {}", e),
        }
        Ok(())
    }

    /// Locate `locator`, wait for it to be actionable, then perform `action`,
    /// all under the retry policy.
    pub async fn locate_and_act(
        &self,
        locator: &Locator,
        action: Action,
        timeout: Duration,
    ) -> Result<ActOutcome> {
        let state = match action {
            Action::Click | Action::DoubleClick => WaitState::Clickable,
            Action::ReadText | Action::ReadValue => WaitState::Present,
        };
        let label = format!("{} {}", action, locator);
        let result = self
            .retry
            .run(&label, |_| async move {
                let el = self.require(locator, state, timeout).await?;
                match self.act(&el, action).await {
                    Err(e @ HarvestError::Intercepted(_)) => {
                        self.clear_overlays().await?;
                        Err(e)
                    }
                    other => other,
                }
            })
            .instrument(self.span.clone())
            .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(parent: &self.span, "Failed to {} {}: {}", action, locator, e);
                Ok(ActOutcome::Failed(e.to_string()))
            }
        }
    }

    pub async fn click(&self, locator: &Locator) -> Result<bool> {
        let outcome = self
            .locate_and_act(locator, Action::Click, self.timeouts.default_wait())
            .await?;
        Ok(outcome.succeeded())
    }

    async fn read(&self, locator: &Locator, action: Action) -> Result<String> {
        let outcome = self
            .locate_and_act(locator, action, self.timeouts.default_wait())
            .await?;
        Ok(match outcome {
            ActOutcome::Read(text) => sanitize(&text),
            _ => String::new(),
        })
    }

    /// Sanitized text of `locator`, empty when it never appears.
    pub async fn read_field(&self, locator: &Locator) -> Result<String> {
        self.read(locator, Action::ReadText).await
    }

    /// Sanitized `value` of an input, empty when it never appears.
    pub async fn read_value(&self, locator: &Locator) -> Result<String> {
        self.read(locator, Action::ReadValue).await
    }

    /// Clear `locator`, type `text`, and press Enter when `submit` is set.
    pub async fn type_into(&self, locator: &Locator, text: &str, submit: bool) -> Result<bool> {
        let timeout = self.timeouts.default_wait();
        let label = format!("type into {}", locator);
        let result = self
            .retry
            .run(&label, |_| async move {
                let el = self.require(locator, WaitState::Visible, timeout).await?;
                self.page.type_text(&el, text, submit).await
            })
            .instrument(self.span.clone())
            .await;

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(parent: &self.span, "Failed to type into {}: {}", locator, e);
                Ok(false)
            }
        }
    }

    /// Click `save`, then wait for `modal` to disappear. A modal that stays
    /// open is logged and reported as false; the caller decides whether to go on.
    pub async fn submit_change_and_wait_for_modal_close(
        &self,
        save: &Locator,
        modal: &Locator,
        timeout: Duration,
    ) -> Result<bool> {
        if !self
            .locate_and_act(save, Action::Click, timeout)
            .await?
            .succeeded()
        {
            return Ok(false);
        }
        let closed = self.wait_for(modal, WaitState::Invisible, timeout).await?;
        if closed {
            debug!(parent: &self.span, "Modal closed");
        } else {
            warn!(parent: &self.span, "Modal {} did not close, continuing", modal);
        }
        Ok(closed)
    }
}
