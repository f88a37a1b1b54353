pub mod webdriver;

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

/// How to find an element. Deserializes from a one-key table such as
/// `{ xpath = "//*[@id='MainWindow']" }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locator {
    Css(String),
    Xpath(String),
    Id(String),
    Class(String),
}

impl Locator {
    pub fn css(s: impl Into<String>) -> Self {
        Locator::Css(s.into())
    }

    pub fn xpath(s: impl Into<String>) -> Self {
        Locator::Xpath(s.into())
    }

    /// Substitute `{item}` in a locator template.
    pub fn fill(&self, item: &str) -> Locator {
        let sub = |s: &String| s.replace("{item}", item);
        match self {
            Locator::Css(s) => Locator::Css(sub(s)),
            Locator::Xpath(s) => Locator::Xpath(sub(s)),
            Locator::Id(s) => Locator::Id(sub(s)),
            Locator::Class(s) => Locator::Class(sub(s)),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(s) => write!(f, "css:{}", s),
            Locator::Xpath(s) => write!(f, "xpath:{}", s),
            Locator::Id(s) => write!(f, "id:{}", s),
            Locator::Class(s) => write!(f, "class:{}", s),
        }
    }
}

/// Element state a wait can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Present,
    Visible,
    Clickable,
    Invisible,
}

/// Scroll geometry of a scrollable container, in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrollMetrics {
    pub scroll_top: i64,
    pub scroll_height: i64,
    pub client_height: i64,
}

impl ScrollMetrics {
    pub fn at_end(&self) -> bool {
        self.scroll_height - self.scroll_top <= self.client_height
    }
}

/// One browsing context. Every call is a single round trip without waiting;
/// bounded waits are layered on top by [`crate::ui::Ui`].
///
/// Lookups that match nothing return an empty list rather than an error.
#[async_trait]
pub trait Page: Send + Sync {
    type Element: Clone + Send + Sync;

    async fn goto(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    async fn find_all(&self, locator: &Locator) -> Result<Vec<Self::Element>>;

    async fn find_all_in(
        &self,
        parent: &Self::Element,
        locator: &Locator,
    ) -> Result<Vec<Self::Element>>;

    async fn is_displayed(&self, el: &Self::Element) -> Result<bool>;

    async fn is_enabled(&self, el: &Self::Element) -> Result<bool>;

    async fn click(&self, el: &Self::Element) -> Result<()>;

    async fn double_click(&self, el: &Self::Element) -> Result<()>;

    async fn text(&self, el: &Self::Element) -> Result<String>;

    /// The `value` property of form inputs.
    async fn value(&self, el: &Self::Element) -> Result<Option<String>>;

    async fn outer_html(&self, el: &Self::Element) -> Result<String>;

    /// Replace the element's content with `text`, optionally followed by Enter.
    async fn type_text(&self, el: &Self::Element, text: &str, submit: bool) -> Result<()>;

    async fn scroll_metrics(&self, el: &Self::Element) -> Result<ScrollMetrics>;

    async fn scroll_by(&self, el: &Self::Element, dy: i64) -> Result<()>;

    /// Strip modal backdrops and similar overlays. Returns how many were removed.
    async fn remove_overlays(&self) -> Result<usize>;

    async fn find_first(&self, locator: &Locator) -> Result<Option<Self::Element>> {
        Ok(self.find_all(locator).await?.into_iter().next())
    }

    async fn find_first_in(
        &self,
        parent: &Self::Element,
        locator: &Locator,
    ) -> Result<Option<Self::Element>> {
        Ok(self.find_all_in(parent, locator).await?.into_iter().next())
    }
}
