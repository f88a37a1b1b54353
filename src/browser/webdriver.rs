use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fantoccini::elements::Element;
use fantoccini::error::{CmdError, ErrorStatus};
use fantoccini::wd::WindowHandle;
use fantoccini::{Client, ClientBuilder, Locator as WdLocator};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Locator, Page, ScrollMetrics};
use crate::error::{HarvestError, Result};

const ENTER_KEY: &str = "\u{E007}";

const DOUBLE_CLICK_JS: &str = "arguments[0].dispatchEvent(new MouseEvent('dblclick', \
     {bubbles: true, cancelable: true, view: window}));";
const SCROLL_METRICS_JS: &str =
    "return [arguments[0].scrollTop, arguments[0].scrollHeight, arguments[0].clientHeight];";
const SCROLL_BY_JS: &str = "arguments[0].scrollTop += arguments[1];";
const REMOVE_OVERLAYS_JS: &str = "const els = document.querySelectorAll(arguments[0]); \
     els.forEach(e => e.remove()); return els.length;";

/// Start a WebDriver session (chromedriver or compatible) at `url`.
pub async fn connect(url: &str, headless: bool) -> Result<Client> {
    let mut args = vec!["--no-sandbox", "--disable-dev-shm-usage"];
    if headless {
        args.push("--headless=new");
    } else {
        args.push("--start-maximized");
    }

    let mut caps = serde_json::Map::new();
    caps.insert("goog:chromeOptions".to_string(), json!({ "args": args }));

    info!("Connecting to webdriver at {}", url);
    ClientBuilder::native()
        .capabilities(caps)
        .connect(url)
        .await
        .map_err(|e| HarvestError::SessionLost(format!("cannot start session at {}: {}", url, e)))
}

/// Open `count` browsing contexts on one client: the current window plus
/// `count - 1` new tabs. They share cookies, so one login covers all of them.
pub async fn open_pages(
    client: &Client,
    count: usize,
    overlay_selector: &str,
) -> Result<Vec<WebDriverPage>> {
    let focus = Arc::new(Mutex::new(Some(0)));
    let mut handles = vec![client.window().await.map_err(|e| classify(e, "window"))?];
    for _ in 1..count {
        let created = client
            .new_window(true)
            .await
            .map_err(|e| classify(e, "new tab"))?;
        handles.push(created.handle);
    }
    debug!("Opened {} browser tabs", handles.len());

    Ok(handles
        .into_iter()
        .enumerate()
        .map(|(index, window)| WebDriverPage {
            client: client.clone(),
            window,
            index,
            focus: Arc::clone(&focus),
            overlay_selector: overlay_selector.to_string(),
        })
        .collect())
}

/// A browser tab. Tabs of one client share a single WebDriver "current
/// window", so every call switches to its own tab first when needed.
pub struct WebDriverPage {
    client: Client,
    window: WindowHandle,
    index: usize,
    focus: Arc<Mutex<Option<usize>>>,
    overlay_selector: String,
}

impl WebDriverPage {
    async fn activate(&self) -> Result<()> {
        let mut focus = self.focus.lock().await;
        if *focus != Some(self.index) {
            self.client
                .switch_to_window(self.window.clone())
                .await
                .map_err(|e| classify(e, "switch tab"))?;
            *focus = Some(self.index);
        }
        Ok(())
    }

    async fn script(&self, js: &str, args: Vec<Value>) -> Result<Value> {
        self.client
            .execute(js, args)
            .await
            .map_err(|e| classify(e, "script"))
    }
}

#[async_trait]
impl Page for WebDriverPage {
    type Element = Element;

    async fn goto(&self, url: &str) -> Result<()> {
        self.activate().await?;
        self.client.goto(url).await.map_err(|e| match classify(e, url) {
            HarvestError::Driver(reason) => HarvestError::Navigation {
                url: url.to_string(),
                reason,
            },
            other => other,
        })
    }

    async fn current_url(&self) -> Result<String> {
        self.activate().await?;
        let url = self
            .client
            .current_url()
            .await
            .map_err(|e| classify(e, "current url"))?;
        Ok(url.to_string())
    }

    async fn find_all(&self, locator: &Locator) -> Result<Vec<Element>> {
        self.activate().await?;
        let query = Query::from(locator);
        self.client
            .find_all(query.as_locator())
            .await
            .map_err(|e| classify(e, &locator.to_string()))
    }

    async fn find_all_in(&self, parent: &Element, locator: &Locator) -> Result<Vec<Element>> {
        self.activate().await?;
        let query = Query::from(locator);
        parent
            .find_all(query.as_locator())
            .await
            .map_err(|e| classify(e, &locator.to_string()))
    }

    async fn is_displayed(&self, el: &Element) -> Result<bool> {
        self.activate().await?;
        el.is_displayed().await.map_err(|e| classify(e, "displayed"))
    }

    async fn is_enabled(&self, el: &Element) -> Result<bool> {
        self.activate().await?;
        el.is_enabled().await.map_err(|e| classify(e, "enabled"))
    }

    async fn click(&self, el: &Element) -> Result<()> {
        self.activate().await?;
        el.click().await.map_err(|e| classify(e, "click"))
    }

    async fn double_click(&self, el: &Element) -> Result<()> {
        self.activate().await?;
        self.script(DOUBLE_CLICK_JS, vec![element_arg(el)?]).await?;
        Ok(())
    }

    async fn text(&self, el: &Element) -> Result<String> {
        self.activate().await?;
        el.text().await.map_err(|e| classify(e, "text"))
    }

    async fn value(&self, el: &Element) -> Result<Option<String>> {
        self.activate().await?;
        el.prop("value").await.map_err(|e| classify(e, "value"))
    }

    async fn outer_html(&self, el: &Element) -> Result<String> {
        self.activate().await?;
        el.html(false).await.map_err(|e| classify(e, "outer html"))
    }

    async fn type_text(&self, el: &Element, text: &str, submit: bool) -> Result<()> {
        self.activate().await?;
        el.clear().await.map_err(|e| classify(e, "clear"))?;
        el.send_keys(text).await.map_err(|e| classify(e, "type"))?;
        if submit {
            el.send_keys(ENTER_KEY)
                .await
                .map_err(|e| classify(e, "submit"))?;
        }
        Ok(())
    }

    async fn scroll_metrics(&self, el: &Element) -> Result<ScrollMetrics> {
        self.activate().await?;
        let v = self.script(SCROLL_METRICS_JS, vec![element_arg(el)?]).await?;
        let nums: Vec<i64> = v
            .as_array()
            .map(|a| a.iter().map(|n| n.as_f64().unwrap_or(0.0).round() as i64).collect())
            .unwrap_or_default();
        match nums.as_slice() {
            [top, height, client] => Ok(ScrollMetrics {
                scroll_top: *top,
                scroll_height: *height,
                client_height: *client,
            }),
            _ => Err(HarvestError::Driver(format!("unexpected scroll metrics: {}", v))),
        }
    }

    async fn scroll_by(&self, el: &Element, dy: i64) -> Result<()> {
        self.activate().await?;
        self.script(SCROLL_BY_JS, vec![element_arg(el)?, json!(dy)])
            .await?;
        Ok(())
    }

    async fn remove_overlays(&self) -> Result<usize> {
        self.activate().await?;
        let v = self
            .script(REMOVE_OVERLAYS_JS, vec![json!(self.overlay_selector)])
            .await?;
        Ok(v.as_u64().unwrap_or(0) as usize)
    }
}

fn element_arg(el: &Element) -> Result<Value> {
    serde_json::to_value(el).map_err(|e| HarvestError::Driver(format!("element arg: {}", e)))
}

/// Owned form of a [`Locator`] that fantoccini can borrow from.
struct Query<'a> {
    by: By,
    value: Cow<'a, str>,
}

enum By {
    Css,
    XPath,
    Id,
}

impl<'a> From<&'a Locator> for Query<'a> {
    fn from(loc: &'a Locator) -> Self {
        match loc {
            Locator::Css(s) => Query { by: By::Css, value: Cow::Borrowed(s) },
            Locator::Xpath(s) => Query { by: By::XPath, value: Cow::Borrowed(s) },
            Locator::Id(s) => Query { by: By::Id, value: Cow::Borrowed(s) },
            Locator::Class(s) => Query {
                by: By::Css,
                value: Cow::Owned(format!(".{}", s.trim())),
            },
        }
    }
}

impl Query<'_> {
    fn as_locator(&self) -> WdLocator<'_> {
        match self.by {
            By::Css => WdLocator::Css(&self.value),
            By::XPath => WdLocator::XPath(&self.value),
            By::Id => WdLocator::Id(&self.value),
        }
    }
}

/// Map a fantoccini error onto the harvest taxonomy. A dead driver or a
/// closed window ends the session.
fn classify(err: CmdError, what: &str) -> HarvestError {
    match &err {
        CmdError::Lost(_) | CmdError::Failed(_) | CmdError::FailedC(_) => {
            HarvestError::SessionLost(err.to_string())
        }
        CmdError::Standard(wd) => match wd.error {
            ErrorStatus::NoSuchElement => HarvestError::NotFound(what.to_string()),
            ErrorStatus::StaleElementReference => HarvestError::Stale(what.to_string()),
            ErrorStatus::ElementClickIntercepted => HarvestError::Intercepted(what.to_string()),
            ErrorStatus::ElementNotInteractable => HarvestError::NotInteractable(what.to_string()),
            ErrorStatus::Timeout | ErrorStatus::ScriptTimeout => {
                HarvestError::timeout(what, Duration::ZERO)
            }
            ErrorStatus::NoSuchWindow
            | ErrorStatus::InvalidSessionId
            | ErrorStatus::SessionNotCreated => HarvestError::SessionLost(err.to_string()),
            _ => HarvestError::Driver(format!("{}: {}", what, err)),
        },
        CmdError::WaitTimeout => HarvestError::timeout(what, Duration::ZERO),
        _ => HarvestError::Driver(format!("{}: {}", what, err)),
    }
}
