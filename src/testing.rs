//! In-memory stand-in for a browser tab, used by unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::browser::{Locator, Page, ScrollMetrics};
use crate::error::{HarvestError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FakeEl {
    Node(usize),
    GridContainer,
    GridRow(usize),
    GridCell(usize),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub text: String,
    pub value: Option<String>,
    pub displayed: bool,
    pub enabled: bool,
    pub html: String,
    children: HashMap<String, Vec<usize>>,
}

impl Node {
    pub fn text(text: &str) -> Self {
        Node {
            text: text.to_string(),
            value: None,
            displayed: true,
            enabled: true,
            html: format!("<div>{}</div>", text),
            children: HashMap::new(),
        }
    }

    pub fn input(value: &str) -> Self {
        Node {
            value: Some(value.to_string()),
            html: format!("<input value=\"{}\">", value),
            ..Node::text("")
        }
    }

    pub fn hidden(mut self) -> Self {
        self.displayed = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_html(mut self, html: &str) -> Self {
        self.html = html.to_string();
        self
    }
}

/// A virtualized list: `labels[i]` is the ordinal cell text of row `i`, or
/// `None` for a row whose cell cannot be read.
#[derive(Debug, Clone)]
pub struct VirtualGrid {
    pub container: Locator,
    pub row: Locator,
    pub cell: Locator,
    pub labels: Vec<Option<String>>,
    pub window: usize,
    pub top: usize,
    pub row_px: i64,
    /// When false the container keeps rendering the same window regardless
    /// of scrolling.
    pub scrolls: bool,
}

impl VirtualGrid {
    pub fn numbered(container: Locator, row: Locator, cell: Locator, total: usize, window: usize) -> Self {
        VirtualGrid {
            container,
            row,
            cell,
            labels: (1..=total).map(|n| Some(format!("Site {}", n))).collect(),
            window,
            top: 0,
            row_px: 30,
            scrolls: true,
        }
    }

    fn visible(&self) -> std::ops::Range<usize> {
        let end = (self.top + self.window).min(self.labels.len());
        self.top..end
    }

    fn max_top(&self) -> usize {
        self.labels.len().saturating_sub(self.window)
    }
}

type Hook = Arc<dyn Fn(&mut FakeDom, &str) + Send + Sync>;

#[derive(Default)]
pub struct FakeDom {
    nodes: Vec<Node>,
    roots: HashMap<String, Vec<usize>>,
    grid: Option<VirtualGrid>,
    url: String,
    on_goto: Option<Hook>,
    on_click: HashMap<FakeEl, Hook>,
    intercepts: HashMap<FakeEl, u32>,
    pub visits: Vec<String>,
    pub clicks: Vec<FakeEl>,
    pub double_clicks: Vec<FakeEl>,
    pub typed: Vec<(FakeEl, String, bool)>,
    pub overlays_removed: usize,
    pub lost: bool,
}

impl FakeDom {
    pub fn add(&mut self, locator: &Locator, node: Node) -> FakeEl {
        let id = self.nodes.len();
        self.nodes.push(node);
        self.roots.entry(locator.to_string()).or_default().push(id);
        FakeEl::Node(id)
    }

    pub fn add_child(&mut self, parent: &FakeEl, locator: &Locator, node: Node) -> FakeEl {
        let id = self.nodes.len();
        self.nodes.push(node);
        if let FakeEl::Node(p) = parent {
            self.nodes[*p]
                .children
                .entry(locator.to_string())
                .or_default()
                .push(id);
        }
        FakeEl::Node(id)
    }

    pub fn remove(&mut self, locator: &Locator) {
        self.roots.remove(&locator.to_string());
    }

    fn node(&self, el: &FakeEl) -> Result<&Node> {
        match el {
            FakeEl::Node(id) => self
                .nodes
                .get(*id)
                .ok_or_else(|| HarvestError::Stale(format!("node {}", id))),
            other => Err(HarvestError::Driver(format!("{:?} is not a node", other))),
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.lost {
            Err(HarvestError::SessionLost("fake browser closed".into()))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Default)]
pub struct FakePage {
    dom: Arc<Mutex<FakeDom>>,
}

impl FakePage {
    pub fn new() -> Self {
        FakePage::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeDom) -> R) -> R {
        let mut dom = self.dom.lock().unwrap();
        f(&mut dom)
    }

    pub fn add(&self, locator: &Locator, node: Node) -> FakeEl {
        self.with(|d| d.add(locator, node))
    }

    pub fn add_child(&self, parent: &FakeEl, locator: &Locator, node: Node) -> FakeEl {
        self.with(|d| d.add_child(parent, locator, node))
    }

    pub fn set_grid(&self, grid: VirtualGrid) {
        self.with(|d| d.grid = Some(grid));
    }

    pub fn grid_top(&self) -> usize {
        self.with(|d| d.grid.as_ref().map(|g| g.top).unwrap_or(0))
    }

    pub fn on_goto(&self, hook: impl Fn(&mut FakeDom, &str) + Send + Sync + 'static) {
        self.with(|d| d.on_goto = Some(Arc::new(hook)));
    }

    pub fn on_click(&self, el: &FakeEl, hook: impl Fn(&mut FakeDom, &str) + Send + Sync + 'static) {
        let el = el.clone();
        self.with(|d| {
            d.on_click.insert(el, Arc::new(hook));
        });
    }

    pub fn intercept_clicks(&self, el: &FakeEl, times: u32) {
        let el = el.clone();
        self.with(|d| {
            d.intercepts.insert(el, times);
        });
    }

    fn fire_click(&self, el: &FakeEl, double: bool) -> Result<()> {
        let hook = {
            let mut dom = self.dom.lock().unwrap();
            dom.check_alive()?;
            if let Some(left) = dom.intercepts.get_mut(el) {
                if *left > 0 {
                    *left -= 1;
                    return Err(HarvestError::Intercepted(format!("{:?}", el)));
                }
            }
            if double {
                dom.double_clicks.push(el.clone());
            } else {
                dom.clicks.push(el.clone());
            }
            dom.on_click.get(el).cloned()
        };
        if let Some(hook) = hook {
            let mut dom = self.dom.lock().unwrap();
            let url = dom.url.clone();
            hook(&mut dom, &url);
        }
        Ok(())
    }
}

#[async_trait]
impl Page for FakePage {
    type Element = FakeEl;

    async fn goto(&self, url: &str) -> Result<()> {
        let hook = {
            let mut dom = self.dom.lock().unwrap();
            dom.check_alive()?;
            dom.url = url.to_string();
            dom.visits.push(url.to_string());
            dom.on_goto.clone()
        };
        if let Some(hook) = hook {
            let mut dom = self.dom.lock().unwrap();
            hook(&mut dom, url);
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let dom = self.dom.lock().unwrap();
        dom.check_alive()?;
        Ok(dom.url.clone())
    }

    async fn find_all(&self, locator: &Locator) -> Result<Vec<FakeEl>> {
        let dom = self.dom.lock().unwrap();
        dom.check_alive()?;
        if let Some(grid) = &dom.grid {
            if &grid.container == locator {
                return Ok(vec![FakeEl::GridContainer]);
            }
        }
        Ok(dom
            .roots
            .get(&locator.to_string())
            .map(|ids| ids.iter().map(|id| FakeEl::Node(*id)).collect())
            .unwrap_or_default())
    }

    async fn find_all_in(&self, parent: &FakeEl, locator: &Locator) -> Result<Vec<FakeEl>> {
        let dom = self.dom.lock().unwrap();
        dom.check_alive()?;
        match parent {
            FakeEl::GridContainer => {
                let grid = dom.grid.as_ref().expect("grid configured");
                if &grid.row == locator {
                    Ok(grid.visible().map(FakeEl::GridRow).collect())
                } else {
                    Ok(Vec::new())
                }
            }
            FakeEl::GridRow(i) => {
                let grid = dom.grid.as_ref().expect("grid configured");
                if &grid.cell != locator {
                    return Ok(Vec::new());
                }
                if !grid.visible().contains(i) {
                    return Err(HarvestError::Stale(format!("row {}", i)));
                }
                Ok(match grid.labels[*i] {
                    Some(_) => vec![FakeEl::GridCell(*i)],
                    None => Vec::new(),
                })
            }
            FakeEl::GridCell(_) => Ok(Vec::new()),
            FakeEl::Node(_) => {
                let node = dom.node(parent)?;
                Ok(node
                    .children
                    .get(&locator.to_string())
                    .map(|ids| ids.iter().map(|id| FakeEl::Node(*id)).collect())
                    .unwrap_or_default())
            }
        }
    }

    async fn is_displayed(&self, el: &FakeEl) -> Result<bool> {
        let dom = self.dom.lock().unwrap();
        dom.check_alive()?;
        match el {
            FakeEl::Node(_) => Ok(dom.node(el)?.displayed),
            _ => Ok(true),
        }
    }

    async fn is_enabled(&self, el: &FakeEl) -> Result<bool> {
        let dom = self.dom.lock().unwrap();
        dom.check_alive()?;
        match el {
            FakeEl::Node(_) => Ok(dom.node(el)?.enabled),
            _ => Ok(true),
        }
    }

    async fn click(&self, el: &FakeEl) -> Result<()> {
        self.fire_click(el, false)
    }

    async fn double_click(&self, el: &FakeEl) -> Result<()> {
        self.fire_click(el, true)
    }

    async fn text(&self, el: &FakeEl) -> Result<String> {
        let dom = self.dom.lock().unwrap();
        dom.check_alive()?;
        match el {
            FakeEl::GridCell(i) | FakeEl::GridRow(i) => {
                let grid = dom.grid.as_ref().expect("grid configured");
                Ok(grid.labels[*i].clone().unwrap_or_default())
            }
            FakeEl::GridContainer => Ok(String::new()),
            FakeEl::Node(_) => Ok(dom.node(el)?.text.clone()),
        }
    }

    async fn value(&self, el: &FakeEl) -> Result<Option<String>> {
        let dom = self.dom.lock().unwrap();
        dom.check_alive()?;
        Ok(dom.node(el)?.value.clone())
    }

    async fn outer_html(&self, el: &FakeEl) -> Result<String> {
        let dom = self.dom.lock().unwrap();
        dom.check_alive()?;
        Ok(dom.node(el)?.html.clone())
    }

    async fn type_text(&self, el: &FakeEl, text: &str, submit: bool) -> Result<()> {
        let hook = {
            let mut dom = self.dom.lock().unwrap();
            dom.check_alive()?;
            dom.typed.push((el.clone(), text.to_string(), submit));
            if submit {
                dom.on_click.get(el).cloned()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            let mut dom = self.dom.lock().unwrap();
            hook(&mut dom, text);
        }
        Ok(())
    }

    async fn scroll_metrics(&self, el: &FakeEl) -> Result<ScrollMetrics> {
        let dom = self.dom.lock().unwrap();
        dom.check_alive()?;
        match (el, &dom.grid) {
            (FakeEl::GridContainer, Some(g)) => Ok(ScrollMetrics {
                scroll_top: g.top as i64 * g.row_px,
                scroll_height: g.labels.len() as i64 * g.row_px,
                client_height: g.window as i64 * g.row_px,
            }),
            _ => Ok(ScrollMetrics::default()),
        }
    }

    async fn scroll_by(&self, el: &FakeEl, dy: i64) -> Result<()> {
        let mut dom = self.dom.lock().unwrap();
        dom.check_alive()?;
        if let (FakeEl::GridContainer, Some(g)) = (el, dom.grid.as_mut()) {
            if g.scrolls {
                let rows = dy / g.row_px;
                let top = (g.top as i64 + rows).clamp(0, g.max_top() as i64);
                g.top = top as usize;
            }
        }
        Ok(())
    }

    async fn remove_overlays(&self) -> Result<usize> {
        let mut dom = self.dom.lock().unwrap();
        dom.check_alive()?;
        dom.overlays_removed += 1;
        Ok(1)
    }
}
