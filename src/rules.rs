use serde::Deserialize;

/// Whether an item should be added to (or removed from) a row.
///
/// Deserializes from a bare string (`"Pet Friendly"`) or a table
/// (`{ item = "50 Amp", include = ["Premium"] }`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Rule {
    Unconditional(String),
    Conditional {
        item: String,
        #[serde(default)]
        include: Option<Vec<String>>,
        #[serde(default)]
        exclude: Option<Vec<String>>,
    },
}

impl Rule {
    pub fn item(&self) -> &str {
        match self {
            Rule::Unconditional(item) | Rule::Conditional { item, .. } => item,
        }
    }

    /// A conditional rule applies when any include keyword occurs in
    /// `context`, or when it has an exclude list and none of those occur.
    pub fn applies(&self, context: &str) -> bool {
        match self {
            Rule::Unconditional(_) => true,
            Rule::Conditional {
                include, exclude, ..
            } => {
                let hit = |words: &[String]| words.iter().any(|w| context.contains(w.as_str()));
                if include.as_deref().is_some_and(hit) {
                    return true;
                }
                exclude.as_deref().is_some_and(|words| !hit(words))
            }
        }
    }
}

/// Items of `rules` that apply to `context`, in rule order.
pub fn applicable<'a>(rules: &'a [Rule], context: &str) -> Vec<&'a str> {
    rules
        .iter()
        .filter(|r| r.applies(context))
        .map(Rule::item)
        .collect()
}
