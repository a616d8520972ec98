use std::{fmt, str::FromStr, sync::Arc};

use crate::error::{PluginError, Result};

/// Element layer a plugin can be attached to. Hosts bring their own
/// implementation; [`Node`] is the in-memory one.
pub trait Element: Send + Sync {
    /// Descendants of `self` matching `selector`, in document order.
    fn query(&self, selector: &Selector) -> Vec<Arc<dyn Element>>;
}

/// Minimal in-memory element tree for hosts that do not bring their own
/// element layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub children: Vec<Arc<Node>>,
}

impl Node {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(Arc::new(child));
        self
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    /// Descendants of `self` (not `self`) matching `selector`, in document
    /// order. Ancestor steps of a descendant selector are only matched inside
    /// this subtree.
    pub fn query(&self, selector: &Selector) -> Vec<Arc<Node>> {
        let mut found = Vec::new();
        let mut path = Vec::new();
        for child in &self.children {
            collect(child, selector, &mut path, &mut found);
        }
        found
    }
}

impl Element for Node {
    fn query(&self, selector: &Selector) -> Vec<Arc<dyn Element>> {
        Node::query(self, selector)
            .into_iter()
            .map(|node| node as Arc<dyn Element>)
            .collect()
    }
}

fn collect<'a>(
    node: &'a Arc<Node>,
    selector: &Selector,
    path: &mut Vec<&'a Node>,
    found: &mut Vec<Arc<Node>>,
) {
    if selector.matches(node, path.as_slice()) {
        found.push(node.clone());
    }
    path.push(node);
    for child in &node.children {
        collect(child, selector, path, found);
    }
    path.pop();
}

/// One compound step such as `li`, `#main`, `button.primary.large` or `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
}

impl Compound {
    fn matches(&self, node: &Node) -> bool {
        if let Some(tag) = &self.tag {
            if !node.tag.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if node.id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        self.classes.iter().all(|class| node.has_class(class))
    }
}

impl FromStr for Compound {
    type Err = PluginError;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = || PluginError::InvalidSelector(raw.to_string());
        let mut compound = Compound {
            tag: None,
            id: None,
            classes: Vec::new(),
        };
        let mut rest = raw;
        let tag_end = rest.find(|c: char| c == '#' || c == '.').unwrap_or(rest.len());
        let tag = &rest[..tag_end];
        if tag != "*" && !tag.is_empty() {
            if !is_ident(tag) {
                return Err(invalid());
            }
            compound.tag = Some(tag.to_string());
        }
        rest = &rest[tag_end..];
        while let Some(marker) = rest.chars().next() {
            let body = &rest[1..];
            let end = body.find(|c: char| c == '#' || c == '.').unwrap_or(body.len());
            let name = &body[..end];
            if !is_ident(name) {
                return Err(invalid());
            }
            match marker {
                '#' if compound.id.is_none() => compound.id = Some(name.to_string()),
                '.' => compound.classes.push(name.to_string()),
                _ => return Err(invalid()),
            }
            rest = &body[end..];
        }
        Ok(compound)
    }
}

fn is_ident(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Whitespace separated descendant chain of compound steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    raw: String,
    steps: Vec<Compound>,
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Self> {
        raw.parse()
    }

    fn matches(&self, node: &Node, ancestors: &[&Node]) -> bool {
        let Some((last, earlier)) = self.steps.split_last() else {
            return false;
        };
        if !last.matches(node) {
            return false;
        }
        let mut remaining = ancestors.iter().rev();
        earlier
            .iter()
            .rev()
            .all(|step| remaining.any(|ancestor| step.matches(ancestor)))
    }
}

impl FromStr for Selector {
    type Err = PluginError;

    fn from_str(raw: &str) -> Result<Self> {
        let steps = raw
            .split_whitespace()
            .map(Compound::from_str)
            .collect::<Result<Vec<_>>>()?;
        if steps.is_empty() {
            return Err(PluginError::InvalidSelector(raw.to_string()));
        }
        Ok(Self {
            raw: raw.trim().to_string(),
            steps,
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Optional association between a plugin and the element it decorates.
#[derive(Clone, Default)]
pub struct ElementBinder {
    root: Option<Arc<dyn Element>>,
}

impl ElementBinder {
    pub fn new(root: Option<Arc<dyn Element>>) -> Self {
        Self { root }
    }

    pub fn element(&self) -> Option<&Arc<dyn Element>> {
        self.root.as_ref()
    }

    /// Scoped lookup under the bound element; always empty when unbound.
    pub fn child(&self, selector: &str) -> Result<Vec<Arc<dyn Element>>> {
        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };
        let selector = Selector::parse(selector)?;
        Ok(root.query(&selector))
    }
}

impl fmt::Debug for ElementBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementBinder")
            .field("bound", &self.root.is_some())
            .finish()
    }
}
