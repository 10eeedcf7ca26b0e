//! Small owned XML tree: parsed with `roxmltree`, mutated in place, written
//! back with namespace declarations, comments and whitespace kept.

use crate::error::ServError;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: &str) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.children.push(Node::Text(text.to_string()));
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attr(&mut self, key: &str, value: &str) {
        match self.attributes.iter_mut().find(|(name, _)| name == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.attributes.push((key.to_string(), value.to_string())),
        }
    }

    /// Concatenated direct text content, trimmed.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<String>()
            .trim()
            .to_string()
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|element| element.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(Element::text)
    }

    pub fn find_mut<F>(&mut self, predicate: F) -> Option<&mut Element>
    where
        F: Fn(&Element) -> bool,
    {
        self.children.iter_mut().find_map(|node| match node {
            Node::Element(element) => predicate(&*element).then_some(element),
            _ => None,
        })
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.find_mut(|element| element.name == name)
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Element) -> bool,
    {
        self.elements().filter(|element| predicate(element)).count()
    }

    /// Indentation used by existing children, if any.
    fn child_indent(&self) -> Option<String> {
        self.children.iter().find_map(|node| match node {
            Node::Text(text) if text.trim().is_empty() && text.contains('\n') => {
                text.rsplit('\n').next().map(str::to_string)
            }
            _ => None,
        })
    }

    /// Append `child`, matching the indentation of existing children.
    pub fn append(&mut self, child: Element, depth: usize) {
        let indent = self
            .child_indent()
            .unwrap_or_else(|| "  ".repeat(depth + 1));
        let closing_indent = "  ".repeat(depth);
        let mut child = child;
        child.indent_children(depth + 1);
        match self.children.last() {
            Some(Node::Text(text)) if text.trim().is_empty() => {
                let last = self.children.len() - 1;
                self.children.insert(last, Node::Text(format!("\n{indent}")));
                self.children.insert(last + 1, Node::Element(child));
            }
            _ => {
                self.children.push(Node::Text(format!("\n{indent}")));
                self.children.push(Node::Element(child));
                self.children.push(Node::Text(format!("\n{closing_indent}")));
            }
        }
    }

    /// Insert `child` directly before the first element matching `anchor`,
    /// or append when none matches.
    pub fn insert_before<F>(&mut self, child: Element, depth: usize, anchor: F)
    where
        F: Fn(&Element) -> bool,
    {
        let position = self.children.iter().position(|node| match node {
            Node::Element(element) => anchor(element),
            _ => false,
        });
        let Some(position) = position else {
            self.append(child, depth);
            return;
        };
        let indent = self
            .child_indent()
            .unwrap_or_else(|| "  ".repeat(depth + 1));
        let mut child = child;
        child.indent_children(depth + 1);
        self.children.insert(position, Node::Text(format!("\n{indent}")));
        self.children.insert(position, Node::Element(child));
    }

    /// Replace the first child matching `is_target` in place (dropping any
    /// further matches), or insert `child` before `anchor` when none exists.
    pub fn upsert<F, A>(&mut self, child: Element, depth: usize, is_target: F, anchor: A)
    where
        F: Fn(&Element) -> bool,
        A: Fn(&Element) -> bool,
    {
        let first = self.children.iter().position(|node| match node {
            Node::Element(element) => is_target(element),
            _ => false,
        });
        let Some(first) = first else {
            self.insert_before(child, depth, anchor);
            return;
        };
        let mut child = child;
        child.indent_children(depth + 1);
        let mut kept: Vec<Node> = Vec::with_capacity(self.children.len());
        for (index, node) in self.children.drain(..).enumerate() {
            match node {
                _ if index == first => kept.push(Node::Element(child.clone())),
                Node::Element(element) if is_target(&element) => {
                    if matches!(kept.last(), Some(Node::Text(text)) if text.trim().is_empty()) {
                        kept.pop();
                    }
                }
                other => kept.push(other),
            }
        }
        self.children = kept;
    }

    /// Remove every child element matching `predicate` together with the
    /// whitespace that preceded it. Returns how many were removed.
    pub fn remove_where<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&Element) -> bool,
    {
        let mut removed = 0;
        let mut kept: Vec<Node> = Vec::with_capacity(self.children.len());
        for node in self.children.drain(..) {
            match node {
                Node::Element(element) if predicate(&element) => {
                    removed += 1;
                    if matches!(kept.last(), Some(Node::Text(text)) if text.trim().is_empty()) {
                        kept.pop();
                    }
                }
                other => kept.push(other),
            }
        }
        if removed > 0 && !matches!(kept.last(), Some(Node::Text(_))) && !kept.is_empty() {
            kept.push(Node::Text("\n".to_string()));
        }
        self.children = kept;
        removed
    }

    // Freshly built elements carry no whitespace; give nested children line
    // breaks so the output stays readable.
    fn indent_children(&mut self, depth: usize) {
        let has_elements = self.children.iter().any(|n| matches!(n, Node::Element(_)));
        let has_layout = self
            .children
            .iter()
            .any(|n| matches!(n, Node::Text(t) if t.trim().is_empty()));
        if !has_elements || has_layout {
            return;
        }
        let inner = "  ".repeat(depth + 1);
        let mut laid_out = Vec::with_capacity(self.children.len() * 2 + 1);
        for node in self.children.drain(..) {
            laid_out.push(Node::Text(format!("\n{inner}")));
            match node {
                Node::Element(mut element) => {
                    element.indent_children(depth + 1);
                    laid_out.push(Node::Element(element));
                }
                other => laid_out.push(other),
            }
        }
        laid_out.push(Node::Text(format!("\n{}", "  ".repeat(depth))));
        self.children = laid_out;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub prolog: Vec<Node>,
    pub root: Element,
}

impl Document {
    pub fn parse(source: &str) -> Result<Self, ServError> {
        let doc = roxmltree::Document::parse(source)
            .map_err(|err| ServError::Config(format!("invalid XML template: {err}")))?;
        let root_node = doc.root_element();
        let mut prolog = Vec::new();
        for node in doc.root().children() {
            if node == root_node {
                break;
            }
            if node.is_comment() {
                prolog.push(Node::Comment(node.text().unwrap_or_default().to_string()));
            }
        }
        Ok(Self {
            prolog,
            root: convert(root_node, &BTreeMap::new()),
        })
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        for node in &self.prolog {
            write_node(node, &mut out);
            out.push('\n');
        }
        write_element(&self.root, &mut out);
        out.push('\n');
        out
    }
}

fn qualified(node: roxmltree::Node, namespace: Option<&str>, local: &str) -> String {
    match namespace.and_then(|uri| node.lookup_prefix(uri)) {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{local}"),
        _ => local.to_string(),
    }
}

fn convert(node: roxmltree::Node, inherited: &BTreeMap<String, String>) -> Element {
    let tag = node.tag_name();
    let mut element = Element::new(&qualified(node, tag.namespace(), tag.name()));

    let mut scope = inherited.clone();
    for ns in node.namespaces() {
        let prefix = ns.name().unwrap_or_default().to_string();
        if prefix == "xml" {
            continue;
        }
        if inherited.get(&prefix).map(String::as_str) != Some(ns.uri()) {
            let key = if prefix.is_empty() {
                "xmlns".to_string()
            } else {
                format!("xmlns:{prefix}")
            };
            element.attributes.push((key, ns.uri().to_string()));
        }
        scope.insert(prefix, ns.uri().to_string());
    }
    for attr in node.attributes() {
        let name = match attr.namespace() {
            Some(uri) => match node.lookup_prefix(uri) {
                Some(prefix) if !prefix.is_empty() => format!("{prefix}:{}", attr.name()),
                _ => attr.name().to_string(),
            },
            None => attr.name().to_string(),
        };
        element.attributes.push((name, attr.value().to_string()));
    }
    for child in node.children() {
        if child.is_element() {
            element.children.push(Node::Element(convert(child, &scope)));
        } else if child.is_text() {
            element
                .children
                .push(Node::Text(child.text().unwrap_or_default().to_string()));
        } else if child.is_comment() {
            element
                .children
                .push(Node::Comment(child.text().unwrap_or_default().to_string()));
        }
    }
    element
}

fn escape(text: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Element(element) => write_element(element, out),
        Node::Text(text) => out.push_str(&escape(text, false)),
        Node::Comment(text) => {
            out.push_str("<!--");
            out.push_str(text);
            out.push_str("-->");
        }
    }
}

fn write_element(element: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&element.name);
    for (key, value) in &element.attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape(value, true));
        out.push('"');
    }
    if element.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &element.children {
        write_node(child, out);
    }
    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
}
