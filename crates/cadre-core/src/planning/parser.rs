//! Incremental plan-document parser.
//!
//! The planner re-parses the accumulated model output on every text delta,
//! so most invocations see a truncated document. Parsing is split into
//! three stages: repair the prefix (drop a dangling partial tag, close
//! every unterminated element from an open-tag stack), tokenize, and build.
//! [`parse_prefix`] maps any failure to `None`; [`parse_final`] is the only
//! fatal parse point.

use crate::planning::plan::{AgentTask, PlanNode, Workflow};
use thiserror::Error;

/// Plan-document parse errors. Only fatal once the stream has completed.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The document contains no `<root>` element.
    #[error("plan document has no <root> element")]
    MissingRoot,

    /// The document is structurally broken.
    #[error("malformed plan document: {0}")]
    Malformed(String),

    /// An `<agent>` element is missing its `name` attribute.
    #[error("plan agent is missing its name attribute")]
    MissingAgentName,
}

/// Best-effort parse of a (possibly truncated) document prefix.
///
/// Never fails: a prefix that cannot be parsed yet yields `None`.
pub fn parse_prefix(raw: &str) -> Option<Workflow> {
    parse_repaired(raw).ok()
}

/// Parse of the completed document. Failures here are fatal.
///
/// The same tag repair as [`parse_prefix`] is applied first, so a model
/// that forgot a trailing close tag still produces a plan.
pub fn parse_final(raw: &str) -> Result<Workflow, PlanError> {
    parse_repaired(raw)
}

fn parse_repaired(raw: &str) -> Result<Workflow, PlanError> {
    let fragment = locate_root(raw).ok_or(PlanError::MissingRoot)?;
    let repaired = repair(fragment);
    let tokens = tokenize(&repaired)?;
    let root = build_dom(tokens)?;
    workflow_from(&root)
}

/// Finds the outermost `<root>` element, skipping any preamble prose the
/// model emitted before the document.
fn locate_root(raw: &str) -> Option<&str> {
    let mut search = 0;
    while let Some(pos) = raw[search..].find("<root") {
        let start = search + pos;
        let after = raw[start + 5..].chars().next();
        // Reject a longer tag name such as <rootnode>.
        match after {
            None | Some('>' | ' ' | '\t' | '\n' | '\r' | '/') => return Some(&raw[start..]),
            _ => search = start + 5,
        }
    }
    None
}

/// Heuristically closes a truncated document so the structural parser
/// accepts it: a dangling partial tag is dropped, then every element still
/// open is closed in stack order.
fn repair(fragment: &str) -> String {
    let mut repaired = fragment.to_string();

    // A '<' with no following '>' is a tag cut off mid-stream.
    if let Some(lt) = repaired.rfind('<') {
        if !repaired[lt..].contains('>') {
            repaired.truncate(lt);
        }
    }

    for name in open_stack(&repaired).into_iter().rev() {
        repaired.push_str("</");
        repaired.push_str(&name);
        repaired.push('>');
    }
    repaired
}

/// Scans tags (without building anything) and returns the names still open.
fn open_stack(fragment: &str) -> Vec<String> {
    let mut stack: Vec<String> = Vec::new();
    let bytes = fragment.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let Some(end) = find_tag_end(fragment, i) else {
            break;
        };
        let tag = &fragment[i + 1..end];
        if let Some(name) = tag.strip_prefix('/') {
            let name = name.trim();
            if let Some(pos) = stack.iter().rposition(|n| n == name) {
                stack.truncate(pos);
            }
        } else if !tag.starts_with('!') && !tag.starts_with('?') && !tag.ends_with('/') {
            let name: String =
                tag.chars().take_while(|c| !c.is_whitespace() && *c != '/').collect();
            if !name.is_empty() {
                stack.push(name);
            }
        }
        i = end + 1;
    }
    stack
}

/// Finds the `>` terminating the tag opened at `start`, skipping quoted
/// attribute values.
fn find_tag_end(fragment: &str, start: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (offset, c) in fragment[start..].char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(start + offset),
            _ => {}
        }
    }
    None
}

#[derive(Debug)]
enum Token {
    Open { name: String, attrs: Vec<(String, String)>, self_closing: bool },
    Close { name: String },
    Text(String),
}

fn tokenize(xml: &str) -> Result<Vec<Token>, PlanError> {
    let mut tokens = Vec::new();
    let mut rest = xml;
    while !rest.is_empty() {
        if let Some(lt) = rest.find('<') {
            if lt > 0 {
                tokens.push(Token::Text(unescape(&rest[..lt])));
            }
            if rest[lt..].starts_with("<!--") {
                match rest[lt..].find("-->") {
                    Some(end) => {
                        rest = &rest[lt + end + 3..];
                        continue;
                    }
                    None => break,
                }
            }
            let end = find_tag_end(rest, lt)
                .ok_or_else(|| PlanError::Malformed("unterminated tag".to_string()))?;
            let tag = &rest[lt + 1..end];
            if let Some(name) = tag.strip_prefix('/') {
                tokens.push(Token::Close { name: name.trim().to_string() });
            } else if !tag.starts_with('!') && !tag.starts_with('?') {
                tokens.push(parse_open_tag(tag)?);
            }
            rest = &rest[end + 1..];
        } else {
            tokens.push(Token::Text(unescape(rest)));
            break;
        }
    }
    Ok(tokens)
}

fn parse_open_tag(tag: &str) -> Result<Token, PlanError> {
    let (body, self_closing) = match tag.strip_suffix('/') {
        Some(body) => (body, true),
        None => (tag, false),
    };
    let mut chars = body.char_indices();
    let name_end = chars
        .find(|(_, c)| c.is_whitespace())
        .map_or(body.len(), |(i, _)| i);
    let name = body[..name_end].to_string();
    if name.is_empty() {
        return Err(PlanError::Malformed("empty tag name".to_string()));
    }

    let mut attrs = Vec::new();
    let mut rest = body[name_end..].trim_start();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        let attr_name = rest[..eq].trim().to_string();
        let after = rest[eq + 1..].trim_start();
        let Some(quote) = after.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            return Err(PlanError::Malformed(format!("unquoted attribute '{}'", attr_name)));
        };
        let value_body = &after[1..];
        let Some(close) = value_body.find(quote) else {
            return Err(PlanError::Malformed(format!("unterminated attribute '{}'", attr_name)));
        };
        attrs.push((attr_name, unescape(&value_body[..close])));
        rest = value_body[close + 1..].trim_start();
    }

    Ok(Token::Open { name, attrs, self_closing })
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[derive(Debug)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlNode>,
}

#[derive(Debug)]
enum XmlNode {
    Element(Element),
    Text(String),
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find_map(|c| match c {
            XmlNode::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter_map(move |c| match c {
            XmlNode::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    /// Direct text content, trimmed.
    fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let XmlNode::Text(t) = child {
                out.push_str(t);
            }
        }
        out.trim().to_string()
    }
}

fn build_dom(tokens: Vec<Token>) -> Result<Element, PlanError> {
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    for token in tokens {
        match token {
            Token::Open { name, attrs, self_closing } => {
                let element = Element { name, attrs, children: Vec::new() };
                if self_closing {
                    attach(&mut stack, &mut root, element)?;
                } else {
                    stack.push(element);
                }
            }
            Token::Close { name } => {
                let Some(pos) = stack.iter().rposition(|e| e.name == name) else {
                    // Stray close tag; tolerate and continue.
                    continue;
                };
                // Close intervening elements implicitly, innermost first.
                while stack.len() > pos {
                    let element = stack.pop().expect("non-empty stack");
                    attach(&mut stack, &mut root, element)?;
                }
            }
            Token::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    if !text.trim().is_empty() {
                        top.children.push(XmlNode::Text(text));
                    }
                }
            }
        }
    }

    if let Some(dangling) = stack.into_iter().next() {
        // Repair closes every element, so this indicates a logic error in
        // the caller rather than bad model output.
        return Err(PlanError::Malformed(format!("unclosed element <{}>", dangling.name)));
    }
    root.ok_or_else(|| PlanError::Malformed("empty document".to_string()))
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), PlanError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(XmlNode::Element(element));
    } else if root.is_none() {
        *root = Some(element);
    } else {
        return Err(PlanError::Malformed("multiple top-level elements".to_string()));
    }
    Ok(())
}

fn workflow_from(root: &Element) -> Result<Workflow, PlanError> {
    if root.name != "root" {
        return Err(PlanError::Malformed(format!("unexpected top-level <{}>", root.name)));
    }

    let name = root.child("name").map(Element::text).unwrap_or_default();
    let thought = root.child("thought").map(Element::text).filter(|t| !t.is_empty());

    let mut agents = Vec::new();
    if let Some(agents_el) = root.child("agents") {
        for agent_el in agents_el.children_named("agent") {
            agents.push(agent_from(agent_el)?);
        }
    }

    Ok(Workflow { name, thought, agents })
}

fn agent_from(element: &Element) -> Result<AgentTask, PlanError> {
    let name = element.attr("name").ok_or(PlanError::MissingAgentName)?.to_string();
    let depends_on = element
        .attr("dependsOn")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let task = element.child("task").map(Element::text).unwrap_or_default();
    let nodes = element.child("nodes").map(nodes_from).unwrap_or_default();

    Ok(AgentTask { name, depends_on, task, nodes })
}

fn nodes_from(element: &Element) -> Vec<PlanNode> {
    let mut nodes = Vec::new();
    for child in element.elements() {
        match child.name.as_str() {
            "node" => nodes.push(PlanNode::Step {
                text: child.text(),
                input: child.attr("input").map(str::to_string),
                output: child.attr("output").map(str::to_string),
            }),
            "forEach" => nodes.push(PlanNode::ForEach {
                items: child.attr("items").unwrap_or_default().to_string(),
                nodes: nodes_from(child),
            }),
            "watch" => nodes.push(PlanNode::Watch {
                event: child.attr("event").unwrap_or_default().to_string(),
                repeat: child.attr("loop") == Some("true"),
                description: child.child("description").map(Element::text).unwrap_or_default(),
                triggers: child.child("trigger").map(nodes_from).unwrap_or_default(),
            }),
            // Unknown elements are skipped rather than failing the plan.
            _ => {}
        }
    }
    nodes
}
