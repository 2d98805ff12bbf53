//! A small internal structured-document model: a tag tree with ordered
//! attributes and optional character data. Used to persist leases and
//! policies, and to render `show-xml`. No general XML engine is pulled in —
//! nothing else in this project's dependency lineage reaches for one, so a
//! purpose-built tree mirroring the donor's own structured text formats
//! (INI sections, key=value state files) is used instead.

use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
    pub text: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Node {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Serialize to indented tagged text. Bit-identical across
    /// serialize/parse/serialize round trips for documents produced by
    /// `parse`.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.write_indented(&mut out, 0);
        out
    }

    fn write_indented(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = write!(out, "{indent}<{}", self.name);
        for (k, v) in &self.attrs {
            let _ = write!(out, " {k}=\"{}\"", escape(v));
        }
        if self.children.is_empty() && self.text.is_none() {
            out.push_str("/>\n");
            return;
        }
        out.push('>');
        if let Some(text) = &self.text {
            out.push_str(&escape(text));
        }
        if !self.children.is_empty() {
            out.push('\n');
            for child in &self.children {
                child.write_indented(out, depth + 1);
            }
            out.push_str(&indent);
        }
        let _ = write!(out, "</{}>\n", self.name);
    }

    /// Parse a document written by `serialize`. Tolerant of surrounding
    /// whitespace; returns `None` on malformed input (used by the lease
    /// recovery path to discard partially written files rather than erroring).
    pub fn parse(input: &str) -> Option<Node> {
        let mut parser = Parser {
            chars: input.char_indices().peekable(),
            input,
        };
        parser.skip_ws();
        let node = parser.parse_node()?;
        Some(node)
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    input: &'a str,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = match self.chars.peek() {
            Some(&(i, _)) => i,
            None => return "",
        };
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if pred(c) {
                end = i + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        &self.input[start..end]
    }

    fn expect(&mut self, c: char) -> Option<()> {
        match self.chars.next() {
            Some((_, got)) if got == c => Some(()),
            _ => None,
        }
    }

    fn parse_node(&mut self) -> Option<Node> {
        self.expect('<')?;
        let name = self.take_while(|c| c != ' ' && c != '/' && c != '>' && !c.is_whitespace());
        if name.is_empty() {
            return None;
        }
        let mut node = Node::new(name);

        loop {
            self.skip_ws();
            match self.peek_char()? {
                '/' => {
                    self.chars.next();
                    self.expect('>')?;
                    return Some(node);
                }
                '>' => {
                    self.chars.next();
                    break;
                }
                _ => {
                    let key = self.take_while(|c| c != '=' && !c.is_whitespace() && c != '>');
                    if key.is_empty() {
                        return None;
                    }
                    let key = key.to_string();
                    self.skip_ws();
                    self.expect('=')?;
                    self.expect('"')?;
                    let value = self.take_while(|c| c != '"');
                    let value = unescape(value);
                    self.expect('"')?;
                    node.attrs.push((key, value));
                }
            }
        }

        // content: either nested nodes or character data, until </name>
        loop {
            self.skip_ws();
            match self.peek_char() {
                Some('<') => {
                    // could be a close tag or a child node
                    let save = self.chars.clone();
                    self.chars.next();
                    if self.peek_char() == Some('/') {
                        self.chars.next();
                        let closing = self.take_while(|c| c != '>');
                        self.expect('>')?;
                        if closing != node.name {
                            return None;
                        }
                        return Some(node);
                    }
                    self.chars = save;
                    let child = self.parse_node()?;
                    node.children.push(child);
                }
                Some(_) => {
                    let text = self.take_while(|c| c != '<');
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        node.text = Some(unescape(trimmed));
                    }
                }
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_leaf_with_attrs() {
        let n = Node::new("lease")
            .with_attr("family", "ipv4")
            .with_attr("method", "dhcp");
        let text = n.serialize();
        let parsed = Node::parse(&text).unwrap();
        assert_eq!(parsed, n);
    }

    #[test]
    fn round_trip_nested() {
        let n = Node::new("lease")
            .with_attr("family", "ipv4")
            .with_child(Node::new("address").with_attr("value", "10.0.0.2/24"))
            .with_child(Node::new("route").with_attr("gateway", "10.0.0.1"));
        let text = n.serialize();
        let parsed = Node::parse(&text).unwrap();
        assert_eq!(parsed, n);
        // serialize -> parse -> serialize is bit-identical
        assert_eq!(parsed.serialize(), text);
    }

    #[test]
    fn round_trip_with_text() {
        let n = Node::new("value").with_text("hunter2");
        let text = n.serialize();
        let parsed = Node::parse(&text).unwrap();
        assert_eq!(parsed, n);
    }

    #[test]
    fn escapes_special_characters() {
        let n = Node::new("x").with_attr("k", "a\"b&c<d>e");
        let text = n.serialize();
        let parsed = Node::parse(&text).unwrap();
        assert_eq!(parsed.attr("k"), Some("a\"b&c<d>e"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Node::parse("not a document").is_none());
        assert!(Node::parse("<unterminated").is_none());
        assert!(Node::parse("").is_none());
    }

    #[test]
    fn parse_rejects_partial_truncated_file() {
        let n = Node::new("lease").with_child(Node::new("address"));
        let text = n.serialize();
        // simulate a crash mid-write: truncate before the closing tag
        let truncated = &text[..text.len() - 5];
        assert!(Node::parse(truncated).is_none());
    }

    #[test]
    fn child_lookup() {
        let n = Node::new("policy")
            .with_child(Node::new("match").with_attr("type", "ethernet"))
            .with_child(Node::new("match").with_attr("type", "wifi"));
        assert_eq!(n.children_named("match").count(), 2);
        assert_eq!(n.child("match").unwrap().attr("type"), Some("ethernet"));
    }
}
