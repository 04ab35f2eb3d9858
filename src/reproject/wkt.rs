//! Well-Known Text CRS reader.
//!
//! Parses WKT1 (`PROJCS`, `GEOGCS`, ESRI flavour included) and the subset of
//! WKT2 (`PROJCRS`, `GEOGCRS`, `ID`) needed to derive a PROJ string. Anything
//! the reader cannot express is reported as an error and the caller decides
//! how to degrade.

use anyhow::{Result, anyhow, bail};

/// Nesting depth accepted before the input is rejected as pathological.
const MAX_DEPTH: usize = 32;

/// One `KEYWORD[arg, ...]` node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub keyword: String,
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Text(String),
    Number(f64),
    Node(Node),
}

impl Node {
    /// First quoted argument, conventionally the object name.
    pub fn name(&self) -> Option<&str> {
        self.args.iter().find_map(|a| match a {
            Arg::Text(t) => Some(t.as_str()),
            _ => None,
        })
    }

    pub fn numbers(&self) -> Vec<f64> {
        self.args
            .iter()
            .filter_map(|a| match a {
                Arg::Number(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    pub fn number(&self, index: usize) -> Option<f64> {
        self.numbers().get(index).copied()
    }

    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.args.iter().filter_map(|a| match a {
            Arg::Node(n) => Some(n),
            _ => None,
        })
    }

    /// First direct child whose keyword is one of `keywords`.
    pub fn child(&self, keywords: &[&str]) -> Option<&Node> {
        self.children()
            .find(|c| keywords.iter().any(|k| c.keyword.eq_ignore_ascii_case(k)))
    }

    /// Depth-first search for the first descendant matching `keywords`.
    pub fn find(&self, keywords: &[&str]) -> Option<&Node> {
        self.child(keywords)
            .or_else(|| self.children().find_map(|c| c.find(keywords)))
    }

    pub fn is(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.keyword.eq_ignore_ascii_case(k))
    }

    /// EPSG code from a direct `AUTHORITY["EPSG","n"]` or `ID["EPSG",n]` child.
    pub fn epsg_code(&self) -> Option<u16> {
        let authority = self.child(&["AUTHORITY", "ID"])?;
        let mut args = authority.args.iter();
        match args.next() {
            Some(Arg::Text(name)) if name.eq_ignore_ascii_case("EPSG") => {}
            _ => return None,
        }
        match args.next()? {
            Arg::Text(code) => code.trim().parse().ok(),
            Arg::Number(code) if code.fract() == 0.0 && *code >= 0.0 && *code <= u16::MAX as f64 => {
                Some(*code as u16)
            }
            _ => None,
        }
    }
}

/// Parse a complete WKT document into its root node.
pub fn parse(input: &str) -> Result<Node> {
    let mut parser = Parser {
        bytes: input.as_bytes(),
        pos: 0,
    };
    let node = parser.node(0)?;
    parser.skip_ws();
    if parser.pos != parser.bytes.len() {
        bail!("trailing characters after WKT at offset {}", parser.pos);
    }
    Ok(node)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn node(&mut self, depth: usize) -> Result<Node> {
        if depth > MAX_DEPTH {
            bail!("WKT nested deeper than {MAX_DEPTH} levels");
        }
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            bail!("expected WKT keyword at offset {start}");
        }
        let keyword = String::from_utf8_lossy(&self.bytes[start..self.pos]).to_ascii_uppercase();

        self.skip_ws();
        let close = match self.peek() {
            Some(b'[') => b']',
            Some(b'(') => b')',
            _ => return Ok(Node { keyword, args: Vec::new() }),
        };
        self.pos += 1;

        let mut args = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(c) if c == close => {
                    self.pos += 1;
                    break;
                }
                Some(b',') if !args.is_empty() => {
                    self.pos += 1;
                    continue;
                }
                Some(b'"') => args.push(Arg::Text(self.quoted()?)),
                Some(c) if c == b'-' || c == b'+' || c == b'.' || c.is_ascii_digit() => {
                    args.push(Arg::Number(self.number()?))
                }
                Some(c) if c.is_ascii_alphabetic() => args.push(Arg::Node(self.node(depth + 1)?)),
                Some(c) => bail!("unexpected character {:?} at offset {}", c as char, self.pos),
                None => bail!("unterminated WKT node {keyword}"),
            }
        }
        Ok(Node { keyword, args })
    }

    fn quoted(&mut self) -> Result<String> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                // WKT escapes a quote by doubling it.
                Some(b'"') if self.bytes.get(self.pos + 1) == Some(&b'"') => {
                    out.push(b'"');
                    self.pos += 2;
                }
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(String::from_utf8_lossy(&out).into_owned());
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
                None => bail!("unterminated quoted string"),
            }
        }
    }

    fn number(&mut self) -> Result<f64> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, b'-' | b'+' | b'.' | b'e' | b'E') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])?;
        text.parse()
            .map_err(|_| anyhow!("invalid number {text:?} at offset {start}"))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }
}
