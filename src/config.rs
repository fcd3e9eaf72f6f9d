// Line-oriented configuration parser.  Each line names a registered model
// followed by an optional first token (usually the device address) and a
// list of options; `#` starts a comment, quoted strings may carry spaces
// with `""` as a literal quote.  Errors carry the line number and stop the
// load.

use std::fmt;

use crate::device::DevAddr;
use crate::error::{Error, Result};

/// How a registered name consumes its line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKind {
    /// `name addr option...` — first token must be a device address.
    Model,
    /// `name value` — a single value, nothing more.
    Option,
    /// `name [addr-or-value] option...`.
    Options,
    /// `name` — no arguments at all.
    Switch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOption {
    pub name: String,
    pub value: String,
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLine {
    pub line_no: usize,
    pub model: String,
    pub first: Option<String>,
    pub options: Vec<ConfigOption>,
}

impl ConfigLine {
    /// The first token interpreted as a 12-bit device address.
    pub fn addr(&self) -> Option<DevAddr> {
        let first = self.first.as_ref()?;
        if first.is_empty() || first.len() > 4 {
            return None;
        }
        match DevAddr::from_str_radix(first, 16) {
            Ok(a) if a < 0x1000 => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.model)?;
        if let Some(first) = &self.first {
            write!(f, " {}", first)?;
        }
        for opt in &self.options {
            write!(f, " {}", opt.name)?;
            if !opt.value.is_empty() {
                if needs_quoting(&opt.value) {
                    write!(f, "=\"{}\"", opt.value.replace('"', "\"\""))?;
                } else {
                    write!(f, "={}", opt.value)?;
                }
            }
            for extra in &opt.extra {
                write!(f, ",{}", extra)?;
            }
        }
        Ok(())
    }
}

fn needs_quoting(s: &str) -> bool {
    s.chars().any(|c| c.is_whitespace() || matches!(c, '"' | ',' | '=' | '#'))
}

struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line_no: usize,
}

impl<'a> Scanner<'a> {
    fn new(line: &'a str, line_no: usize) -> Scanner<'a> {
        Scanner { chars: line.chars().peekable(), line_no }
    }

    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn at_end(&mut self) -> bool {
        matches!(self.chars.peek(), None | Some('#'))
    }

    fn ident(&mut self) -> Result<String> {
        let mut s = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || matches!(c, '=' | ',' | '"' | '#') {
                break;
            }
            s.push(c);
            self.chars.next();
        }
        if s.is_empty() {
            return Err(Error::config(self.line_no, "expected a word"));
        }
        Ok(s)
    }

    fn qstring(&mut self) -> Result<String> {
        if self.chars.peek() != Some(&'"') {
            return self.ident();
        }
        self.chars.next();
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some('"') => {
                    // A doubled quote is a literal quote.
                    if self.chars.peek() == Some(&'"') {
                        self.chars.next();
                        s.push('"');
                    } else {
                        return Ok(s);
                    }
                }
                Some(c) => s.push(c),
                None => return Err(Error::config(self.line_no, "unterminated string")),
            }
        }
    }
}

/// Parses one line; `None` for blank lines and comments.
pub fn parse_line(line: &str, line_no: usize) -> Result<Option<ConfigLine>> {
    let mut sc = Scanner::new(line, line_no);
    sc.skip_ws();
    if sc.at_end() {
        return Ok(None);
    }
    let model = sc.ident()?;
    let mut first = None;
    let mut options = Vec::new();
    loop {
        sc.skip_ws();
        if sc.at_end() {
            break;
        }
        let name = sc.ident()?;
        let mut value = String::new();
        let mut has_value = false;
        if sc.chars.peek() == Some(&'=') {
            sc.chars.next();
            value = sc.qstring()?;
            has_value = true;
        }
        let mut extra = Vec::new();
        while sc.chars.peek() == Some(&',') {
            sc.chars.next();
            sc.skip_ws();
            extra.push(sc.ident()?);
        }
        if first.is_none() && options.is_empty() && !has_value && extra.is_empty() {
            first = Some(name);
        } else {
            options.push(ConfigOption { name, value, extra });
        }
    }
    Ok(Some(ConfigLine { line_no, model, first, options }))
}

/// Parses a whole configuration file; any error aborts the load.
pub fn parse_text(text: &str) -> Result<Vec<ConfigLine>> {
    let mut lines = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        if let Some(line) = parse_line(raw, i + 1)? {
            lines.push(line);
        }
    }
    Ok(lines)
}

pub fn load_file(path: &str) -> Result<Vec<ConfigLine>> {
    let text = std::fs::read_to_string(path)?;
    parse_text(&text)
}
