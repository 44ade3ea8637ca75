//! Package manifest loading
//!
//! Parses `package.json` files while retaining the byte offset and length of
//! every key and value, so the analyzer can attach caret-style diagnostics to
//! the exact span a problem came from. `serde_json` discards spans, which is
//! why the manifest surface has its own small recursive-descent parser; the
//! values it produces are plain Rust data from there on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::diagnostic::{Diagnostic, Location};

/// A parsed JSON value with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonValue {
    pub offset: usize,
    pub length: usize,
    pub kind: JsonKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsonKind {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<JsonValue>),
    Object(Vec<JsonProperty>),
}

/// An object member: key span plus value.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonProperty {
    pub name: String,
    pub name_offset: usize,
    pub name_length: usize,
    pub value: JsonValue,
}

impl JsonValue {
    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            JsonKind::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.kind {
            JsonKind::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[JsonValue]> {
        match &self.kind {
            JsonKind::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[JsonProperty]> {
        match &self.kind {
            JsonKind::Object(props) => Some(props),
            _ => None,
        }
    }

    /// First property with the given name, if this is an object.
    pub fn property(&self, name: &str) -> Option<&JsonProperty> {
        self.as_object()?.iter().find(|p| p.name == name)
    }

    pub fn location(&self, file: &Path) -> Location {
        Location::new(file, self.offset, self.length)
    }
}

impl JsonProperty {
    pub fn name_location(&self, file: &Path) -> Location {
        Location::new(file, self.name_offset, self.name_length)
    }
}

#[derive(Debug)]
pub struct JsonParseError {
    pub offset: usize,
    pub message: String,
}

/// Parse a complete JSON document, spans included.
pub fn parse_json(source: &str) -> Result<JsonValue, JsonParseError> {
    let mut parser = Parser {
        bytes: source.as_bytes(),
        pos: 0,
    };
    parser.skip_whitespace();
    let value = parser.parse_value()?;
    parser.skip_whitespace();
    if parser.pos != parser.bytes.len() {
        return Err(parser.error("Unexpected trailing content"));
    }
    Ok(value)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> JsonParseError {
        JsonParseError {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), JsonParseError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("Expected {:?}", byte as char)))
        }
    }

    fn parse_value(&mut self) -> Result<JsonValue, JsonParseError> {
        let start = self.pos;
        let kind = match self.peek() {
            Some(b'{') => self.parse_object()?,
            Some(b'[') => self.parse_array()?,
            Some(b'"') => JsonKind::String(self.parse_string()?),
            Some(b't') => {
                self.parse_keyword("true")?;
                JsonKind::Bool(true)
            }
            Some(b'f') => {
                self.parse_keyword("false")?;
                JsonKind::Bool(false)
            }
            Some(b'n') => {
                self.parse_keyword("null")?;
                JsonKind::Null
            }
            Some(b'-' | b'0'..=b'9') => JsonKind::Number(self.parse_number()?),
            _ => return Err(self.error("Expected a JSON value")),
        };
        Ok(JsonValue {
            offset: start,
            length: self.pos - start,
            kind,
        })
    }

    fn parse_keyword(&mut self, keyword: &str) -> Result<(), JsonParseError> {
        if self.bytes[self.pos..].starts_with(keyword.as_bytes()) {
            self.pos += keyword.len();
            Ok(())
        } else {
            Err(self.error(format!("Expected {keyword:?}")))
        }
    }

    fn parse_object(&mut self) -> Result<JsonKind, JsonParseError> {
        self.expect(b'{')?;
        let mut props = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(JsonKind::Object(props));
        }
        loop {
            self.skip_whitespace();
            let name_offset = self.pos;
            let name = self.parse_string()?;
            let name_length = self.pos - name_offset;
            self.skip_whitespace();
            self.expect(b':')?;
            self.skip_whitespace();
            let value = self.parse_value()?;
            props.push(JsonProperty {
                name,
                name_offset,
                name_length,
                value,
            });
            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(JsonKind::Object(props));
                }
                _ => return Err(self.error("Expected ',' or '}'")),
            }
        }
    }

    fn parse_array(&mut self) -> Result<JsonKind, JsonParseError> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(JsonKind::Array(items));
        }
        loop {
            self.skip_whitespace();
            items.push(self.parse_value()?);
            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(JsonKind::Array(items));
                }
                _ => return Err(self.error("Expected ',' or ']'")),
            }
        }
    }

    fn parse_string(&mut self) -> Result<String, JsonParseError> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("Unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'"') => out.push('"'),
                        Some(b'\\') => out.push('\\'),
                        Some(b'/') => out.push('/'),
                        Some(b'b') => out.push('\u{0008}'),
                        Some(b'f') => out.push('\u{000c}'),
                        Some(b'n') => out.push('\n'),
                        Some(b'r') => out.push('\r'),
                        Some(b't') => out.push('\t'),
                        Some(b'u') => {
                            self.pos += 1;
                            let first = self.parse_hex4()?;
                            let ch = if (0xd800..0xdc00).contains(&first) {
                                // Surrogate pair
                                if self.parse_keyword("\\u").is_err() {
                                    return Err(self.error("Expected low surrogate"));
                                }
                                let low = self.parse_hex4()?;
                                let combined =
                                    0x10000 + ((first - 0xd800) << 10) + (low - 0xdc00);
                                char::from_u32(combined)
                                    .ok_or_else(|| self.error("Invalid surrogate pair"))?
                            } else {
                                char::from_u32(first)
                                    .ok_or_else(|| self.error("Invalid unicode escape"))?
                            };
                            out.push(ch);
                            continue;
                        }
                        _ => return Err(self.error("Invalid escape sequence")),
                    }
                    self.pos += 1;
                }
                Some(b) if b < 0x20 => return Err(self.error("Control character in string")),
                Some(_) => {
                    // Copy one UTF-8 scalar.
                    let rest = &self.bytes[self.pos..];
                    let s = std::str::from_utf8(rest)
                        .map_err(|_| self.error("Invalid UTF-8 in string"))?;
                    let ch = s.chars().next().unwrap();
                    out.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
    }

    fn parse_hex4(&mut self) -> Result<u32, JsonParseError> {
        // Called with pos at the first hex digit.
        let end = self.pos + 4;
        if end > self.bytes.len() {
            return Err(self.error("Truncated unicode escape"));
        }
        let hex = std::str::from_utf8(&self.bytes[self.pos..end])
            .map_err(|_| self.error("Invalid unicode escape"))?;
        let value =
            u32::from_str_radix(hex, 16).map_err(|_| self.error("Invalid unicode escape"))?;
        self.pos = end;
        Ok(value)
    }

    fn parse_number(&mut self) -> Result<f64, JsonParseError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') {
            self.pos += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.error("Invalid number"))
    }
}

/// A loaded and parsed package.json.
#[derive(Debug)]
pub struct PackageJson {
    pub path: PathBuf,
    pub package_dir: PathBuf,
    pub source: Arc<str>,
    pub root: JsonValue,
}

impl PackageJson {
    /// Read and parse the manifest of the given package directory.
    ///
    /// A missing file or malformed JSON is a single file-level diagnostic,
    /// not a panic or an infrastructure error.
    pub fn load(package_dir: &Path) -> Result<Self, Diagnostic> {
        let path = package_dir.join("package.json");
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) => {
                return Err(Diagnostic::error(
                    format!("Could not read {}: {}", path.display(), err),
                    Location::new(&path, 0, 0),
                ))
            }
        };

        let root = match parse_json(&source) {
            Ok(root) => root,
            Err(err) => {
                return Err(Diagnostic::error(
                    format!("Invalid JSON: {}", err.message),
                    Location::new(&path, err.offset, 1),
                ))
            }
        };

        Ok(Self {
            path,
            package_dir: package_dir.to_path_buf(),
            source: Arc::from(source),
            root,
        })
    }

    /// The `scripts` property, if present.
    pub fn scripts(&self) -> Option<&JsonProperty> {
        self.root.property("scripts")
    }

    /// The `wireit` property, if present.
    pub fn wireit(&self) -> Option<&JsonProperty> {
        self.root.property("wireit")
    }

    /// The `scripts.<name>` property, if present.
    pub fn script(&self, name: &str) -> Option<&JsonProperty> {
        self.scripts()?.value.property(name)
    }

    /// The `wireit.<name>` property, if present (only when `wireit` is an
    /// object; shape violations are reported by the analyzer).
    pub fn wireit_script(&self, name: &str) -> Option<&JsonProperty> {
        self.wireit()?.value.property(name)
    }

    /// A whole-file location for problems with no better span.
    pub fn file_location(&self) -> Location {
        Location::new(&self.path, 0, 0)
    }
}

/// Per-analysis manifest cache, keyed by package directory.
#[derive(Default)]
pub struct ManifestLoader {
    cache: HashMap<PathBuf, Arc<PackageJson>>,
    failures: HashMap<PathBuf, Diagnostic>,
}

impl ManifestLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, package_dir: &Path) -> Result<Arc<PackageJson>, Diagnostic> {
        if let Some(manifest) = self.cache.get(package_dir) {
            return Ok(manifest.clone());
        }
        if let Some(diagnostic) = self.failures.get(package_dir) {
            return Err(diagnostic.clone());
        }
        match PackageJson::load(package_dir) {
            Ok(manifest) => {
                let manifest = Arc::new(manifest);
                self.cache.insert(package_dir.to_path_buf(), manifest.clone());
                Ok(manifest)
            }
            Err(diagnostic) => {
                self.failures
                    .insert(package_dir.to_path_buf(), diagnostic.clone());
                Err(diagnostic)
            }
        }
    }

    /// Every manifest loaded so far (for the diagnostic printer and the
    /// watcher's manifest watch group).
    pub fn loaded(&self) -> impl Iterator<Item = &Arc<PackageJson>> {
        self.cache.values()
    }
}
