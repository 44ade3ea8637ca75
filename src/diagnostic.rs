//! Analyzer diagnostics and their caret-style rendering
//!
//! All configuration, launch, and graph problems are values of [`Diagnostic`]
//! rather than errors: the analyzer batches them so a single run can report
//! every independent problem before exiting. A diagnostic carries byte-offset
//! locations; the printer converts those to 1-based line/column positions and
//! renders an underlined source excerpt.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A byte span in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: PathBuf,
    pub offset: usize,
    pub length: usize,
}

impl Location {
    pub fn new(file: impl Into<PathBuf>, offset: usize, length: usize) -> Self {
        Self {
            file: file.into(),
            offset,
            length,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub location: Location,
    /// Additional source ranges shown after the primary one (e.g. the other
    /// half of a scripts/wireit mismatch).
    pub supplemental: Vec<Location>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, location: Location) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            location,
            supplemental: Vec::new(),
        }
    }

    pub fn with_supplemental(mut self, locations: Vec<Location>) -> Self {
        self.supplemental = locations;
        self
    }
}

/// Renders diagnostics with source excerpts.
///
/// The printer owns a copy of each file's source text (supplied by the
/// manifest loader) so rendering never re-reads the filesystem.
pub struct DiagnosticPrinter {
    cwd: PathBuf,
    sources: HashMap<PathBuf, Arc<str>>,
}

impl DiagnosticPrinter {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            sources: HashMap::new(),
        }
    }

    pub fn add_source(&mut self, file: impl Into<PathBuf>, source: Arc<str>) {
        self.sources.insert(file.into(), source);
    }

    /// Render one diagnostic, excerpt included, as a multi-line string.
    pub fn render(&self, diagnostic: &Diagnostic) -> String {
        let glyph = match diagnostic.severity {
            Severity::Error => "\u{274c}",
            Severity::Warning => "\u{26a0}\u{fe0f}",
        };

        let mut out = String::new();
        let position = self.describe(&diagnostic.location);
        let _ = writeln!(out, "{glyph} {position} {}", diagnostic.message);
        self.render_excerpt(&diagnostic.location, &mut out);

        for supplemental in &diagnostic.supplemental {
            let _ = writeln!(out, "    {}", self.describe(supplemental));
            self.render_excerpt(supplemental, &mut out);
        }
        out
    }

    /// Print to stderr.
    pub fn print(&self, diagnostic: &Diagnostic) {
        eprint!("{}", self.render(diagnostic));
    }

    /// `relative/path.json:line:col` for the start of the span.
    fn describe(&self, location: &Location) -> String {
        let path = relativize(&self.cwd, &location.file);
        match self.sources.get(&location.file) {
            Some(source) => {
                let (line, col) = offset_to_line_col(source, location.offset);
                format!("{}:{}:{}", path.display(), line, col)
            }
            None => path.display().to_string(),
        }
    }

    fn render_excerpt(&self, location: &Location, out: &mut String) {
        let Some(source) = self.sources.get(&location.file) else {
            return;
        };

        let end = (location.offset + location.length.max(1)).min(source.len());
        let (first_line, _) = offset_to_line_col(source, location.offset);

        // Line starts for every line the span touches.
        let mut line_no = first_line;
        let mut line_start = source[..location.offset]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);

        let gutter = digits(count_lines_to(source, end));

        while line_start < source.len() {
            let line_end = source[line_start..]
                .find('\n')
                .map(|i| line_start + i)
                .unwrap_or(source.len());
            let text = &source[line_start..line_end];

            let _ = writeln!(out, "    {line_no:>gutter$} | {text}");

            // Underline the intersection of the span with this line.
            let from = location.offset.max(line_start);
            let to = end.min(line_end);
            if to > from || (location.length == 0 && location.offset >= line_start) {
                let pad = from.saturating_sub(line_start);
                let width = to.saturating_sub(from).max(1);
                let _ = writeln!(
                    out,
                    "    {:>gutter$} | {}{}",
                    "",
                    " ".repeat(pad),
                    "~".repeat(width)
                );
            }

            if line_end >= end {
                break;
            }
            line_start = line_end + 1;
            line_no += 1;
        }
    }
}

/// 1-based line and column for a byte offset, by scanning newline indexes.
pub fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let mut line = 1;
    let mut line_start = 0;
    for (i, byte) in source.bytes().enumerate().take(offset) {
        if byte == b'\n' {
            line += 1;
            line_start = i + 1;
        }
    }
    (line, offset - line_start + 1)
}

fn count_lines_to(source: &str, offset: usize) -> usize {
    source[..offset.min(source.len())]
        .bytes()
        .filter(|&b| b == b'\n')
        .count()
        + 1
}

fn digits(n: usize) -> usize {
    n.to_string().len()
}

fn relativize(cwd: &Path, file: &Path) -> PathBuf {
    file.strip_prefix(cwd)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| file.to_path_buf())
}
