//! Position mapping between an instrumented file and its original.
//!
//! The injector only ever inserts text, so a rendered file is a sequence of
//! segments copied from the original interleaved with generated segments.
//! Generated text never contains a newline, so line numbers are preserved
//! and only columns shift.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::domain::ast::LineIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SegmentKind {
    /// Copied from the original starting at this offset.
    Original(usize),
    /// Generated; positions inside map to this original offset.
    Inserted(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    rendered_start: usize,
    len: usize,
    kind: SegmentKind,
}

/// Result of mapping a rendered position back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapped {
    pub offset: usize,
    /// The position fell inside injected code.
    pub generated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionMap {
    segments: Vec<Segment>,
}

/// Incremental builder used while rendering.
#[derive(Debug, Default)]
pub struct Renderer {
    out: String,
    map: PositionMap,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy(&mut self, original: &str, from: usize, to: usize) {
        if to <= from {
            return;
        }
        self.map.segments.push(Segment {
            rendered_start: self.out.len(),
            len: to - from,
            kind: SegmentKind::Original(from),
        });
        self.out.push_str(&original[from..to]);
    }

    pub fn insert(&mut self, anchor: usize, text: &str) {
        if text.is_empty() {
            return;
        }
        debug_assert!(!text.contains('\n'), "generated text must stay on one line");
        self.map.segments.push(Segment {
            rendered_start: self.out.len(),
            len: text.len(),
            kind: SegmentKind::Inserted(anchor),
        });
        self.out.push_str(text);
    }

    pub fn finish(self) -> (String, PositionMap) {
        (self.out, self.map)
    }
}

impl PositionMap {
    /// Original offset of a rendered offset.
    pub fn to_original(&self, rendered: usize) -> Mapped {
        let idx = match self
            .segments
            .binary_search_by(|s| s.rendered_start.cmp(&rendered))
        {
            Ok(i) => i,
            Err(0) => {
                return Mapped {
                    offset: 0,
                    generated: false,
                }
            }
            Err(i) => i - 1,
        };
        let seg = &self.segments[idx];
        match seg.kind {
            SegmentKind::Original(start) => Mapped {
                offset: start + (rendered - seg.rendered_start).min(seg.len),
                generated: false,
            },
            SegmentKind::Inserted(anchor) => Mapped {
                offset: anchor,
                generated: true,
            },
        }
    }

    pub fn inserted_bytes(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s.kind, SegmentKind::Inserted(_)))
            .map(|s| s.len)
            .sum()
    }

    /// Rendered line to original line. The rewrite never adds lines, so this
    /// is the identity for every line that starts with original text; the
    /// table lists each rendered line with the original line it maps to.
    pub fn line_table(&self, rendered: &str, original: &str) -> Vec<(usize, usize)> {
        let rendered_index = LineIndex::new(rendered);
        let original_index = LineIndex::new(original);
        let mut table = Vec::new();
        let mut line_start = 0;
        for (line_no, line) in rendered.split_inclusive('\n').enumerate() {
            let mapped = self.to_original(line_start);
            let (orig_line, _) = original_index.line_col(original, mapped.offset);
            debug_assert_eq!(rendered_index.line_col(rendered, line_start).0, line_no + 1);
            table.push((line_no + 1, orig_line));
            line_start += line.len();
        }
        table
    }
}

/// A compiler position translated to the original tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourcePosition {
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
    /// The compiler pointed into injected code; the position is the opening
    /// brace of the instrumented declaration.
    pub generated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemappedDiagnostic {
    pub level: String,
    pub code: Option<String>,
    pub message: String,
    pub primary: Option<SourcePosition>,
    pub secondary: Vec<SourcePosition>,
}

impl fmt::Display for RemappedDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}[{}]: {}", self.level, code, self.message)?,
            None => write!(f, "{}: {}", self.level, self.message)?,
        }
        if let Some(pos) = &self.primary {
            write!(
                f,
                "\n  --> {}:{}:{}",
                pos.file.display(),
                pos.line,
                pos.column
            )?;
            if pos.generated {
                f.write_str(" (in injected instrumentation)")?;
            }
        }
        Ok(())
    }
}
