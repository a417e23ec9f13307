//! Instrumented files: original text plus per-declaration stage lists,
//! rendered into the rewritten source and its position map.

use std::path::Path;
use std::sync::Arc;

use crate::domain::ast::{DeclSite, FileScan, LineIndex};
use crate::domain::position::{Mapped, PositionMap, Renderer, SourcePosition};
use crate::domain::trampoline::{extern_crate_line, generate, single_groups, Group, StagePlan};

#[derive(Debug, Clone)]
pub struct InstrumentedDecl {
    pub import_path: String,
    pub decl: Arc<DeclSite>,
    /// Applied rules, outermost first.
    pub stages: Vec<StagePlan>,
    pub groups: Vec<Group>,
    /// Removed by reachability analysis.
    pub pruned: bool,
}

impl InstrumentedDecl {
    pub fn new(import_path: String, decl: Arc<DeclSite>, stages: Vec<StagePlan>) -> Self {
        let groups = single_groups(stages.len());
        Self {
            import_path,
            decl,
            stages,
            groups,
            pruned: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.pruned && !self.stages.is_empty()
    }

    pub fn rule_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.rule.id.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentedFile {
    /// Owning package, index into the dependency graph.
    pub package: usize,
    pub original: Arc<FileScan>,
    /// Crates needing an `extern crate` at this crate root (2015 edition).
    pub prelude: Vec<String>,
    pub decls: Vec<InstrumentedDecl>,
    text: String,
    map: PositionMap,
    /// Line starts of `text`.
    lines: LineIndex,
}

impl InstrumentedFile {
    /// A draft with nothing applied; renders to the original text.
    pub fn draft(package: usize, original: Arc<FileScan>) -> Self {
        let mut file = Self {
            package,
            original,
            prelude: Vec::new(),
            decls: Vec::new(),
            text: String::new(),
            map: PositionMap::default(),
            lines: LineIndex::new(""),
        };
        file.render();
        file
    }

    pub fn original_path(&self) -> &Path {
        &self.original.path
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn map(&self) -> &PositionMap {
        &self.map
    }

    /// Active (rendered) declarations.
    pub fn active_decls(&self) -> impl Iterator<Item = &InstrumentedDecl> {
        self.decls.iter().filter(|d| d.is_active())
    }

    pub fn is_modified(&self) -> bool {
        !self.prelude.is_empty() || self.active_decls().next().is_some()
    }

    /// Re-render from the original text and the current stage lists. The
    /// output depends on nothing else, so rendering is repeatable.
    pub fn render(&mut self) {
        let source = &self.original.text;
        let mut insertions: Vec<(usize, usize, String)> = Vec::new();

        if !self.prelude.is_empty() {
            let line = extern_crate_line(&self.prelude);
            let at = self.original.inner_attrs_end;
            let text = if at == self.original.bom {
                format!("{} ", line)
            } else {
                format!(" {}", line)
            };
            insertions.push((at, at, text));
        }
        for d in self.decls.iter().filter(|d| d.is_active()) {
            let splice = generate(&d.import_path, &d.decl, &d.stages, &d.groups);
            insertions.push((d.decl.body_open, d.decl.body_open, splice.before));
            insertions.push((d.decl.body_close + 1, d.decl.body_open, splice.after));
        }
        insertions.sort_by_key(|(at, _, _)| *at);

        let mut renderer = Renderer::new();
        let mut cursor = 0;
        for (at, anchor, text) in insertions {
            renderer.copy(source, cursor, at);
            renderer.insert(anchor, &text);
            cursor = at;
        }
        renderer.copy(source, cursor, source.len());
        let (text, map) = renderer.finish();
        self.lines = LineIndex::new(&text);
        self.text = text;
        self.map = map;
    }

    fn locate(&self, line: usize, column: usize) -> Mapped {
        let bom_chars = usize::from(self.original.bom > 0 && line == 1);
        let at = proc_macro2::LineColumn {
            line,
            column: column.saturating_sub(1) + bom_chars,
        };
        self.map.to_original(self.lines.offset(&self.text, at))
    }

    /// Translate a compiler position (1-based line and char column) in the
    /// rendered text to the original file.
    pub fn to_original(&self, line: usize, column: usize) -> SourcePosition {
        let mapped = self.locate(line, column);
        let (orig_line, orig_col) = self
            .original
            .line_index
            .line_col(&self.original.text, mapped.offset);
        let orig_col = if orig_line == 1 && self.original.bom > 0 {
            orig_col.saturating_sub(1).max(1)
        } else {
            orig_col
        };
        SourcePosition {
            file: self.original.path.clone(),
            line: orig_line,
            column: orig_col,
            generated: mapped.generated,
        }
    }

    /// Whether a compiler position points into injected code or at the
    /// opening brace of an instrumented body, which the guard form wraps in
    /// a second block.
    pub fn is_instrumentation_site(&self, line: usize, column: usize) -> bool {
        let mapped = self.locate(line, column);
        mapped.generated || self.active_decls().any(|d| d.decl.body_open == mapped.offset)
    }

    /// Rendered line to original line.
    pub fn line_table(&self) -> Vec<(usize, usize)> {
        self.map.line_table(&self.text, &self.original.text)
    }

    /// Pretty-printed copy of the rendered file, for inspection only.
    pub fn prettified(&self) -> Result<String, syn::Error> {
        let body = self.text.strip_prefix('\u{feff}').unwrap_or(&self.text);
        let file = syn::parse_file(body)?;
        Ok(prettyplease::unparse(&file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rule::{HookCrate, HookRule, RuleDef};
    use std::path::PathBuf;

    fn rule(id: &str) -> Arc<HookRule> {
        let def: RuleDef = toml::from_str(&format!(
            "id = \"{}\"\nimport_path = \"pkg\"\nfunction = \"f\"\non_exit = \"exit\"\n",
            id
        ))
        .unwrap();
        Arc::new(def.into_rule(0, "t", &HookCrate { name: "hooks".into(), dir: PathBuf::new() }).unwrap())
    }

    const SRC: &str = "#![allow(unused)]\nfn f(x: u32) -> u32 {\n    let y = x + 1;\n    y\n}\n\nfn g() {}\n";

    fn file() -> InstrumentedFile {
        let scan = FileScan::parse(Path::new("src/lib.rs"), SRC.to_string()).unwrap();
        InstrumentedFile::draft(0, Arc::new(scan))
    }

    #[test]
    fn test_draft_renders_original() {
        let f = file();
        assert_eq!(f.text(), SRC);
        assert!(!f.is_modified());
    }

    #[test]
    fn test_render_preserves_lines_and_parses() {
        let mut f = file();
        let decl = Arc::new(f.original.decls[0].clone());
        f.decls.push(InstrumentedDecl::new("pkg".into(), decl, vec![StagePlan::new(rule("a"))]));
        f.prelude = vec!["hookweave_rt".into()];
        f.render();

        assert_eq!(f.text().lines().count(), SRC.lines().count());
        assert!(f.text().starts_with("#![allow(unused)] extern crate hookweave_rt;\n"));
        syn::parse_file(f.text()).unwrap();
        assert!(f.prettified().unwrap().contains("Trampoline::toggled"));

        // `y` on line 4 keeps its line; its column is unchanged too.
        let pos = f.to_original(4, 5);
        assert_eq!((pos.line, pos.column, pos.generated), (4, 5, false));

        // A column inside the prologue maps to the body's opening brace.
        let line2 = f.text().lines().nth(1).unwrap();
        let col = line2.find("static").unwrap() + 1;
        let pos = f.to_original(2, col);
        assert_eq!((pos.line, pos.column, pos.generated), (2, 21, true));

        let table = f.line_table();
        assert!(table.iter().all(|(r, o)| r == o));
    }

    #[test]
    fn test_positions_follow_rerender() {
        let mut f = file();
        let g = Arc::new(f.original.decls[1].clone());
        f.decls.push(InstrumentedDecl::new("pkg".into(), g, vec![StagePlan::new(rule("g"))]));
        f.render();
        assert_eq!(f.to_original(4, 5).column, 5);

        // Instrumenting `f` afterwards shifts line 2; the cached line starts
        // must follow.
        let decl = Arc::new(f.original.decls[0].clone());
        f.decls.push(InstrumentedDecl::new("pkg".into(), decl, vec![StagePlan::new(rule("a"))]));
        f.render();
        let line2 = f.text().lines().nth(1).unwrap();
        let brace = line2.rfind('{').unwrap() + 1;
        let pos = f.to_original(2, brace);
        assert_eq!((pos.line, pos.column, pos.generated), (2, 21, false));
        assert!(f.is_instrumentation_site(2, brace));
        assert!(f.is_instrumentation_site(2, line2.find("static").unwrap() + 1));
        assert!(!f.is_instrumentation_site(2, 4));

        // The closing ` }` of `g` is injected and maps to its opening brace.
        let line7 = f.text().lines().nth(6).unwrap();
        let pos = f.to_original(7, line7.rfind('}').unwrap() + 1);
        assert_eq!((pos.line, pos.column, pos.generated), (7, 8, true));
    }

    #[test]
    fn test_rerender_is_stable() {
        let mut f = file();
        let decl = Arc::new(f.original.decls[1].clone());
        f.decls.push(InstrumentedDecl::new("pkg".into(), decl, vec![StagePlan::new(rule("a"))]));
        f.render();
        let first = f.text().to_string();
        f.render();
        assert_eq!(first, f.text());
        f.decls[0].pruned = true;
        f.render();
        assert_eq!(f.text(), SRC);
    }
}
