// Source scanning for hookweave.
// A file is parsed once with syn and reduced to plain, thread-safe data:
// declaration sites with byte offsets, outline module declarations, and
// per-function summaries for the call graph. Syn trees themselves never
// leave the worker thread that parsed them.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use proc_macro2::{LineColumn, TokenStream, TokenTree};
use quote::ToTokens;
use rayon::prelude::*;
use syn::visit::Visit;

use crate::domain::error::{PipelineError, Result, Stage};

const BOM: &str = "\u{feff}";

// ═══════════════════════════════════════════════════════════════════════════
// Type normalization
// ═══════════════════════════════════════════════════════════════════════════

/// Whitespace-free token string of a syntax node; the comparison key for
/// parameter, result, and receiver shapes.
pub fn normalize_tokens<T: ToTokens>(node: &T) -> String {
    node.to_token_stream()
        .to_string()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

pub fn normalize_type_str(text: &str) -> std::result::Result<String, String> {
    let ty: syn::Type = syn::parse_str(text).map_err(|e| e.to_string())?;
    Ok(normalize_tokens(&ty))
}

// ═══════════════════════════════════════════════════════════════════════════
// Line index
// ═══════════════════════════════════════════════════════════════════════════

/// Maps proc-macro2 line/column pairs (1-based lines, char columns) to byte
/// offsets of the text they were taken from.
#[derive(Debug, Clone)]
pub struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    pub fn offset(&self, text: &str, at: LineColumn) -> usize {
        let Some(&start) = self.starts.get(at.line.saturating_sub(1)) else {
            return text.len();
        };
        text[start..]
            .char_indices()
            .nth(at.column)
            .map(|(i, _)| start + i)
            .unwrap_or(text.len())
    }

    /// 1-based line and char column of a byte offset.
    pub fn line_col(&self, text: &str, offset: usize) -> (usize, usize) {
        let line = match self.starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let start = self.starts[line];
        let end = offset.min(text.len());
        let column = text.get(start..end).map(|s| s.chars().count()).unwrap_or(0);
        (line + 1, column + 1)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scanned data
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfKind {
    /// Free function or associated function without `self`.
    None,
    /// `&self` / `&mut self`.
    Ref,
    /// `self` / `mut self`.
    Value,
    /// `self: Box<Self>` and friends.
    Typed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSite {
    /// Binding name when the pattern is a plain identifier.
    pub name: Option<String>,
    pub ty: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverInfo {
    /// Last path segment of the impl self type (`Client`).
    pub last: String,
    /// Full normalized self type (`Client<T>`).
    pub full: String,
}

/// A function with a body that hook rules may target.
#[derive(Debug, Clone)]
pub struct DeclSite {
    /// Inline module path inside the file (`mod a { mod b { .. } }`).
    pub inline_module: Vec<String>,
    pub name: String,
    pub receiver: Option<ReceiverInfo>,
    pub trait_name: Option<String>,
    pub self_kind: SelfKind,
    pub params: Vec<ParamSite>,
    pub results: Vec<String>,
    /// Return type as compilable tokens, `None` for unit.
    pub return_type: Option<String>,
    /// The return type can be written as a closure return annotation.
    pub annotatable: bool,
    pub returns_result: bool,
    pub is_async: bool,
    /// Byte offsets of the body's braces in the file text.
    pub body_open: usize,
    pub body_close: usize,
    pub line: usize,
}

impl DeclSite {
    pub fn qualified_name(&self) -> String {
        match &self.receiver {
            Some(r) => format!("{}::{}", r.last, self.name),
            None => self.name.clone(),
        }
    }

    pub fn param_types(&self) -> Vec<String> {
        self.params.iter().map(|p| p.ty.clone()).collect()
    }

    pub fn param(&self, name: &str) -> Option<&ParamSite> {
        self.params.iter().find(|p| p.name.as_deref() == Some(name))
    }
}

/// Outline `mod name;` declaration.
#[derive(Debug, Clone)]
pub struct ModDecl {
    pub inline_prefix: Vec<String>,
    pub name: String,
    pub path_attr: Option<String>,
    pub is_pub: bool,
    pub has_cfg: bool,
}

/// Per-function facts used by reachability analysis.
#[derive(Debug, Clone)]
pub struct FnSummary {
    pub inline_module: Vec<String>,
    pub name: String,
    pub receiver: Option<String>,
    pub is_pub: bool,
    pub is_test: bool,
    pub is_async: bool,
    /// Trait-impl methods, `Drop`, and exported symbols.
    pub always_live: bool,
    /// Body offset, links a summary to its `DeclSite`.
    pub body_open: usize,
    pub line: usize,
    /// Every identifier mentioned by the body, macros included.
    pub mentions: BTreeSet<String>,
}

/// Everything the pipeline needs from one source file.
#[derive(Debug)]
pub struct FileScan {
    pub path: PathBuf,
    pub text: String,
    /// Byte length of a leading BOM, 0 when absent.
    pub bom: usize,
    /// Offset just past the last inner attribute (`#![..]`) of the file.
    pub inner_attrs_end: usize,
    pub decls: Vec<DeclSite>,
    pub modules: Vec<ModDecl>,
    pub functions: Vec<FnSummary>,
    /// Identifiers mentioned outside function bodies: `macro_rules!`
    /// definitions and `const`/`static` initializers.
    pub item_mentions: BTreeSet<String>,
    pub line_index: LineIndex,
}

impl FileScan {
    pub fn parse(path: &Path, text: String) -> Result<Self> {
        let bom = if text.starts_with(BOM) { BOM.len() } else { 0 };
        let body = &text[bom..];
        let file = syn::parse_file(body).map_err(|e| PipelineError::parse(path, &e))?;
        let line_index = LineIndex::new(body);

        let mut scanner = Scanner {
            text: body,
            index: &line_index,
            prefix: Vec::new(),
            decls: Vec::new(),
            modules: Vec::new(),
            functions: Vec::new(),
            item_mentions: BTreeSet::new(),
        };
        let inner_attrs_end = file
            .attrs
            .iter()
            .filter(|a| matches!(a.style, syn::AttrStyle::Inner(_)))
            .map(|a| scanner.end_of(a))
            .max()
            .map(|end| end + bom)
            .unwrap_or(bom);
        scanner.items(&file.items);

        let Scanner {
            mut decls,
            modules,
            mut functions,
            item_mentions,
            ..
        } = scanner;
        for decl in &mut decls {
            decl.body_open += bom;
            decl.body_close += bom;
        }
        for f in &mut functions {
            f.body_open += bom;
        }
        decls.sort_by_key(|d| d.body_open);

        let line_index = LineIndex::new(&text);
        Ok(Self {
            path: path.to_path_buf(),
            text,
            bom,
            inner_attrs_end,
            decls,
            modules,
            functions,
            item_mentions,
            line_index,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::io(Stage::Matcher, path, e))?;
        Self::parse(path, text)
    }
}

struct Scanner<'a> {
    text: &'a str,
    index: &'a LineIndex,
    prefix: Vec<String>,
    decls: Vec<DeclSite>,
    modules: Vec<ModDecl>,
    functions: Vec<FnSummary>,
    item_mentions: BTreeSet<String>,
}

fn has_attr(attrs: &[syn::Attribute], name: &str) -> bool {
    attrs.iter().any(|a| a.path().is_ident(name))
}

fn is_test_attr(attrs: &[syn::Attribute]) -> bool {
    attrs.iter().any(|a| {
        let path = a.path();
        path.is_ident("test")
            || path
                .segments
                .last()
                .map(|s| s.ident == "test")
                .unwrap_or(false)
    })
}

fn path_attr(attrs: &[syn::Attribute]) -> Option<String> {
    attrs.iter().find_map(|a| {
        if !a.path().is_ident("path") {
            return None;
        }
        match &a.meta {
            syn::Meta::NameValue(nv) => match &nv.value {
                syn::Expr::Lit(syn::ExprLit {
                    lit: syn::Lit::Str(s),
                    ..
                }) => Some(s.value()),
                _ => None,
            },
            _ => None,
        }
    })
}

fn is_pub(vis: &syn::Visibility) -> bool {
    matches!(vis, syn::Visibility::Public(_))
}

fn collect_idents(tokens: TokenStream, out: &mut BTreeSet<String>) {
    for tree in tokens {
        match tree {
            TokenTree::Ident(ident) => {
                let text = ident.to_string();
                let text = text.strip_prefix("r#").map(String::from).unwrap_or(text);
                out.insert(text);
            }
            TokenTree::Group(group) => collect_idents(group.stream(), out),
            _ => {}
        }
    }
}

fn receiver_info(ty: &syn::Type) -> ReceiverInfo {
    let full = normalize_tokens(ty);
    let last = match ty {
        syn::Type::Path(p) => p
            .path
            .segments
            .last()
            .map(|s| s.ident.to_string())
            .unwrap_or_else(|| full.clone()),
        syn::Type::Reference(r) => receiver_info(&r.elem).last,
        _ => full.clone(),
    };
    ReceiverInfo { last, full }
}

/// Flags return types that cannot be spelled in a closure signature.
#[derive(Default)]
struct Unannotatable(bool);

impl<'ast> Visit<'ast> for Unannotatable {
    fn visit_type_reference(&mut self, _: &'ast syn::TypeReference) {
        self.0 = true;
    }
    fn visit_type_impl_trait(&mut self, _: &'ast syn::TypeImplTrait) {
        self.0 = true;
    }
    fn visit_type_never(&mut self, _: &'ast syn::TypeNever) {
        self.0 = true;
    }
    fn visit_type_infer(&mut self, _: &'ast syn::TypeInfer) {
        self.0 = true;
    }
    fn visit_lifetime(&mut self, _: &'ast syn::Lifetime) {
        self.0 = true;
    }
    fn visit_type_macro(&mut self, _: &'ast syn::TypeMacro) {
        self.0 = true;
    }
}

fn ends_in_result(ty: &syn::Type) -> bool {
    match ty {
        syn::Type::Path(p) => p
            .path
            .segments
            .last()
            .map(|s| s.ident == "Result")
            .unwrap_or(false),
        syn::Type::Paren(p) => ends_in_result(&p.elem),
        syn::Type::Group(g) => ends_in_result(&g.elem),
        _ => false,
    }
}

impl<'a> Scanner<'a> {
    fn offset(&self, at: LineColumn) -> usize {
        self.index.offset(self.text, at)
    }

    fn end_of<T: ToTokens>(&self, node: &T) -> usize {
        let mut end = 0;
        for tree in node.to_token_stream() {
            end = end.max(self.offset(tree.span().end()));
        }
        end
    }

    fn items(&mut self, items: &[syn::Item]) {
        for item in items {
            match item {
                syn::Item::Fn(f) => self.free_fn(f),
                syn::Item::Impl(imp) => self.impl_block(imp),
                syn::Item::Trait(t) => self.trait_defaults(t),
                syn::Item::Mod(m) => self.module(m),
                syn::Item::Macro(m) if m.ident.is_some() => {
                    collect_idents(m.mac.tokens.clone(), &mut self.item_mentions)
                }
                syn::Item::Const(c) => collect_idents(c.expr.to_token_stream(), &mut self.item_mentions),
                syn::Item::Static(st) => collect_idents(st.expr.to_token_stream(), &mut self.item_mentions),
                _ => {}
            }
        }
    }

    fn module(&mut self, m: &syn::ItemMod) {
        let name = m.ident.to_string();
        match &m.content {
            Some((_, items)) => {
                self.prefix.push(name);
                self.items(items);
                self.prefix.pop();
            }
            None => self.modules.push(ModDecl {
                inline_prefix: self.prefix.clone(),
                name,
                path_attr: path_attr(&m.attrs),
                is_pub: is_pub(&m.vis),
                has_cfg: has_attr(&m.attrs, "cfg"),
            }),
        }
    }

    fn free_fn(&mut self, f: &syn::ItemFn) {
        let always_live = has_attr(&f.attrs, "no_mangle") || has_attr(&f.attrs, "export_name");
        self.summary(&f.sig, &f.block, &f.attrs, None, is_pub(&f.vis), always_live);
        if f.sig.constness.is_none() {
            self.decl(&f.sig, &f.block, None, None);
        }
    }

    fn impl_block(&mut self, imp: &syn::ItemImpl) {
        let receiver = receiver_info(&imp.self_ty);
        let trait_name = imp.trait_.as_ref().and_then(|(_, path, _)| {
            path.segments.last().map(|s| s.ident.to_string())
        });
        for item in &imp.items {
            let syn::ImplItem::Fn(method) = item else {
                continue;
            };
            let method_pub = is_pub(&method.vis) || trait_name.is_some();
            self.summary(
                &method.sig,
                &method.block,
                &method.attrs,
                Some(&receiver.last),
                method_pub,
                trait_name.is_some(),
            );
            if method.sig.constness.is_none() {
                self.decl(
                    &method.sig,
                    &method.block,
                    Some(receiver.clone()),
                    trait_name.clone(),
                );
            }
        }
    }

    fn trait_defaults(&mut self, t: &syn::ItemTrait) {
        let owner = t.ident.to_string();
        for item in &t.items {
            if let syn::TraitItem::Fn(method) = item {
                if let Some(block) = &method.default {
                    self.summary(&method.sig, block, &method.attrs, Some(&owner), true, true);
                }
            }
        }
    }

    fn summary(
        &mut self,
        sig: &syn::Signature,
        block: &syn::Block,
        attrs: &[syn::Attribute],
        receiver: Option<&str>,
        is_pub: bool,
        always_live: bool,
    ) {
        let mut mentions = BTreeSet::new();
        collect_idents(block.to_token_stream(), &mut mentions);
        let span = block.brace_token.span;
        self.functions.push(FnSummary {
            inline_module: self.prefix.clone(),
            name: sig.ident.to_string(),
            receiver: receiver.map(String::from),
            is_pub,
            is_test: is_test_attr(attrs),
            is_async: sig.asyncness.is_some(),
            always_live,
            body_open: self.offset(span.open().start()),
            line: sig.ident.span().start().line,
            mentions,
        });
    }

    fn decl(
        &mut self,
        sig: &syn::Signature,
        block: &syn::Block,
        receiver: Option<ReceiverInfo>,
        trait_name: Option<String>,
    ) {
        let mut self_kind = SelfKind::None;
        let mut params = Vec::new();
        for input in &sig.inputs {
            match input {
                syn::FnArg::Receiver(r) => {
                    self_kind = if r.colon_token.is_some() {
                        SelfKind::Typed
                    } else if r.reference.is_some() {
                        SelfKind::Ref
                    } else {
                        SelfKind::Value
                    };
                }
                syn::FnArg::Typed(pt) => {
                    let name = match pt.pat.as_ref() {
                        syn::Pat::Ident(pi) if pi.by_ref.is_none() && pi.subpat.is_none() => {
                            Some(pi.ident.to_string())
                        }
                        _ => None,
                    };
                    params.push(ParamSite {
                        name,
                        ty: normalize_tokens(&pt.ty),
                    });
                }
            }
        }

        let (results, return_type, annotatable, returns_result) = match &sig.output {
            syn::ReturnType::Default => (Vec::new(), None, true, false),
            syn::ReturnType::Type(_, ty) => {
                if matches!(ty.as_ref(), syn::Type::Tuple(t) if t.elems.is_empty()) {
                    (Vec::new(), None, true, false)
                } else {
                    let mut check = Unannotatable::default();
                    check.visit_type(ty);
                    (
                        vec![normalize_tokens(ty)],
                        Some(ty.to_token_stream().to_string()),
                        !check.0,
                        ends_in_result(ty),
                    )
                }
            }
        };

        let span = block.brace_token.span;
        let body_open = self.offset(span.open().start());
        let body_close = self.offset(span.close().start());
        self.decls.push(DeclSite {
            inline_module: self.prefix.clone(),
            name: sig.ident.to_string(),
            receiver,
            trait_name,
            self_kind,
            params,
            results,
            return_type,
            annotatable,
            returns_result,
            is_async: sig.asyncness.is_some(),
            body_open,
            body_close,
            line: sig.ident.span().start().line,
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Parse cache and module walking
// ═══════════════════════════════════════════════════════════════════════════

/// Parsed files shared by the worker pool, keyed by path. Each file is
/// parsed at most once per run.
#[derive(Default)]
pub struct ParseCache {
    files: DashMap<PathBuf, Arc<FileScan>>,
}

impl ParseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_parse(&self, path: &Path) -> Result<Arc<FileScan>> {
        if let Some(hit) = self.files.get(path) {
            return Ok(Arc::clone(hit.value()));
        }
        let scan = Arc::new(FileScan::read(path)?);
        let entry = self
            .files
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::clone(&scan));
        Ok(Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// One source file of a crate with the module path it is mounted at.
#[derive(Debug, Clone)]
pub struct ModuleFile {
    /// `crate_name::a::b`.
    pub module_path: String,
    /// Every module on the way from the crate root is `pub`.
    pub exported: bool,
    pub scan: Arc<FileScan>,
}

impl ModuleFile {
    /// Import path of an item nested in inline modules of this file.
    pub fn import_path(&self, inline: &[String]) -> String {
        if inline.is_empty() {
            self.module_path.clone()
        } else {
            format!("{}::{}", self.module_path, inline.join("::"))
        }
    }
}

struct Pending {
    path: PathBuf,
    module_path: String,
    /// Directory that `mod x;` declarations of this file resolve against.
    dir: PathBuf,
    exported: bool,
}

/// Walk `mod` declarations from a crate root, parsing one breadth level at a
/// time on the rayon pool.
pub fn walk_crate(crate_name: &str, root: &Path, cache: &ParseCache) -> Result<Vec<ModuleFile>> {
    let root_dir = root.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut level = vec![Pending {
        path: root.to_path_buf(),
        module_path: crate_name.to_string(),
        dir: root_dir,
        exported: true,
    }];
    let mut out = Vec::new();
    let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
    seen.insert(root.to_path_buf());

    while !level.is_empty() {
        let parsed: Vec<(Pending, Arc<FileScan>)> = level
            .into_par_iter()
            .map(|p| cache.get_or_parse(&p.path).map(|scan| (p, scan)))
            .collect::<Result<_>>()?;

        let mut next = VecDeque::new();
        for (pending, scan) in parsed {
            for m in &scan.modules {
                let mut dir = pending.dir.clone();
                for seg in &m.inline_prefix {
                    dir.push(seg);
                }
                let candidates = match &m.path_attr {
                    Some(p) => vec![dir.join(p)],
                    None => vec![
                        dir.join(format!("{}.rs", m.name)),
                        dir.join(&m.name).join("mod.rs"),
                    ],
                };
                let Some(found) = candidates.into_iter().find(|c| c.is_file()) else {
                    if !m.has_cfg {
                        tracing::warn!(
                            module = %m.name,
                            file = %pending.path.display(),
                            "module file not found, skipping"
                        );
                    }
                    continue;
                };
                if !seen.insert(found.clone()) {
                    continue;
                }
                let mut module_path = pending.module_path.clone();
                for seg in m.inline_prefix.iter().chain(std::iter::once(&m.name)) {
                    module_path.push_str("::");
                    module_path.push_str(seg);
                }
                let child_dir = if m.path_attr.is_some() || found.ends_with("mod.rs") {
                    found.parent().map(Path::to_path_buf).unwrap_or_default()
                } else {
                    dir.join(&m.name)
                };
                next.push_back(Pending {
                    path: found,
                    module_path,
                    dir: child_dir,
                    exported: pending.exported && m.is_pub,
                });
            }
            out.push(ModuleFile {
                module_path: pending.module_path,
                exported: pending.exported,
                scan,
            });
        }
        level = next.into_iter().collect();
    }
    Ok(out)
}
