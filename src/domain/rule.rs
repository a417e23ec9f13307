//! Hook rules: the declarative description of what to wrap and with which
//! hooks. Rules are immutable once the registry has validated them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::ast::normalize_type_str;
use crate::domain::version::VersionRange;

/// How a rule selects the receiver of a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReceiverSelector {
    /// Only free functions match.
    None,
    /// Any impl block matches ("*").
    Any,
    /// Compared with the last segment of the impl self type, or with the
    /// full normalized self type when it carries generics.
    Exact(String),
}

impl ReceiverSelector {
    pub fn matches(&self, receiver: Option<(&str, &str)>) -> bool {
        match (self, receiver) {
            (ReceiverSelector::None, None) => true,
            (ReceiverSelector::None, Some(_)) => false,
            (_, None) => false,
            (ReceiverSelector::Any, Some(_)) => true,
            (ReceiverSelector::Exact(want), Some((last, full))) => {
                if want.contains('<') {
                    want == full
                } else {
                    want == last
                }
            }
        }
    }
}

/// Parameter or result shape: exact normalized type list, or wildcard arity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Shape {
    Any,
    Exact(Vec<String>),
}

impl Shape {
    pub fn matches(&self, types: &[String]) -> bool {
        match self {
            Shape::Any => true,
            Shape::Exact(want) => want.len() == types.len() && want.iter().zip(types).all(|(a, b)| a == b || a == "_"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Debug,
    Display,
    Clone,
}

impl CaptureMode {
    /// `CallContext` method that stores a capture of this mode.
    pub fn context_method(self) -> &'static str {
        match self {
            CaptureMode::Debug => "capture_debug",
            CaptureMode::Display => "capture_display",
            CaptureMode::Clone => "capture_clone",
        }
    }
}

/// One parameter (or `return`) snapshot requested by a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capture {
    pub param: String,
    pub mode: CaptureMode,
    /// Declared parameter type, normalized. Checked against the declaration
    /// and against other rules capturing the same slot.
    pub ty: Option<String>,
}

impl Capture {
    pub fn is_return(&self) -> bool {
        self.param == "return"
    }
}

/// Reference to a `pub fn` in a hook crate, e.g. `client::on_enter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookRef {
    pub hook_crate: String,
    pub path: String,
}

impl HookRef {
    /// Absolute path usable from any crate that depends on the hook crate.
    pub fn absolute(&self) -> String {
        format!("::{}::{}", self.hook_crate, self.path)
    }
}

/// A hook crate declared by a rule source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookCrate {
    pub name: String,
    pub dir: PathBuf,
}

/// A dependency the rule needs in the program graph besides its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requirement {
    pub package: String,
    pub range: VersionRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookRule {
    pub id: String,
    /// Position in registration order; drives nesting order.
    pub order: usize,
    /// Rule file the rule came from.
    pub source: String,
    pub import_path: String,
    pub receiver: ReceiverSelector,
    pub function: String,
    pub params: Shape,
    pub results: Shape,
    pub on_enter: Option<HookRef>,
    pub on_exit: Option<HookRef>,
    pub version: VersionRange,
    pub rustc: Option<VersionRange>,
    pub requires: Vec<Requirement>,
    pub fusible: bool,
    pub captures: Vec<Capture>,
    pub hook_crate: HookCrate,
}

impl HookRule {
    /// First segment of the import path: the target's lib crate name.
    pub fn target_crate(&self) -> &str {
        self.import_path
            .split("::")
            .next()
            .unwrap_or(&self.import_path)
    }

    /// Whether the wrapped body's return value is needed at exit.
    pub fn captures_return(&self) -> bool {
        self.captures.iter().any(Capture::is_return)
    }

    pub fn param_captures(&self) -> impl Iterator<Item = &Capture> {
        self.captures.iter().filter(|c| !c.is_return())
    }

    /// Qualified name of the selected declaration, for messages.
    pub fn selector(&self) -> String {
        match &self.receiver {
            ReceiverSelector::None => format!("{}::{}", self.import_path, self.function),
            ReceiverSelector::Any => format!("{}::*::{}", self.import_path, self.function),
            ReceiverSelector::Exact(r) => format!("{}::{}::{}", self.import_path, r, self.function),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Rule file format
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleFile {
    pub hooks: HooksDef,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HooksDef {
    #[serde(rename = "crate")]
    pub crate_name: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ShapeDef {
    Wildcard(String),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequirementDef {
    pub package: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureDef {
    pub param: String,
    #[serde(rename = "as", default = "default_capture_mode")]
    pub mode: String,
    #[serde(default)]
    pub ty: Option<String>,
}

fn default_capture_mode() -> String {
    "debug".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDef {
    pub id: String,
    pub import_path: String,
    #[serde(default)]
    pub receiver: Option<String>,
    pub function: String,
    #[serde(default)]
    pub params: Option<ShapeDef>,
    #[serde(default)]
    pub results: Option<ShapeDef>,
    #[serde(default)]
    pub on_enter: Option<String>,
    #[serde(default)]
    pub on_exit: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub rustc: Option<String>,
    #[serde(default)]
    pub requires: Vec<RequirementDef>,
    #[serde(default)]
    pub fusible: bool,
    #[serde(default)]
    pub captures: Vec<CaptureDef>,
}

fn is_identifier(segment: &str) -> bool {
    let segment = segment.strip_prefix("r#").unwrap_or(segment);
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    segment != "_" && chars.all(|c| c.is_alphanumeric() || c == '_')
}

pub(crate) fn is_path(text: &str) -> bool {
    !text.is_empty() && text.split("::").all(is_identifier)
}

fn is_rule_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_package_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

fn parse_shape(def: Option<ShapeDef>, what: &str) -> Result<Shape, String> {
    match def {
        None => Ok(Shape::Any),
        Some(ShapeDef::Wildcard(s)) if s.trim() == "*" => Ok(Shape::Any),
        Some(ShapeDef::Wildcard(s)) => Err(format!(
            "{} must be \"*\" or a list of types, got \"{}\"",
            what, s
        )),
        Some(ShapeDef::List(types)) => {
            let mut out = Vec::with_capacity(types.len());
            for ty in &types {
                if ty.trim() == "_" {
                    out.push("_".to_string());
                    continue;
                }
                out.push(normalize_type_str(ty).map_err(|e| format!("{} type '{}': {}", what, ty, e))?);
            }
            // `-> ()` and no return type are the same shape.
            if out.len() == 1 && out[0] == "()" {
                out.clear();
            }
            Ok(Shape::Exact(out))
        }
    }
}

fn parse_hook_ref(text: Option<String>, hook_crate: &str, what: &str) -> Result<Option<HookRef>, String> {
    match text {
        None => Ok(None),
        Some(path) => {
            let path = path.trim();
            let path = path
                .strip_prefix(&format!("{}::", hook_crate))
                .unwrap_or(path)
                .to_string();
            if !is_path(&path) {
                return Err(format!("{} '{}' is not a function path", what, path));
            }
            Ok(Some(HookRef {
                hook_crate: hook_crate.to_string(),
                path,
            }))
        }
    }
}

impl RuleDef {
    /// Validate one rule definition. Hook references are only checked for
    /// shape here; the registry resolves them against the hook crate.
    pub fn into_rule(self, order: usize, source: &str, hook_crate: &HookCrate) -> Result<HookRule, (Option<String>, String)> {
        let id = self.id.trim().to_string();
        if !is_rule_id(&id) {
            return Err((None, format!("invalid rule id '{}'", self.id)));
        }
        let fail = |msg: String| (Some(id.clone()), msg);

        if !is_path(&self.import_path) {
            return Err(fail(format!("malformed import_path '{}'", self.import_path)));
        }
        if !is_identifier(&self.function) {
            return Err(fail(format!("malformed function name '{}'", self.function)));
        }
        let receiver = match self.receiver.as_deref().map(str::trim) {
            None => ReceiverSelector::None,
            Some("*") => ReceiverSelector::Any,
            Some(ty) => ReceiverSelector::Exact(
                normalize_type_str(ty).map_err(|e| fail(format!("receiver '{}': {}", ty, e)))?,
            ),
        };
        let params = parse_shape(self.params, "params").map_err(fail)?;
        let results = parse_shape(self.results, "results").map_err(fail)?;

        let on_enter = parse_hook_ref(self.on_enter, &hook_crate.name, "on_enter").map_err(fail)?;
        let on_exit = parse_hook_ref(self.on_exit, &hook_crate.name, "on_exit").map_err(fail)?;
        if on_enter.is_none() && on_exit.is_none() {
            return Err(fail("rule declares neither on_enter nor on_exit".to_string()));
        }

        let version = match &self.version {
            Some(v) => VersionRange::parse(v).map_err(fail)?,
            None => VersionRange::any(),
        };
        let rustc = match &self.rustc {
            Some(v) => Some(VersionRange::parse(v).map_err(fail)?),
            None => None,
        };

        let mut requires = Vec::with_capacity(self.requires.len());
        for req in self.requires {
            if !is_package_name(&req.package) {
                return Err(fail(format!("malformed required package '{}'", req.package)));
            }
            let range = match &req.version {
                Some(v) => VersionRange::parse(v).map_err(fail)?,
                None => VersionRange::any(),
            };
            requires.push(Requirement {
                package: req.package,
                range,
            });
        }

        let mut captures: Vec<Capture> = Vec::with_capacity(self.captures.len());
        for cap in self.captures {
            let param = cap.param.trim().to_string();
            if param == "self" {
                return Err(fail("the receiver is captured automatically; remove the 'self' capture".to_string()));
            }
            if param != "return" && !is_identifier(&param) {
                return Err(fail(format!("malformed capture '{}'", cap.param)));
            }
            let mode = match cap.mode.as_str() {
                "debug" => CaptureMode::Debug,
                "display" => CaptureMode::Display,
                "clone" => CaptureMode::Clone,
                other => return Err(fail(format!("unknown capture mode '{}' for '{}'", other, param))),
            };
            let ty = match cap.ty {
                Some(ty) => Some(normalize_type_str(&ty).map_err(|e| fail(format!("capture '{}' type '{}': {}", param, ty, e)))?),
                None => None,
            };
            if captures.iter().any(|c| c.param == param) {
                return Err(fail(format!("'{}' is captured twice", param)));
            }
            captures.push(Capture { param, mode, ty });
        }

        Ok(HookRule {
            id,
            order,
            source: source.to_string(),
            import_path: self.import_path,
            receiver,
            function: self.function,
            params,
            results,
            on_enter,
            on_exit,
            version,
            rustc,
            requires,
            fusible: self.fusible,
            captures,
            hook_crate: hook_crate.clone(),
        })
    }
}
