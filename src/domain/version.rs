//! Version ranges for rule applicability.
//!
//! Two spellings are accepted:
//! - interval form, `[0.1.0,0.2.0)`, `(1.0,]`, `[,2.0.0)` (bounds may omit
//!   trailing components and carry a leading `v`);
//! - a Cargo requirement, `>=1.20, <2`, `^0.3`, `~1.2.3`, `1.*`.
//!
//! Both become a single interval, so disjointness between two rules is exact.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use cargo_metadata::semver::{Comparator, Op, Prerelease, Version, VersionReq};
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    lower: Bound<Version>,
    upper: Bound<Version>,
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl VersionRange {
    pub fn any() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(
            (&self.lower, &self.upper),
            (Bound::Unbounded, Bound::Unbounded)
        )
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.is_empty() || text == "*" {
            return Ok(Self::any());
        }
        if text.starts_with('[') || text.starts_with('(') {
            return parse_interval(text);
        }
        let req = VersionReq::parse(text)
            .map_err(|e| format!("invalid version range '{}': {}", text, e))?;
        let mut range = Self::any();
        for comparator in &req.comparators {
            let (lower, upper) = comparator_bounds(comparator)
                .ok_or_else(|| format!("unsupported version operator in '{}'", text))?;
            range = range.intersect(&Self { lower, upper });
        }
        if range.is_empty() {
            return Err(format!("version range '{}' is empty", text));
        }
        Ok(range)
    }

    pub fn contains(&self, version: &Version) -> bool {
        let above = match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(lo) => version >= lo,
            Bound::Excluded(lo) => version > lo,
        };
        let below = match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(hi) => version <= hi,
            Bound::Excluded(hi) => version < hi,
        };
        above && below
    }

    pub fn intersect(&self, other: &Self) -> Self {
        Self {
            lower: tighter_lower(&self.lower, &other.lower),
            upper: tighter_upper(&self.upper, &other.upper),
        }
    }

    pub fn is_empty(&self) -> bool {
        let (lo, lo_inclusive) = match &self.lower {
            Bound::Unbounded => return false,
            Bound::Included(v) => (v, true),
            Bound::Excluded(v) => (v, false),
        };
        let (hi, hi_inclusive) = match &self.upper {
            Bound::Unbounded => return false,
            Bound::Included(v) => (v, true),
            Bound::Excluded(v) => (v, false),
        };
        match lo.cmp(hi) {
            Ordering::Greater => true,
            Ordering::Equal => !(lo_inclusive && hi_inclusive),
            Ordering::Less => false,
        }
    }

    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.intersect(other).is_empty()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return f.write_str("*");
        }
        match &self.lower {
            Bound::Unbounded => f.write_str("[,")?,
            Bound::Included(v) => write!(f, "[{},", v)?,
            Bound::Excluded(v) => write!(f, "({},", v)?,
        }
        match &self.upper {
            Bound::Unbounded => f.write_str(")"),
            Bound::Included(v) => write!(f, "{}]", v),
            Bound::Excluded(v) => write!(f, "{})", v),
        }
    }
}

impl Serialize for VersionRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn parse_interval(text: &str) -> Result<VersionRange, String> {
    let open = text.chars().next().unwrap_or('[');
    let close = text.chars().last().unwrap_or(')');
    if !matches!(close, ']' | ')') {
        return Err(format!("interval '{}' is not closed", text));
    }
    let inner = &text[1..text.len() - 1];
    let (lo, hi) = inner
        .split_once(',')
        .ok_or_else(|| format!("interval '{}' needs a ',' between bounds", text))?;

    let lower = match lo.trim() {
        "" => Bound::Unbounded,
        lo if open == '[' => Bound::Included(parse_loose(lo)?),
        lo => Bound::Excluded(parse_loose(lo)?),
    };
    let upper = match hi.trim() {
        "" => Bound::Unbounded,
        hi if close == ']' => Bound::Included(parse_loose(hi)?),
        hi => Bound::Excluded(parse_loose(hi)?),
    };
    let range = VersionRange { lower, upper };
    if range.is_empty() {
        return Err(format!("interval '{}' is empty", text));
    }
    Ok(range)
}

/// Parse a version that may lack minor/patch components or carry a `v`
/// prefix (`v1.2`, `1`, `1.70.0-nightly`).
pub fn parse_loose(text: &str) -> Result<Version, String> {
    let text = text.trim();
    let bare = text.strip_prefix('v').unwrap_or(text);
    if let Ok(version) = Version::parse(bare) {
        return Ok(version);
    }
    let (core, pre) = match bare.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (bare, None),
    };
    let mut parts = core.split('.');
    let mut next = |name: &str| -> Result<u64, String> {
        match parts.next() {
            None => Ok(0),
            Some(p) => p
                .parse::<u64>()
                .map_err(|_| format!("invalid {} component in version '{}'", name, text)),
        }
    };
    let major = next("major")?;
    let minor = next("minor")?;
    let patch = next("patch")?;
    let mut version = Version::new(major, minor, patch);
    if let Some(pre) = pre {
        version.pre = Prerelease::new(pre).map_err(|e| format!("version '{}': {}", text, e))?;
    }
    Ok(version)
}

fn comparator_bounds(c: &Comparator) -> Option<(Bound<Version>, Bound<Version>)> {
    let mut base = Version::new(c.major, c.minor.unwrap_or(0), c.patch.unwrap_or(0));
    base.pre = c.pre.clone();
    let next_major = Version::new(c.major + 1, 0, 0);
    let next_minor = c.minor.map(|minor| Version::new(c.major, minor + 1, 0));
    // Upper bound that ends the range named by the components present.
    let span_end = match (c.minor, c.patch) {
        (Some(_), Some(patch)) => Version::new(c.major, c.minor.unwrap_or(0), patch + 1),
        (Some(_), None) => next_minor.clone().unwrap_or_else(|| next_major.clone()),
        (None, _) => next_major.clone(),
    };

    let bounds = match c.op {
        Op::Exact => match c.patch {
            Some(_) => (Bound::Included(base.clone()), Bound::Included(base)),
            None => (Bound::Included(base), Bound::Excluded(span_end)),
        },
        Op::Greater => match c.patch {
            Some(_) => (Bound::Excluded(base), Bound::Unbounded),
            None => (Bound::Included(span_end), Bound::Unbounded),
        },
        Op::GreaterEq => (Bound::Included(base), Bound::Unbounded),
        Op::Less => (Bound::Unbounded, Bound::Excluded(base)),
        Op::LessEq => match c.patch {
            Some(_) => (Bound::Unbounded, Bound::Included(base)),
            None => (Bound::Unbounded, Bound::Excluded(span_end)),
        },
        Op::Tilde => {
            let end = next_minor.unwrap_or(next_major);
            (Bound::Included(base), Bound::Excluded(end))
        }
        Op::Caret => {
            let end = match (c.major, c.minor, c.patch) {
                (0, Some(0), Some(patch)) => Version::new(0, 0, patch + 1),
                (0, Some(minor), _) => Version::new(0, minor + 1, 0),
                _ => next_major,
            };
            (Bound::Included(base), Bound::Excluded(end))
        }
        Op::Wildcard => (Bound::Included(base), Bound::Excluded(span_end)),
        _ => return None,
    };
    Some(bounds)
}

fn tighter_lower(a: &Bound<Version>, b: &Bound<Version>) -> Bound<Version> {
    match (a, b) {
        (Bound::Unbounded, other) | (other, Bound::Unbounded) => other.clone(),
        (Bound::Included(x), Bound::Included(y)) => Bound::Included(x.max(y).clone()),
        (Bound::Excluded(x), Bound::Excluded(y)) => Bound::Excluded(x.max(y).clone()),
        (Bound::Included(inc), Bound::Excluded(exc))
        | (Bound::Excluded(exc), Bound::Included(inc)) => {
            if inc > exc {
                Bound::Included(inc.clone())
            } else {
                Bound::Excluded(exc.clone())
            }
        }
    }
}

fn tighter_upper(a: &Bound<Version>, b: &Bound<Version>) -> Bound<Version> {
    match (a, b) {
        (Bound::Unbounded, other) | (other, Bound::Unbounded) => other.clone(),
        (Bound::Included(x), Bound::Included(y)) => Bound::Included(x.min(y).clone()),
        (Bound::Excluded(x), Bound::Excluded(y)) => Bound::Excluded(x.min(y).clone()),
        (Bound::Included(inc), Bound::Excluded(exc))
        | (Bound::Excluded(exc), Bound::Included(inc)) => {
            if inc < exc {
                Bound::Included(inc.clone())
            } else {
                Bound::Excluded(exc.clone())
            }
        }
    }
}
