//! Runtime on/off switch for rules built with a runtime toggle.
//!
//! `HOOKWEAVE_DISABLED_RULES` holds a comma separated list of rule ids, or
//! `all`. It is read once per process.

use std::collections::HashSet;
use std::sync::OnceLock;

pub const DISABLED_RULES_ENV: &str = "HOOKWEAVE_DISABLED_RULES";

enum Disabled {
    All,
    Some(HashSet<String>),
}

static DISABLED: OnceLock<Disabled> = OnceLock::new();

fn parse(raw: &str) -> Disabled {
    if raw.trim() == "all" {
        return Disabled::All;
    }
    Disabled::Some(
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    )
}

pub fn is_enabled(rule: &str) -> bool {
    let disabled = DISABLED.get_or_init(|| {
        std::env::var(DISABLED_RULES_ENV)
            .map(|raw| parse(&raw))
            .unwrap_or_else(|_| Disabled::Some(HashSet::new()))
    });
    match disabled {
        Disabled::All => false,
        Disabled::Some(set) => !set.contains(rule),
    }
}
