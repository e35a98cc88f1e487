//! Runtime scoping for shared stores.
//!
//! Dev and prod deployments may share one store. Every query is narrowed to
//! the current runtime family so instances never process each other's work.
//! Legacy rows without a tag belong to prod.

use std::sync::OnceLock;

use regex::Regex;

use super::filter::Filter;

/// Canonical tag of the prod family.
pub const PROD_FAMILY: &str = "prod";

/// Field holding the runtime tag on every scoped record.
pub const RUNTIME_TAG_FIELD: &str = "runtime_tag";

static PROD_FAMILY_RE: OnceLock<Regex> = OnceLock::new();

/// The runtime a process runs as, e.g. `prod`, `prod-host1`, `dev-alice`.
#[derive(Debug, Clone)]
pub struct RuntimeScope {
    runtime_tag: String,
}

impl RuntimeScope {
    pub fn new(runtime_tag: impl Into<String>) -> Self {
        let runtime_tag = runtime_tag.into().trim().to_string();
        Self { runtime_tag }
    }

    /// The exact tag of this runtime.
    pub fn runtime_tag(&self) -> &str {
        &self.runtime_tag
    }

    /// True when this runtime belongs to the prod family.
    pub fn is_prod(&self) -> bool {
        is_prod_family(&self.runtime_tag)
    }

    /// Tag written on records created by this runtime.
    ///
    /// Prod-family runtimes share one canonical tag so that any prod host
    /// picks up work created by another.
    pub fn record_tag(&self) -> &str {
        if self.is_prod() {
            PROD_FAMILY
        } else {
            &self.runtime_tag
        }
    }

    /// Filter matching records owned by this runtime on `field`.
    pub fn filter(&self, field: &str) -> Filter {
        if self.is_prod() {
            Filter::or([
                Filter::Matches(field.to_string(), prod_family_regex().clone()),
                Filter::missing_or_empty(field),
            ])
        } else {
            Filter::eq(field, self.runtime_tag.clone())
        }
    }

    /// Narrow `base` to this runtime on `field`.
    pub fn scope(&self, base: Filter, field: &str) -> Filter {
        base.and_also(self.filter(field))
    }

    /// Narrow `base` to this runtime on the default `runtime_tag` field.
    pub fn apply(&self, base: Filter) -> Filter {
        self.scope(base, RUNTIME_TAG_FIELD)
    }
}

/// True when `tag` names a prod-family runtime.
pub fn is_prod_family(tag: &str) -> bool {
    prod_family_regex().is_match(tag.trim())
}

fn prod_family_regex() -> &'static Regex {
    PROD_FAMILY_RE.get_or_init(|| Regex::new(r"^prod(?:-|$)").expect("prod family pattern is valid"))
}
