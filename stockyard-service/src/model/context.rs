//! Immutable per-vendor context
//!
//! A context carries the static configuration a vendor's getters need at call
//! time (credentials, date format strings, header values) plus derived values
//! computed from the static set. It is built once at vendor load and exposes
//! no mutating API afterwards.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Frozen key/value configuration handed to every getter invocation
#[derive(Debug, Clone, Default)]
pub struct Context {
    vars: BTreeMap<String, String>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::Internal(format!("context is missing `{key}`")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

type Derive = Box<dyn FnOnce(&Context) -> String>;

/// Builder for [`Context`]
///
/// Derived variables are evaluated exactly once, at [`build`](Self::build)
/// time, in insertion order, each seeing the static set plus previously
/// derived values.
#[derive(Default)]
pub struct ContextBuilder {
    vars: BTreeMap<String, String>,
    derived: Vec<(String, Derive)>,
}

impl ContextBuilder {
    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn derived(
        mut self,
        key: impl Into<String>,
        f: impl FnOnce(&Context) -> String + 'static,
    ) -> Self {
        self.derived.push((key.into(), Box::new(f)));
        self
    }

    pub fn build(self) -> Context {
        let mut ctx = Context { vars: self.vars };
        for (key, f) in self.derived {
            let value = f(&ctx);
            ctx.vars.insert(key, value);
        }
        ctx
    }
}
