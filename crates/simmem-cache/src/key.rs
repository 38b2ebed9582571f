// SPDX-License-Identifier: AGPL-3.0

//! Cache file name templates

use once_cell::sync::Lazy;
use regex::Regex;

use simmem_exceptions::{CacheError, CacheResult};

static KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}]*)\}").expect("cache key pattern is valid"));

const ACCEPTED_KEYS: [&str; 3] = ["name", "binhash", "addr"];

/// File name template with `{name}`, `{binhash}` and `{addr}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    template: String,
}

impl CacheKey {
    pub const DEFAULT_TEMPLATE: &'static str = "{name}-{binhash}.cache";

    /// Parse a template, rejecting unknown placeholders
    pub fn parse(template: &str) -> CacheResult<Self> {
        for captures in KEY_PATTERN.captures_iter(template) {
            let key = &captures[1];
            if !ACCEPTED_KEYS.contains(&key) {
                return Err(CacheError::UnknownKey(key.to_string()));
            }
        }

        Ok(Self {
            template: template.to_string(),
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Whether the rendered name depends on the state address
    pub fn uses_addr(&self) -> bool {
        self.template.contains("{addr}")
    }

    /// Render the file name; without an address `{addr}` stays pending
    pub fn render(&self, name: &str, binhash: &str, addr: Option<u64>) -> String {
        let rendered = self
            .template
            .replace("{name}", name)
            .replace("{binhash}", binhash);
        match addr {
            Some(addr) => rendered.replace("{addr}", &format!("{:#x}", addr)),
            None => rendered,
        }
    }
}

impl Default for CacheKey {
    fn default() -> Self {
        Self {
            template: Self::DEFAULT_TEMPLATE.to_string(),
        }
    }
}
