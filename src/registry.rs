use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Domain → token mapping loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: HashMap<String, String>,
}

impl Registry {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read registry file: {}", path.display()))?;

        Ok(Self::parse(&content))
    }

    /// Parses `domain:token` lines. Lines missing either half are skipped.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split(':');
                let domain = parts.next()?.trim();
                let token = parts.next()?.trim();
                if domain.is_empty() || token.is_empty() {
                    return None;
                }
                Some((domain.to_string(), token.to_string()))
            })
            .collect();

        Self { entries }
    }

    pub fn lookup(&self, domain: &str) -> Option<&str> {
        self.entries.get(domain).map(String::as_str)
    }

    pub fn authorizes(&self, domain: &str, token: &str) -> bool {
        self.lookup(domain) == Some(token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<D: Into<String>, T: Into<String>> FromIterator<(D, T)> for Registry {
    fn from_iter<I: IntoIterator<Item = (D, T)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(d, t)| (d.into(), t.into()))
                .collect(),
        }
    }
}
