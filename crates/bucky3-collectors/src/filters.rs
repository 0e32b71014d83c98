//! Entity name filtering for the collectors.

use regex::Regex;

/// Full-match regex white/blacklists applied to entity names (interfaces,
/// disks, filesystems, containers). A whitelist, when present, is
/// authoritative; otherwise the blacklist rejects.
#[derive(Debug, Default, Clone)]
pub struct NameFilter {
    whitelist: Option<Vec<Regex>>,
    blacklist: Option<Vec<Regex>>,
}

impl NameFilter {
    pub fn new(
        whitelist: Option<&[String]>,
        blacklist: Option<&[String]>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            whitelist: whitelist.map(compile).transpose()?,
            blacklist: blacklist.map(compile).transpose()?,
        })
    }

    pub fn accepts(&self, name: &str) -> bool {
        if let Some(whitelist) = &self.whitelist {
            return whitelist.iter().any(|r| r.is_match(name));
        }
        if let Some(blacklist) = &self.blacklist {
            return !blacklist.iter().any(|r| r.is_match(name));
        }
        true
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("^(?:{p})$")))
        .collect()
}
