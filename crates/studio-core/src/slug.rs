use crate::config_list::AgentDirectoryEntry;
use crate::error::{StudioError, StudioResult};
use std::collections::HashSet;

const FALLBACK_SLUG: &str = "agent";
const MAX_SUFFIX: u32 = 100_000;

/// Lowercase ASCII alphanumerics; every other run of characters becomes a
/// single `-`, and leading/trailing dashes are dropped.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        slug
    }
}

/// Pick `slug(name)` or the first free `slug-N` for N in `2..100000`.
pub fn allocate_agent_id(name: &str, list: &[AgentDirectoryEntry]) -> StudioResult<String> {
    let base = slugify(name);
    let existing: HashSet<&str> = list.iter().map(|entry| entry.id.as_str()).collect();
    if !existing.contains(base.as_str()) {
        return Ok(base);
    }
    (2..MAX_SUFFIX)
        .map(|suffix| format!("{base}-{suffix}"))
        .find(|candidate| !existing.contains(candidate.as_str()))
        .ok_or(StudioError::IdAllocation { base })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("My Agent"), "my-agent");
        assert_eq!(slugify("  --Research__Bot 2!! "), "research-bot-2");
        assert_eq!(slugify("Ünïcode"), "n-code");
        assert_eq!(slugify("!!!"), "agent");
    }

    #[test]
    fn allocate_suffixes_collisions() {
        let list = vec![
            AgentDirectoryEntry::new("my-agent"),
            AgentDirectoryEntry::new("my-agent-2"),
        ];
        assert_eq!(allocate_agent_id("My Agent", &list).unwrap(), "my-agent-3");
        assert_eq!(allocate_agent_id("Other", &list).unwrap(), "other");
    }

    #[test]
    fn allocate_exhaustion_fails() {
        let mut list = vec![AgentDirectoryEntry::new("x")];
        list.extend((2..MAX_SUFFIX).map(|n| AgentDirectoryEntry::new(format!("x-{n}"))));
        let err = allocate_agent_id("x", &list).unwrap_err();
        assert!(matches!(err, StudioError::IdAllocation { ref base } if base == "x"));
    }
}
