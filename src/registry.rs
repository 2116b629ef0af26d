use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::{error::Error, types::LanguageProfile, Result};

/// Fuzzy matches further away than this are never suggested.
const MAX_FUZZY_DISTANCE: usize = 2;

/// Immutable mapping from user-facing aliases to execution backends. The
/// snapshot behind the lock is replaced atomically on reload; resolved
/// profiles are handed out as `Arc`s, so in-flight requests keep referencing
/// the snapshot they resolved against.
pub struct LanguageRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
}

struct Snapshot {
    by_alias: HashMap<String, Arc<LanguageProfile>>,
}

impl LanguageRegistry {
    /// Build a registry from a profile list. Aliases are keyed lowercase and
    /// must be unique within the snapshot.
    pub fn from_profiles(profiles: Vec<LanguageProfile>) -> Result<Self> {
        let snapshot = Snapshot::build(profiles)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Replace the alias snapshot atomically.
    pub fn reload(&self, profiles: Vec<LanguageProfile>) -> Result<()> {
        let snapshot = Snapshot::build(profiles)?;
        let count = snapshot.by_alias.len();
        *self.snapshot.write().expect("registry lock poisoned") = Arc::new(snapshot);
        info!("Language registry reloaded with {} aliases", count);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshot
            .read()
            .expect("registry lock poisoned")
            .by_alias
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a user-supplied tag to a profile. Case-insensitive exact match
    /// first; otherwise a single unambiguous close match resolves, and
    /// anything else fails with the closest aliases as suggestions.
    pub fn resolve(&self, tag: &str) -> Result<Arc<LanguageProfile>> {
        let snapshot = self.snapshot.read().expect("registry lock poisoned").clone();
        let needle = tag.trim().to_lowercase();

        if let Some(profile) = snapshot.by_alias.get(&needle) {
            return Ok(profile.clone());
        }

        let mut best_distance = usize::MAX;
        let mut best: Vec<&Arc<LanguageProfile>> = Vec::new();
        for (alias, profile) in &snapshot.by_alias {
            let distance = levenshtein(&needle, alias);
            if distance > MAX_FUZZY_DISTANCE {
                continue;
            }
            if distance < best_distance {
                best_distance = distance;
                best = vec![profile];
            } else if distance == best_distance {
                best.push(profile);
            }
        }

        match best.as_slice() {
            [only] => {
                debug!(
                    "Fuzzy-resolved language tag {:?} to alias {:?}",
                    tag, only.alias
                );
                Ok((*only).clone())
            }
            _ => {
                let mut suggestions: Vec<String> =
                    best.iter().map(|p| p.alias.clone()).collect();
                suggestions.sort();
                Err(Error::UnknownLanguage {
                    tag: tag.to_string(),
                    suggestions,
                })
            }
        }
    }
}

impl Snapshot {
    fn build(profiles: Vec<LanguageProfile>) -> Result<Self> {
        let mut by_alias = HashMap::with_capacity(profiles.len());
        for mut profile in profiles {
            profile.alias = profile.alias.trim().to_lowercase();
            if profile.alias.is_empty() {
                return Err(Error::Registry("empty language alias".to_string()));
            }
            if let Some(previous) =
                by_alias.insert(profile.alias.clone(), Arc::new(profile))
            {
                return Err(Error::Registry(format!(
                    "duplicate alias: {}",
                    previous.alias
                )));
            }
        }
        Ok(Self { by_alias })
    }
}

/// Edit distance over unicode scalar values, two-row DP.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(alias: &str) -> LanguageProfile {
        LanguageProfile {
            alias: alias.to_string(),
            backend_id: format!("{}-backend", alias),
            compiler_version: "1.0.0".to_string(),
            display_name: alias.to_string(),
        }
    }

    fn registry(aliases: &[&str]) -> LanguageRegistry {
        LanguageRegistry::from_profiles(aliases.iter().map(|a| profile(a)).collect()).unwrap()
    }

    #[test]
    fn resolve_is_case_insensitive() {
        let registry = registry(&["python", "rust", "haskell"]);
        for tag in ["python", "PYTHON", "Python", "  python  "] {
            assert_eq!(registry.resolve(tag).unwrap().alias, "python");
        }
    }

    #[test]
    fn resolve_is_deterministic() {
        let registry = registry(&["python", "rust", "go"]);
        let first = registry.resolve("rust").unwrap();
        for _ in 0..10 {
            assert_eq!(registry.resolve("rust").unwrap(), first);
        }
    }

    #[test]
    fn close_typo_resolves_unambiguously() {
        let registry = registry(&["brainfuck", "python", "rust"]);
        assert_eq!(registry.resolve("brainfck").unwrap().alias, "brainfuck");
        assert_eq!(registry.resolve("pythn").unwrap().alias, "python");
    }

    #[test]
    fn brainfck_resolves_when_brainfuck_registered() {
        let registry = registry(&["brainfuck", "python"]);
        assert_eq!(registry.resolve("brainfck").unwrap().alias, "brainfuck");
    }

    #[test]
    fn brainfck_fails_without_close_alias() {
        let registry = registry(&["python", "rust"]);
        let err = registry.resolve("brainfck").unwrap_err();
        match err {
            Error::UnknownLanguage { tag, suggestions } => {
                assert_eq!(tag, "brainfck");
                assert!(suggestions.is_empty());
            }
            other => panic!("expected UnknownLanguage, got {other}"),
        }
    }

    #[test]
    fn far_off_tag_has_no_suggestions() {
        let registry = registry(&["python", "rust"]);
        let err = registry.resolve("cobol").unwrap_err();
        match err {
            Error::UnknownLanguage { tag, suggestions } => {
                assert_eq!(tag, "cobol");
                assert!(suggestions.is_empty());
            }
            other => panic!("expected UnknownLanguage, got {other}"),
        }
    }

    #[test]
    fn ambiguous_match_is_rejected_with_shortlist() {
        let registry = registry(&["ruby", "rust"]);
        // "rusy" is distance 1 from both
        let err = registry.resolve("rusy").unwrap_err();
        match err {
            Error::UnknownLanguage { suggestions, .. } => {
                assert_eq!(suggestions, vec!["ruby".to_string(), "rust".to_string()]);
            }
            other => panic!("expected UnknownLanguage, got {other}"),
        }
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let result = LanguageRegistry::from_profiles(vec![profile("python"), profile("PYTHON")]);
        assert!(matches!(result, Err(Error::Registry(_))));
    }

    #[test]
    fn reload_swaps_snapshot_but_old_profiles_stay_valid() {
        let registry = registry(&["python"]);
        let old = registry.resolve("python").unwrap();
        registry
            .reload(vec![profile("rust"), profile("go")])
            .unwrap();
        assert!(registry.resolve("python").is_err());
        assert_eq!(registry.resolve("rust").unwrap().alias, "rust");
        // resolved Arc from the previous snapshot is untouched
        assert_eq!(old.alias, "python");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("brainfck", "brainfuck"), 1);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }
}
