//! Interest index: `(kind, concrete type)` → subscribed worker templates.
//!
//! Group names are expanded through the fact registry at registration time;
//! types registered later do not retroactively widen an existing
//! subscription.

use std::collections::HashMap;

use crate::board::EntryKind;
use crate::facts::FactRegistry;
use crate::registration::InterestDecl;
use crate::utilities::errors::RegistrationError;

#[derive(Debug, Default)]
pub struct InterestIndex {
    map: HashMap<(EntryKind, String), Vec<String>>,
}

impl InterestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a template's interests, expanding groups to concrete types.
    ///
    /// An empty declaration is valid; the template will simply never be
    /// dispatched.
    pub fn register(
        &mut self,
        registry: &FactRegistry,
        template: &str,
        interests: &InterestDecl,
    ) -> Result<(), RegistrationError> {
        for (kind, names) in [
            (EntryKind::Fact, interests.fact_names()),
            (EntryKind::Hyp, interests.hyp_names()),
        ] {
            for concrete in registry.expand_all(names)? {
                let subscribers = self.map.entry((kind, concrete)).or_default();
                if !subscribers.iter().any(|existing| existing == template) {
                    subscribers.push(template.to_string());
                }
            }
        }
        Ok(())
    }

    /// Templates subscribed to `(kind, type_name)`.
    pub fn matching(&self, kind: EntryKind, type_name: &str) -> &[String] {
        self.map
            .get(&(kind, type_name.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::{register_builtin_types, FactRegistry};
    use crate::registration::InterestDecl;

    fn registry() -> FactRegistry {
        let mut registry = FactRegistry::new();
        register_builtin_types(&mut registry).unwrap();
        registry
    }

    #[test]
    fn group_interest_expands_to_members() {
        let registry = registry();
        let mut index = InterestIndex::new();
        index
            .register(
                &registry,
                "HashPlayer",
                &InterestDecl::Flat(vec!["hash".to_string()]),
            )
            .unwrap();

        for concrete in ["md5", "sha1", "sha256", "ssdeep"] {
            assert_eq!(index.matching(EntryKind::Fact, concrete), ["HashPlayer"]);
        }
        assert!(index.matching(EntryKind::Hyp, "md5").is_empty());
        assert!(index.matching(EntryKind::Fact, "mimetype").is_empty());
    }

    #[test]
    fn split_interests_land_on_their_kind() {
        let registry = registry();
        let mut index = InterestIndex::new();
        index
            .register(
                &registry,
                "MimeGuesser",
                &InterestDecl::Split {
                    facts: vec!["md5".to_string()],
                    hyps: vec!["mimetype".to_string()],
                },
            )
            .unwrap();
        assert_eq!(index.matching(EntryKind::Fact, "md5"), ["MimeGuesser"]);
        assert_eq!(index.matching(EntryKind::Hyp, "mimetype"), ["MimeGuesser"]);
        assert!(index.matching(EntryKind::Hyp, "md5").is_empty());
    }

    #[test]
    fn overlapping_names_do_not_double_subscribe() {
        let registry = registry();
        let mut index = InterestIndex::new();
        index
            .register(
                &registry,
                "Greedy",
                &InterestDecl::Flat(vec!["hash".to_string(), "md5".to_string()]),
            )
            .unwrap();
        assert_eq!(index.matching(EntryKind::Fact, "md5"), ["Greedy"]);
    }

    #[test]
    fn unknown_interest_fails_registration() {
        let registry = registry();
        let mut index = InterestIndex::new();
        let err = index
            .register(
                &registry,
                "Lost",
                &InterestDecl::Flat(vec!["nosuch".to_string()]),
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::UnknownInterest { .. }));
    }

    #[test]
    fn empty_interests_register_nothing() {
        let registry = registry();
        let mut index = InterestIndex::new();
        index
            .register(&registry, "Idle", &InterestDecl::default())
            .unwrap();
        assert!(index.is_empty());
    }
}
