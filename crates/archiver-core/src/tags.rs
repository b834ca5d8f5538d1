//! Ticket-side tag state machine (C5).
//!
//! Every transition is expressed as an `(add_set, remove_set)` pair against
//! the configurable [`TagNames`]; nothing here talks to the TMS directly —
//! the orchestrator (C12) takes the sets this module computes and issues
//! the corresponding `add_tag`/`remove_tag` calls.

use std::collections::HashSet;

use archiver_types::TagNames;

/// One computed transition: tags to add, tags to remove. Order within each
/// `Vec` is insertion order (trigger/processing/done/error/signed), not
/// semantically meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagTransition {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

/// `apply_processing`: adds `PROCESSING`, removes `DONE`, `ERROR`,
/// `TRIGGER` (§4.5).
pub fn apply_processing(tags: &TagNames) -> TagTransition {
    TagTransition {
        add: vec![tags.processing.clone()],
        remove: vec![tags.done.clone(), tags.error.clone(), tags.trigger.clone()],
    }
}

/// `apply_done`: adds `DONE` (and the `signed` marker when `signed` is
/// true), removes `PROCESSING`, `ERROR`, `TRIGGER` (§4.5, expansion in
/// §4.5 for the `signed` marker).
pub fn apply_done(tags: &TagNames, signed: bool) -> TagTransition {
    let mut add = vec![tags.done.clone()];
    if signed {
        add.push(tags.signed.clone());
    }
    TagTransition {
        add,
        remove: vec![tags.processing.clone(), tags.error.clone(), tags.trigger.clone()],
    }
}

/// `apply_error(keep_trigger)`: adds `ERROR` (and `TRIGGER` if
/// `keep_trigger`), removes `PROCESSING`, `DONE` (and `TRIGGER` if not
/// `keep_trigger`) (§4.5). Per the invariant in §8-6, callers must pass
/// `keep_trigger == (classification == Transient)`.
pub fn apply_error(tags: &TagNames, keep_trigger: bool) -> TagTransition {
    let mut add = vec![tags.error.clone()];
    let mut remove = vec![tags.processing.clone(), tags.done.clone()];
    if keep_trigger {
        add.push(tags.trigger.clone());
    } else {
        remove.push(tags.trigger.clone());
    }
    TagTransition { add, remove }
}

/// Applies a computed transition to a tag set, returning the resulting
/// set. Used by tests and by any caller that wants to predict the
/// post-transition tag set without round-tripping through the TMS.
pub fn apply_to(current: &HashSet<String>, transition: &TagTransition) -> HashSet<String> {
    let mut next = current.clone();
    for tag in &transition.remove {
        next.remove(tag);
    }
    for tag in &transition.add {
        next.insert(tag.clone());
    }
    next
}

/// `should_process(current_tags, config) -> bool` (§4.5): false when
/// `DONE` is present; false when `require_trigger_tag` and `TRIGGER` is
/// absent; true otherwise.
pub fn should_process(current_tags: &HashSet<String>, tags: &TagNames, require_trigger_tag: bool) -> bool {
    if current_tags.contains(&tags.done) {
        return false;
    }
    if require_trigger_tag && !current_tags.contains(&tags.trigger) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> TagNames {
        TagNames::default()
    }

    #[test]
    fn apply_processing_adds_processing_removes_others() {
        let tags = names();
        let t = apply_processing(&tags);
        assert_eq!(t.add, vec![tags.processing.clone()]);
        assert!(t.remove.contains(&tags.done));
        assert!(t.remove.contains(&tags.error));
        assert!(t.remove.contains(&tags.trigger));
    }

    #[test]
    fn apply_done_without_signed_marker() {
        let tags = names();
        let t = apply_done(&tags, false);
        assert_eq!(t.add, vec![tags.done.clone()]);
    }

    #[test]
    fn apply_done_with_signed_marker() {
        let tags = names();
        let t = apply_done(&tags, true);
        assert!(t.add.contains(&tags.done));
        assert!(t.add.contains(&tags.signed));
    }

    #[test]
    fn apply_error_keep_trigger_adds_trigger_back() {
        let tags = names();
        let t = apply_error(&tags, true);
        assert!(t.add.contains(&tags.trigger));
        assert!(!t.remove.contains(&tags.trigger));
    }

    #[test]
    fn apply_error_drop_trigger_removes_it() {
        let tags = names();
        let t = apply_error(&tags, false);
        assert!(!t.add.contains(&tags.trigger));
        assert!(t.remove.contains(&tags.trigger));
    }

    #[test]
    fn processing_then_done_leaves_only_done() {
        let tags = names();
        let mut current: HashSet<String> = [tags.trigger.clone()].into_iter().collect();
        current = apply_to(&current, &apply_processing(&tags));
        assert_eq!(current, [tags.processing.clone()].into_iter().collect());
        current = apply_to(&current, &apply_done(&tags, false));
        assert_eq!(current, [tags.done.clone()].into_iter().collect());
    }

    #[test]
    fn should_process_false_when_done_present() {
        let tags = names();
        let current: HashSet<String> = [tags.done.clone()].into_iter().collect();
        assert!(!should_process(&current, &tags, false));
    }

    #[test]
    fn should_process_false_when_trigger_required_and_missing() {
        let tags = names();
        let current: HashSet<String> = HashSet::new();
        assert!(!should_process(&current, &tags, true));
    }

    #[test]
    fn should_process_true_by_default_with_no_restrictive_tags() {
        let tags = names();
        let current: HashSet<String> = [tags.trigger.clone()].into_iter().collect();
        assert!(should_process(&current, &tags, true));
        assert!(should_process(&current, &tags, false));
    }

    proptest::proptest! {
        #[test]
        fn apply_error_keep_trigger_matches_classification(keep_trigger in proptest::bool::ANY) {
            let tags = names();
            let t = apply_error(&tags, keep_trigger);
            proptest::prop_assert_eq!(t.add.contains(&tags.trigger), keep_trigger);
            proptest::prop_assert_eq!(t.remove.contains(&tags.trigger), !keep_trigger);
        }

        #[test]
        fn processing_then_done_is_idempotent_from_any_starting_subset(
            has_trigger in proptest::bool::ANY,
            has_processing in proptest::bool::ANY,
            has_done in proptest::bool::ANY,
            has_error in proptest::bool::ANY,
        ) {
            let tags = names();
            let mut current = HashSet::new();
            if has_trigger { current.insert(tags.trigger.clone()); }
            if has_processing { current.insert(tags.processing.clone()); }
            if has_done { current.insert(tags.done.clone()); }
            if has_error { current.insert(tags.error.clone()); }

            current = apply_to(&current, &apply_processing(&tags));
            current = apply_to(&current, &apply_done(&tags, false));
            proptest::prop_assert_eq!(current, [tags.done.clone()].into_iter().collect());
        }
    }
}
