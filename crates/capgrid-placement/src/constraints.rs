//! Tag constraint evaluation.
//!
//! A resource description may carry placement constraints: tags in
//! `key:value` form that a candidate's backing resource pool must (hard) or
//! should (soft) carry, or must not carry. Hard conditions drop candidates;
//! satisfied soft conditions are counted and used as a secondary sort key
//! after pool priority.

use std::collections::BTreeSet;

use capgrid_state::{Enforcement, Occurrence, PlacementConstraint, ResourceDescription};
use tracing::debug;

/// A single tag condition extracted from a description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCondition {
    pub tag: String,
    pub enforcement: Enforcement,
    pub occurrence: Occurrence,
}

impl TagCondition {
    pub fn hard(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            enforcement: Enforcement::Hard,
            occurrence: Occurrence::MustOccur,
        }
    }

    pub fn soft(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            enforcement: Enforcement::Soft,
            occurrence: Occurrence::MustOccur,
        }
    }

    pub fn negated(mut self) -> Self {
        self.occurrence = Occurrence::MustNotOccur;
        self
    }

    pub fn is_hard(&self) -> bool {
        self.enforcement == Enforcement::Hard
    }

    /// Whether the condition holds for a candidate carrying `tags`.
    pub fn holds(&self, tags: &BTreeSet<String>) -> bool {
        let present = tags.contains(&self.tag);
        match self.occurrence {
            Occurrence::MustOccur => present,
            Occurrence::MustNotOccur => !present,
        }
    }
}

impl From<&PlacementConstraint> for TagCondition {
    fn from(c: &PlacementConstraint) -> Self {
        Self {
            tag: c.tag.clone(),
            enforcement: c.enforcement,
            occurrence: c.occurrence,
        }
    }
}

/// Outcome of evaluating all conditions against one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Rejected,
    Accepted { soft_matches: usize },
}

/// Conditions declared on `desc`, or `None` when it declares none.
///
/// `None` means evaluation is skipped entirely. `Some` with conditions that
/// nothing satisfies is a hard failure for the caller.
pub fn extract_tag_conditions(desc: &ResourceDescription) -> Option<Vec<TagCondition>> {
    if desc.constraints.is_empty() {
        return None;
    }
    Some(desc.constraints.iter().map(TagCondition::from).collect())
}

/// Evaluate `conditions` against a candidate's tag set.
pub fn evaluate(conditions: &[TagCondition], tags: &BTreeSet<String>) -> Evaluation {
    let mut soft_matches = 0;
    for condition in conditions {
        let holds = condition.holds(tags);
        if condition.is_hard() {
            if !holds {
                return Evaluation::Rejected;
            }
        } else if holds {
            soft_matches += 1;
        }
    }
    Evaluation::Accepted { soft_matches }
}

/// Drop candidates failing a hard condition and order the rest by
/// ascending priority, then descending soft-match count.
///
/// `key` yields a candidate's priority and tag set. The sort is stable, so
/// ties keep their input (discovery) order. With `conditions == None` the
/// candidates are only sorted.
pub fn filter_by_constraints<T, F>(
    candidates: Vec<T>,
    conditions: Option<&[TagCondition]>,
    key: F,
) -> Vec<T>
where
    F: Fn(&T) -> (i32, &BTreeSet<String>),
{
    let total = candidates.len();
    let mut kept: Vec<(T, usize)> = Vec::with_capacity(total);
    for candidate in candidates {
        let verdict = match conditions {
            Some(conditions) => evaluate(conditions, key(&candidate).1),
            None => Evaluation::Accepted { soft_matches: 0 },
        };
        if let Evaluation::Accepted { soft_matches } = verdict {
            kept.push((candidate, soft_matches));
        }
    }

    kept.sort_by(|(a, soft_a), (b, soft_b)| {
        key(a).0.cmp(&key(b).0).then(soft_b.cmp(soft_a))
    });

    debug!(
        candidates = total,
        kept = kept.len(),
        constrained = conditions.is_some(),
        "tag constraints applied"
    );
    kept.into_iter().map(|(c, _)| c).collect()
}
