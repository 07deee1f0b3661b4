//! Contender space: singleton roots or bounded-cardinality compositional
//! stories built from atomic roots.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::config::RootSpec;
use crate::core::policy::{ContenderSpaceMode, ContenderSpacePolicy};
use crate::gates::GateStatus;

/// Separator between member ids of a story id and signature.
pub const STORY_SEPARATOR: &str = "+";

/// Result of validating the contender space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContenderCheck {
    pub status: GateStatus,
    pub mode: ContenderSpaceMode,
    pub max_cardinality: usize,
    pub failures: Vec<String>,
    /// Story roots generated by auto-expansion.
    pub expanded: Vec<String>,
}

/// Sorted, deduplicated member signature of a root.
#[must_use]
pub fn signature(root: &RootSpec) -> Vec<String> {
    if root.components.is_empty() {
        return vec![root.root_id.clone()];
    }
    root.components
        .iter()
        .map(|c| c.trim().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Index combinations of `size` out of `n`, in lexicographic order.
fn combinations(n: usize, size: usize) -> Vec<Vec<usize>> {
    fn walk(start: usize, n: usize, size: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == size {
            out.push(current.clone());
            return;
        }
        for idx in start..n {
            current.push(idx);
            walk(idx + 1, n, size, current, out);
            current.pop();
        }
    }
    let mut out = Vec::new();
    walk(0, n, size, &mut Vec::with_capacity(size), &mut out);
    out
}

/// Add every missing story of 2..=`max_cardinality` atomic roots.
/// Returns the roots in their final order and the generated ids.
#[must_use]
pub fn expand_stories(roots: &[RootSpec], max_cardinality: usize) -> (Vec<RootSpec>, Vec<String>) {
    let mut atomic: Vec<&RootSpec> = roots.iter().filter(|r| r.components.is_empty()).collect();
    atomic.sort_by(|a, b| a.root_id.cmp(&b.root_id));
    let mut known: BTreeSet<Vec<String>> = roots.iter().map(signature).collect();
    let mut out = roots.to_vec();
    let mut generated = Vec::new();

    for size in 2..=max_cardinality.min(atomic.len()) {
        for combo in combinations(atomic.len(), size) {
            let members: Vec<&RootSpec> = combo.iter().map(|&idx| atomic[idx]).collect();
            let components: Vec<String> = members.iter().map(|r| r.root_id.clone()).collect();
            if !known.insert(components.clone()) {
                continue;
            }
            let root_id = components.join(STORY_SEPARATOR);
            let statement = members
                .iter()
                .map(|r| r.statement.trim())
                .collect::<Vec<_>>()
                .join(" AND ");
            generated.push(root_id.clone());
            out.push(RootSpec {
                root_id,
                statement,
                exclusion_clause: String::new(),
                components,
            });
        }
    }
    (out, generated)
}

/// Validate roots against the contender-space policy.
#[must_use]
pub fn validate_contender_space(
    roots: &[RootSpec],
    policy: &ContenderSpacePolicy,
    expanded: Vec<String>,
) -> ContenderCheck {
    let atomic: BTreeSet<&str> = roots
        .iter()
        .filter(|r| r.components.is_empty())
        .map(|r| r.root_id.as_str())
        .collect();
    let mut failures = Vec::new();
    let mut seen: BTreeMap<Vec<String>, &str> = BTreeMap::new();

    for root in roots {
        let members = signature(root);
        if !root.components.is_empty() {
            match policy.mode {
                ContenderSpaceMode::Singleton => failures.push(format!(
                    "{} is a compositional story but the contender space is singleton",
                    root.root_id
                )),
                ContenderSpaceMode::Compositional => {
                    for member in &members {
                        if !atomic.contains(member.as_str()) {
                            failures.push(format!(
                                "{} names unknown atomic root {member:?}",
                                root.root_id
                            ));
                        }
                    }
                    if members.len() < 2 || members.len() > policy.max_cardinality {
                        failures.push(format!(
                            "{} has cardinality {} outside 2..={}",
                            root.root_id,
                            members.len(),
                            policy.max_cardinality
                        ));
                    }
                }
            }
        }
        if let Some(first) = seen.get(&members) {
            failures.push(format!(
                "{} duplicates the story signature of {first}",
                root.root_id
            ));
        } else {
            seen.insert(members, root.root_id.as_str());
        }
    }

    ContenderCheck {
        status: GateStatus::from_pass(failures.is_empty()),
        mode: policy.mode,
        max_cardinality: policy.max_cardinality,
        failures,
        expanded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(id: &str, members: &[&str]) -> RootSpec {
        RootSpec {
            root_id: id.into(),
            statement: id.into(),
            exclusion_clause: String::new(),
            components: members.iter().map(|m| (*m).to_string()).collect(),
        }
    }

    fn compositional(max: usize) -> ContenderSpacePolicy {
        ContenderSpacePolicy {
            mode: ContenderSpaceMode::Compositional,
            max_cardinality: max,
            auto_expand: true,
        }
    }

    fn atomic() -> Vec<RootSpec> {
        vec![
            RootSpec::new("A", "seal wear"),
            RootSpec::new("B", "power dip"),
            RootSpec::new("C", "operator error"),
        ]
    }

    #[test]
    fn expansion_adds_all_pairs_up_to_cardinality() {
        let (roots, generated) = expand_stories(&atomic(), 2);
        assert_eq!(generated, vec!["A+B", "A+C", "B+C"]);
        assert_eq!(roots.len(), 6);
        assert_eq!(roots[3].statement, "seal wear AND power dip");
        let check = validate_contender_space(&roots, &compositional(2), generated);
        assert_eq!(check.status, GateStatus::Passed, "{:?}", check.failures);
    }

    #[test]
    fn expansion_skips_existing_signatures() {
        let mut roots = atomic();
        roots.push(story("BA", &["B", "A"]));
        let (expanded, generated) = expand_stories(&roots, 3);
        assert_eq!(generated, vec!["A+C", "B+C", "A+B+C"]);
        assert_eq!(expanded.len(), 7);
    }

    #[test]
    fn singleton_space_rejects_stories() {
        let mut roots = atomic();
        roots.push(story("AB", &["A", "B"]));
        let policy = ContenderSpacePolicy {
            mode: ContenderSpaceMode::Singleton,
            max_cardinality: 1,
            auto_expand: false,
        };
        let check = validate_contender_space(&roots, &policy, Vec::new());
        assert_eq!(check.status, GateStatus::Failed);
    }

    #[test]
    fn duplicate_signatures_and_cardinality_fail() {
        let mut roots = atomic();
        roots.push(story("AB", &["A", "B"]));
        roots.push(story("BA", &["B", "A"]));
        roots.push(story("ABC", &["A", "B", "C"]));
        let check = validate_contender_space(&roots, &compositional(2), Vec::new());
        assert_eq!(check.status, GateStatus::Failed);
        assert_eq!(check.failures.len(), 2, "{:?}", check.failures);
    }

    #[test]
    fn stories_must_reference_atomic_roots() {
        let mut roots = atomic();
        roots.push(story("AZ", &["A", "Z"]));
        let check = validate_contender_space(&roots, &compositional(2), Vec::new());
        assert!(check.failures.iter().any(|f| f.contains("\"Z\"")));
    }
}
