//! Pairwise MECE certificate.
//!
//! Key validation is a configuration check raised before any credit; the
//! certificate check itself is a gate whose failure ends the session with
//! zero credits spent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::canonical::{pair_key, split_pair_key};
use crate::core::config::MeceCertificate;
use crate::core::errors::{AbxError, Result};
use crate::gates::GateStatus;

/// Why one pair failed the certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum MeceFailure {
    MissingPair { pair: String },
    MissingDiscriminator { pair: String },
    OverlapExceeded { pair: String, overlap: f64, max: f64 },
}

/// Result of checking a certificate against the named roots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeceCheck {
    pub status: GateStatus,
    pub pairs_checked: usize,
    pub max_pair_overlap: f64,
    pub failures: Vec<MeceFailure>,
}

/// Reject keys that are not `a|b` of two distinct known roots, and
/// overlaps that are negative or non-finite.
pub fn validate_certificate_keys(
    certificate: &MeceCertificate,
    roots: &BTreeSet<String>,
) -> Result<()> {
    for (key, entry) in certificate {
        let malformed = |details: String| AbxError::MalformedCertificate {
            key: key.clone(),
            details,
        };
        let (left, right) =
            split_pair_key(key).ok_or_else(|| malformed("expected `a|b`".to_string()))?;
        if left == right {
            return Err(malformed("pair members must differ".to_string()));
        }
        for member in [left, right] {
            if !roots.contains(member) {
                return Err(malformed(format!("unknown root {member:?}")));
            }
        }
        if !entry.overlap.is_finite() || entry.overlap < 0.0 {
            return Err(malformed(format!(
                "overlap {} must be finite and >= 0",
                entry.overlap
            )));
        }
    }
    Ok(())
}

/// Check every unordered pair of `roots` against the certificate.
#[must_use]
pub fn check_certificate(
    certificate: &MeceCertificate,
    roots: &[String],
    max_pair_overlap: f64,
) -> MeceCheck {
    let normalized: std::collections::BTreeMap<String, _> = certificate
        .iter()
        .filter_map(|(key, entry)| {
            split_pair_key(key).map(|(left, right)| (pair_key(left, right), entry))
        })
        .collect();

    let mut failures = Vec::new();
    let mut pairs_checked = 0;
    for (idx, left) in roots.iter().enumerate() {
        for right in &roots[idx + 1..] {
            pairs_checked += 1;
            let pair = pair_key(left, right);
            let Some(entry) = normalized.get(&pair) else {
                failures.push(MeceFailure::MissingPair { pair });
                continue;
            };
            if entry.discriminator.trim().is_empty() {
                failures.push(MeceFailure::MissingDiscriminator { pair: pair.clone() });
            }
            if entry.overlap > max_pair_overlap {
                failures.push(MeceFailure::OverlapExceeded {
                    pair,
                    overlap: entry.overlap,
                    max: max_pair_overlap,
                });
            }
        }
    }

    MeceCheck {
        status: GateStatus::from_pass(failures.is_empty()),
        pairs_checked,
        max_pair_overlap,
        failures,
    }
}
