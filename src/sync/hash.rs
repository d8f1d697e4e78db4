//! Content fingerprints for sync operations.
//!
//! This module provides SHA256-based fingerprints of a snapshot's
//! comparable fields. When base, local and remote fingerprints agree the
//! field-by-field comparison can be skipped.

use sha2::{Digest, Sha256};

use crate::model::{Field, NormalizedSnapshot};

/// Compute a SHA256 fingerprint of a snapshot's comparable fields.
///
/// The id and `updated_at` are excluded: two snapshots with the same field
/// values fingerprint identically regardless of which side they came from.
#[must_use]
pub fn fingerprint(snapshot: &NormalizedSnapshot) -> String {
    let mut hasher = Sha256::new();
    for field in Field::ALL {
        hasher.update(field.as_str().as_bytes());
        hasher.update(b"=");
        hasher.update(snapshot.get(field).to_json().to_string().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
