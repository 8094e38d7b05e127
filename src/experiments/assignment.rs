use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Outside the traffic percentage; shown the default output.
    Excluded,
    Variant(usize),
}

impl Assignment {
    pub fn variant(&self) -> Option<usize> {
        match self {
            Assignment::Excluded => None,
            Assignment::Variant(i) => Some(*i),
        }
    }
}

/// Deterministic bucketing of a visitor into a test on one subject.
///
/// The same visitor always lands in the same bucket for a given
/// `(test_id, subject_id)`. Roughly `traffic_percentage`% of visitors are
/// included and spread evenly over the variants.
pub fn assign_variant(
    test_id: &str,
    subject_id: u64,
    visitor_key: &str,
    traffic_percentage: u8,
    variant_count: usize,
) -> Assignment {
    if variant_count == 0 || traffic_percentage == 0 {
        return Assignment::Excluded;
    }

    let key = format!("{}:{}:{}", test_id, subject_id, visitor_key);
    let digest = Sha256::digest(key.as_bytes());
    let mut inclusion = [0u8; 8];
    let mut choice = [0u8; 8];
    inclusion.copy_from_slice(&digest[..8]);
    choice.copy_from_slice(&digest[8..16]);

    let bucket = u64::from_le_bytes(inclusion) % 10_000;
    if bucket >= u64::from(traffic_percentage.min(100)) * 100 {
        return Assignment::Excluded;
    }
    Assignment::Variant((u64::from_le_bytes(choice) % variant_count as u64) as usize)
}
