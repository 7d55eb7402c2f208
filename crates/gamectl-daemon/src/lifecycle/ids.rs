//! Server ids and admin secrets.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use rand::RngExt;

const ID_PREFIX: &str = "palworld";
/// Suffix values before the sequence wraps.
const SEQUENCE_SPAN: u32 = 100;
pub const SECRET_LEN: usize = 24;

/// Generates `palworld-YYYYMMDD-HHMMSS-NN` ids.
///
/// The two-digit suffix is a process-wide sequence, so servers created in
/// the same second still get distinct ids. Callers check for an existing
/// record and ask again on collision (e.g. after a restart).
#[derive(Debug, Default)]
pub struct IdGenerator {
    sequence: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self, now: DateTime<Utc>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) % SEQUENCE_SPAN;
        format!("{ID_PREFIX}-{}-{seq:02}", now.format("%Y%m%d-%H%M%S"))
    }
}

/// Random alphanumeric admin secret.
pub fn generate_secret() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..SECRET_LEN)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn same_second_ids_differ() {
        let ids = IdGenerator::new();
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let first = ids.next_id(now);
        let second = ids.next_id(now);
        assert_eq!(first, "palworld-20250304-050607-00");
        assert_eq!(second, "palworld-20250304-050607-01");
    }

    #[test]
    fn secrets_are_alphanumeric_and_distinct() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), SECRET_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
