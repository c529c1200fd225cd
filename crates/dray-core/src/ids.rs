/// Opaque identifier generation.
///
/// IDs are prefixed v4 UUIDs. The prefix makes log lines and API payloads
/// self-describing; nothing parses the suffix.

use uuid::Uuid;

pub fn job_id() -> String {
    format!("job-{}", Uuid::new_v4())
}

pub fn lease_id() -> String {
    format!("lease-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let j = job_id();
            let l = lease_id();
            assert!(j.starts_with("job-"));
            assert!(l.starts_with("lease-"));
            assert!(seen.insert(j));
            assert!(seen.insert(l));
        }
    }
}
