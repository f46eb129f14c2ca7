use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;

/// Hands out short alphanumeric agent ids and remembers which are
/// taken, so a connecting client can never collide with a live client
/// or an application-named team.
#[derive(Debug)]
pub struct IdAllocator {
    taken: HashSet<String>,
    length: usize,
}

impl IdAllocator {
    pub fn new(length: usize) -> Self {
        IdAllocator {
            taken: HashSet::new(),
            length,
        }
    }

    /// Draws a fresh random id. Re-draws on collision, which for the
    /// default length is vanishingly rare even with thousands of agents.
    pub fn allocate(&mut self) -> String {
        loop {
            let candidate: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(self.length)
                .map(char::from)
                .collect();
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// Reserves an explicit name (teams pick their own). False when the
    /// name is already held.
    pub fn claim(&mut self, id: &str) -> bool {
        self.taken.insert(id.to_string())
    }

    pub fn release(&mut self, id: &str) {
        self.taken.remove(id);
    }

    pub fn is_taken(&self, id: &str) -> bool {
        self.taken.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_unique() {
        let mut ids = IdAllocator::new(8);
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let id = ids.allocate();
            assert_eq!(id.len(), 8);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn claim_blocks_duplicates_until_release() {
        let mut ids = IdAllocator::new(8);
        assert!(ids.claim("lobby"));
        assert!(!ids.claim("lobby"));
        ids.release("lobby");
        assert!(ids.claim("lobby"));
    }

    #[test]
    fn random_ids_avoid_claimed_names() {
        // With length 1 the space is only 62 ids; claim most of it and
        // the allocator must still find the free ones.
        let mut ids = IdAllocator::new(1);
        let mut reserved = 0;
        for c in ('a'..='z').chain('A'..='Z').chain('0'..='9') {
            if reserved < 60 && ids.claim(&c.to_string()) {
                reserved += 1;
            }
        }
        let got = ids.allocate();
        assert_eq!(got.len(), 1);
    }
}
