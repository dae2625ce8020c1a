use crate::firestore::core::types::TargetId;

/// Hands out target ids. The target cache uses even ids, the sync engine
/// odd ids for limbo resolution targets, so the two never collide.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// Even ids starting at 2, continuing after `highest_target_id`.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        let mut last_id = highest_target_id.max(0);
        if last_id % 2 != 0 {
            last_id -= 1;
        }
        Self { last_id }
    }

    /// Odd ids starting at 1.
    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next_id(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_and_sync_engine_ids_do_not_collide() {
        let mut cache = TargetIdGenerator::for_target_cache(0);
        let mut engine = TargetIdGenerator::for_sync_engine();
        assert_eq!(cache.next_id(), 2);
        assert_eq!(cache.next_id(), 4);
        assert_eq!(engine.next_id(), 1);
        assert_eq!(engine.next_id(), 3);
    }

    #[test]
    fn cache_generator_resumes_after_highest_id() {
        let mut cache = TargetIdGenerator::for_target_cache(8);
        assert_eq!(cache.next_id(), 10);
        let mut odd_seed = TargetIdGenerator::for_target_cache(7);
        assert_eq!(odd_seed.next_id(), 8);
    }
}
