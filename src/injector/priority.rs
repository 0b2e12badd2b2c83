use std::sync::Mutex;

/// Lowest priority tc picks itself when a filter is added without an
/// explicit pref; allocation starts from there in both directions.
const TC_FILTER_PRIORITY: u32 = 49149;

struct Counters {
    disruption: u32,
    safeguard: u32,
}

/// Hands out unique kernel filter priorities. Disruption filters grow upward
/// from the base, safeguard filters downward, so a safeguard always carries
/// a numerically lower priority and is matched first. Reconcilers allocate
/// concurrently, hence the mutex.
pub struct PriorityAllocator {
    counters: Mutex<Counters>,
}

impl PriorityAllocator {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters {
                disruption: TC_FILTER_PRIORITY,
                safeguard: TC_FILTER_PRIORITY,
            }),
        }
    }

    /// Next priority for a disruption filter: 49150, 49151, ...
    pub fn next(&self) -> u32 {
        let mut counters = self.lock();
        counters.disruption += 1;
        counters.disruption
    }

    /// Next priority for a safeguard or allowed-host filter: 49148, 49147, ...
    pub fn next_safeguard(&self) -> u32 {
        let mut counters = self.lock();
        counters.safeguard -= 1;
        counters.safeguard
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for PriorityAllocator {
    fn default() -> Self {
        Self::new()
    }
}
