/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}

/// Lifecycle counters of the project environment cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentStats {
    pub builds: u64,
    pub reuses: u64,
    pub releases: u64,
    pub release_failures: u64,
    pub live: usize,
}
