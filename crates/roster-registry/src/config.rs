use std::time::Duration;

/// Tuning for eviction and self-preservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Largest share of the expected registry size, in percent, that may be
    /// evicted before self-preservation kicks in.
    pub eviction_allowed_percentage_drop: u8,
    /// How long a lapsed copy waits in the eviction queue before it becomes
    /// eligible, giving its contributor time to reconnect.
    pub eviction_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            eviction_allowed_percentage_drop: 20,
            eviction_timeout: Duration::from_secs(30),
        }
    }
}
