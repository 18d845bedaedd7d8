//! Server configuration.

/// Configuration for the sync server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Maximum number of records returned by one pull.
    pub max_pull_batch: u32,
    /// Maximum number of records accepted in one push.
    pub max_push_batch: u32,
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_pull_batch: 100,
            max_push_batch: 1000,
        }
    }

    /// Sets the maximum pull batch size.
    pub fn with_max_pull_batch(mut self, size: u32) -> Self {
        self.max_pull_batch = size;
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: u32) -> Self {
        self.max_push_batch = size;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_pull_batch, 100);
        assert_eq!(config.max_push_batch, 1000);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_pull_batch(10)
            .with_max_push_batch(20);
        assert_eq!(config.max_pull_batch, 10);
        assert_eq!(config.max_push_batch, 20);
    }
}
