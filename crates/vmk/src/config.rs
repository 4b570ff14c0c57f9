//! Runtime configuration.

use std::time::Duration;

use crate::error::{VmError, VmResult};

/// Stack size used for the main and idle threads unless configured.
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Name used in log output.
    pub name: String,
    /// Length of one scheduler tick in milliseconds.
    pub tick_ms: u32,
    /// Stack size requested for the idle thread.
    pub idle_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "vmk".to_string(),
            tick_ms: 10,
            idle_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl VmConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> VmConfigBuilder {
        VmConfigBuilder::default()
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(u64::from(self.tick_ms))
    }

    pub fn validate(&self) -> VmResult<()> {
        if self.tick_ms == 0 || self.idle_stack_size == 0 {
            return Err(VmError::InvalidParameter);
        }
        Ok(())
    }
}

/// Builder for [`VmConfig`].
#[derive(Debug, Clone, Default)]
pub struct VmConfigBuilder {
    config: VmConfig,
}

impl VmConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Sets the tick length. Zero is rejected by [`build`](Self::build).
    pub fn tick_ms(mut self, tick_ms: u32) -> Self {
        self.config.tick_ms = tick_ms;
        self
    }

    pub fn idle_stack_size(mut self, size: usize) -> Self {
        self.config.idle_stack_size = size;
        self
    }

    pub fn build(self) -> VmResult<VmConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = VmConfig::default();
        assert_eq!(config.tick_ms, 10);
        assert_eq!(config.idle_stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.tick_period(), Duration::from_millis(10));
    }

    #[test]
    fn builder_overrides() {
        let config = VmConfig::builder()
            .name("demo")
            .tick_ms(25)
            .idle_stack_size(0x2000)
            .build()
            .unwrap();
        assert_eq!(config.name, "demo");
        assert_eq!(config.tick_period(), Duration::from_millis(25));
        assert_eq!(config.idle_stack_size, 0x2000);
    }

    #[test]
    fn zero_tick_is_rejected() {
        assert_eq!(
            VmConfig::builder().tick_ms(0).build(),
            Err(VmError::InvalidParameter)
        );
    }
}
