//! Runtime configuration for worlds and the shared metadata.

use crate::error::{EcsError, Result};

/// Byte width of entity ids stored inside chunks.
///
/// Smaller widths pack more entities per chunk but cap the highest entity id
/// at `2^(8 * width) - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityIdWidth {
    One,
    Two,
    Four,
}

impl EntityIdWidth {
    /// Width in bytes.
    pub const fn bytes(self) -> u32 {
        match self {
            EntityIdWidth::One => 1,
            EntityIdWidth::Two => 2,
            EntityIdWidth::Four => 4,
        }
    }

    /// Highest entity id representable at this width.
    pub const fn max_entity_id(self) -> u32 {
        match self {
            EntityIdWidth::One => u8::MAX as u32 - 1,
            EntityIdWidth::Two => u16::MAX as u32 - 1,
            EntityIdWidth::Four => u32::MAX - 1,
        }
    }
}

/// ECS configuration
///
/// `chunk_size` trades per-chunk allocation overhead against wasted tail
/// space; 4 KiB to 64 KiB are the recommended range.
#[derive(Debug, Clone)]
pub struct EcsConfig {
    /// Fixed chunk size in bytes. Must be a power of two.
    pub chunk_size: u32,
    /// Upper bound on archetype ids the shared metadata will hand out.
    pub max_archetypes: u32,
    /// Upper bound on chunk slots the allocator will create.
    pub max_chunks: u32,
    /// Byte width of entity ids inside chunks.
    pub entity_id_width: EntityIdWidth,
    /// Directory capacity reserved up front.
    pub initial_entity_capacity: u32,
    /// Chunk slots reserved up front.
    pub initial_chunk_capacity: u32,
    /// Upper bound on distinct interned query predicates.
    pub max_queries: u32,
}

impl Default for EcsConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            max_archetypes: 4096,
            max_chunks: 65_536,
            entity_id_width: EntityIdWidth::Four,
            initial_entity_capacity: 1024,
            initial_chunk_capacity: 64,
            max_queries: 1024,
        }
    }
}

impl EcsConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.chunk_size.is_power_of_two() {
            return Err(EcsError::InvalidConfig(format!(
                "chunk_size must be a power of two, got {}",
                self.chunk_size
            )));
        }
        if self.chunk_size < 256 {
            return Err(EcsError::InvalidConfig(format!(
                "chunk_size must be at least 256 bytes, got {}",
                self.chunk_size
            )));
        }
        if self.max_archetypes == 0 {
            return Err(EcsError::InvalidConfig(
                "max_archetypes must be non-zero".to_string(),
            ));
        }
        if self.max_chunks == 0 {
            return Err(EcsError::InvalidConfig(
                "max_chunks must be non-zero".to_string(),
            ));
        }
        if self.max_queries == 0 {
            return Err(EcsError::InvalidConfig(
                "max_queries must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Highest entity id spawnable under this configuration.
    pub fn max_entity_id(&self) -> u32 {
        self.entity_id_width.max_entity_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EcsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_power_of_two_chunk() {
        let cfg = EcsConfig {
            chunk_size: 5000,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(EcsError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_tiny_chunk() {
        let cfg = EcsConfig {
            chunk_size: 128,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_id_width_limits() {
        assert_eq!(EntityIdWidth::One.max_entity_id(), 254);
        assert_eq!(EntityIdWidth::Two.max_entity_id(), 65_534);
        assert_eq!(EntityIdWidth::Four.bytes(), 4);
    }
}
