//! In-memory module state mirror.
//!
//! `OutputState` holds the raw 12-byte vector for one module; `StateCache`
//! maps module address to `OutputState`. The engine only ever has one task
//! (Listener or Scheduler completion path) mutate a given module's state at
//! a time, so a `tokio::sync::RwLock` around the whole map gives the same
//! observed behaviour as a lock-free single-writer discipline without
//! unsafe code: reads never block on other reads, and the single-threaded
//! cooperative scheduler means a writer never actually contends with a
//! concurrent writer.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::{NikobusError, Result};
use crate::types::{Group, ModuleAddress};

/// Per-module 12-byte output vector. `state[i]` describes channel `i+1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputState {
    bytes: [u8; 12],
}

impl OutputState {
    pub fn new() -> Self {
        Self { bytes: [0u8; 12] }
    }

    /// Read channel `channel` (1-indexed).
    pub fn get(&self, channel: u8) -> u8 {
        self.bytes[(channel - 1) as usize]
    }

    /// Write channel `channel` (1-indexed).
    pub fn set(&mut self, channel: u8, value: u8) {
        self.bytes[(channel - 1) as usize] = value;
    }

    /// The 6 bytes making up one group, in wire order.
    pub fn group_bytes(&self, group: Group) -> [u8; 6] {
        let offset = group.byte_offset();
        let mut out = [0u8; 6];
        out.copy_from_slice(&self.bytes[offset..offset + 6]);
        out
    }

    /// Overwrite one group's 6 bytes in place.
    pub fn set_group(&mut self, group: Group, data: &[u8; 6]) {
        let offset = group.byte_offset();
        self.bytes[offset..offset + 6].copy_from_slice(data);
    }
}

impl Default for OutputState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, many-reader/single-writer map from module address to its last
/// known `OutputState`.
pub struct StateCache {
    modules: RwLock<HashMap<ModuleAddress, OutputState>>,
}

impl StateCache {
    /// Seed the cache with every module known to config, all channels off.
    pub fn new(known: impl IntoIterator<Item = ModuleAddress>) -> Self {
        let modules = known.into_iter().map(|a| (a, OutputState::new())).collect();
        Self {
            modules: RwLock::new(modules),
        }
    }

    pub async fn get(&self, module: ModuleAddress, channel: u8) -> Result<u8> {
        let map = self.modules.read().await;
        map.get(&module)
            .map(|s| s.get(channel))
            .ok_or(NikobusError::UnknownModule(module))
    }

    pub async fn group_bytes(&self, module: ModuleAddress, group: Group) -> Result<[u8; 6]> {
        let map = self.modules.read().await;
        map.get(&module)
            .map(|s| s.group_bytes(group))
            .ok_or(NikobusError::UnknownModule(module))
    }

    /// Optimistic write applied by the API facade *before* the frame is
    /// sent — gives the host an immediately consistent view.
    pub async fn apply_write(&self, module: ModuleAddress, channel: u8, value: u8) -> Result<()> {
        let mut map = self.modules.write().await;
        let state = map.get_mut(&module).ok_or(NikobusError::UnknownModule(module))?;
        state.set(channel, value);
        Ok(())
    }

    /// Apply a feedback-answer or read-answer's group bytes.
    pub async fn apply_feedback(
        &self,
        module: ModuleAddress,
        group: Group,
        data: &[u8; 6],
    ) -> Result<()> {
        let mut map = self.modules.write().await;
        let state = map.get_mut(&module).ok_or(NikobusError::UnknownModule(module))?;
        state.set_group(group, data);
        Ok(())
    }

    pub async fn known_modules(&self) -> Vec<ModuleAddress> {
        self.modules.read().await.keys().copied().collect()
    }

    pub async fn contains(&self, module: ModuleAddress) -> bool {
        self.modules.read().await.contains_key(&module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ModuleAddress {
        ModuleAddress::parse(s).unwrap()
    }

    #[test]
    fn output_state_channel_indexing_is_one_based() {
        let mut s = OutputState::new();
        s.set(1, 0xFF);
        s.set(12, 0x80);
        assert_eq!(s.get(1), 0xFF);
        assert_eq!(s.get(12), 0x80);
        assert_eq!(s.get(2), 0x00);
    }

    #[test]
    fn group_bytes_split_at_six() {
        let mut s = OutputState::new();
        for ch in 1..=12u8 {
            s.set(ch, ch);
        }
        assert_eq!(s.group_bytes(Group::One), [1, 2, 3, 4, 5, 6]);
        assert_eq!(s.group_bytes(Group::Two), [7, 8, 9, 10, 11, 12]);
    }

    #[tokio::test]
    async fn apply_write_then_get_round_trips() {
        let cache = StateCache::new([addr("4707")]);
        cache.apply_write(addr("4707"), 1, 0xFF).await.unwrap();
        assert_eq!(cache.get(addr("4707"), 1).await.unwrap(), 0xFF);
    }

    #[tokio::test]
    async fn get_unknown_module_errors() {
        let cache = StateCache::new([]);
        assert!(matches!(
            cache.get(addr("0000"), 1).await,
            Err(NikobusError::UnknownModule(_))
        ));
    }

    #[tokio::test]
    async fn apply_feedback_writes_only_its_group() {
        let cache = StateCache::new([addr("4707")]);
        cache.apply_write(addr("4707"), 1, 0xAA).await.unwrap();
        cache
            .apply_feedback(addr("4707"), Group::Two, &[1, 2, 3, 4, 5, 6])
            .await
            .unwrap();
        assert_eq!(cache.get(addr("4707"), 1).await.unwrap(), 0xAA);
        assert_eq!(cache.get(addr("4707"), 7).await.unwrap(), 1);
    }
}
