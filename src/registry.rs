use std::sync::Arc;

use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::source::{source_available, Source, SOURCE_LISTENERS_SYNC};

/// How many fallback links a lookup or admission walk may follow.
pub const MAX_FALLBACK_DEPTH: usize = 10;

/// Process-wide mount name to source map, ordered by name.
pub struct MountRegistry {
    tree: RwLock<BTreeMap<String, Arc<Source>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
        }
    }

    /// Claim `mount` for a new producer. When the mount is taken,
    /// `return_existing` hands the existing source back (the hijack
    /// path) unless its listeners are mid-migration, in which case a
    /// new producer must not touch it.
    pub fn reserve(&self, mount: &str, return_existing: bool) -> Option<Arc<Source>> {
        let mut tree = self.tree.write();
        if let Some(existing) = tree.get(mount) {
            if !return_existing {
                return None;
            }
            if existing.inner.lock().flags & SOURCE_LISTENERS_SYNC != 0 {
                return None;
            }
            return Some(existing.clone());
        }
        let source = Source::new(mount);
        tree.insert(mount.to_string(), source.clone());
        Some(source)
    }

    /// Direct lookup, no fallback walking.
    pub fn find_raw(&self, mount: &str) -> Option<Arc<Source>> {
        self.tree.read().get(mount).cloned()
    }

    /// Find a live source for `mount`, walking the configured fallback
    /// chain past dead or absent mounts.
    pub fn find_with_fallback(&self, config: &Config, mount: &str) -> Option<Arc<Source>> {
        let mut current = mount.to_string();
        for _ in 0..MAX_FALLBACK_DEPTH {
            if let Some(source) = self.find_raw(&current) {
                if source_available(&source.inner.lock()) {
                    return Some(source);
                }
            }
            match config.find_mount(&current).and_then(|m| m.fallback_mount.clone()) {
                Some(next) => current = next,
                None => break,
            }
        }
        None
    }

    pub fn remove(&self, mount: &str) -> Option<Arc<Source>> {
        self.tree.write().remove(mount)
    }

    pub fn mounts(&self) -> Vec<String> {
        self.tree.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientSignal;
    use crate::config::MountConfig;
    use crate::source::{ProducerRef, SOURCE_TERMINATING};

    fn give_producer(source: &Arc<Source>) {
        source.inner.lock().producer = Some(ProducerRef {
            signal: Arc::new(ClientSignal::default()),
            id: 1,
        });
    }

    #[test]
    fn reserve_is_exclusive() {
        let reg = MountRegistry::new();
        let first = reg.reserve("/live", false).unwrap();
        assert!(reg.reserve("/live", false).is_none());
        let again = reg.reserve("/live", true).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn reserve_refuses_mid_sync_source() {
        let reg = MountRegistry::new();
        let s = reg.reserve("/live", false).unwrap();
        s.inner.lock().flags |= SOURCE_LISTENERS_SYNC;
        assert!(reg.reserve("/live", true).is_none());
    }

    #[test]
    fn fallback_walk_skips_dead_mounts() {
        let mut cfg = Config::default();
        cfg.mounts.push(MountConfig {
            fallback_mount: Some("/backup".into()),
            ..MountConfig::named("/live")
        });
        let reg = MountRegistry::new();
        // /live exists but has no producer; /backup is live
        reg.reserve("/live", false).unwrap();
        let backup = reg.reserve("/backup", false).unwrap();
        give_producer(&backup);
        let found = reg.find_with_fallback(&cfg, "/live").unwrap();
        assert!(Arc::ptr_eq(&found, &backup));
    }

    #[test]
    fn fallback_walk_is_bounded() {
        // a chain that loops back on itself must terminate
        let mut cfg = Config::default();
        cfg.mounts.push(MountConfig {
            fallback_mount: Some("/b".into()),
            ..MountConfig::named("/a")
        });
        cfg.mounts.push(MountConfig {
            fallback_mount: Some("/a".into()),
            ..MountConfig::named("/b")
        });
        let reg = MountRegistry::new();
        assert!(reg.find_with_fallback(&cfg, "/a").is_none());
    }

    #[test]
    fn terminating_source_is_not_available() {
        let reg = MountRegistry::new();
        let s = reg.reserve("/live", false).unwrap();
        give_producer(&s);
        assert!(reg.find_with_fallback(&Config::default(), "/live").is_some());
        s.inner.lock().flags |= SOURCE_TERMINATING;
        assert!(reg.find_with_fallback(&Config::default(), "/live").is_none());
    }
}
