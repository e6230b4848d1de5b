//! Exclusive named-resource locks shared by every node of a run.
//!
//! All grant decisions go through one mutex so a node receives either its
//! whole resource set or nothing. Requests are sorted before evaluation.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockConflict {
    pub node_id: String,
    pub resource: String,
    pub holder: String,
}

#[derive(Debug, Default)]
pub struct ResourceArbiter {
    holders: Mutex<BTreeMap<String, String>>,
    released: Notify,
}

impl ResourceArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants every resource in `resources` to `node_id`, or none of them.
    /// A resource already held, even by `node_id` itself, is a conflict.
    pub fn try_acquire(&self, node_id: &str, resources: &[String]) -> Result<(), LockConflict> {
        if resources.is_empty() {
            return Ok(());
        }
        let mut requested: Vec<&String> = resources.iter().collect();
        requested.sort();
        requested.dedup();

        let mut holders = self.lock_holders();
        for resource in &requested {
            if let Some(holder) = holders.get(resource.as_str()) {
                debug!(
                    node_id,
                    resource = resource.as_str(),
                    holder = holder.as_str(),
                    "resource lock contended"
                );
                return Err(LockConflict {
                    node_id: node_id.to_string(),
                    resource: resource.to_string(),
                    holder: holder.clone(),
                });
            }
        }
        for resource in requested {
            holders.insert(resource.clone(), node_id.to_string());
        }
        debug!(node_id, count = resources.len(), "resource locks granted");
        Ok(())
    }

    /// Releases every resource held by `node_id` and returns their names.
    pub fn release(&self, node_id: &str) -> Vec<String> {
        let released: Vec<String> = {
            let mut holders = self.lock_holders();
            let names: Vec<String> = holders
                .iter()
                .filter(|(_, holder)| holder.as_str() == node_id)
                .map(|(resource, _)| resource.clone())
                .collect();
            for name in &names {
                holders.remove(name);
            }
            names
        };
        if !released.is_empty() {
            self.released.notify_waiters();
        }
        released
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock_holders().clone()
    }

    /// Resolves the next time any lock is released.
    pub async fn released(&self) {
        self.released.notified().await;
    }

    fn lock_holders(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        // A poisoned map is still consistent: every mutation is a single insert/remove.
        self.holders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
