use std::{sync::Arc, time::Instant};

use dashmap::DashMap;

use crate::remoting::ResponseFuture;

/// Correlation table: opaque → in-flight request.
///
/// Removal is the claim on an entry. Only the caller that removed a future may drive its
/// terminal transition, so a response and a timeout can never both act on the same entry.
#[derive(Debug, Default)]
pub struct ResponseTable {
    entries: DashMap<i32, Arc<ResponseFuture>>,
}

impl ResponseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, future: Arc<ResponseFuture>) {
        self.entries.insert(future.opaque(), future);
    }

    pub fn remove(&self, opaque: i32) -> Option<Arc<ResponseFuture>> {
        self.entries.remove(&opaque).map(|(_, future)| future)
    }

    pub fn get(&self, opaque: i32) -> Option<Arc<ResponseFuture>> {
        self.entries.get(&opaque).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opaques of entries older than their timeout. Holds no lock once it returns.
    pub fn expired(&self, now: Instant) -> Vec<i32> {
        self.entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<Arc<ResponseFuture>> {
        let opaques: Vec<i32> = self.entries.iter().map(|entry| *entry.key()).collect();
        opaques
            .into_iter()
            .filter_map(|opaque| self.remove(opaque))
            .collect()
    }
}
