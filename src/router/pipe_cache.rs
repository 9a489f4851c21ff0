//! Per-pipe resource cache.
//!
//! Every router keeps its backend-native per-pipe handles (producers,
//! channels, links, delivery tasks) in a `PipeCache`. Creation happens under
//! the cache lock, so two concurrent first uses of a pipe never open two
//! handles.

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::Mutex;

use crate::{PipeError, Result};

pub(crate) struct PipeCache<H> {
    handles: Mutex<HashMap<String, H>>,
}

impl<H> PipeCache<H> {
    // ---
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub async fn contains(&self, pipe: &str) -> bool {
        self.handles.lock().await.contains_key(pipe)
    }

    /// Cached handle of `pipe`, created with `create` on first use.
    ///
    /// A failed creation caches nothing.
    pub async fn get_or_try_insert_with<F, Fut>(&self, pipe: &str, create: F) -> Result<H>
    where
        H: Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H>>,
    {
        // ---
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(pipe) {
            return Ok(handle.clone());
        }

        let handle = create().await?;
        handles.insert(pipe.to_string(), handle.clone());
        Ok(handle)
    }

    /// Create and cache the handle of a pipe that has none.
    ///
    /// # Errors
    ///
    /// [`PipeError::AlreadyAccepted`] if `pipe` already has a handle, or
    /// whatever `create` fails with.
    pub async fn insert_with<F, Fut>(&self, pipe: &str, create: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H>>,
    {
        // ---
        let mut handles = self.handles.lock().await;
        if handles.contains_key(pipe) {
            return Err(PipeError::AlreadyAccepted(pipe.to_string()));
        }

        let handle = create().await?;
        handles.insert(pipe.to_string(), handle);
        Ok(())
    }

    pub async fn remove(&self, pipe: &str) -> Option<H> {
        self.handles.lock().await.remove(pipe)
    }

    /// Remove the handle of `pipe` if it is still the one `is_failed` rejects,
    /// so the next use opens a fresh one. A handle already replaced by a
    /// concurrent caller is left alone.
    pub async fn evict<F>(&self, pipe: &str, is_failed: F) -> Option<H>
    where
        F: FnOnce(&H) -> bool,
    {
        // ---
        let mut handles = self.handles.lock().await;
        match handles.get(pipe) {
            Some(handle) if is_failed(handle) => handles.remove(pipe),
            _ => None,
        }
    }

    /// Take every cached handle, leaving the cache empty.
    pub async fn drain(&self) -> Vec<(String, H)> {
        self.handles.lock().await.drain().collect()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    #[cfg(test)]
    pub async fn pipes(&self) -> Vec<String> {
        self.handles.lock().await.keys().cloned().collect()
    }
}

impl<H> Default for PipeCache<H> {
    fn default() -> Self {
        Self::new()
    }
}
