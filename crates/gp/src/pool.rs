use linfa::Float;
use ndarray::{Array, Dimension};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// A pool of scratch arrays keyed by their shape.
///
/// Arrays are checked out before a task and given back after it
/// so that concurrent tasks do not allocate one array per call.
#[derive(Debug, Default)]
pub(crate) struct ScratchPool<F: Float, D: Dimension> {
    free: Mutex<HashMap<D, Vec<Array<F, D>>>>,
}

impl<F: Float, D: Dimension + Hash> ScratchPool<F, D> {
    pub fn new() -> Self {
        ScratchPool {
            free: Mutex::new(HashMap::new()),
        }
    }

    /// Get an array of the given shape, its content is unspecified
    pub fn checkout(&self, shape: D) -> Array<F, D> {
        let reused = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.get_mut(&shape).and_then(|arrays| arrays.pop()));
        reused.unwrap_or_else(|| Array::zeros(shape))
    }

    /// Give an array back for later reuse
    pub fn give_back(&self, array: Array<F, D>) {
        if let Ok(mut free) = self.free.lock() {
            free.entry(array.raw_dim()).or_default().push(array);
        }
    }

    /// Drop pooled arrays of any other shape
    pub fn retain_shape(&self, shape: &D) {
        if let Ok(mut free) = self.free.lock() {
            free.retain(|key, _| key == shape);
        }
    }

    /// Drop all pooled arrays
    pub fn clear(&self) {
        if let Ok(mut free) = self.free.lock() {
            free.clear();
        }
    }

    #[cfg(test)]
    fn pooled(&self, shape: &D) -> usize {
        self.free
            .lock()
            .map(|free| free.get(shape).map_or(0, |arrays| arrays.len()))
            .unwrap_or(0)
    }
}
