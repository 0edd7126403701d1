//! Per-connection state owned on behalf of handlers.
//!
//! Codecs are shared by every connection, so anything they need to
//! remember about one peer lives here, keyed by the handler's position in
//! the pipeline and the state's type. The table is cleared right after
//! the connection's disconnect event.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::WeftError;

type Slot = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct Attachments {
    slots: Mutex<HashMap<(usize, TypeId), Slot>>,
}

impl Attachments {
    /// Fetch the state of type `T` for handler `index`, creating it with
    /// `init` on first use.
    pub fn get_or_try_insert<T, F>(&self, index: usize, init: F) -> Result<Arc<Mutex<T>>, WeftError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, WeftError>,
    {
        let key = (index, TypeId::of::<T>());
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(&key) {
            if let Ok(state) = Arc::clone(slot).downcast::<Mutex<T>>() {
                return Ok(state);
            }
        }
        let state = Arc::new(Mutex::new(init()?));
        slots.insert(key, state.clone() as Slot);
        Ok(state)
    }

    /// Fetch existing state without creating it.
    pub fn get<T: Send + 'static>(&self, index: usize) -> Option<Arc<Mutex<T>>> {
        let slots = self.slots.lock();
        let slot = slots.get(&(index, TypeId::of::<T>()))?;
        Arc::clone(slot).downcast::<Mutex<T>>().ok()
    }

    pub fn remove<T: Send + 'static>(&self, index: usize) -> Option<Arc<Mutex<T>>> {
        let slot = self.slots.lock().remove(&(index, TypeId::of::<T>()))?;
        slot.downcast::<Mutex<T>>().ok()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

impl std::fmt::Debug for Attachments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachments").field("len", &self.len()).finish()
    }
}
