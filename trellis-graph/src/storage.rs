use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;

/// Typed name for a value kept in [`AgentStorage`].
///
/// ```rust
/// use trellis_graph::{AgentStorage, StorageKey};
///
/// const ATTEMPTS: StorageKey<u32> = StorageKey::new("attempts");
///
/// let mut storage = AgentStorage::default();
/// storage.set_typed(&ATTEMPTS, 2);
/// assert_eq!(storage.get_typed(&ATTEMPTS), Some(&2));
/// ```
pub struct StorageKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StorageKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StorageKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StorageKey<T> {}

/// Per-run scratch space for nodes. Not part of checkpoints.
#[derive(Default)]
pub struct AgentStorage {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for AgentStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

impl AgentStorage {
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Returns `None` when the key is missing or holds another type.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values
            .get_mut(key)
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove(&mut self, key: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn set_typed<T: Any + Send + Sync>(&mut self, key: &StorageKey<T>, value: T) {
        self.set(key.name, value);
    }

    pub fn get_typed<T: Any>(&self, key: &StorageKey<T>) -> Option<&T> {
        self.get(key.name)
    }

    pub fn get_typed_mut<T: Any>(&mut self, key: &StorageKey<T>) -> Option<&mut T> {
        self.get_mut(key.name)
    }

    pub fn remove_typed<T: Any>(&mut self, key: &StorageKey<T>) -> Option<T> {
        let value = self.values.remove(key.name)?;
        match value.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(value) => {
                self.values.insert(key.name.to_string(), value);
                None
            }
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}
