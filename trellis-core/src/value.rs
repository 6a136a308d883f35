use serde::{de::DeserializeOwned, Serialize};

use crate::TrellisError;

pub type Value = serde_json::Value;

/// Marker for types that can flow between nodes. Values are erased to
/// [`Value`] at node boundaries, so anything serde can round-trip qualifies.
pub trait NodeValue: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> NodeValue for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

pub trait IntoValue {
    fn into_value(self) -> Result<Value, TrellisError>;
}

pub trait TryFromValue: Sized {
    fn try_from_value(value: Value) -> Result<Self, TrellisError>;
}

impl<T> IntoValue for T
where
    T: Serialize,
{
    fn into_value(self) -> Result<Value, TrellisError> {
        Ok(serde_json::to_value(self)?)
    }
}

impl<T> TryFromValue for T
where
    T: DeserializeOwned,
{
    fn try_from_value(value: Value) -> Result<Self, TrellisError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Stable-enough name of a value type, recorded next to persisted inputs.
pub fn type_name_of<T: ?Sized>() -> &'static str {
    std::any::type_name::<T>()
}
