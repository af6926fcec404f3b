//! Type resolution for stored entries
//!
//! Every entry records the name of the concrete type it was written as. On
//! read that name is looked up here to find a decoder. The embedding
//! application registers the names it knows when it opens a store.

use std::fmt;

use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// A value that can live in a `JsonStorage`.
///
/// `type_name` is written next to the payload and must be resolvable by the
/// store's `TypeRegistry` (directly or after migration) for the value to be
/// read back. Enums whose variants wrap different payload types return a
/// different name per variant.
pub trait Storable: Serialize + DeserializeOwned {
    fn type_name(&self) -> &str;
}

type Decoder<T> = Box<dyn Fn(Value) -> Result<T, serde_json::Error> + Send + Sync>;

/// Maps stored type names to decoders producing `T`.
pub struct TypeRegistry<T> {
    decoders: HashMap<String, Decoder<T>>,
}

impl<T: 'static> TypeRegistry<T> {
    pub fn new() -> Self {
        Self { decoders: HashMap::new() }
    }

    /// Decode entries named `name` as `U`, then convert into `T`.
    pub fn register<U>(self, name: impl Into<String>) -> Self
    where
        U: DeserializeOwned + Into<T> + 'static,
    {
        self.register_fn(name, |value| serde_json::from_value::<U>(value).map(Into::into))
    }

    /// Decode entries named `name` directly as `T`.
    pub fn with_self(self, name: impl Into<String>) -> Self
    where
        T: DeserializeOwned,
    {
        self.register_fn(name, serde_json::from_value::<T>)
    }

    /// Register a hand-written decoder.
    pub fn register_fn<F>(mut self, name: impl Into<String>, decode: F) -> Self
    where
        F: Fn(Value) -> Result<T, serde_json::Error> + Send + Sync + 'static,
    {
        self.decoders.insert(name.into(), Box::new(decode));
        self
    }
}

impl<T> TypeRegistry<T> {
    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode `value` as the type registered under `type_name`.
    pub fn decode(&self, type_name: &str, value: Value) -> StoreResult<T> {
        let decoder = self.decoders.get(type_name).ok_or_else(|| StoreError::UnresolvableType {
            type_name: type_name.to_string(),
        })?;
        decoder(value).map_err(|e| StoreError::Deserialization {
            type_name: type_name.to_string(),
            reason: e.to_string(),
        })
    }
}

impl<T: 'static> Default for TypeRegistry<T> {
    fn default() -> Self { Self::new() }
}

impl<T> fmt::Debug for TypeRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TypeRegistry").field("types", &names).finish()
    }
}
