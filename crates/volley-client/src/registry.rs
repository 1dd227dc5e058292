//! Resource type registry
//!
//! Maps each entity type to its endpoints and to a factory for an empty
//! collection of that type. Built once at start-up and shared read-only
//! behind an `Arc`; nothing mutates it afterwards.

use std::any::TypeId;
use std::collections::HashMap;

use volley_common::{DynObject, RemoteObject};

use crate::ClientError;

/// A decoded page of items of one registered type
pub trait Collection: Send {
    /// Kind of the items
    fn kind(&self) -> &'static str;
    /// Replace the contents with the JSON array in `body`
    fn decode(&mut self, body: &[u8]) -> Result<(), serde_json::Error>;
    /// Number of items
    fn len(&self) -> usize;
    /// True when there are no items
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Items in list order, type-erased
    fn into_objects(self: Box<Self>) -> Vec<Box<dyn DynObject>>;
}

impl<T: RemoteObject> Collection for Vec<T> {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn decode(&mut self, body: &[u8]) -> Result<(), serde_json::Error> {
        *self = serde_json::from_slice(body)?;
        Ok(())
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn into_objects(self: Box<Self>) -> Vec<Box<dyn DynObject>> {
        self.into_iter()
            .map(|item| Box::new(item) as Box<dyn DynObject>)
            .collect()
    }
}

#[derive(Clone)]
struct Record {
    kind: &'static str,
    item_endpoint: String,
    collection_endpoint: String,
    new_collection: fn() -> Box<dyn Collection>,
}

fn empty_collection<T: RemoteObject>() -> Box<dyn Collection> {
    Box::new(Vec::<T>::new())
}

/// Entity type → endpoint table
#[derive(Clone, Default)]
pub struct Registry {
    records: HashMap<&'static str, Record>,
    kinds: HashMap<TypeId, &'static str>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` served at the collection endpoint `endpoint`
    ///
    /// Both `T` and `Vec<T>` resolve to the new record. The item endpoint is
    /// `endpoint/{name}`. Registering the same type twice replaces the record.
    pub fn register<T: RemoteObject>(&mut self, endpoint: &str) -> &mut Self {
        let collection_endpoint = endpoint.trim_end_matches('/').to_string();
        let record = Record {
            kind: T::KIND,
            item_endpoint: format!("{}/{{name}}", collection_endpoint),
            collection_endpoint,
            new_collection: empty_collection::<T>,
        };
        self.kinds.insert(TypeId::of::<T>(), T::KIND);
        self.kinds.insert(TypeId::of::<Vec<T>>(), T::KIND);
        self.records.insert(T::KIND, record);
        self
    }

    fn record_for<T: 'static>(&self) -> Result<&Record, ClientError> {
        self.kinds
            .get(&TypeId::of::<T>())
            .and_then(|kind| self.records.get(kind))
            .ok_or_else(|| ClientError::UnknownType(std::any::type_name::<T>().to_string()))
    }

    fn record_named(&self, kind: &str) -> Result<&Record, ClientError> {
        self.records
            .get(kind)
            .ok_or_else(|| ClientError::UnknownType(kind.to_string()))
    }

    /// Item endpoint template for `T` (contains `{name}`)
    pub fn item_endpoint<T: 'static>(&self) -> Result<&str, ClientError> {
        self.record_for::<T>().map(|r| r.item_endpoint.as_str())
    }

    /// Collection endpoint template for `T` or `Vec<T>`
    pub fn collection_endpoint<T: 'static>(&self) -> Result<&str, ClientError> {
        self.record_for::<T>().map(|r| r.collection_endpoint.as_str())
    }

    /// Collection endpoint template for a kind name
    pub fn collection_endpoint_of(&self, kind: &str) -> Result<&str, ClientError> {
        self.record_named(kind)
            .map(|r| r.collection_endpoint.as_str())
    }

    /// Fresh, empty collection for a registered kind
    pub fn new_collection(&self, kind: &str) -> Result<Box<dyn Collection>, ClientError> {
        self.record_named(kind).map(|r| (r.new_collection)())
    }

    /// Kind name registered for `T`
    pub fn kind_of<T: 'static>(&self) -> Result<&'static str, ClientError> {
        self.record_for::<T>().map(|r| r.kind)
    }

    /// Whether a kind name is registered
    pub fn contains(&self, kind: &str) -> bool {
        self.records.contains_key(kind)
    }
}
