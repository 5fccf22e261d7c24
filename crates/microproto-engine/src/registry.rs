use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, info, warn};

use microproto_core::messages::{encode_property_update, UpdateEntry};
use microproto_core::schema::encode_schema_upsert;
use microproto_core::wire::MAX_BATCH;
use microproto_core::{PropertyDef, PropertyType, ProtoError, Value};
use microproto_store::PropertyValueRepo;

use crate::error::EngineError;
use crate::validate::validate;

/// A registered property and its live value.
#[derive(Clone, Debug)]
pub struct PropertyEntry {
    pub def: PropertyDef,
    pub value: Value,
}

/// The property table.
///
/// Update messages carry only the property id, so ids are unique across all
/// namespaces. Iteration is in id order, which is also the schema order.
pub struct PropertyRegistry {
    entries: BTreeMap<u8, PropertyEntry>,
    sealed: bool,
    store: Option<PropertyValueRepo>,
}

impl PropertyRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            sealed: false,
            store: None,
        }
    }

    /// Persistent properties are loaded from and saved to `store`.
    pub fn with_store(store: PropertyValueRepo) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    /// Add a property with its default value.
    ///
    /// A persistent property starts from its stored value when one exists
    /// and still passes validation.
    pub fn register(&mut self, def: PropertyDef, default: Value) -> Result<(), EngineError> {
        if self.sealed {
            return Err(EngineError::Sealed);
        }
        if self.entries.contains_key(&def.id) {
            return Err(ProtoError::DuplicateId(def.id).into());
        }
        def.check_definition()?;
        default.check_shape(&def.ty)?;
        validate(&def, &default)?;

        let value = self.restore(&def).unwrap_or(default);
        debug!(property_id = def.id, name = %def.name, ty = %def.ty, "property registered");
        self.entries.insert(def.id, PropertyEntry { def, value });
        Ok(())
    }

    fn restore(&self, def: &PropertyDef) -> Option<Value> {
        if !def.access.persistent {
            return None;
        }
        let store = self.store.as_ref()?;
        match store.load(def) {
            Ok(Some(value)) => match validate(def, &value) {
                Ok(()) => {
                    info!(property_id = def.id, name = %def.name, "restored persisted value");
                    Some(value)
                }
                Err(e) => {
                    warn!(property_id = def.id, error = %e, "persisted value violates constraints, using default");
                    if let Err(e) = store.erase(def.namespace_id, def.id) {
                        warn!(property_id = def.id, error = %e, "failed to erase stale value");
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(property_id = def.id, error = %e, "failed to load persisted value");
                None
            }
        }
    }

    /// Stop accepting registrations. Called when the first session is served.
    pub fn seal(&mut self) {
        if !self.sealed {
            info!(properties = self.entries.len(), "property registry sealed");
        }
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn get(&self, id: u8) -> Option<&PropertyEntry> {
        self.entries.get(&id)
    }

    pub fn type_of(&self, id: u8) -> Option<PropertyType> {
        self.entries.get(&id).map(|e| e.def.ty.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyEntry> {
        self.entries.values()
    }

    /// Replace the live value. Shape and constraints must already be checked.
    pub(crate) fn replace(&mut self, id: u8, value: Value) -> Option<&PropertyEntry> {
        let entry = self.entries.get_mut(&id)?;
        entry.value = value;
        Some(entry)
    }

    /// Save the live value of `id` if it is persistent and a store is attached.
    pub(crate) fn persist(&self, id: u8) -> Result<(), EngineError> {
        let (Some(store), Some(entry)) = (&self.store, self.entries.get(&id)) else {
            return Ok(());
        };
        if entry.def.access.persistent {
            store.save(&entry.def, &entry.value)?;
        }
        Ok(())
    }

    /// `SCHEMA_UPSERT` messages describing every property, at most 256 per message.
    pub fn encode_schema(&self) -> Result<Vec<Bytes>, ProtoError> {
        let entries: Vec<&PropertyEntry> = self.entries.values().collect();
        entries
            .chunks(MAX_BATCH)
            .map(|chunk| {
                let items: Vec<(&PropertyDef, &Value)> =
                    chunk.iter().map(|e| (&e.def, &e.value)).collect();
                encode_schema_upsert(&items)
            })
            .collect()
    }

    /// `PROPERTY_UPDATE_SHORT` messages carrying every current value.
    pub fn encode_values(&self) -> Result<Vec<Bytes>, ProtoError> {
        let entries: Vec<&PropertyEntry> = self.entries.values().collect();
        entries
            .chunks(MAX_BATCH)
            .map(|chunk| {
                let items: Vec<UpdateEntry<'_>> = chunk
                    .iter()
                    .map(|e| UpdateEntry {
                        id: e.def.id,
                        ty: &e.def.ty,
                        value: &e.value,
                    })
                    .collect();
                encode_property_update(&items)
            })
            .collect()
    }
}

impl Default for PropertyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
