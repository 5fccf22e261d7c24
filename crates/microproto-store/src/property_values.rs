use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use microproto_core::wire::WireReader;
use microproto_core::{PropertyDef, PropertyType, Value};

use crate::database::Database;
use crate::error::StoreError;

/// Metadata of one stored value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredProperty {
    pub namespace_id: u8,
    pub property_id: u8,
    pub name: String,
    pub ty: PropertyType,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct PropertyValueRepo {
    db: Database,
}

fn type_signature(ty: &PropertyType) -> Result<String, StoreError> {
    Ok(serde_json::to_string(ty)?)
}

impl PropertyValueRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the stored value of `def`.
    #[instrument(skip(self, def, value), fields(property_id = def.id, namespace_id = def.namespace_id))]
    pub fn save(&self, def: &PropertyDef, value: &Value) -> Result<(), StoreError> {
        let blob = value.to_bytes(&def.ty)?;
        let signature = type_signature(&def.ty)?;
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO property_values (namespace_id, property_id, name, type_def, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(namespace_id, property_id) DO UPDATE SET
                     name = excluded.name,
                     type_def = excluded.type_def,
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    def.namespace_id,
                    def.id,
                    def.name,
                    signature,
                    &blob[..],
                    now
                ],
            )?;
            Ok(())
        })
    }

    /// Stored value for `def`, if one exists and still fits its type.
    ///
    /// A row saved under a different type, or whose bytes no longer decode,
    /// is treated as absent.
    #[instrument(skip(self, def), fields(property_id = def.id, namespace_id = def.namespace_id))]
    pub fn load(&self, def: &PropertyDef) -> Result<Option<Value>, StoreError> {
        let row: Option<(String, Vec<u8>)> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT type_def, value FROM property_values
                     WHERE namespace_id = ?1 AND property_id = ?2",
                    rusqlite::params![def.namespace_id, def.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;
        let Some((stored_sig, blob)) = row else {
            return Ok(None);
        };
        if stored_sig != type_signature(&def.ty)? {
            debug!(stored = %stored_sig, "stored value has a different type, ignoring");
            return Ok(None);
        }
        let mut r = WireReader::new(&blob);
        match Value::decode(&mut r, &def.ty) {
            Ok(value) if r.is_empty() => Ok(Some(value)),
            Ok(_) => {
                warn!("stored value has trailing bytes, ignoring");
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "stored value does not decode, ignoring");
                Ok(None)
            }
        }
    }

    /// Remove one stored value. Returns whether a row existed.
    #[instrument(skip(self))]
    pub fn erase(&self, namespace_id: u8, property_id: u8) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM property_values WHERE namespace_id = ?1 AND property_id = ?2",
                rusqlite::params![namespace_id, property_id],
            )?;
            Ok(n > 0)
        })
    }

    #[instrument(skip(self))]
    pub fn erase_all(&self) -> Result<usize, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.execute("DELETE FROM property_values", [])?))
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<StoredProperty>, StoreError> {
        let rows: Vec<(u8, u8, String, String, String)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT namespace_id, property_id, name, type_def, updated_at
                 FROM property_values ORDER BY namespace_id, property_id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(namespace_id, property_id, name, sig, updated_at)| {
                Ok(StoredProperty {
                    namespace_id,
                    property_id,
                    name,
                    ty: serde_json::from_str(&sig)?,
                    updated_at,
                })
            })
            .collect()
    }
}
