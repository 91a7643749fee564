//! Snapshot encoding for crossing process boundaries.
//!
//! Only locals registered with a [`SnapshotCodec`] are transported, by name.
//! Both sides must register the same names with compatible types.

use super::local::{AsyncLocal, Binding, LocalValue, Snapshot};
use crate::error::{CodecError, Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    name: String,
    /// Outermost first.
    values: Vec<Vec<u8>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireSnapshot {
    entries: Vec<WireEntry>,
}

type EncodeFn = fn(&LocalValue) -> Result<Vec<u8>>;
type DecodeFn = fn(&[u8]) -> Result<LocalValue>;

struct Registered {
    id: u64,
    name: &'static str,
    stacking: bool,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Registry of transportable locals.
#[derive(Default)]
pub struct SnapshotCodec {
    by_name: HashMap<&'static str, Registered>,
}

impl SnapshotCodec {
    /// An empty codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `local` transportable under its name.
    pub fn register<T>(&mut self, local: &AsyncLocal<T>) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
    {
        if self.by_name.contains_key(local.name()) {
            return Err(CodecError::DuplicateLocal(local.name()).into());
        }
        self.by_name.insert(
            local.name(),
            Registered {
                id: local.id(),
                name: local.name(),
                stacking: local.is_stacking(),
                encode: encode_value::<T>,
                decode: decode_value::<T>,
            },
        );
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<T>(mut self, local: &AsyncLocal<T>) -> Result<Self>
    where
        T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
    {
        self.register(local)?;
        Ok(self)
    }

    /// Number of registered locals.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Encode the registered locals bound in `snapshot`.
    pub fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        let by_id: HashMap<u64, &Registered> =
            self.by_name.values().map(|r| (r.id, r)).collect();

        let mut wire = WireSnapshot::default();
        for (id, binding) in snapshot.entries() {
            let Some(registered) = by_id.get(&id) else {
                trace!(local = binding.name, "local not transportable, skipped");
                continue;
            };
            let values = binding
                .values
                .iter()
                .map(registered.encode)
                .collect::<Result<Vec<_>>>()?;
            wire.entries.push(WireEntry {
                name: registered.name.to_string(),
                values,
            });
        }
        wire.entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(bincode::serialize(&wire)?)
    }

    /// Rebuild a snapshot from [`encode`](Self::encode) output.
    pub fn decode(&self, bytes: &[u8]) -> Result<Snapshot> {
        if bytes.is_empty() {
            return Ok(Snapshot::empty());
        }
        let wire: WireSnapshot = bincode::deserialize(bytes)
            .map_err(|e| Error::Codec(CodecError::Deserialization(e.to_string())))?;

        let mut bindings = HashMap::with_capacity(wire.entries.len());
        for entry in wire.entries {
            let Some(registered) = self.by_name.get(entry.name.as_str()) else {
                warn!(local = %entry.name, "unknown local in snapshot, skipped");
                continue;
            };
            let values = entry
                .values
                .iter()
                .map(|bytes| (registered.decode)(bytes))
                .collect::<Result<Vec<_>>>()?;
            if values.is_empty() {
                continue;
            }
            bindings.insert(
                registered.id,
                Binding {
                    name: registered.name,
                    stacking: registered.stacking,
                    values,
                },
            );
        }
        Ok(Snapshot::from_entries(bindings))
    }
}

impl std::fmt::Debug for SnapshotCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.by_name.keys().collect();
        names.sort_unstable();
        f.debug_struct("SnapshotCodec").field("locals", &names).finish()
    }
}

fn encode_value<T: Serialize + 'static>(value: &LocalValue) -> Result<Vec<u8>> {
    let value = value
        .downcast_ref::<T>()
        .ok_or_else(|| CodecError::Serialization("local value has an unexpected type".into()))?;
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: DeserializeOwned + Send + Sync + 'static>(bytes: &[u8]) -> Result<LocalValue> {
    let value: T = bincode::deserialize(bytes)
        .map_err(|e| Error::Codec(CodecError::Deserialization(e.to_string())))?;
    Ok(Arc::new(value))
}
