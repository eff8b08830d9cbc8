//! Group assignment JSON.
//!
//! One object keyed by long address with the list of groups:
//!
//! ```json
//! {"0A1B2C":[0,3],"00FF01":[15]}
//! ```

use serde::{Deserialize, Serialize};

use crate::addressing::{GroupId, LongAddress};
use crate::error::{DaliError, Result};
use crate::registry::groups::{GroupAssignments, MAX_ASSIGNMENTS};

/// Largest encoded document (every device in every group)
pub const GROUPS_JSON_LEN: usize = 4096;

type GroupList = heapless::Vec<u8, 16>;

/// Serialized form of [`GroupAssignments`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupsDocument {
    entries: heapless::index_map::FnvIndexMap<heapless::String<6>, GroupList, MAX_ASSIGNMENTS>,
}

impl GroupsDocument {
    pub fn from_assignments(assignments: &GroupAssignments) -> Result<Self> {
        let mut entries = heapless::index_map::FnvIndexMap::new();
        for (long, mask) in assignments.iter() {
            let groups: GroupList = GroupId::all()
                .filter(|group| mask & group.mask_bit() != 0)
                .map(GroupId::value)
                .collect();
            entries
                .insert(long.to_hex(), groups)
                .map_err(|_| DaliError::buffer_too_small())?;
        }
        Ok(Self { entries })
    }

    /// Convert to assignments, skipping entries that don't parse.
    pub fn to_assignments(&self) -> GroupAssignments {
        let mut assignments = GroupAssignments::new();
        for (key, groups) in self.entries.iter() {
            let Ok(long) = key.parse::<LongAddress>() else {
                dali_log!(warn, "Ignoring group entry with bad address {}", key.as_str());
                continue;
            };
            let mut mask = 0u16;
            for group in groups {
                match GroupId::new(*group) {
                    Ok(group) => mask |= group.mask_bit(),
                    Err(_) => dali_log!(warn, "Ignoring group {} of {}", group, key.as_str()),
                }
            }
            // Capacity matches the document
            let _ = assignments.set(long, mask);
        }
        assignments
    }

    /// Serialize into `buf`, returning the length.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `buf` is too small.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        serde_json_core::to_slice(self, buf).map_err(|_| DaliError::storage_serialize())
    }

    /// Parse a stored document.
    ///
    /// # Errors
    ///
    /// Returns a corrupt-storage error if `bytes` is not a valid document.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json_core::from_slice::<Self>(bytes)
            .map(|(document, _)| document)
            .map_err(|_| DaliError::storage_corrupt())
    }
}
