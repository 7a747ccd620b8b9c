use chrono::NaiveDate;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::types::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub resource_id: ResourceId,
    pub date: NaiveDate,
}

impl SlotKey {
    pub const fn new(resource_id: ResourceId, date: NaiveDate) -> Self {
        Self { resource_id, date }
    }
}

pub type SlotIndex<Id> = HashMap<SlotKey, Vec<Id>>;

pub(crate) fn remove_from_slot<Id: PartialEq>(index: &mut SlotIndex<Id>, key: SlotKey, id: &Id) {
    if let Some(ids) = index.get_mut(&key) {
        if let Some(pos) = ids.iter().position(|x| x == id) {
            ids.remove(pos);
        }
        if ids.is_empty() {
            index.remove(&key);
        }
    }
}
