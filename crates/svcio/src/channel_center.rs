//! Channel registry; every id it issues has the channel bit set

use std::sync::Arc;

use svcio_core::{kdebug, kwarn};

use crate::channel::Channel;
use crate::registry::SlotTable;

pub struct ChannelCenter {
    table: SlotTable<Channel>,
}

impl ChannelCenter {
    pub fn new(initial_capacity: usize, max_slots: usize) -> Self {
        Self {
            table: SlotTable::new(true, initial_capacity, max_slots),
        }
    }

    /// Returns the new id, or 0 when the registry is full.
    pub fn register(&self, channel: Arc<Channel>) -> u32 {
        match self.table.insert(channel) {
            Ok(id) => {
                kdebug!("channel {:#x} registered", id);
                id
            }
            Err(e) => {
                kwarn!("channel register failed: {}", e);
                0
            }
        }
    }

    pub fn gain(&self, id: u32) -> Option<Arc<Channel>> {
        self.table.get(id)
    }

    pub fn deregister(&self, id: u32) -> Option<Arc<Channel>> {
        let channel = self.table.remove(id)?;
        kdebug!("channel {:#x} deregistered", id);
        Some(channel)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.table.ids()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn clear(&self) -> Vec<Arc<Channel>> {
        self.table.clear()
    }
}
