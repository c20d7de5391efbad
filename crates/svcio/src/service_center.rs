//! Service registry with optional name binding

use std::collections::HashMap;
use std::sync::Arc;

use svcio_core::handle::Handle;
use svcio_core::{kdebug, kwarn, SpinLock};

use crate::registry::SlotTable;
use crate::service::Service;

pub struct ServiceCenter {
    table: SlotTable<Service>,
    names: SpinLock<HashMap<String, u32>>,
}

impl ServiceCenter {
    pub fn new(initial_capacity: usize, max_slots: usize) -> Self {
        Self {
            table: SlotTable::new(false, initial_capacity, max_slots),
            names: SpinLock::new(HashMap::new()),
        }
    }

    /// Returns the new id, or 0 when the registry is full.
    pub fn register(&self, service: Arc<Service>) -> u32 {
        match self.table.insert(service) {
            Ok(id) => {
                kdebug!("service {:#x} registered", id);
                id
            }
            Err(e) => {
                kwarn!("service register failed: {}", e);
                0
            }
        }
    }

    pub fn gain(&self, id: u32) -> Option<Arc<Service>> {
        self.table.get(id)
    }

    /// Also drops every name bound to `id`.
    pub fn deregister(&self, id: u32) -> Option<Arc<Service>> {
        let service = self.table.remove(id)?;
        self.names.lock().retain(|_, bound| *bound != id);
        kdebug!("service {:#x} deregistered", id);
        Some(service)
    }

    /// Bind `name` to a live service id, replacing any previous binding
    pub fn bind_name(&self, name: &str, id: u32) -> bool {
        if id == 0 || Handle::new(id).is_channel() || !self.table.contains(id) {
            return false;
        }
        self.names.lock().insert(name.to_owned(), id);
        true
    }

    pub fn unbind_name(&self, name: &str) -> bool {
        self.names.lock().remove(name).is_some()
    }

    /// 0 if the name is not bound
    pub fn find_service_id(&self, name: &str) -> u32 {
        self.names.lock().get(name).copied().unwrap_or(0)
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

    pub fn clear(&self) -> Vec<Arc<Service>> {
        self.names.lock().clear();
        self.table.clear()
    }
}
