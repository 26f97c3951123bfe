//! In-process store. Used by tests and by runs that should leave nothing on disk.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{DeliveryLogEntry, MemberEdit, MemberRecord, StateStore};

#[derive(Default)]
pub struct MemoryStore {
    members: Mutex<BTreeMap<String, MemberRecord>>,
    deliveries: Mutex<Vec<DeliveryLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_member(&self, session_name: &str) -> Result<Option<MemberRecord>> {
        let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        Ok(members.get(session_name).cloned())
    }

    async fn put_member(&self, record: MemberRecord) -> Result<()> {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        members.insert(record.session_name.clone(), record);
        Ok(())
    }

    async fn update_member(
        &self,
        session_name: &str,
        create_role: Option<&str>,
        edit: MemberEdit,
    ) -> Result<Option<MemberRecord>> {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        if !members.contains_key(session_name) {
            let Some(role) = create_role else {
                return Ok(None);
            };
            members.insert(session_name.to_string(), MemberRecord::new(session_name, role));
        }
        let Some(record) = members.get_mut(session_name) else {
            return Ok(None);
        };
        edit(record);
        Ok(Some(record.clone()))
    }

    async fn remove_member(&self, session_name: &str) -> Result<()> {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        members.remove(session_name);
        Ok(())
    }

    async fn get_all_members(&self) -> Result<Vec<MemberRecord>> {
        let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        Ok(members.values().cloned().collect())
    }

    async fn record_delivery_log(&self, entry: DeliveryLogEntry) -> Result<()> {
        let mut deliveries = self.deliveries.lock().unwrap_or_else(|e| e.into_inner());
        deliveries.push(entry);
        Ok(())
    }

    async fn delivery_logs(&self, session_name: Option<&str>) -> Result<Vec<DeliveryLogEntry>> {
        let deliveries = self.deliveries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(deliveries
            .iter()
            .filter(|e| session_name.map(|s| e.target_session == s).unwrap_or(true))
            .cloned()
            .collect())
    }
}
