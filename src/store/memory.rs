//! 内存存储 (测试 / 无盘运行)

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use super::{
    find_person, locate_by_id, new_object_id, select_events, ContactRecord, ContactStore, EventLogStore, EventQuery,
    EventRecord, PersonRecord, PersonStore, PersonUpdate,
};

#[derive(Default)]
pub struct MemoryStore {
    persons: Mutex<Vec<PersonRecord>>,
    contacts: Mutex<Vec<ContactRecord>>,
    logs: Mutex<Vec<EventRecord>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_by_id<T>(items: &mut Vec<T>, id: &str, id_of: impl Fn(&T) -> &str) -> bool {
    locate_by_id(items, id, id_of).map(|i| items.remove(i)).is_some()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersonStore for MemoryStore {
    fn list_persons(&self) -> Result<Vec<PersonRecord>> {
        Ok(guard(&self.persons).clone())
    }

    fn find_by_serial_or_name(&self, serial_no: Option<u32>, name: Option<&str>) -> Result<Option<PersonRecord>> {
        Ok(find_person(&guard(&self.persons), serial_no, name))
    }

    fn insert(&self, mut person: PersonRecord) -> Result<String> {
        if person.id.is_empty() {
            person.id = new_object_id();
        }
        let id = person.id.clone();
        guard(&self.persons).push(person);
        Ok(id)
    }

    fn update_fields(&self, id: &str, update: &PersonUpdate) -> Result<bool> {
        let mut persons = guard(&self.persons);
        match locate_by_id(&persons, id, |p| p.id.as_str()) {
            Some(i) => {
                update.apply(&mut persons[i]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(remove_by_id(&mut guard(&self.persons), id, |p| p.id.as_str()))
    }
}

impl ContactStore for MemoryStore {
    fn list(&self) -> Result<Vec<ContactRecord>> {
        Ok(guard(&self.contacts).clone())
    }

    fn insert(&self, name: &str, phone: &str, relation: &str) -> Result<String> {
        let id = new_object_id();
        guard(&self.contacts).push(ContactRecord {
            id: id.clone(),
            name: name.to_string(),
            phone: phone.to_string(),
            relation: relation.to_string(),
        });
        Ok(id)
    }

    fn delete_by_id(&self, id: &str) -> Result<bool> {
        Ok(remove_by_id(&mut guard(&self.contacts), id, |c| c.id.as_str()))
    }
}

impl EventLogStore for MemoryStore {
    fn append(&self, mut entry: EventRecord) -> Result<String> {
        if entry.id.is_empty() {
            entry.id = new_object_id();
        }
        let id = entry.id.clone();
        guard(&self.logs).push(entry);
        Ok(id)
    }

    fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        Ok(select_events(&guard(&self.logs), query))
    }

    fn delete_by_id(&self, id: &str) -> Result<bool> {
        Ok(remove_by_id(&mut guard(&self.logs), id, |r| r.id.as_str()))
    }
}
