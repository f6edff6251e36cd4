//! JSON 文件存储: persons.json / contacts.json / logs.json

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    find_person, locate_by_id, new_object_id, select_events, ContactRecord, ContactStore, EventLogStore, EventQuery,
    EventRecord, PersonRecord, PersonStore, PersonUpdate,
};

/// 单个集合: 内存副本 + 文件
pub struct JsonCollection<T> {
    path: PathBuf,
    items: Mutex<Vec<T>>,
}

impl<T: Serialize + DeserializeOwned + Clone> JsonCollection<T> {
    /// 加载集合; 文件不存在或损坏时为空集合
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = match fs::read_to_string(&path) {
            Ok(json) => match serde_json::from_str::<Vec<T>>(&json) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!("⚠️  {} 解析失败: {}, 视为空集合", path.display(), e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path,
            items: Mutex::new(items),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 写临时文件后 rename, 避免写一半的文件
    fn persist(&self, items: &[T]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(items)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.lock().clone()
    }

    /// 在锁内修改并落盘; 落盘失败时回滚内存修改
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> Result<R> {
        let mut items = self.lock();
        let backup = items.clone();
        let out = f(&mut items);
        if let Err(e) = self.persist(&items) {
            *items = backup;
            return Err(e);
        }
        Ok(out)
    }
}

/// 三个集合组成的数据目录
pub struct JsonStore {
    persons: JsonCollection<PersonRecord>,
    contacts: JsonCollection<ContactRecord>,
    logs: JsonCollection<EventRecord>,
}

impl JsonStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("create data dir {}", dir.display()))?;
        let store = Self {
            persons: JsonCollection::open(dir.join("persons.json")),
            contacts: JsonCollection::open(dir.join("contacts.json")),
            logs: JsonCollection::open(dir.join("logs.json")),
        };
        tracing::info!(
            "✅ 数据目录 {}: 人员 {} | 联系人 {} | 日志 {}",
            dir.display(),
            store.persons.lock().len(),
            store.contacts.lock().len(),
            store.logs.lock().len()
        );
        Ok(store)
    }
}

impl PersonStore for JsonStore {
    fn list_persons(&self) -> Result<Vec<PersonRecord>> {
        Ok(self.persons.snapshot())
    }

    fn find_by_serial_or_name(&self, serial_no: Option<u32>, name: Option<&str>) -> Result<Option<PersonRecord>> {
        Ok(find_person(&self.persons.lock(), serial_no, name))
    }

    fn insert(&self, mut person: PersonRecord) -> Result<String> {
        if person.id.is_empty() {
            person.id = new_object_id();
        }
        let id = person.id.clone();
        self.persons.mutate(|items| items.push(person))?;
        Ok(id)
    }

    fn update_fields(&self, id: &str, update: &PersonUpdate) -> Result<bool> {
        self.persons.mutate(|items| match locate_by_id(items, id, |p| p.id.as_str()) {
            Some(i) => {
                update.apply(&mut items[i]);
                true
            }
            None => false,
        })
    }

    fn delete(&self, id: &str) -> Result<bool> {
        self.persons.mutate(|items| {
            locate_by_id(items, id, |p| p.id.as_str())
                .map(|i| items.remove(i))
                .is_some()
        })
    }
}

impl ContactStore for JsonStore {
    fn list(&self) -> Result<Vec<ContactRecord>> {
        Ok(self.contacts.snapshot())
    }

    fn insert(&self, name: &str, phone: &str, relation: &str) -> Result<String> {
        let contact = ContactRecord {
            id: new_object_id(),
            name: name.to_string(),
            phone: phone.to_string(),
            relation: relation.to_string(),
        };
        let id = contact.id.clone();
        self.contacts.mutate(|items| items.push(contact))?;
        Ok(id)
    }

    fn delete_by_id(&self, id: &str) -> Result<bool> {
        self.contacts.mutate(|items| {
            locate_by_id(items, id, |c| c.id.as_str())
                .map(|i| items.remove(i))
                .is_some()
        })
    }
}

impl EventLogStore for JsonStore {
    fn append(&self, mut entry: EventRecord) -> Result<String> {
        if entry.id.is_empty() {
            entry.id = new_object_id();
        }
        let id = entry.id.clone();
        self.logs.mutate(|items| items.push(entry))?;
        Ok(id)
    }

    fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        Ok(select_events(&self.logs.lock(), query))
    }

    fn delete_by_id(&self, id: &str) -> Result<bool> {
        self.logs.mutate(|items| {
            locate_by_id(items, id, |r| r.id.as_str())
                .map(|i| items.remove(i))
                .is_some()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn person(serial: u32, name: &str) -> PersonRecord {
        PersonRecord {
            id: String::new(),
            serial_no: serial,
            name: name.to_string(),
            relation: "Family".to_string(),
            phone: "123".to_string(),
            address: "Home".to_string(),
            photo_path: None,
            photo_dir: Some(format!("known/{}", name)),
            created_at: Local::now(),
        }
    }

    #[test]
    fn test_persons_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = JsonStore::open(dir.path()).unwrap();
            PersonStore::insert(&store, person(1, "Alice")).unwrap()
        };

        let store = JsonStore::open(dir.path()).unwrap();
        let all = store.list_persons().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
        assert_eq!(
            store.find_by_serial_or_name(None, Some("Alice")).unwrap().map(|p| p.serial_no),
            Some(1)
        );
        assert!(store.find_by_serial_or_name(Some(2), None).unwrap().is_none());
    }

    #[test]
    fn test_update_and_delete_person() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let id = PersonStore::insert(&store, person(1, "Alice")).unwrap();

        let update = PersonUpdate {
            relation: Some("Suspect".to_string()),
            ..Default::default()
        };
        assert!(store.update_fields(&id, &update).unwrap());
        assert_eq!(store.list_persons().unwrap()[0].relation, "Suspect");

        assert!(store.delete(&id).unwrap());
        assert!(!store.delete(&id).unwrap());
        assert!(store.list_persons().unwrap().is_empty());
    }

    #[test]
    fn test_contact_delete_raw_string_id() {
        let dir = tempfile::tempdir().unwrap();
        // 旧数据: 毫秒时间戳字符串 id
        fs::write(
            dir.path().join("contacts.json"),
            r#"[{"_id": "1699999999999", "name": "Mom", "phone": "555", "relation": "Family"}]"#,
        )
        .unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let id = ContactStore::insert(&store, "Dad", "666", "Family").unwrap();

        assert!(ContactStore::delete_by_id(&store, &id.to_uppercase()).unwrap());
        assert!(ContactStore::delete_by_id(&store, "1699999999999").unwrap());
        assert!(!ContactStore::delete_by_id(&store, "missing").unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("logs.json"), "[{ broken").unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        assert!(store.query(&EventQuery::default()).unwrap().is_empty());
    }
}
