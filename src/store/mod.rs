//! 持久化存储接口 (人员 / 紧急联系人 / 事件日志)
//!
//! - `json`:   每个集合一个 JSON 文件, 写临时文件后原子替换
//! - `memory`: 纯内存实现, 用于测试和无盘运行
//!
//! 记录 id 有两种来源: 新记录生成 24 位十六进制 ObjectId, 旧数据里可能是任意字符串。
//! 删除时先按规范化的 ObjectId 查找, 找不到再按原始字符串查找。

pub mod json;
pub mod memory;

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

pub use json::JsonStore;
pub use memory::MemoryStore;

// ========== 记录类型 ==========

/// 已登记人员
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersonRecord {
    #[serde(rename = "_id", default)]
    pub id: String,
    pub serial_no: u32,
    pub name: String,
    pub relation: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    /// 旧版单张照片 (相对媒体根目录)
    #[serde(default)]
    pub photo_path: Option<String>,
    /// 照片目录 (相对媒体根目录), 优先于 photo_path
    #[serde(default)]
    pub photo_dir: Option<String>,
    pub created_at: DateTime<Local>,
}

/// 人员字段更新, None 表示不修改
#[derive(Clone, Debug, Default)]
pub struct PersonUpdate {
    pub name: Option<String>,
    pub relation: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub photo_path: Option<String>,
    pub photo_dir: Option<String>,
}

impl PersonUpdate {
    pub fn apply(&self, person: &mut PersonRecord) {
        if let Some(v) = &self.name {
            person.name = v.clone();
        }
        if let Some(v) = &self.relation {
            person.relation = v.clone();
        }
        if let Some(v) = &self.phone {
            person.phone = v.clone();
        }
        if let Some(v) = &self.address {
            person.address = v.clone();
        }
        if let Some(v) = &self.photo_path {
            person.photo_path = Some(v.clone());
        }
        if let Some(v) = &self.photo_dir {
            person.photo_dir = Some(v.clone());
        }
    }

    /// 是否影响人脸库 (姓名/关系/照片)
    pub fn touches_identity(&self) -> bool {
        self.name.is_some() || self.relation.is_some() || self.photo_path.is_some() || self.photo_dir.is_some()
    }
}

/// 紧急联系人
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContactRecord {
    #[serde(rename = "_id", default)]
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub relation: String,
}

/// 事件日志条目
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    #[serde(rename = "_id", default)]
    pub id: String,
    pub name: String,
    pub action: String,
    pub relation: String,
    /// 抓拍图片 (相对媒体根目录)
    #[serde(default)]
    pub image: Option<String>,
    pub timestamp: DateTime<Local>,
}

/// 日志查询条件: 结果总是按时间倒序
#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    pub since: Option<DateTime<Local>>,
    pub until: Option<DateTime<Local>>,
    pub limit: Option<usize>,
}

// ========== 存储接口 ==========

pub trait PersonStore: Send + Sync {
    fn list_persons(&self) -> Result<Vec<PersonRecord>>;
    fn find_by_serial_or_name(&self, serial_no: Option<u32>, name: Option<&str>) -> Result<Option<PersonRecord>>;
    /// 插入记录, 返回生成的 id
    fn insert(&self, person: PersonRecord) -> Result<String>;
    fn update_fields(&self, id: &str, update: &PersonUpdate) -> Result<bool>;
    fn delete(&self, id: &str) -> Result<bool>;
}

pub trait ContactStore: Send + Sync {
    fn list(&self) -> Result<Vec<ContactRecord>>;
    fn insert(&self, name: &str, phone: &str, relation: &str) -> Result<String>;
    fn delete_by_id(&self, id: &str) -> Result<bool>;
}

pub trait EventLogStore: Send + Sync {
    fn append(&self, entry: EventRecord) -> Result<String>;
    fn query(&self, query: &EventQuery) -> Result<Vec<EventRecord>>;
    fn delete_by_id(&self, id: &str) -> Result<bool>;
}

// ========== id ==========

/// 生成 24 位十六进制 id: 4 字节秒级时间戳 + 8 字节随机数
pub fn new_object_id() -> String {
    let secs = Local::now().timestamp() as u32;
    format!("{:08x}{:016x}", secs, rand::random::<u64>())
}

/// 规范化 ObjectId (24 位十六进制, 小写); 不是 ObjectId 返回 None
pub fn parse_object_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.len() == 24 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(trimmed.to_ascii_lowercase())
    } else {
        None
    }
}

/// 先按 ObjectId 再按原始字符串定位记录下标
pub(crate) fn locate_by_id<T>(items: &[T], raw: &str, id_of: impl Fn(&T) -> &str) -> Option<usize> {
    if let Some(oid) = parse_object_id(raw) {
        if let Some(i) = items.iter().position(|t| id_of(t) == oid) {
            return Some(i);
        }
    }
    items.iter().position(|t| id_of(t) == raw)
}

/// 按查询条件过滤并倒序
pub(crate) fn select_events(records: &[EventRecord], query: &EventQuery) -> Vec<EventRecord> {
    let mut out: Vec<EventRecord> = records
        .iter()
        .filter(|r| query.since.map_or(true, |s| r.timestamp >= s))
        .filter(|r| query.until.map_or(true, |u| r.timestamp < u))
        .cloned()
        .collect();
    // 稳定排序: 同一时刻后写入的排在前面
    out.reverse();
    out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    if let Some(limit) = query.limit {
        out.truncate(limit);
    }
    out
}

pub(crate) fn find_person(
    persons: &[PersonRecord],
    serial_no: Option<u32>,
    name: Option<&str>,
) -> Option<PersonRecord> {
    persons
        .iter()
        .find(|p| serial_no == Some(p.serial_no) || name == Some(p.name.as_str()))
        .cloned()
}
