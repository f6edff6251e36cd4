//! 事件日志与统计 (Event Log & Stats)
//!
//! ```text
//! log_event → 防抖 (同一 subject+action, 3s 内只记一次)
//!           → 抓拍图片 captures/{时间戳}_{名字}.jpg
//!           → 持久化日志 (EventLogStore)
//!           → 内存环形缓冲 (最近 N 条)
//!           → 计数器 (仅 Incremental 策略)
//! ```
//!
//! 统计策略二选一, 同一个 EventLog 只用一种:
//! - `DailyFromLog`: 从持久化日志按当天重新统计 (默认)
//! - `Incremental`:  启动以来的内存计数

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Days, Local, NaiveDate, TimeZone};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::store::{locate_by_id, EventLogStore, EventQuery, EventRecord};

/// 统计策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsPolicy {
    Incremental,
    DailyFromLog,
}

/// 事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Known,
    Unknown,
    Suspect,
}

impl EventCategory {
    /// "System" 或关系含 suspect → 可疑; "Unknown" 开头 → 陌生人; 其余 → 熟人
    pub fn of(name: &str, relation: &str) -> Self {
        if name == "System" || relation.to_lowercase().contains("suspect") {
            EventCategory::Suspect
        } else if name.starts_with("Unknown") {
            EventCategory::Unknown
        } else {
            EventCategory::Known
        }
    }
}

/// 统计结果
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Stats {
    pub known: u64,
    pub unknown: u64,
    pub suspects: u64,
    pub traffic: u64,
    /// 最近事件, 新的在前
    pub history: Vec<EventRecord>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    known: u64,
    unknown: u64,
    suspects: u64,
    traffic: u64,
}

impl Counters {
    fn count(&mut self, category: EventCategory) {
        match category {
            EventCategory::Known => self.known += 1,
            EventCategory::Unknown => self.unknown += 1,
            EventCategory::Suspect => self.suspects += 1,
        }
        self.traffic += 1;
    }
}

struct LastEvent {
    name: String,
    action: String,
    at: Instant,
}

#[derive(Default)]
struct LogState {
    last: Option<LastEvent>,
    history: VecDeque<EventRecord>,
    counters: Counters,
}

/// 文件名清洗: 只保留字母数字/空格/-/_, 空格换成下划线
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .replace(' ', "_")
}

pub struct EventLog {
    store: Arc<dyn EventLogStore>,
    media_root: PathBuf,
    debounce: Duration,
    history_len: usize,
    policy: StatsPolicy,
    state: Mutex<LogState>,
}

impl EventLog {
    pub fn new(
        store: Arc<dyn EventLogStore>,
        media_root: impl Into<PathBuf>,
        debounce: Duration,
        history_len: usize,
        policy: StatsPolicy,
    ) -> Self {
        Self {
            store,
            media_root: media_root.into(),
            debounce,
            history_len: history_len.max(1),
            policy,
            state: Mutex::new(LogState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> StatsPolicy {
        self.policy
    }

    /// 启动时用持久化日志的最近 N 条填充环形缓冲
    pub fn hydrate(&self) -> Result<usize> {
        let recent = self.store.query(&EventQuery {
            limit: Some(self.history_len),
            ..Default::default()
        })?;
        let mut state = self.state();
        state.history = recent.into_iter().rev().collect();
        Ok(state.history.len())
    }

    /// 记录事件; 被防抖抑制时返回 None
    pub fn log_event(
        &self,
        name: &str,
        action: &str,
        relation: &str,
        snapshot: Option<&RgbImage>,
    ) -> Option<EventRecord> {
        self.log_event_at(Instant::now(), Local::now(), name, action, relation, snapshot)
    }

    fn log_event_at(
        &self,
        now: Instant,
        wall: DateTime<Local>,
        name: &str,
        action: &str,
        relation: &str,
        snapshot: Option<&RgbImage>,
    ) -> Option<EventRecord> {
        // 防抖检查与更新在同一临界区
        {
            let mut state = self.state();
            if let Some(last) = &state.last {
                if last.name == name && last.action == action && now.duration_since(last.at) < self.debounce {
                    return None;
                }
            }
            state.last = Some(LastEvent {
                name: name.to_string(),
                action: action.to_string(),
                at: now,
            });
        }

        let image = snapshot.and_then(|img| self.save_snapshot(img, name, wall));
        let mut entry = EventRecord {
            id: String::new(),
            name: name.to_string(),
            action: action.to_string(),
            relation: relation.to_string(),
            image,
            timestamp: wall,
        };

        match self.store.append(entry.clone()) {
            Ok(id) => entry.id = id,
            Err(e) => tracing::error!("❌ 日志写入失败: {:#}", e),
        }

        let mut state = self.state();
        state.history.push_back(entry.clone());
        while state.history.len() > self.history_len {
            state.history.pop_front();
        }
        state.counters.count(EventCategory::of(name, relation));
        tracing::info!("📝 {} | {} | {}", name, action, relation);
        Some(entry)
    }

    fn save_snapshot(&self, image: &RgbImage, name: &str, wall: DateTime<Local>) -> Option<String> {
        let dir = self.media_root.join("captures");
        let filename = format!("{}_{}.jpg", wall.format("%Y%m%d_%H%M%S_%3f"), sanitize_name(name));
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::warn!("⚠️  无法创建抓拍目录 {}: {}", dir.display(), e);
            return None;
        }
        match image.save(dir.join(&filename)) {
            Ok(()) => Some(format!("captures/{}", filename)),
            Err(e) => {
                tracing::warn!("⚠️  抓拍保存失败: {}", e);
                None
            }
        }
    }

    /// 当前统计 + 最近事件
    pub fn stats(&self) -> Stats {
        let (counters, history) = {
            let state = self.state();
            (state.counters, state.history.iter().rev().cloned().collect::<Vec<_>>())
        };

        let counters = match self.policy {
            StatsPolicy::Incremental => counters,
            StatsPolicy::DailyFromLog => match self.daily_counters(Local::now()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("⚠️  统计查询失败: {:#}", e);
                    Counters::default()
                }
            },
        };

        Stats {
            known: counters.known,
            unknown: counters.unknown,
            suspects: counters.suspects,
            traffic: counters.traffic,
            history,
        }
    }

    fn daily_counters(&self, now: DateTime<Local>) -> Result<Counters> {
        let today = now.date_naive();
        let midnight = |d: NaiveDate| {
            d.and_hms_opt(0, 0, 0)
                .and_then(|t| Local.from_local_datetime(&t).earliest())
        };
        let start = midnight(today).unwrap_or(now);
        let until = today.checked_add_days(Days::new(1)).and_then(midnight);

        let records = self.store.query(&EventQuery {
            since: Some(start),
            until,
            limit: None,
        })?;
        let mut counters = Counters::default();
        for r in &records {
            counters.count(EventCategory::of(&r.name, &r.relation));
        }
        Ok(counters)
    }

    /// 最近日志 (时间倒序)
    pub fn recent_logs(&self, limit: usize) -> Result<Vec<EventRecord>> {
        self.store.query(&EventQuery {
            limit: Some(limit),
            ..Default::default()
        })
    }

    /// 删除日志 (持久化存储 + 环形缓冲)
    pub fn delete_log(&self, id: &str) -> Result<bool> {
        let deleted = self.store.delete_by_id(id)?;
        let mut state = self.state();
        let ids: Vec<String> = state.history.iter().map(|r| r.id.clone()).collect();
        if let Some(i) = locate_by_id(&ids, id, |s| s.as_str()) {
            state.history.remove(i);
        }
        Ok(deleted)
    }
}
