//! 紧急告警状态机 (Emergency Escalation)
//!
//! ```text
//!          trigger (不在防抖窗口内)
//!   Idle ─────────────────────────→ Active ── 查询时 >5s: 文案改为"已接通"
//!    ↑                                 │
//!    └──────── 触发后超过 reset 时长 ──┘
//! ```
//!
//! 所有摄像头共享同一个实例; 防抖检查与状态切换在同一把锁内完成,
//! 两路摄像头同时触发时只会产生一次告警。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::store::{ContactRecord, ContactStore};

pub const FALLBACK_CONTACT_NAME: &str = "Emergency Services";
pub const FALLBACK_CONTACT_PHONE: &str = "911";
const CONNECTED_MESSAGE: &str = "CALL CONNECTED - ALERTING SUSPECT DETECTED";

/// 告警计时参数
#[derive(Debug, Clone, Copy)]
pub struct AlertTiming {
    /// 防抖窗口: 窗口内重复触发返回原告警
    pub refractory: Duration,
    /// 多久后文案切换为"已接通"
    pub connected_after: Duration,
    /// 多久后自动复位
    pub reset_after: Duration,
}

impl Default for AlertTiming {
    fn default() -> Self {
        Self {
            refractory: Duration::from_secs(10),
            connected_after: Duration::from_secs(5),
            reset_after: Duration::from_secs(15),
        }
    }
}

/// 当前告警
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Alert {
    pub active: bool,
    pub threat: String,
    pub calling: String,
    pub phone: String,
    pub timestamp: DateTime<Local>,
    pub message: String,
    #[serde(skip)]
    started: Instant,
}

/// 状态查询结果: `{"active": false}` 或完整告警
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum AlertStatus {
    Active(Alert),
    Inactive { active: bool },
}

impl AlertStatus {
    pub fn inactive() -> Self {
        AlertStatus::Inactive { active: false }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AlertStatus::Active(_))
    }
}

pub struct EmergencyEscalation {
    contacts: Arc<dyn ContactStore>,
    timing: AlertTiming,
    alert: Mutex<Option<Alert>>,
}

impl EmergencyEscalation {
    pub fn new(contacts: Arc<dyn ContactStore>, timing: AlertTiming) -> Self {
        Self {
            contacts,
            timing,
            alert: Mutex::new(None),
        }
    }

    fn alert(&self) -> MutexGuard<'_, Option<Alert>> {
        self.alert.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 触发告警; 防抖窗口内返回已有告警 (不重置计时, 不重新选择联系人)
    pub fn trigger(&self, threat: &str) -> Alert {
        self.trigger_at(Instant::now(), threat)
    }

    fn trigger_at(&self, now: Instant, threat: &str) -> Alert {
        let mut slot = self.alert();
        // 已超时复位的告警不再拦截新的触发
        if slot
            .as_ref()
            .is_some_and(|current| now.duration_since(current.started) > self.timing.reset_after)
        {
            *slot = None;
        }
        if let Some(current) = slot.as_ref() {
            if now.duration_since(current.started) < self.timing.refractory {
                return current.clone();
            }
        }

        let (calling, phone) = self.first_contact();
        let alert = Alert {
            active: true,
            threat: threat.to_string(),
            message: format!("DIALING {} ({})...", calling, phone),
            calling,
            phone,
            timestamp: Local::now(),
            started: now,
        };
        tracing::warn!("🚨 紧急告警: {} | 呼叫 {} ({})", threat, alert.calling, alert.phone);
        *slot = Some(alert.clone());
        alert
    }

    /// 第一个紧急联系人, 没有则使用默认号码
    fn first_contact(&self) -> (String, String) {
        match self.contacts.list() {
            Ok(list) => {
                if let Some(c) = list.into_iter().next() {
                    return (c.name, c.phone);
                }
            }
            Err(e) => tracing::warn!("⚠️  读取紧急联系人失败: {:#}", e),
        }
        (FALLBACK_CONTACT_NAME.to_string(), FALLBACK_CONTACT_PHONE.to_string())
    }

    /// 查询状态 (会推进文案并处理超时复位)
    pub fn status(&self) -> AlertStatus {
        self.status_at(Instant::now())
    }

    fn status_at(&self, now: Instant) -> AlertStatus {
        let mut slot = self.alert();
        let Some(alert) = slot.as_mut() else {
            return AlertStatus::inactive();
        };
        let elapsed = now.duration_since(alert.started);
        if elapsed > self.timing.reset_after {
            tracing::info!("✅ 告警已复位: {}", alert.threat);
            *slot = None;
            return AlertStatus::inactive();
        }
        if elapsed > self.timing.connected_after {
            alert.message = CONNECTED_MESSAGE.to_string();
        }
        AlertStatus::Active(alert.clone())
    }

    // ========== 紧急联系人 ==========

    pub fn contacts(&self) -> Result<Vec<ContactRecord>> {
        self.contacts.list()
    }

    pub fn add_contact(&self, name: &str, phone: &str, relation: &str) -> Result<String> {
        self.contacts.insert(name, phone, relation)
    }

    /// 删除联系人: ObjectId 优先, 其次原始字符串; 失败只返回 false
    pub fn delete_contact(&self, id: &str) -> bool {
        match self.contacts.delete_by_id(id) {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::warn!("⚠️  删除联系人 {} 失败: {:#}", id, e);
                false
            }
        }
    }
}
