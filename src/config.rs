//! 系统配置 - 通过JSON文件调整参数

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detection::threat::default_threat_classes;
use crate::events::StatsPolicy;

/// 摄像头输入源
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// 循环回放目录中的图片 (jpg/png)
    ImageDir { path: PathBuf },
    /// 轮询 IP 摄像头的 JPEG 快照地址
    HttpSnapshot { url: String },
}

/// 启动时自动添加的摄像头
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub id: String,
    pub label: String,
    pub source: SourceSpec,
}

/// 数字卫兵参数配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    // === 存储 ===
    pub media_root: PathBuf, // 上传/抓拍图片根目录
    pub data_dir: PathBuf,   // JSON 存储与特征缓存目录
    pub embedding_cache_file: String,

    // === 采集 ===
    pub capture_interval_ms: u64, // 采集节流 (~30Hz)
    pub reopen_backoff_ms: u64,   // 读帧失败后重连等待
    pub startup_grace_ms: u64,    // 添加摄像头时等待首帧
    pub stop_timeout_ms: u64,     // 停止时等待线程退出

    // === 检测 ===
    pub detect_interval_ms: u64, // 检测节流 (~12Hz)
    pub downscale: f32,          // 推理前缩放比例
    pub match_tolerance: f32,    // 人脸匹配距离阈值
    pub detector_iou_threshold: f32,
    pub detector_conf_threshold: f32,
    pub violence_iou_threshold: f32,
    pub threat_classes: BTreeMap<u32, String>,

    // === 事件日志 ===
    pub event_debounce_ms: u64,
    pub history_len: usize,
    pub stats_policy: StatsPolicy,

    // === 紧急告警 ===
    pub alert_refractory_secs: u64,
    pub alert_connected_secs: u64,
    pub alert_reset_secs: u64,

    // === 渲染 ===
    pub font_path: Option<PathBuf>,

    pub cameras: Vec<CameraConfig>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("static/uploads"),
            data_dir: PathBuf::from("data"),
            embedding_cache_file: "encodings_cache.json".to_string(),

            capture_interval_ms: 33,
            reopen_backoff_ms: 500,
            startup_grace_ms: 1000,
            stop_timeout_ms: 1000,

            detect_interval_ms: 80,
            downscale: 0.5,
            match_tolerance: 0.55,
            detector_iou_threshold: 0.5,
            detector_conf_threshold: 0.4,
            violence_iou_threshold: 0.35,
            threat_classes: default_threat_classes(),

            event_debounce_ms: 3000,
            history_len: 20,
            stats_policy: StatsPolicy::DailyFromLog,

            alert_refractory_secs: 10,
            alert_connected_secs: 5,
            alert_reset_secs: 15,

            font_path: None,

            cameras: Vec::new(),
        }
    }
}

impl SentinelConfig {
    /// 从JSON文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    tracing::info!("✅ 配置已从 {} 加载", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                config.save(path);
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    tracing::error!("❌ 保存配置失败: {}", e);
                } else {
                    tracing::info!("💾 配置已保存到 {}", path.display());
                }
            }
            Err(e) => tracing::error!("❌ 序列化配置失败: {}", e),
        }
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn reopen_backoff(&self) -> Duration {
        Duration::from_millis(self.reopen_backoff_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn detect_interval(&self) -> Duration {
        Duration::from_millis(self.detect_interval_ms)
    }

    pub fn event_debounce(&self) -> Duration {
        Duration::from_millis(self.event_debounce_ms)
    }

    pub fn embedding_cache_path(&self) -> PathBuf {
        self.data_dir.join(&self.embedding_cache_file)
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        tracing::info!("🎛️  当前配置:");
        tracing::info!("  媒体目录: {}", self.media_root.display());
        tracing::info!("  数据目录: {}", self.data_dir.display());
        tracing::info!(
            "  采集间隔: {}ms | 检测间隔: {}ms | 缩放: {:.2}",
            self.capture_interval_ms,
            self.detect_interval_ms,
            self.downscale
        );
        tracing::info!(
            "  匹配阈值: {:.2} | 打架IOU: {:.2}",
            self.match_tolerance,
            self.violence_iou_threshold
        );
        tracing::info!(
            "  告警: 防抖{}s | 接通{}s | 复位{}s",
            self.alert_refractory_secs,
            self.alert_connected_secs,
            self.alert_reset_secs
        );
        tracing::info!("  统计策略: {:?}", self.stats_policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SentinelConfig::default();
        assert_eq!(config.match_tolerance, 0.55);
        assert_eq!(config.alert_reset_secs, 15);
        assert_eq!(config.history_len, 20);
        assert_eq!(config.threat_classes.get(&43).map(String::as_str), Some("Knife"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.json");
        fs::write(&path, r#"{ "alert_reset_secs": 2, "stats_policy": "incremental" }"#).unwrap();

        let config = SentinelConfig::load(&path);
        assert_eq!(config.alert_reset_secs, 2);
        assert_eq!(config.stats_policy, StatsPolicy::Incremental);
        assert_eq!(config.detect_interval_ms, 80);
    }

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.json");

        let config = SentinelConfig::load(&path);
        assert!(path.exists());
        assert_eq!(config.capture_interval_ms, 33);
    }

    #[test]
    fn test_broken_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let config = SentinelConfig::load(&path);
        assert_eq!(config.downscale, 0.5);
    }

    #[test]
    fn test_source_spec_serde() {
        let json = r#"{ "id": "0", "label": "Gate", "source": { "kind": "http_snapshot", "url": "http://cam/snap.jpg" } }"#;
        let cam: CameraConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            cam.source,
            SourceSpec::HttpSnapshot {
                url: "http://cam/snap.jpg".to_string()
            }
        );
    }
}
