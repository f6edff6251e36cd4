//! 控制入口 (Sentinel)
//!
//! 把摄像头管理、人员管理、告警、日志统计收拢成一个服务对象,
//! 上层 (CLI / HTTP) 只调用这里的方法。

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use image::RgbImage;
use serde_json::Value;

use crate::camera::{AddOutcome, Camera, CameraInfo, CameraRegistry, RegistryTiming};
use crate::config::{SentinelConfig, SourceSpec};
use crate::detection::{AutoEnroller, FaceRecognizer, FramePipeline, ObjectDetector, PipelineParams, SentinelPipeline, ThreatTable};
use crate::error::{CameraError, RoiError};
use crate::escalation::{Alert, AlertStatus, AlertTiming, EmergencyEscalation};
use crate::events::{sanitize_name, EventLog, Stats};
use crate::registry::KnownFaceRegistry;
use crate::render::OverlayRenderer;
use crate::store::{ContactRecord, ContactStore, EventLogStore, EventRecord, JsonStore, PersonRecord, PersonStore, PersonUpdate};

const FIRST_SERIAL: u32 = 1001;
const RECENT_LOG_LIMIT: usize = 100;

/// 新增人员的登记信息
#[derive(Debug, Clone, Default)]
pub struct NewPerson {
    pub name: String,
    pub relation: String,
    pub phone: String,
    pub address: String,
}

pub struct Sentinel {
    config: SentinelConfig,
    persons: Arc<dyn PersonStore>,
    registry: Arc<KnownFaceRegistry>,
    events: Arc<EventLog>,
    escalation: Arc<EmergencyEscalation>,
    cameras: CameraRegistry,
}

impl Sentinel {
    /// 使用 JSON 文件存储启动, 并添加配置中的摄像头
    pub fn bootstrap(
        config: SentinelConfig,
        recognizer: Arc<dyn FaceRecognizer>,
        detector: Arc<dyn ObjectDetector>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.media_root)
            .with_context(|| format!("create media root {}", config.media_root.display()))?;
        let store = Arc::new(JsonStore::open(&config.data_dir)?);
        let sentinel = Self::with_stores(config, store.clone(), store.clone(), store, recognizer, detector)?;

        for cam in sentinel.config.cameras.clone() {
            if let Err(e) = sentinel.add_camera(&cam.id, &cam.label, &cam.source) {
                tracing::warn!("⚠️  启动摄像头 {} 失败: {}", cam.id, e);
            }
        }
        Ok(sentinel)
    }

    /// 指定存储实现组装各服务 (不启动摄像头)
    pub fn with_stores(
        config: SentinelConfig,
        persons: Arc<dyn PersonStore>,
        contacts: Arc<dyn ContactStore>,
        logs: Arc<dyn EventLogStore>,
        recognizer: Arc<dyn FaceRecognizer>,
        detector: Arc<dyn ObjectDetector>,
    ) -> Result<Self> {
        config.print_summary();

        let registry = Arc::new(KnownFaceRegistry::new(
            recognizer.clone(),
            &config.media_root,
            config.embedding_cache_path(),
            config.match_tolerance,
        ));
        registry.reload(persons.as_ref())?;

        let enroller = AutoEnroller::new(persons.clone(), registry.clone(), &config.media_root)?;

        let events = Arc::new(EventLog::new(
            logs,
            &config.media_root,
            config.event_debounce(),
            config.history_len,
            config.stats_policy,
        ));
        let hydrated = events.hydrate()?;
        tracing::info!("📝 已载入最近 {} 条日志", hydrated);

        let escalation = Arc::new(EmergencyEscalation::new(
            contacts,
            AlertTiming {
                refractory: Duration::from_secs(config.alert_refractory_secs),
                connected_after: Duration::from_secs(config.alert_connected_secs),
                reset_after: Duration::from_secs(config.alert_reset_secs),
            },
        ));

        let pipeline: Arc<dyn FramePipeline> = Arc::new(SentinelPipeline::new(
            recognizer,
            detector,
            registry.clone(),
            enroller,
            events.clone(),
            escalation.clone(),
            ThreatTable::new(config.threat_classes.clone()),
            PipelineParams::from_config(&config),
            OverlayRenderer::new(config.font_path.as_deref()),
        ));
        let cameras = CameraRegistry::new(Some(pipeline), RegistryTiming::from_config(&config));

        Ok(Self {
            config,
            persons,
            registry,
            events,
            escalation,
            cameras,
        })
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn registry(&self) -> &KnownFaceRegistry {
        &self.registry
    }

    // ========== 摄像头 ==========

    pub fn add_camera(&self, id: &str, label: &str, source: &SourceSpec) -> Result<AddOutcome, CameraError> {
        self.cameras.add(id, label, source)
    }

    pub fn cameras(&self) -> &CameraRegistry {
        &self.cameras
    }

    pub fn remove_camera(&self, id: &str) -> bool {
        self.cameras.remove(id)
    }

    pub fn set_main(&self, id: &str) -> bool {
        self.cameras.set_main(id)
    }

    pub fn main_camera(&self) -> Option<Arc<Camera>> {
        self.cameras.main_camera()
    }

    pub fn list_cameras(&self) -> Vec<CameraInfo> {
        self.cameras.list()
    }

    /// 设置 ROI: 接受 JSON 文本, `null` 清除
    pub fn set_roi_json(&self, camera_id: &str, json: &str) -> Result<(), RoiError> {
        let value: Value = serde_json::from_str(json).map_err(|e| RoiError::Malformed(e.to_string()))?;
        self.cameras.set_roi(camera_id, &value)
    }

    // ========== 告警与统计 ==========

    /// 手动模拟告警 (演示/测试用)
    pub fn simulate_threat(&self, threat: &str) -> Alert {
        self.events
            .log_event("System", &format!("Simulated: {}", threat), "Medical/Test", None);
        self.escalation.trigger(threat)
    }

    pub fn alert_status(&self) -> AlertStatus {
        self.escalation.status()
    }

    pub fn stats(&self) -> Stats {
        self.events.stats()
    }

    pub fn recent_logs(&self) -> Result<Vec<EventRecord>> {
        self.events.recent_logs(RECENT_LOG_LIMIT)
    }

    pub fn delete_log(&self, id: &str) -> Result<bool> {
        self.events.delete_log(id)
    }

    // ========== 紧急联系人 ==========

    pub fn contacts(&self) -> Result<Vec<ContactRecord>> {
        self.escalation.contacts()
    }

    pub fn add_contact(&self, name: &str, phone: &str, relation: &str) -> Result<String> {
        self.escalation.add_contact(name, phone, relation)
    }

    pub fn delete_contact(&self, id: &str) -> bool {
        self.escalation.delete_contact(id)
    }

    // ========== 人员 ==========

    pub fn persons(&self) -> Result<Vec<PersonRecord>> {
        self.persons.list_persons()
    }

    /// 新增人员 (姓名不区分大小写去重), 可附带一张证件照
    pub fn enroll_person(&self, person: NewPerson, photo: Option<&RgbImage>) -> Result<PersonRecord> {
        let name = person.name.trim();
        if name.is_empty() {
            bail!("person name is empty");
        }
        let existing = self.persons.list_persons()?;
        if existing.iter().any(|p| p.name.eq_ignore_ascii_case(name)) {
            bail!("person {:?} already exists", name);
        }
        let serial_no = existing
            .iter()
            .map(|p| p.serial_no)
            .max()
            .map(|n| n + 1)
            .unwrap_or(FIRST_SERIAL);

        let photo_path = match photo {
            Some(img) => {
                let rel = format!("known/{}_{}.jpg", serial_no, sanitize_name(name));
                self.save_media(img, &rel)?;
                Some(rel)
            }
            None => None,
        };

        let mut record = PersonRecord {
            id: String::new(),
            serial_no,
            name: name.to_string(),
            relation: person.relation,
            phone: person.phone,
            address: person.address,
            photo_path,
            photo_dir: None,
            created_at: Local::now(),
        };
        record.id = self.persons.insert(record.clone())?;
        let faces = self.registry.add_record(&record);
        tracing::info!("🆕 新增人员 #{} {} ({} 张人脸)", serial_no, record.name, faces);
        Ok(record)
    }

    /// 保存多张样本照片到 `known/{serial}_{name}/`, 并刷新该人员的人脸
    pub fn register_samples(&self, serial_no: u32, samples: &[RgbImage]) -> Result<usize> {
        let Some(person) = self.persons.find_by_serial_or_name(Some(serial_no), None)? else {
            bail!("person #{} not found", serial_no);
        };
        let dir = format!("known/{}_{}", serial_no, sanitize_name(&person.name));
        for (i, img) in samples.iter().enumerate() {
            self.save_media(img, &format!("{}/sample_{}.jpg", dir, i + 1))?;
        }

        let update = PersonUpdate {
            photo_dir: Some(dir),
            ..Default::default()
        };
        self.persons.update_fields(&person.id, &update)?;
        let mut updated = person;
        update.apply(&mut updated);

        let faces = self.registry.replace_person(&updated.name, &updated);
        tracing::info!("📸 #{} {}: 保存 {} 张样本, {} 张可用", serial_no, updated.name, samples.len(), faces);
        Ok(faces)
    }

    /// 按编号删除人员 (先删记录, 再移出人脸库)
    pub fn delete_person(&self, serial_no: u32) -> Result<bool> {
        let Some(person) = self.persons.find_by_serial_or_name(Some(serial_no), None)? else {
            return Ok(false);
        };
        if !self.persons.delete(&person.id)? {
            return Ok(false);
        }
        self.registry.remove_person(&person.name);
        tracing::info!("🗑️  删除人员 #{} {}", serial_no, person.name);
        Ok(true)
    }

    /// 更新人员; 姓名/关系/照片变化时重新加入人脸库
    pub fn update_person(&self, serial_no: u32, update: PersonUpdate) -> Result<bool> {
        let Some(person) = self.persons.find_by_serial_or_name(Some(serial_no), None)? else {
            return Ok(false);
        };
        if !self.persons.update_fields(&person.id, &update)? {
            return Ok(false);
        }
        if update.touches_identity() {
            let mut updated = person.clone();
            update.apply(&mut updated);
            self.registry.replace_person(&person.name, &updated);
        }
        Ok(true)
    }

    fn save_media(&self, img: &RgbImage, rel: &str) -> Result<()> {
        let path = self.config.media_root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        img.save(&path).with_context(|| format!("save {}", path.display()))?;
        Ok(())
    }

    /// 停止全部摄像头
    pub fn shutdown(&self) {
        tracing::info!("🛑 正在停止所有摄像头...");
        self.cameras.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::NullDetector;
    use crate::events::StatsPolicy;
    use crate::registry::tests::ColorRecognizer;
    use crate::store::MemoryStore;
    use image::Rgb;

    fn sentinel() -> (Sentinel, Arc<MemoryStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = SentinelConfig {
            media_root: dir.path().join("media"),
            data_dir: dir.path().join("data"),
            stats_policy: StatsPolicy::Incremental,
            startup_grace_ms: 500,
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new());
        let s = Sentinel::with_stores(
            config,
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(ColorRecognizer),
            Arc::new(NullDetector),
        )
        .unwrap();
        (s, store, dir)
    }

    fn person(name: &str, relation: &str) -> NewPerson {
        NewPerson {
            name: name.to_string(),
            relation: relation.to_string(),
            phone: "555".to_string(),
            address: "Main St".to_string(),
        }
    }

    #[test]
    fn test_enroll_person_serials_and_duplicates() {
        let (s, _, _dir) = sentinel();
        let photo = RgbImage::from_pixel(8, 8, Rgb([200, 20, 20]));
        let alice = s.enroll_person(person("Alice", "Family"), Some(&photo)).unwrap();
        assert_eq!(alice.serial_no, 1001);
        assert_eq!(alice.photo_path.as_deref(), Some("known/1001_Alice.jpg"));
        assert_eq!(s.registry().len(), 1);

        let bob = s.enroll_person(person("Bob", "Friend"), None).unwrap();
        assert_eq!(bob.serial_no, 1002);
        assert_eq!(s.registry().len(), 1);

        assert!(s.enroll_person(person("alice", "Family"), None).is_err());
        assert!(s.enroll_person(person("  ", "Family"), None).is_err());
    }

    #[test]
    fn test_register_samples_refreshes_registry() {
        let (s, store, dir) = sentinel();
        let bob = s.enroll_person(person("Bob", "Friend"), None).unwrap();
        let samples = vec![
            RgbImage::from_pixel(8, 8, Rgb([10, 200, 10])),
            RgbImage::from_pixel(8, 8, Rgb([12, 198, 10])),
        ];
        assert_eq!(s.register_samples(bob.serial_no, &samples).unwrap(), 2);
        assert_eq!(s.registry().len(), 2);
        assert!(dir.path().join("media/known/1001_Bob/sample_2.jpg").exists());

        let stored = store.find_by_serial_or_name(Some(1001), None).unwrap().unwrap();
        assert_eq!(stored.photo_dir.as_deref(), Some("known/1001_Bob"));
        assert!(s.register_samples(4242, &samples).is_err());
    }

    #[test]
    fn test_update_and_delete_person_sync_registry() {
        let (s, _, _dir) = sentinel();
        let photo = RgbImage::from_pixel(8, 8, Rgb([200, 20, 20]));
        let alice = s.enroll_person(person("Alice", "Family"), Some(&photo)).unwrap();

        let update = PersonUpdate {
            relation: Some("Suspect".to_string()),
            ..Default::default()
        };
        assert!(s.update_person(alice.serial_no, update).unwrap());
        assert_eq!(s.registry().entries(), vec![("Alice".to_string(), "Suspect".to_string())]);

        assert!(s.delete_person(alice.serial_no).unwrap());
        assert!(s.registry().is_empty());
        assert!(!s.delete_person(alice.serial_no).unwrap());
        assert!(!s.update_person(9999, PersonUpdate::default()).unwrap());
    }

    #[test]
    fn test_simulate_threat_logs_and_alerts() {
        let (s, _, _dir) = sentinel();
        s.add_contact("Mom", "555-0100", "Family").unwrap();

        let alert = s.simulate_threat("Fire");
        assert_eq!(alert.threat, "Fire");
        assert_eq!(alert.calling, "Mom");
        assert!(s.alert_status().is_active());

        let logs = s.recent_logs().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "Simulated: Fire");
        assert_eq!(logs[0].relation, "Medical/Test");
        assert_eq!(s.stats().suspects, 1);

        assert!(s.delete_log(&logs[0].id).unwrap());
        assert!(s.recent_logs().unwrap().is_empty());
    }

    #[test]
    fn test_camera_admin_through_facade() {
        let (s, _, dir) = sentinel();
        let frames = dir.path().join("frames");
        fs::create_dir_all(&frames).unwrap();
        RgbImage::from_pixel(16, 12, Rgb([0, 0, 0])).save(frames.join("f1.png")).unwrap();

        let source = SourceSpec::ImageDir { path: frames.clone() };
        let out = s.add_camera("cam1", "Lobby", &source).unwrap();
        assert_eq!(out.main.as_deref(), Some("cam1"));
        assert!(s.add_camera("cam1", "Lobby", &source).unwrap().already_active);

        s.set_roi_json("cam1", r#"{"circle": [0.5, 0.5, 0.25]}"#).unwrap();
        assert!(matches!(s.set_roi_json("cam1", "{not json"), Err(RoiError::Malformed(_))));
        assert!(matches!(
            s.set_roi_json("cam2", "null"),
            Err(RoiError::CameraNotFound(_))
        ));

        let missing = SourceSpec::ImageDir {
            path: dir.path().join("missing"),
        };
        assert!(matches!(s.add_camera("cam2", "Yard", &missing), Err(CameraError::Open { .. })));

        assert!(s.remove_camera("cam1"));
        assert!(s.list_cameras().is_empty());
        s.shutdown();
    }
}
