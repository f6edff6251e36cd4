//! 检测流水线 (人脸识别 + 威胁物品 + 打架)
//!
//! ```text
//! 原图 ─(ROI掩膜)→ 副本 ─(缩放 0.5)→ 推理
//!                                     ├─ 人脸: 定位 → 特征 → 人脸库匹配 / 自动登记
//!                                     ├─ 物体: 威胁表 → THREAT 框
//!                                     └─ 人体: 两两 IoU → VIOLENCE 框
//! 坐标 ×(1/0.5) 还原到原图 → 叠加层 + 日志 + 告警
//! ```
//!
//! 推理全部完成后才产生副作用 (日志/告警/登记), 任一适配器失败则本轮作废。

use std::sync::Arc;

use fast_image_resize as fr;
use image::{imageops, RgbImage};

use super::adapter::{Embedding, FaceRecognizer, ObjectDetector};
use super::enroll::AutoEnroller;
use super::threat::{ThreatTable, PERSON_CLASS};
use super::types::{BBox, Overlay, COLOR_KNOWN, COLOR_SUSPECT, COLOR_THREAT, COLOR_UNKNOWN, COLOR_VIOLENCE};
use super::violence::violent_pairs;
use crate::config::SentinelConfig;
use crate::error::PipelineError;
use crate::escalation::EmergencyEscalation;
use crate::events::EventLog;
use crate::registry::KnownFaceRegistry;
use crate::render::OverlayRenderer;
use crate::roi::RoiMask;

/// 摄像头线程使用的两阶段接口: 检测线程调 detect, 合成线程调 draw
pub trait FramePipeline: Send + Sync {
    fn detect(&self, frame: &RgbImage, roi: Option<&RoiMask>) -> Result<Vec<Overlay>, PipelineError>;
    fn draw(&self, frame: RgbImage, overlays: &[Overlay], roi: Option<&RoiMask>) -> RgbImage;
}

/// 推理参数
#[derive(Debug, Clone, Copy)]
pub struct PipelineParams {
    pub downscale: f32,
    pub iou_threshold: f32,
    pub conf_threshold: f32,
    pub violence_iou: f32,
}

impl PipelineParams {
    pub fn from_config(config: &SentinelConfig) -> Self {
        Self {
            downscale: config.downscale.clamp(0.05, 1.0),
            iou_threshold: config.detector_iou_threshold,
            conf_threshold: config.detector_conf_threshold,
            violence_iou: config.violence_iou_threshold,
        }
    }
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self::from_config(&SentinelConfig::default())
    }
}

/// 缩放 (fast_image_resize, 双线性)
pub fn downscale(frame: &RgbImage, factor: f32) -> Result<RgbImage, PipelineError> {
    if (factor - 1.0).abs() < f32::EPSILON {
        return Ok(frame.clone());
    }
    let w = ((frame.width() as f32 * factor).round() as u32).max(1);
    let h = ((frame.height() as f32 * factor).round() as u32).max(1);

    let src = fr::images::ImageRef::new(frame.width(), frame.height(), frame.as_raw(), fr::PixelType::U8x3)
        .map_err(|e| PipelineError::Resize(e.to_string()))?;
    let mut dst = fr::images::Image::new(w, h, fr::PixelType::U8x3);
    let options = fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
    fr::Resizer::new()
        .resize(&src, &mut dst, Some(&options))
        .map_err(|e| PipelineError::Resize(e.to_string()))?;

    RgbImage::from_raw(w, h, dst.into_vec()).ok_or_else(|| PipelineError::Resize("buffer size mismatch".to_string()))
}

fn crop(frame: &RgbImage, bbox: &BBox) -> Option<RgbImage> {
    let (x, y, w, h) = bbox.clip_to(frame.width(), frame.height())?;
    Some(imageops::crop_imm(frame, x, y, w, h).to_image())
}

fn is_suspect(relation: &str) -> bool {
    relation.to_lowercase().contains("suspect")
}

pub struct SentinelPipeline {
    recognizer: Arc<dyn FaceRecognizer>,
    detector: Arc<dyn ObjectDetector>,
    registry: Arc<KnownFaceRegistry>,
    enroller: AutoEnroller,
    events: Arc<EventLog>,
    escalation: Arc<EmergencyEscalation>,
    threats: ThreatTable,
    params: PipelineParams,
    renderer: OverlayRenderer,
}

impl SentinelPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        recognizer: Arc<dyn FaceRecognizer>,
        detector: Arc<dyn ObjectDetector>,
        registry: Arc<KnownFaceRegistry>,
        enroller: AutoEnroller,
        events: Arc<EventLog>,
        escalation: Arc<EmergencyEscalation>,
        threats: ThreatTable,
        params: PipelineParams,
        renderer: OverlayRenderer,
    ) -> Self {
        Self {
            recognizer,
            detector,
            registry,
            enroller,
            events,
            escalation,
            threats,
            params,
            renderer,
        }
    }

    pub fn enroller(&self) -> &AutoEnroller {
        &self.enroller
    }

    /// 人脸匹配, 未匹配则自动登记
    fn identify(&self, frame: &RgbImage, face: &BBox, embedding: Embedding) -> (String, String) {
        if let Some(hit) = self.registry.match_face(&embedding) {
            return hit;
        }
        match self.enroller.enroll(frame, face, embedding) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!("⚠️  自动登记失败: {:#}", e);
                ("Unknown".to_string(), "Stranger".to_string())
            }
        }
    }

    fn face_overlays(&self, frame: &RgbImage, faces: Vec<(BBox, Embedding)>, overlays: &mut Vec<Overlay>) {
        for (face, embedding) in faces {
            let (name, relation) = self.identify(frame, &face, embedding);
            let suspect = is_suspect(&relation);
            if suspect {
                self.escalation.trigger("Known Suspect");
            }
            self.events.log_event(&name, "Detected", &relation, crop(frame, &face).as_ref());

            let color = if suspect {
                COLOR_SUSPECT
            } else if name.starts_with("Unknown") {
                COLOR_UNKNOWN
            } else {
                COLOR_KNOWN
            };
            overlays.push(Overlay::from_bbox(&face, color, format!("{} ({})", name, relation), 2, true));
        }
    }
}

impl FramePipeline for SentinelPipeline {
    fn detect(&self, frame: &RgbImage, roi: Option<&RoiMask>) -> Result<Vec<Overlay>, PipelineError> {
        // 1. ROI 只作用于检测副本
        let mut masked = frame.clone();
        if let Some(roi) = roi {
            roi.apply(&mut masked);
        }

        // 2. 缩放推理
        let small = downscale(&masked, self.params.downscale)?;
        let back = frame.width() as f32 / small.width() as f32;

        let locations = self.recognizer.locate_faces(&small).map_err(PipelineError::Recognizer)?;
        let embeddings = if locations.is_empty() {
            Vec::new()
        } else {
            self.recognizer
                .embed_faces(&small, &locations)
                .map_err(PipelineError::Recognizer)?
        };
        let detections = self
            .detector
            .detect_objects(&small, self.params.iou_threshold, self.params.conf_threshold)
            .map_err(PipelineError::Detector)?;

        // 3. 坐标还原到原图
        let faces: Vec<(BBox, Embedding)> = locations
            .iter()
            .map(|b| b.scale(back))
            .zip(embeddings)
            .collect();

        let mut overlays = Vec::new();
        self.face_overlays(frame, faces, &mut overlays);

        // 4. 威胁物品
        let mut persons = Vec::new();
        for det in &detections {
            let bbox = det.bbox.scale(back);
            if det.class_id == PERSON_CLASS {
                persons.push(bbox);
                continue;
            }
            let Some(label) = self.threats.label(det.class_id) else {
                continue;
            };
            self.escalation.trigger(&format!("Weapon ({})", label));
            self.events
                .log_event("System", &format!("Weapon: {}", label), "Suspect", crop(frame, &bbox).as_ref());
            overlays.push(Overlay::from_bbox(&bbox, COLOR_THREAT, format!("THREAT: {}", label), 3, false));
        }

        // 5. 打架
        for area in violent_pairs(&persons, self.params.violence_iou) {
            self.events
                .log_event("System", "Violence Detected", "Suspect", crop(frame, &area).as_ref());
            self.escalation.trigger("Violence / Fighting");
            overlays.push(Overlay::from_bbox(&area, COLOR_VIOLENCE, "VIOLENCE DETECTED", 4, false));
        }

        Ok(overlays)
    }

    fn draw(&self, frame: RgbImage, overlays: &[Overlay], roi: Option<&RoiMask>) -> RgbImage {
        self.renderer.draw(frame, overlays, roi)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detection::adapter::NullDetector;
    use crate::detection::types::RawDetection;
    use crate::escalation::AlertTiming;
    use crate::events::StatsPolicy;
    use crate::registry::tests::ColorRecognizer;
    use crate::store::{EventLogStore, EventQuery, MemoryStore};
    use anyhow::{anyhow, Result};
    use image::Rgb;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// 固定输出的检测器 (推理分辨率坐标), 可切换为失败
    pub(crate) struct ScriptedDetector {
        pub detections: Vec<RawDetection>,
        pub fail: AtomicBool,
    }

    impl ObjectDetector for ScriptedDetector {
        fn detect_objects(&self, _image: &RgbImage, _iou: f32, _conf: f32) -> Result<Vec<RawDetection>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("model crashed"));
            }
            Ok(self.detections.clone())
        }
    }

    pub(crate) struct Harness {
        pub pipeline: SentinelPipeline,
        pub registry: Arc<KnownFaceRegistry>,
        pub store: Arc<MemoryStore>,
        pub escalation: Arc<EmergencyEscalation>,
        pub _dir: tempfile::TempDir,
    }

    pub(crate) fn harness(detector: Arc<dyn ObjectDetector>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let recognizer: Arc<dyn FaceRecognizer> = Arc::new(ColorRecognizer);
        let registry = Arc::new(KnownFaceRegistry::new(
            recognizer.clone(),
            dir.path(),
            dir.path().join("cache.json"),
            0.55,
        ));
        let enroller = AutoEnroller::new(store.clone(), registry.clone(), dir.path()).unwrap();
        let events = Arc::new(EventLog::new(
            store.clone(),
            dir.path(),
            Duration::from_secs(3),
            20,
            StatsPolicy::Incremental,
        ));
        let escalation = Arc::new(EmergencyEscalation::new(store.clone(), AlertTiming::default()));
        let pipeline = SentinelPipeline::new(
            recognizer,
            detector,
            registry.clone(),
            enroller,
            events,
            escalation.clone(),
            ThreatTable::default(),
            PipelineParams::default(),
            OverlayRenderer::without_font(),
        );
        Harness {
            pipeline,
            registry,
            store,
            escalation,
            _dir: dir,
        }
    }

    fn logs(store: &MemoryStore) -> Vec<String> {
        store
            .query(&EventQuery::default())
            .unwrap()
            .into_iter()
            .map(|r| format!("{}|{}", r.name, r.action))
            .collect()
    }

    #[test]
    fn test_downscale_half() {
        let frame = RgbImage::from_pixel(64, 48, Rgb([10, 20, 30]));
        let small = downscale(&frame, 0.5).unwrap();
        assert_eq!(small.dimensions(), (32, 24));
        let px = small.get_pixel(5, 5).0;
        for (got, want) in px.iter().zip([10u8, 20, 30]) {
            assert!((*got as i32 - want as i32).abs() <= 1);
        }
    }

    #[test]
    fn test_known_face_green_overlay() {
        let h = harness(Arc::new(NullDetector));
        h.registry
            .enroll(Embedding::new(vec![200.0 / 255.0, 0.0, 0.0]), "Alice", "Family");

        let frame = RgbImage::from_pixel(64, 64, Rgb([200, 0, 0]));
        let overlays = h.pipeline.detect(&frame, None).unwrap();
        assert_eq!(overlays.len(), 1);
        let o = &overlays[0];
        assert_eq!(o.label, "Alice (Family)");
        assert_eq!(o.color, COLOR_KNOWN);
        assert!(o.filled_label);
        // 坐标还原到原图尺寸
        assert_eq!((o.left, o.top, o.right, o.bottom), (0, 0, 64, 64));
        assert_eq!(h.registry.len(), 1);
        assert!(!h.escalation.status().is_active());
    }

    #[test]
    fn test_unknown_face_auto_enrolled() {
        let h = harness(Arc::new(NullDetector));
        let frame = RgbImage::from_pixel(64, 64, Rgb([0, 0, 200]));

        let overlays = h.pipeline.detect(&frame, None).unwrap();
        assert_eq!(overlays[0].label, "Unknown 1 (Auto-Detected)");
        assert_eq!(overlays[0].color, COLOR_UNKNOWN);
        assert_eq!(h.registry.len(), 1);
        assert_eq!(h.pipeline.enroller().next_id(), 2);

        // 第二次出现: 已在人脸库中, 不再登记
        h.pipeline.detect(&frame, None).unwrap();
        assert_eq!(h.registry.len(), 1);
        assert_eq!(logs(&h.store), vec!["Unknown 1|Detected"]);
    }

    #[test]
    fn test_suspect_face_orange_and_alert() {
        let h = harness(Arc::new(NullDetector));
        h.registry
            .enroll(Embedding::new(vec![0.0, 200.0 / 255.0, 0.0]), "Mallory", "Known Suspect");
        let frame = RgbImage::from_pixel(32, 32, Rgb([0, 200, 0]));

        let overlays = h.pipeline.detect(&frame, None).unwrap();
        assert_eq!(overlays[0].color, COLOR_SUSPECT);
        match h.escalation.status() {
            crate::escalation::AlertStatus::Active(a) => assert_eq!(a.threat, "Known Suspect"),
            other => panic!("expected alert, got {:?}", other),
        }
    }

    #[test]
    fn test_threat_and_violence() {
        let detector = ScriptedDetector {
            detections: vec![
                RawDetection {
                    class_id: 43,
                    bbox: BBox::new(2.0, 2.0, 6.0, 6.0),
                    confidence: 0.9,
                },
                RawDetection {
                    class_id: PERSON_CLASS,
                    bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
                    confidence: 0.9,
                },
                RawDetection {
                    class_id: PERSON_CLASS,
                    bbox: BBox::new(1.0, 1.0, 9.0, 9.0),
                    confidence: 0.8,
                },
                // 不在威胁表中
                RawDetection {
                    class_id: 56,
                    bbox: BBox::new(0.0, 0.0, 3.0, 3.0),
                    confidence: 0.8,
                },
            ],
            fail: AtomicBool::new(false),
        };
        let h = harness(Arc::new(detector));
        // 黑图: ColorRecognizer 不返回人脸
        let frame = RgbImage::new(40, 40);

        let overlays = h.pipeline.detect(&frame, None).unwrap();
        assert_eq!(overlays.len(), 2);
        assert_eq!(overlays[0].label, "THREAT: Knife");
        assert_eq!(overlays[0].thickness, 3);
        assert_eq!((overlays[0].left, overlays[0].right), (4, 12));
        assert_eq!(overlays[1].label, "VIOLENCE DETECTED");
        assert_eq!(overlays[1].color, COLOR_VIOLENCE);
        assert_eq!((overlays[1].left, overlays[1].top, overlays[1].right, overlays[1].bottom), (0, 0, 20, 20));

        let mut entries = logs(&h.store);
        entries.sort();
        assert_eq!(entries, vec!["System|Violence Detected", "System|Weapon: Knife"]);
        // 防抖窗口内只有第一次触发生效
        match h.escalation.status() {
            crate::escalation::AlertStatus::Active(a) => assert_eq!(a.threat, "Weapon (Knife)"),
            other => panic!("expected alert, got {:?}", other),
        }
    }

    #[test]
    fn test_detector_failure_has_no_side_effects() {
        let detector = Arc::new(ScriptedDetector {
            detections: Vec::new(),
            fail: AtomicBool::new(true),
        });
        let h = harness(detector);
        let frame = RgbImage::from_pixel(32, 32, Rgb([0, 0, 200]));

        assert!(matches!(h.pipeline.detect(&frame, None), Err(PipelineError::Detector(_))));
        assert!(h.registry.is_empty());
        assert!(logs(&h.store).is_empty());
    }

    #[test]
    fn test_roi_masks_detection_input() {
        let h = harness(Arc::new(NullDetector));
        let frame = RgbImage::from_pixel(32, 32, Rgb([0, 0, 200]));
        // ROI 在右下角, 左上角像素被置黑 → ColorRecognizer 认为没有人脸
        let roi = RoiMask::new(32, 32, crate::roi::RoiShape::Rect([0.5, 0.5, 0.5, 0.5])).unwrap();
        assert!(h.pipeline.detect(&frame, Some(&roi)).unwrap().is_empty());
        // 原图不受影响
        assert_eq!(frame.get_pixel(0, 0).0, [0, 0, 200]);
    }
}
