//! 摄像头 (Camera)
//!
//! ```text
//! FrameSource ──read──→ [采集线程] ──raw──→ FrameSlot ←──snapshot── [检测线程]
//!                            │                                        │
//!                            └── draw(raw, overlays) ──→ composited   └─→ overlays
//!                                                            │
//!                                                        MJPEG 输出
//! ```
//!
//! 每路摄像头两个线程: 采集线程负责读帧与合成, 检测线程负责推理。
//! 所有共享状态都是"替换整个 Arc"的快照, 锁只保护指针交换,
//! 推理与绘制都在锁外进行。

pub mod capture;
pub mod registry;
pub mod source;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use image::RgbImage;

use crate::detection::pipeline::FramePipeline;
use crate::detection::types::Overlay;
use crate::error::RoiError;
use crate::roi::{RoiMask, RoiShape};

pub use capture::{capture_loop, CaptureTiming};
pub use registry::{AddOutcome, CameraInfo, CameraRegistry, RegistryTiming};
pub use source::{open_source, FrameSource, HttpSnapshotSource, ImageDirSource};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct FrameSlot {
    raw: Option<Arc<RgbImage>>,
    composited: Option<Arc<RgbImage>>,
}

pub struct Camera {
    id: String,
    label: String,
    main: AtomicBool,
    /// 最近一次读帧是否成功
    live: AtomicBool,
    stop: AtomicBool,
    frames: Mutex<FrameSlot>,
    overlays: Mutex<Arc<Vec<Overlay>>>,
    roi: Mutex<Option<Arc<RoiMask>>>,
}

impl Camera {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            main: AtomicBool::new(false),
            live: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            frames: Mutex::new(FrameSlot::default()),
            overlays: Mutex::new(Arc::new(Vec::new())),
            roi: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_main(&self) -> bool {
        self.main.load(Ordering::Acquire)
    }

    pub(crate) fn set_main(&self, main: bool) {
        self.main.store(main, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    // ========== 帧 ==========

    /// 最新合成帧 (含叠加层); 尚无画面时为 None
    pub fn read(&self) -> Option<Arc<RgbImage>> {
        lock(&self.frames).composited.clone()
    }

    /// 最新原始帧 (检测线程使用)
    pub fn raw_frame(&self) -> Option<Arc<RgbImage>> {
        lock(&self.frames).raw.clone()
    }

    /// 采集线程写入新帧: 保存原始帧, 分辨率变化时重建 ROI, 再合成叠加层
    pub fn store_frame(&self, frame: RgbImage, pipeline: Option<&dyn FramePipeline>) {
        let dims = frame.dimensions();
        let raw = Arc::new(frame);
        lock(&self.frames).raw = Some(raw.clone());

        let roi = self.refresh_roi(dims);
        let composited = match pipeline {
            Some(pipeline) => {
                let overlays = self.overlays();
                Arc::new(pipeline.draw(raw.as_ref().clone(), &overlays, roi.as_deref()))
            }
            None => raw,
        };
        lock(&self.frames).composited = Some(composited);
    }

    fn refresh_roi(&self, dims: (u32, u32)) -> Option<Arc<RoiMask>> {
        let current = self.roi()?;
        if current.dimensions() == dims {
            return Some(current);
        }
        match current.rebuild(dims.0, dims.1) {
            Ok(rebuilt) => {
                tracing::info!("🔍 [{}] 分辨率变为 {}x{}, ROI掩膜已重建", self.id, dims.0, dims.1);
                let rebuilt = Arc::new(rebuilt);
                *lock(&self.roi) = Some(rebuilt.clone());
                Some(rebuilt)
            }
            Err(e) => {
                tracing::warn!("⚠️  [{}] ROI重建失败: {}", self.id, e);
                Some(current)
            }
        }
    }

    // ========== 叠加层 ==========

    pub fn overlays(&self) -> Arc<Vec<Overlay>> {
        lock(&self.overlays).clone()
    }

    /// 整体替换叠加层
    pub fn publish_overlays(&self, overlays: Vec<Overlay>) {
        *lock(&self.overlays) = Arc::new(overlays);
    }

    // ========== ROI ==========

    pub fn roi(&self) -> Option<Arc<RoiMask>> {
        lock(&self.roi).clone()
    }

    /// 设置或清除 ROI; 掩膜按当前画面分辨率栅格化
    pub fn set_roi(&self, shape: Option<RoiShape>) -> Result<(), RoiError> {
        let Some(shape) = shape else {
            *lock(&self.roi) = None;
            tracing::info!("🎯 [{}] ROI已清除", self.id);
            return Ok(());
        };
        let (w, h) = self
            .raw_frame()
            .map(|f| f.dimensions())
            .ok_or_else(|| RoiError::NoFrame(self.id.clone()))?;
        let mask = RoiMask::new(w, h, shape)?;
        *lock(&self.roi) = Some(Arc::new(mask));
        tracing::info!("🎯 [{}] ROI已更新 ({}x{})", self.id, w, h);
        Ok(())
    }
}
