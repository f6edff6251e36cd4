//! 摄像头管理: 添加 / 移除 / 主画面 / ROI
//!
//! 登记表由一把锁保护, 只在读写登记表时持有; 停止线程和等待首帧都在锁外进行。
//! 采集与检测线程不会获取这把锁。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use serde_json::Value;

use super::capture::{capture_loop, CaptureTiming};
use super::source::{open_source, FrameSource};
use super::Camera;
use crate::config::{SentinelConfig, SourceSpec};
use crate::detection::pipeline::FramePipeline;
use crate::detection::worker::detection_loop;
use crate::error::{CameraError, RoiError};
use crate::roi::RoiShape;

#[derive(Debug, Clone, Copy)]
pub struct RegistryTiming {
    pub capture: CaptureTiming,
    pub detect_interval: Duration,
    /// 添加摄像头后等待首帧的时长
    pub startup_grace: Duration,
    /// 停止时等待线程退出的上限
    pub stop_timeout: Duration,
}

impl RegistryTiming {
    pub fn from_config(config: &SentinelConfig) -> Self {
        Self {
            capture: CaptureTiming {
                interval: config.capture_interval(),
                backoff: config.reopen_backoff(),
            },
            detect_interval: config.detect_interval(),
            startup_grace: config.startup_grace(),
            stop_timeout: config.stop_timeout(),
        }
    }
}

impl Default for RegistryTiming {
    fn default() -> Self {
        Self {
            capture: CaptureTiming::default(),
            detect_interval: Duration::from_millis(80),
            startup_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(1),
        }
    }
}

/// 添加结果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AddOutcome {
    pub id: String,
    /// 已在运行, 未重新打开
    pub already_active: bool,
    pub main: Option<String>,
}

/// 摄像头列表项
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CameraInfo {
    pub id: String,
    pub label: String,
    pub main: bool,
    pub live: bool,
}

struct CameraHandle {
    camera: Arc<Camera>,
    threads: Vec<JoinHandle<()>>,
    /// 所有线程退出后断开
    done: Receiver<()>,
}

#[derive(Default)]
struct Inner {
    /// 按添加顺序
    cameras: Vec<CameraHandle>,
    main: Option<String>,
}

impl Inner {
    fn position(&self, id: &str) -> Option<usize> {
        self.cameras.iter().position(|h| h.camera.id() == id)
    }

    fn set_main(&mut self, id: Option<String>) {
        for h in &self.cameras {
            h.camera.set_main(Some(h.camera.id()) == id.as_deref());
        }
        self.main = id;
    }
}

pub struct CameraRegistry {
    inner: Mutex<Inner>,
    pipeline: Option<Arc<dyn FramePipeline>>,
    timing: RegistryTiming,
}

impl CameraRegistry {
    /// `pipeline` 为 None 时只采集不检测
    pub fn new(pipeline: Option<Arc<dyn FramePipeline>>, timing: RegistryTiming) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            pipeline,
            timing,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 按配置打开视频源并添加
    pub fn add(&self, id: &str, label: &str, spec: &SourceSpec) -> Result<AddOutcome, CameraError> {
        {
            let inner = self.inner();
            if let Some(idx) = inner.position(id) {
                if inner.cameras[idx].camera.is_live() {
                    return Ok(AddOutcome {
                        id: id.to_string(),
                        already_active: true,
                        main: inner.main.clone(),
                    });
                }
            }
        }
        let source = open_source(spec).map_err(|e| CameraError::Open {
            id: id.to_string(),
            reason: format!("{:#}", e),
        })?;
        self.add_source(id, label, source)
    }

    /// 添加摄像头: 已在运行则直接返回; 旧实例已失效则替换
    ///
    /// 停止旧实例和等待首帧都不持有登记锁, 期间 `get`/`list` 不受影响
    pub fn add_source(&self, id: &str, label: &str, source: Box<dyn FrameSource>) -> Result<AddOutcome, CameraError> {
        let stale = {
            let mut inner = self.inner();
            match inner.position(id) {
                Some(idx) if inner.cameras[idx].camera.is_live() => {
                    tracing::info!("📷 [{}] 已在运行", id);
                    return Ok(AddOutcome {
                        id: id.to_string(),
                        already_active: true,
                        main: inner.main.clone(),
                    });
                }
                Some(idx) => {
                    tracing::info!("🔄 [{}] 旧实例已失效, 替换", id);
                    Some(inner.cameras.remove(idx))
                }
                None => None,
            }
        };
        if let Some(stale) = stale {
            self.stop_handle(stale);
        }

        let handle = self.spawn(id, label, source);
        if !wait_first_frame(&handle.camera, self.timing.startup_grace) {
            tracing::warn!("❌ [{}] {}ms 内无画面, 放弃", id, self.timing.startup_grace.as_millis());
            self.stop_handle(handle);
            let mut inner = self.inner();
            if inner.main.as_deref() == Some(id) && inner.position(id).is_none() {
                let next = inner.cameras.first().map(|h| h.camera.id().to_string());
                inner.set_main(next);
            }
            return Err(CameraError::NoSignal(id.to_string()));
        }

        let mut inner = self.inner();
        if inner.position(id).is_some() {
            // 等待首帧期间已被另一个请求添加
            let main = inner.main.clone();
            drop(inner);
            tracing::info!("📷 [{}] 已由并发请求添加, 丢弃本次实例", id);
            self.stop_handle(handle);
            return Ok(AddOutcome {
                id: id.to_string(),
                already_active: true,
                main,
            });
        }

        inner.cameras.push(handle);
        if inner.main.is_none() || inner.main.as_deref() == Some(id) {
            inner.set_main(Some(id.to_string()));
        } else {
            let main = inner.main.clone();
            inner.set_main(main);
        }
        tracing::info!("✅ [{}] 摄像头已添加: {} (主画面: {:?})", id, label, inner.main);

        Ok(AddOutcome {
            id: id.to_string(),
            already_active: false,
            main: inner.main.clone(),
        })
    }

    fn spawn(&self, id: &str, label: &str, source: Box<dyn FrameSource>) -> CameraHandle {
        let camera = Arc::new(Camera::new(id, label));
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let mut threads = Vec::with_capacity(2);

        {
            let camera = camera.clone();
            let pipeline = self.pipeline.clone();
            let timing = self.timing.capture;
            let done = done_tx.clone();
            threads.push(thread::spawn(move || capture_loop(camera, source, pipeline, timing, done)));
        }
        if let Some(pipeline) = self.pipeline.clone() {
            let camera = camera.clone();
            let interval = self.timing.detect_interval;
            let done = done_tx.clone();
            threads.push(thread::spawn(move || detection_loop(camera, pipeline, interval, done)));
        }
        drop(done_tx);

        CameraHandle {
            camera,
            threads,
            done: done_rx,
        }
    }

    /// 通知线程退出并限时等待; 超时则放弃等待 (线程退出时自行释放视频源)
    fn stop_handle(&self, handle: CameraHandle) {
        let CameraHandle { camera, threads, done } = handle;
        camera.request_stop();
        match done.recv_timeout(self.timing.stop_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "⚠️  [{}] 线程未在 {}ms 内退出, 不再等待",
                    camera.id(),
                    self.timing.stop_timeout.as_millis()
                );
            }
            _ => {
                for t in threads {
                    if t.join().is_err() {
                        tracing::error!("❌ [{}] 工作线程 panic", camera.id());
                    }
                }
                tracing::info!("🗑️  [{}] 已停止", camera.id());
            }
        }
    }

    /// 移除摄像头; 被移除的是主画面时由剩余第一路接替
    pub fn remove(&self, id: &str) -> bool {
        let handle = {
            let mut inner = self.inner();
            let Some(idx) = inner.position(id) else {
                return false;
            };
            let handle = inner.cameras.remove(idx);
            if inner.main.as_deref() == Some(id) {
                let next = inner.cameras.first().map(|h| h.camera.id().to_string());
                if let Some(next) = &next {
                    tracing::info!("🎯 主画面切换到 [{}]", next);
                }
                inner.set_main(next);
            }
            handle
        };
        self.stop_handle(handle);
        true
    }

    pub fn set_main(&self, id: &str) -> bool {
        let mut inner = self.inner();
        if inner.position(id).is_none() {
            return false;
        }
        inner.set_main(Some(id.to_string()));
        tracing::info!("🎯 主画面: [{}]", id);
        true
    }

    pub fn main_id(&self) -> Option<String> {
        self.inner().main.clone()
    }

    /// 设置 ROI (JSON 形状, null 清除)
    pub fn set_roi(&self, id: &str, shape: &Value) -> Result<(), RoiError> {
        let inner = self.inner();
        let idx = inner
            .position(id)
            .ok_or_else(|| RoiError::CameraNotFound(id.to_string()))?;
        let shape = RoiShape::from_value(shape)?;
        inner.cameras[idx].camera.set_roi(shape)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Camera>> {
        let inner = self.inner();
        inner.position(id).map(|idx| inner.cameras[idx].camera.clone())
    }

    pub fn main_camera(&self) -> Option<Arc<Camera>> {
        let inner = self.inner();
        let main = inner.main.as_deref()?;
        inner.position(main).map(|idx| inner.cameras[idx].camera.clone())
    }

    pub fn list(&self) -> Vec<CameraInfo> {
        self.inner()
            .cameras
            .iter()
            .map(|h| CameraInfo {
                id: h.camera.id().to_string(),
                label: h.camera.label().to_string(),
                main: h.camera.is_main(),
                live: h.camera.is_live(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner().cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 停止全部摄像头
    pub fn shutdown(&self) {
        let handles: Vec<CameraHandle> = {
            let mut inner = self.inner();
            inner.main = None;
            inner.cameras.drain(..).collect()
        };
        for h in handles {
            self.stop_handle(h);
        }
    }
}

impl Drop for CameraRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wait_first_frame(camera: &Camera, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if camera.read().is_some() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
