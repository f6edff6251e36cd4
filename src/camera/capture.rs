//! 采集线程: 读帧 → 写入原始帧 → 合成叠加层
//!
//! 读帧失败时标记离线, 退避后重新打开视频源; 退出时释放视频源。

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use super::source::FrameSource;
use super::Camera;
use crate::detection::pipeline::FramePipeline;

#[derive(Debug, Clone, Copy)]
pub struct CaptureTiming {
    /// 两次读帧之间的最小间隔
    pub interval: Duration,
    /// 读帧失败后重连前的等待
    pub backoff: Duration,
}

impl Default for CaptureTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(33),
            backoff: Duration::from_millis(500),
        }
    }
}

/// 分段睡眠, 收到停止信号后尽快返回
pub(crate) fn sleep_unless_stopped(camera: &Camera, total: Duration) {
    let step = Duration::from_millis(10);
    let deadline = Instant::now() + total;
    while !camera.should_stop() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(step.min(deadline - now));
    }
}

/// 采集循环 (阻塞, 运行在独立线程)
///
/// `_done` 在线程退出时随闭包一起释放, 管理方据此判断线程已结束
pub fn capture_loop(
    camera: Arc<Camera>,
    mut source: Box<dyn FrameSource>,
    pipeline: Option<Arc<dyn FramePipeline>>,
    timing: CaptureTiming,
    _done: Sender<()>,
) {
    tracing::info!("🎥 [{}] 采集线程启动: {}", camera.id(), source.describe());

    let mut frame_count = 0u64;
    let mut failures = 0u64;
    let mut fps_timer = Instant::now();

    while !camera.should_stop() {
        let started = Instant::now();

        match source.read() {
            Ok(frame) => {
                if failures > 0 {
                    tracing::info!("✅ [{}] 画面恢复 (失败 {} 次后)", camera.id(), failures);
                    failures = 0;
                }
                camera.set_live(true);
                camera.store_frame(frame, pipeline.as_deref());

                frame_count += 1;
                if frame_count % 30 == 0 {
                    let elapsed = fps_timer.elapsed().as_secs_f64();
                    if elapsed > 0.0 {
                        tracing::debug!("📊 [{}] 采集 FPS: {:.1}", camera.id(), 30.0 / elapsed);
                    }
                    fps_timer = Instant::now();
                }
            }
            Err(e) => {
                camera.set_live(false);
                failures += 1;
                if failures == 1 || failures % 30 == 0 {
                    tracing::warn!("⚠️  [{}] 读帧失败 (第 {} 次): {:#}", camera.id(), failures, e);
                }
                sleep_unless_stopped(&camera, timing.backoff);
                if camera.should_stop() {
                    break;
                }
                if let Err(e) = source.reopen() {
                    tracing::debug!("[{}] 重新打开失败: {:#}", camera.id(), e);
                }
                continue;
            }
        }

        if let Some(rest) = timing.interval.checked_sub(started.elapsed()) {
            sleep_unless_stopped(&camera, rest);
        }
    }

    camera.set_live(false);
    drop(source);
    tracing::info!("🗑️  [{}] 采集线程退出, 视频源已释放 (共 {} 帧)", camera.id(), frame_count);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::tests::{green_box, FixedPipeline};
    use crate::detection::types::COLOR_KNOWN;
    use anyhow::{anyhow, Result};
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 按脚本返回帧或失败的视频源
    pub(crate) struct ScriptedSource {
        pub fail_first: usize,
        pub reads: Arc<AtomicUsize>,
        pub reopens: Arc<AtomicUsize>,
        pub dropped: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        pub fn failing_first(fail_first: usize) -> Self {
            Self {
                fail_first,
                reads: Arc::new(AtomicUsize::new(0)),
                reopens: Arc::new(AtomicUsize::new(0)),
                dropped: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn healthy() -> Self {
            Self::failing_first(0)
        }

        pub fn dead() -> Self {
            Self::failing_first(usize::MAX)
        }
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<RgbImage> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(anyhow!("no signal"));
            }
            Ok(RgbImage::new(32, 24))
        }

        fn reopen(&mut self) -> Result<()> {
            self.reopens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast() -> CaptureTiming {
        CaptureTiming {
            interval: Duration::from_millis(5),
            backoff: Duration::from_millis(5),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_capture_composites_and_releases_source() {
        let camera = Arc::new(Camera::new("cam1", "Lobby"));
        camera.publish_overlays(vec![green_box()]);
        let source = ScriptedSource::healthy();
        let dropped = source.dropped.clone();
        let pipeline: Arc<dyn FramePipeline> = Arc::new(FixedPipeline::new(vec![]));
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);

        let cam = camera.clone();
        let handle = thread::spawn(move || capture_loop(cam, Box::new(source), Some(pipeline), fast(), tx));

        assert!(wait_for(|| camera.read().is_some()));
        assert!(camera.is_live());
        assert_eq!(*camera.read().unwrap().get_pixel(2, 5), COLOR_KNOWN);

        camera.request_stop();
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());
        handle.join().unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(!camera.is_live());
    }

    #[test]
    fn test_capture_reopens_after_failures() {
        let camera = Arc::new(Camera::new("cam2", "Yard"));
        let source = ScriptedSource::failing_first(3);
        let reopens = source.reopens.clone();
        let (tx, _rx) = crossbeam_channel::bounded::<()>(0);

        let cam = camera.clone();
        let handle = thread::spawn(move || capture_loop(cam, Box::new(source), None, fast(), tx));

        assert!(wait_for(|| camera.raw_frame().is_some()));
        assert_eq!(reopens.load(Ordering::SeqCst), 3);

        camera.request_stop();
        handle.join().unwrap();
    }
}
