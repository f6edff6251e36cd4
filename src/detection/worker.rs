//! 检测线程: 取最新原始帧 → 流水线推理 → 整体替换叠加层
//!
//! 推理失败只记录日志, 上一轮的叠加层保留不动。

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use super::pipeline::FramePipeline;
use crate::camera::capture::sleep_unless_stopped;
use crate::camera::Camera;

/// 检测循环 (阻塞, 运行在独立线程)
pub fn detection_loop(camera: Arc<Camera>, pipeline: Arc<dyn FramePipeline>, interval: Duration, _done: Sender<()>) {
    tracing::info!("🔍 [{}] 检测线程启动 (间隔 {}ms)", camera.id(), interval.as_millis());

    let mut cycles = 0u64;
    let mut errors = 0u64;
    let mut fps_timer = Instant::now();

    while !camera.should_stop() {
        let started = Instant::now();

        let Some(frame) = camera.raw_frame() else {
            sleep_unless_stopped(&camera, Duration::from_millis(10));
            continue;
        };
        let roi = camera.roi();

        match pipeline.detect(&frame, roi.as_deref()) {
            Ok(overlays) => {
                tracing::trace!("[{}] 检测完成: {} 个叠加层, 耗时 {:?}", camera.id(), overlays.len(), started.elapsed());
                camera.publish_overlays(overlays);
            }
            Err(e) => {
                errors += 1;
                if errors == 1 || errors % 30 == 0 {
                    tracing::warn!("⚠️  [{}] 检测失败 (第 {} 次), 保留上一轮结果: {}", camera.id(), errors, e);
                }
            }
        }

        cycles += 1;
        if cycles % 30 == 0 {
            let elapsed = fps_timer.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                tracing::debug!("📊 [{}] 检测 FPS: {:.1}", camera.id(), 30.0 / elapsed);
            }
            fps_timer = Instant::now();
        }

        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            sleep_unless_stopped(&camera, rest);
        }
    }

    tracing::info!("🗑️  [{}] 检测线程退出 (共 {} 轮)", camera.id(), cycles);
}
