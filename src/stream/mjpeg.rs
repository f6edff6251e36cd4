//! MJPEG 输出
//!
//! 每帧封装为:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! \r\n
//! <jpeg bytes>\r\n
//! ```
//!
//! 尽力而为: 只发送最新一帧, 中间帧直接丢弃。

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use crate::camera::Camera;

pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const JPEG_QUALITY: u8 = 80;

/// 无画面时的重试间隔
const RETRY_DELAY: Duration = Duration::from_millis(10);
/// 两帧之间的节拍
const FRAME_PACING: Duration = Duration::from_millis(30);

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode_image(frame)
        .context("jpeg encode")?;
    Ok(bytes)
}

/// 一帧的 multipart 封装
pub fn frame_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(jpeg.len() + PART_HEADER.len() + 2);
    part.extend_from_slice(PART_HEADER);
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// 单个观看者的输出流
pub struct MjpegStream<W: Write> {
    camera: Arc<Camera>,
    writer: W,
    last: Option<Arc<RgbImage>>,
    sent: u64,
}

impl<W: Write> MjpegStream<W> {
    pub fn new(camera: Arc<Camera>, writer: W) -> Self {
        Self {
            camera,
            writer,
            last: None,
            sent: 0,
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// 写出最新合成帧; 尚无画面或画面未更新时返回 Ok(false)
    pub fn write_next(&mut self) -> Result<bool> {
        let Some(frame) = self.camera.read() else {
            return Ok(false);
        };
        if self.last.as_ref().is_some_and(|last| Arc::ptr_eq(last, &frame)) {
            return Ok(false);
        }
        let jpeg = encode_jpeg(&frame, JPEG_QUALITY)?;
        self.writer.write_all(&frame_part(&jpeg)).context("write frame")?;
        self.writer.flush().context("flush frame")?;
        self.last = Some(frame);
        self.sent += 1;
        Ok(true)
    }

    /// 持续推送直到 `stop` 返回 true、写失败或达到 `max_frames`
    pub fn pump(&mut self, max_frames: Option<u64>, stop: impl Fn() -> bool) -> Result<u64> {
        tracing::info!("📺 [{}] MJPEG 输出开始", self.camera.id());
        while !stop() && max_frames.map_or(true, |max| self.sent < max) {
            if self.write_next()? {
                thread::sleep(FRAME_PACING);
            } else {
                thread::sleep(RETRY_DELAY);
            }
        }
        tracing::info!("📺 [{}] MJPEG 输出结束, 共 {} 帧", self.camera.id(), self.sent);
        Ok(self.sent)
    }
}
