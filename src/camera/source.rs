//! 视频源
//!
//! - ImageDirSource: 循环读取目录中的图片 (回放/测试)
//! - HttpSnapshotSource: 轮询 IP 摄像头的 JPEG 快照地址

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;

use crate::config::SourceSpec;

const HTTP_TIMEOUT: Duration = Duration::from_millis(800);
const MAX_SNAPSHOT_BYTES: u64 = 16 * 1024 * 1024;

/// 一路摄像头的帧来源; 由采集线程独占
pub trait FrameSource: Send {
    /// 读取下一帧 (阻塞)
    fn read(&mut self) -> Result<RgbImage>;

    /// 读取失败后重新打开设备
    fn reopen(&mut self) -> Result<()>;

    fn describe(&self) -> String;
}

/// 根据配置打开视频源
pub fn open_source(spec: &SourceSpec) -> Result<Box<dyn FrameSource>> {
    match spec {
        SourceSpec::ImageDir { path } => Ok(Box::new(ImageDirSource::open(path)?)),
        SourceSpec::HttpSnapshot { url } => Ok(Box::new(HttpSnapshotSource::new(url)?)),
    }
}

// ========== 图片目录 ==========

pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png" | "bmp"))
        .unwrap_or(false)
}

fn scan(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    files.sort();
    Ok(files)
}

impl ImageDirSource {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let files = scan(&dir)?;
        if files.is_empty() {
            bail!("no images in {}", dir.display());
        }
        tracing::debug!("📂 图片源 {}: {} 张", dir.display(), files.len());
        Ok(Self { dir, files, cursor: 0 })
    }
}

impl FrameSource for ImageDirSource {
    fn read(&mut self) -> Result<RgbImage> {
        if self.files.is_empty() {
            bail!("no images in {}", self.dir.display());
        }
        let path = &self.files[self.cursor % self.files.len()];
        self.cursor = (self.cursor + 1) % self.files.len();
        let img = image::open(path).with_context(|| format!("decode {}", path.display()))?;
        Ok(img.to_rgb8())
    }

    fn reopen(&mut self) -> Result<()> {
        self.files = scan(&self.dir)?;
        self.cursor = 0;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.dir.display())
    }
}

// ========== HTTP 快照 ==========

pub struct HttpSnapshotSource {
    url: String,
    agent: ureq::Agent,
}

impl HttpSnapshotSource {
    pub fn new(url: &str) -> Result<Self> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("unsupported snapshot url: {}", url);
        }
        Ok(Self {
            url: url.to_string(),
            agent: ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build(),
        })
    }
}

impl FrameSource for HttpSnapshotSource {
    fn read(&mut self) -> Result<RgbImage> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .map_err(|e| anyhow!("GET {}: {}", self.url, e))?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_SNAPSHOT_BYTES)
            .read_to_end(&mut bytes)
            .with_context(|| format!("read body {}", self.url))?;

        let img = image::load_from_memory(&bytes).with_context(|| format!("decode snapshot {}", self.url))?;
        Ok(img.to_rgb8())
    }

    fn reopen(&mut self) -> Result<()> {
        // 重建连接池
        self.agent = ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build();
        Ok(())
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_image_dir_cycles_sorted() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([10, 0, 0])).save(dir.path().join("a.png")).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([20, 0, 0])).save(dir.path().join("b.png")).unwrap();
        fs::write(dir.path().join("notes.txt"), "skip").unwrap();

        let mut source = ImageDirSource::open(dir.path()).unwrap();
        assert_eq!(source.read().unwrap().get_pixel(0, 0).0[0], 10);
        assert_eq!(source.read().unwrap().get_pixel(0, 0).0[0], 20);
        assert_eq!(source.read().unwrap().get_pixel(0, 0).0[0], 10);
    }

    #[test]
    fn test_empty_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageDirSource::open(dir.path()).is_err());
        assert!(open_source(&SourceSpec::ImageDir {
            path: dir.path().join("missing"),
        })
        .is_err());
    }

    #[test]
    fn test_http_url_validated() {
        assert!(HttpSnapshotSource::new("rtsp://cam/stream").is_err());
        assert!(HttpSnapshotSource::new("http://127.0.0.1/snapshot.jpg").is_ok());
    }
}
