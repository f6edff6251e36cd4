//! 陌生人自动登记
//!
//! 未匹配的人脸 → "Unknown N" → 裁剪人脸保存到 known/Unknown_N.jpg
//! → 写入人员库 → 直接追加到人脸库 (不触发 reload)

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use image::{imageops, RgbImage};
use once_cell::sync::Lazy;
use regex::Regex;

use super::adapter::Embedding;
use super::types::BBox;
use crate::registry::KnownFaceRegistry;
use crate::store::{PersonRecord, PersonStore};

pub const AUTO_RELATION: &str = "Auto-Detected";
const AUTO_SERIAL_BASE: u32 = 9000;

static AUTO_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Unknown (\d+)$").expect("valid regex"));

/// 已有自动登记名字中的最大编号 + 1
pub fn next_auto_id(persons: &[PersonRecord]) -> u32 {
    persons
        .iter()
        .filter_map(|p| AUTO_NAME.captures(&p.name))
        .filter_map(|c| c.get(1)?.as_str().parse::<u32>().ok())
        .max()
        .map(|n| n + 1)
        .unwrap_or(1)
}

pub struct AutoEnroller {
    /// 下一个编号; 只在登记成功后递增
    counter: Mutex<u32>,
    media_root: PathBuf,
    persons: Arc<dyn PersonStore>,
    registry: Arc<KnownFaceRegistry>,
}

impl AutoEnroller {
    /// 从人员库中已有的 "Unknown N" 推算起始编号
    pub fn new(persons: Arc<dyn PersonStore>, registry: Arc<KnownFaceRegistry>, media_root: impl Into<PathBuf>) -> Result<Self> {
        let start = next_auto_id(&persons.list_persons()?);
        tracing::info!("🆕 自动登记编号从 Unknown {} 开始", start);
        Ok(Self {
            counter: Mutex::new(start),
            media_root: media_root.into(),
            persons,
            registry,
        })
    }

    pub fn next_id(&self) -> u32 {
        *self.counter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记陌生人, 返回 (姓名, 关系)
    ///
    /// `face` 是原始分辨率下的人脸框, 从未加掩膜的原图裁剪
    pub fn enroll(&self, frame: &RgbImage, face: &BBox, embedding: Embedding) -> Result<(String, String)> {
        // 整个登记过程持锁, 保证编号唯一
        let mut counter = self.counter.lock().unwrap_or_else(PoisonError::into_inner);
        let n = *counter;
        let name = format!("Unknown {}", n);

        let (x, y, w, h) = face
            .clip_to(frame.width(), frame.height())
            .ok_or_else(|| anyhow!("face box {:?} outside frame", face))?;
        let crop: RgbImage = imageops::crop_imm(frame, x, y, w, h).to_image();

        let filename = format!("{}.jpg", name.replace(' ', "_"));
        let dir = self.media_root.join("known");
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        crop.save(dir.join(&filename))
            .with_context(|| format!("save {}", filename))?;

        self.persons.insert(PersonRecord {
            id: String::new(),
            serial_no: AUTO_SERIAL_BASE + n,
            name: name.clone(),
            relation: AUTO_RELATION.to_string(),
            phone: "N/A".to_string(),
            address: "Auto-Captured".to_string(),
            photo_path: Some(format!("known/{}", filename)),
            photo_dir: None,
            created_at: Local::now(),
        })?;
        self.registry.enroll(embedding, &name, AUTO_RELATION);

        *counter += 1;
        tracing::info!("🆕 自动登记陌生人: {}", name);
        Ok((name, AUTO_RELATION.to_string()))
    }
}
