// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理适配器接口 (人脸识别 / 目标检测)
//!
//! 人脸特征模型与目标检测器都是外部协作者, 这里只定义调用契约:
//!
//! ```text
//! RgbImage → locate_faces → [BBox] → embed_faces → [Embedding]
//! RgbImage → detect_objects(iou, conf) → [(class_id, bbox, confidence)]
//! ```
//!
//! 实现必须是 `Send + Sync`: 同一个适配器被所有摄像头的检测线程共享。

use anyhow::Result;
use image::RgbImage;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::types::{BBox, RawDetection};

/// 人脸特征向量
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(pub Array1<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(Array1::from(values))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 欧氏距离; 维度不同视为无穷远
    pub fn distance(&self, other: &Embedding) -> f32 {
        if self.0.len() != other.0.len() {
            return f32::INFINITY;
        }
        let diff = &self.0 - &other.0;
        diff.dot(&diff).sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(e: Embedding) -> Self {
        e.0.to_vec()
    }
}

/// 人脸识别适配器
pub trait FaceRecognizer: Send + Sync {
    /// 人脸定位 (像素坐标)
    fn locate_faces(&self, image: &RgbImage) -> Result<Vec<BBox>>;

    /// 对给定人脸框计算特征, 顺序与 `faces` 一致
    fn embed_faces(&self, image: &RgbImage, faces: &[BBox]) -> Result<Vec<Embedding>>;

    /// 整图取第一张人脸的特征, 无人脸返回 None
    fn embed(&self, image: &RgbImage) -> Result<Option<Embedding>> {
        let faces = self.locate_faces(image)?;
        if faces.is_empty() {
            return Ok(None);
        }
        Ok(self.embed_faces(image, &faces[..1])?.into_iter().next())
    }
}

/// 目标检测适配器
pub trait ObjectDetector: Send + Sync {
    fn detect_objects(&self, image: &RgbImage, iou_threshold: f32, conf_threshold: f32) -> Result<Vec<RawDetection>>;
}

/// 空识别器: 未接入模型时使用, 永远不返回人脸
pub struct NullRecognizer;

impl FaceRecognizer for NullRecognizer {
    fn locate_faces(&self, _image: &RgbImage) -> Result<Vec<BBox>> {
        Ok(Vec::new())
    }

    fn embed_faces(&self, _image: &RgbImage, _faces: &[BBox]) -> Result<Vec<Embedding>> {
        Ok(Vec::new())
    }
}

/// 空检测器
pub struct NullDetector;

impl ObjectDetector for NullDetector {
    fn detect_objects(&self, _image: &RgbImage, _iou: f32, _conf: f32) -> Result<Vec<RawDetection>> {
        Ok(Vec::new())
    }
}
