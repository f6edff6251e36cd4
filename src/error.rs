//! 各阶段的错误类型
//! Typed errors for the stages whose callers need to branch on the failure.

use thiserror::Error;

/// ROI 设置错误 (形状非法 / 摄像头不存在 / 尚无画面)
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RoiError {
    #[error("unknown ROI shape type: {0}")]
    UnknownShape(String),

    #[error("malformed ROI shape: {0}")]
    Malformed(String),

    #[error("camera {0} has not produced a frame yet")]
    NoFrame(String),

    #[error("camera {0} not found")]
    CameraNotFound(String),
}

/// 检测流水线错误: 推理适配器失败时本轮结果作废,保留上一轮叠加层
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("face recognizer failed: {0:#}")]
    Recognizer(anyhow::Error),

    #[error("object detector failed: {0:#}")]
    Detector(anyhow::Error),

    #[error("frame resize failed: {0}")]
    Resize(String),
}

/// 摄像头生命周期错误
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("cannot open camera/stream {id}: {reason}")]
    Open { id: String, reason: String },

    #[error("camera {0} produced no frame within the startup grace period")]
    NoSignal(String),
}
