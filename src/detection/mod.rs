/// 检测系统 (Detection System)
///
/// 独立工作线程,负责智能分析
/// - Adapter:  人脸识别 / 目标检测推理接口
/// - Pipeline: 单帧分析 (人脸匹配、危险物品、打架)
/// - Enroll:   陌生人自动登记
/// - Worker:   每路摄像头的检测线程
pub mod adapter;
pub mod enroll;
pub mod pipeline;
pub mod threat;
pub mod types;
pub mod violence;
pub mod worker;

pub use adapter::{Embedding, FaceRecognizer, NullDetector, NullRecognizer, ObjectDetector};
pub use enroll::AutoEnroller;
pub use pipeline::{FramePipeline, PipelineParams, SentinelPipeline};
pub use threat::ThreatTable;
pub use types::{BBox, Overlay, RawDetection};
pub use worker::detection_loop;
