// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod camera; // 摄像头: 视频源、采集线程、管理
pub mod config; // 系统配置参数
pub mod control; // 控制入口
pub mod detection; // 智能检测系统
pub mod error; // 错误类型
pub mod escalation; // 紧急告警
pub mod events; // 事件日志与统计
pub mod registry; // 已知人脸库
pub mod render; // 叠加层绘制
pub mod roi; // 检测区域掩膜
pub mod store; // 人员/联系人/日志存储
pub mod stream; // MJPEG 输出

pub use crate::camera::{Camera, CameraRegistry};
pub use crate::config::{CameraConfig, SentinelConfig, SourceSpec};
pub use crate::control::{NewPerson, Sentinel};
pub use crate::detection::{FaceRecognizer, FramePipeline, ObjectDetector};
pub use crate::error::{CameraError, PipelineError, RoiError};
pub use crate::escalation::{Alert, AlertStatus};
pub use crate::events::{Stats, StatsPolicy};
