/// 视频输出 (Streaming)
///
/// - MJPEG: multipart/x-mixed-replace 帧封装, 由消费方按自己的节奏拉取最新合成帧
pub mod mjpeg;

pub use mjpeg::{encode_jpeg, frame_part, MjpegStream, CONTENT_TYPE};
