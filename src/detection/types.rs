/// 检测系统数据结构定义
/// Data structures shared by the detection worker and the compositor
use image::Rgb;

// ========== 颜色 ==========

pub const COLOR_KNOWN: Rgb<u8> = Rgb([0, 255, 0]);
pub const COLOR_UNKNOWN: Rgb<u8> = Rgb([255, 0, 0]);
pub const COLOR_SUSPECT: Rgb<u8> = Rgb([255, 165, 0]);
pub const COLOR_THREAT: Rgb<u8> = Rgb([255, 0, 0]);
pub const COLOR_VIOLENCE: Rgb<u8> = Rgb([128, 0, 128]);
pub const COLOR_ROI: Rgb<u8> = Rgb([255, 255, 0]);

// ========== 数据结构 ==========

/// 检测框 (像素坐标, 左上 + 右下)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// 交并比 IoU = 交集 / (A + B - 交集), 不相交为 0
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// 最小外接框
    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    /// 坐标缩放 (推理分辨率 → 原始分辨率)
    pub fn scale(&self, factor: f32) -> BBox {
        BBox {
            x1: self.x1 * factor,
            y1: self.y1 * factor,
            x2: self.x2 * factor,
            y2: self.y2 * factor,
        }
    }

    /// 裁剪到图像范围内, 返回 (x, y, w, h); 空区域返回 None
    pub fn clip_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x1.max(0.0).min(width as f32) as u32;
        let y1 = self.y1.max(0.0).min(height as f32) as u32;
        let x2 = self.x2.max(0.0).min(width as f32) as u32;
        let y2 = self.y2.max(0.0).min(height as f32) as u32;
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// 目标检测原始输出 (检测适配器 → 流水线)
#[derive(Clone, Debug)]
pub struct RawDetection {
    pub class_id: u32,
    pub bbox: BBox,
    pub confidence: f32,
}

/// 叠加层 (检测线程 → 合成线程), 发布后不可变, 每轮整体替换
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub color: Rgb<u8>,
    pub label: String,
    pub thickness: u32,
    /// true: 框底部实心标签栏; false: 标签画在框上方
    pub filled_label: bool,
}

impl Overlay {
    pub fn from_bbox(bbox: &BBox, color: Rgb<u8>, label: impl Into<String>, thickness: u32, filled_label: bool) -> Self {
        Self {
            left: bbox.x1.round() as i32,
            top: bbox.y1.round() as i32,
            right: bbox.x2.round() as i32,
            bottom: bbox.y2.round() as i32,
            color,
            label: label.into(),
            thickness,
            filled_label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical_disjoint_symmetric() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        let c = BBox::new(5.0, 5.0, 15.0, 15.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&c) - c.iou(&a)).abs() < 1e-6);
    }

    #[test]
    fn test_iou_values() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 15.0);
        // 25 / (100 + 100 - 25)
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);

        let inner = BBox::new(1.0, 1.0, 9.0, 9.0);
        assert!((a.iou(&inner) - 0.64).abs() < 1e-6);
    }

    #[test]
    fn test_union_scale_clip() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 20.0);
        assert_eq!(a.union(&b), BBox::new(0.0, 0.0, 15.0, 20.0));
        assert_eq!(a.scale(2.0), BBox::new(0.0, 0.0, 20.0, 20.0));
        assert_eq!(b.clip_to(12, 12), Some((5, 5, 7, 7)));
        assert_eq!(BBox::new(50.0, 50.0, 60.0, 60.0).clip_to(10, 10), None);
    }
}
