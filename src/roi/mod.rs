//! ROI 掩膜引擎 (Region of Interest)
//!
//! 归一化形状 [0,1] → 按帧尺寸缩放并裁剪到像素边界 → 二值掩膜
//!
//! - 检测线程: 对帧副本做按位与 (`RoiMask::apply`)
//! - 合成线程: 只在显示帧上描绘掩膜轮廓,不遮挡画面

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_polygon_mut};
use imageproc::point::Point;
use imageproc::rect::Rect;
use serde::Serialize;
use serde_json::Value;

use crate::error::RoiError;

const MASK_ON: Luma<u8> = Luma([255]);

/// 归一化ROI形状
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiShape {
    /// [x, y, w, h]
    Rect([f32; 4]),
    /// [cx, cy, r], 半径按帧宽缩放
    Circle([f32; 3]),
    /// [[x, y], ...]
    Polygon(Vec<[f32; 2]>),
}

impl RoiShape {
    /// 解析控制端传来的JSON
    ///
    /// 支持两种格式:
    /// - `{"rect": [x,y,w,h]}` / `{"circle": [cx,cy,r]}` / `{"polygon": [[x,y],...]}`
    /// - 旧版前端: `{"type": "rect"|"circle"|"poly"|"freehand", "points": ...}`
    ///
    /// `null` 返回 `Ok(None)` 表示清除掩膜
    pub fn from_value(value: &Value) -> Result<Option<Self>, RoiError> {
        let obj = match value {
            Value::Null => return Ok(None),
            Value::Object(obj) => obj,
            other => return Err(RoiError::Malformed(format!("expected object, got {}", other))),
        };

        if let Some(kind) = obj.get("type") {
            let kind = kind
                .as_str()
                .ok_or_else(|| RoiError::Malformed("`type` must be a string".to_string()))?;
            let points = obj
                .get("points")
                .ok_or_else(|| RoiError::Malformed("missing `points`".to_string()))?;
            return Self::parse_kind(kind, points).map(Some);
        }

        if obj.len() != 1 {
            return Err(RoiError::Malformed(
                "expected exactly one of rect/circle/polygon".to_string(),
            ));
        }
        // len == 1
        let (kind, points) = obj
            .iter()
            .next()
            .ok_or_else(|| RoiError::Malformed("empty shape".to_string()))?;
        Self::parse_kind(kind, points).map(Some)
    }

    fn parse_kind(kind: &str, points: &Value) -> Result<Self, RoiError> {
        match kind {
            "rect" => {
                let v = number_list(points)?;
                let [x, y, w, h] = <[f32; 4]>::try_from(v.as_slice())
                    .map_err(|_| RoiError::Malformed("rect needs [x, y, w, h]".to_string()))?;
                Ok(RoiShape::Rect([x, y, w, h]))
            }
            "circle" => {
                let v = number_list(points)?;
                let [cx, cy, r] = <[f32; 3]>::try_from(v.as_slice())
                    .map_err(|_| RoiError::Malformed("circle needs [cx, cy, r]".to_string()))?;
                if !(r > 0.0 && r <= 1.0) {
                    return Err(RoiError::Malformed(format!("circle radius must be in (0, 1], got {}", r)));
                }
                Ok(RoiShape::Circle([cx, cy, r]))
            }
            "polygon" | "poly" | "freehand" => {
                let list = points
                    .as_array()
                    .ok_or_else(|| RoiError::Malformed("polygon needs a point list".to_string()))?;
                let pts = list
                    .iter()
                    .map(|p| {
                        let v = number_list(p)?;
                        <[f32; 2]>::try_from(v.as_slice())
                            .map_err(|_| RoiError::Malformed("polygon point needs [x, y]".to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(RoiShape::Polygon(pts))
            }
            other => Err(RoiError::UnknownShape(other.to_string())),
        }
    }
}

fn number_list(value: &Value) -> Result<Vec<f32>, RoiError> {
    let list = value
        .as_array()
        .ok_or_else(|| RoiError::Malformed(format!("expected number list, got {}", value)))?;
    list.iter()
        .map(|n| {
            n.as_f64()
                .filter(|f| f.is_finite())
                .map(|f| f as f32)
                .ok_or_else(|| RoiError::Malformed(format!("not a finite number: {}", n)))
        })
        .collect()
}

/// 归一化坐标 → 像素坐标 (裁剪到 [0, dim-1])
fn to_pixel(v: f32, dim: u32) -> i32 {
    let max = dim.saturating_sub(1) as f32;
    (v * dim as f32).round().clamp(0.0, max) as i32
}

/// 构建二值掩膜 (255 = 检测区域)
pub fn build_mask(width: u32, height: u32, shape: &RoiShape) -> Result<GrayImage, RoiError> {
    if width == 0 || height == 0 {
        return Err(RoiError::Malformed(format!("empty frame {}x{}", width, height)));
    }
    let mut mask = GrayImage::new(width, height);

    match shape {
        RoiShape::Rect([x, y, w, h]) => {
            let (mut x1, mut y1) = (to_pixel(*x, width), to_pixel(*y, height));
            let (mut x2, mut y2) = (to_pixel(x + w, width), to_pixel(y + h, height));
            // 负宽高: 从右下往左上拖拽
            if x2 < x1 {
                std::mem::swap(&mut x1, &mut x2);
            }
            if y2 < y1 {
                std::mem::swap(&mut y1, &mut y2);
            }
            let rect = Rect::at(x1, y1).of_size((x2 - x1 + 1) as u32, (y2 - y1 + 1) as u32);
            draw_filled_rect_mut(&mut mask, rect, MASK_ON);
        }
        RoiShape::Circle([cx, cy, r]) => {
            if *r <= 0.0 {
                return Err(RoiError::Malformed(format!("circle radius must be positive, got {}", r)));
            }
            let center = (to_pixel(*cx, width), to_pixel(*cy, height));
            // 半径不超过帧对角线
            let diagonal = (width as f32).hypot(height as f32).ceil();
            let radius = (r * width as f32).round().clamp(1.0, diagonal) as i32;
            draw_filled_circle_mut(&mut mask, center, radius, MASK_ON);
        }
        RoiShape::Polygon(points) => {
            let mut poly: Vec<Point<i32>> = Vec::with_capacity(points.len());
            for [x, y] in points {
                let p = Point::new(to_pixel(*x, width), to_pixel(*y, height));
                if poly.last() != Some(&p) {
                    poly.push(p);
                }
            }
            // 多边形必须是开放路径
            while poly.len() > 1 && poly.first() == poly.last() {
                poly.pop();
            }
            if poly.len() < 3 {
                return Err(RoiError::Malformed(format!(
                    "polygon needs at least 3 distinct points, got {}",
                    poly.len()
                )));
            }
            draw_polygon_mut(&mut mask, &poly, MASK_ON);
        }
    }

    Ok(mask)
}

/// 已栅格化的ROI: 形状 + 掩膜 + 轮廓
#[derive(Debug, Clone)]
pub struct RoiMask {
    pub shape: RoiShape,
    pub mask: GrayImage,
    pub outline: Vec<Vec<(i32, i32)>>,
}

impl RoiMask {
    pub fn new(width: u32, height: u32, shape: RoiShape) -> Result<Self, RoiError> {
        let mask = build_mask(width, height, &shape)?;
        let outline = outer_contours(&mask);
        Ok(Self {
            shape,
            mask,
            outline,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.mask.dimensions()
    }

    /// 分辨率变化后按原形状重建
    pub fn rebuild(&self, width: u32, height: u32) -> Result<Self, RoiError> {
        Self::new(width, height, self.shape.clone())
    }

    /// 掩膜外的像素置零 (尺寸不一致时不处理)
    pub fn apply(&self, frame: &mut RgbImage) {
        if frame.dimensions() != self.mask.dimensions() {
            tracing::debug!(
                "ROI掩膜尺寸 {:?} 与帧尺寸 {:?} 不一致, 跳过",
                self.mask.dimensions(),
                frame.dimensions()
            );
            return;
        }
        for (px, m) in frame.pixels_mut().zip(self.mask.pixels()) {
            if m.0[0] == 0 {
                px.0 = [0, 0, 0];
            }
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.mask
            .get_pixel_checked(x, y)
            .map(|p| p.0[0] > 0)
            .unwrap_or(false)
    }
}

/// 外轮廓 (像素坐标)
///
/// 贴着第 0 行/列的区域在原图上找不到边界, 先四周补 1 像素再平移回来
fn outer_contours(mask: &GrayImage) -> Vec<Vec<(i32, i32)>> {
    let (width, height) = mask.dimensions();
    let mut padded = GrayImage::new(width + 2, height + 2);
    image::imageops::replace(&mut padded, mask, 1, 1);

    let (max_x, max_y) = (width as i32 - 1, height as i32 - 1);
    find_contours::<i32>(&padded)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .map(|c| {
            c.points
                .into_iter()
                .map(|p| ((p.x - 1).clamp(0, max_x), (p.y - 1).clamp(0, max_y)))
                .collect()
        })
        .collect()
}
