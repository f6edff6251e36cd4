//! 叠加层绘制 (合成线程调用)
//!
//! - 框: 按粗细画多层空心矩形
//! - 实心标签: 框底部画色块, 白字
//! - 普通标签: 框上方画同色文字
//! - ROI: 黄色细轮廓

use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::detection::types::{Overlay, COLOR_ROI};
use crate::roi::RoiMask;

const LABEL_BAR_HEIGHT: i32 = 35;
const TEXT_WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// 常见系统字体
const FONT_CANDIDATES: [&str; 4] = [
    "assets/font/msyh.ttc",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

pub struct OverlayRenderer {
    font: Option<FontArc>,
}

fn load_font(path: &Path) -> Option<FontArc> {
    let bytes = std::fs::read(path).ok()?;
    match FontArc::try_from_vec(bytes) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::warn!("⚠️  字体 {} 无法解析: {}", path.display(), e);
            None
        }
    }
}

impl OverlayRenderer {
    /// 加载字体: 优先配置路径, 再尝试系统字体; 都没有则只画框不画字
    pub fn new(font_path: Option<&Path>) -> Self {
        let mut candidates: Vec<PathBuf> = font_path.map(Path::to_path_buf).into_iter().collect();
        candidates.extend(FONT_CANDIDATES.iter().map(PathBuf::from));
        if let Some(user_fonts) = dirs::font_dir() {
            candidates.push(user_fonts.join("DejaVuSans.ttf"));
        }

        let font = candidates.iter().find_map(|p| {
            let font = load_font(p)?;
            tracing::info!("✅ 标签字体: {}", p.display());
            Some(font)
        });
        if font.is_none() {
            tracing::warn!("⚠️  未找到可用字体, 叠加层只绘制边框");
        }
        Self { font }
    }

    /// 不绘制文字 (测试/无字体环境)
    pub fn without_font() -> Self {
        Self { font: None }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// 在帧上绘制叠加层和 ROI 轮廓
    pub fn draw(&self, mut frame: RgbImage, overlays: &[Overlay], roi: Option<&RoiMask>) -> RgbImage {
        for overlay in overlays {
            self.draw_overlay(&mut frame, overlay);
        }
        if let Some(roi) = roi {
            draw_roi_outline(&mut frame, roi);
        }
        frame
    }

    fn draw_overlay(&self, frame: &mut RgbImage, o: &Overlay) {
        let (l, t) = (o.left.min(o.right), o.top.min(o.bottom));
        let (r, b) = (o.left.max(o.right), o.top.max(o.bottom));
        let (w, h) = ((r - l).max(1) as u32, (b - t).max(1) as u32);

        for i in 0..o.thickness.max(1) as i32 {
            let rect = Rect::at(l - i, t - i).of_size(w + 2 * i as u32, h + 2 * i as u32);
            draw_hollow_rect_mut(frame, rect, o.color);
        }

        if o.filled_label {
            let bar_top = (b - LABEL_BAR_HEIGHT).max(t);
            let bar = Rect::at(l, bar_top).of_size(w, (b - bar_top).max(1) as u32);
            draw_filled_rect_mut(frame, bar, o.color);
            if let Some(font) = &self.font {
                draw_text_mut(frame, TEXT_WHITE, l + 6, b - 28, PxScale::from(20.0), font, &o.label);
            }
        } else if let Some(font) = &self.font {
            draw_text_mut(frame, o.color, l, (t - 24).max(0), PxScale::from(22.0), font, &o.label);
        }
    }
}

/// 只描轮廓, 不改变区域内像素
pub fn draw_roi_outline(frame: &mut RgbImage, roi: &RoiMask) {
    if frame.dimensions() != roi.dimensions() {
        return;
    }
    for contour in &roi.outline {
        for &(x, y) in contour {
            if x >= 0 && y >= 0 && (x as u32) < frame.width() && (y as u32) < frame.height() {
                frame.put_pixel(x as u32, y as u32, COLOR_ROI);
            }
        }
    }
}
