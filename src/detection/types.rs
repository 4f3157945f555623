/// 检测系统数据结构定义
/// Data structures for the detection system
use std::time::Instant;

use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{Deserialize, Serialize};

// ========== 公共常量 ==========

/// 默认工作分辨率 (跟踪阈值以此分辨率为基准)
pub const WORKING_WIDTH: u32 = 1280;
pub const WORKING_HEIGHT: u32 = 720;

// ========== 数据结构 ==========

/// 二维点 (像素坐标)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// 欧氏距离
    pub fn distance(&self, other: &Point2) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// 指向 `other` 的方向角 (度, -180..180)
    pub fn angle_to(&self, other: &Point2) -> f32 {
        (other.y - self.y).atan2(other.x - self.x).to_degrees()
    }
}

/// 检测框 (左上角 + 宽高)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// 以中心点和边长构造
    pub fn centered(center: Point2, width: f32, height: f32) -> Self {
        Self::new(
            center.x - width / 2.0,
            center.y - height / 2.0,
            width,
            height,
        )
    }

    pub fn xmax(&self) -> f32 {
        self.x + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Point2 {
        Point2::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// 裁剪到图像范围内, 返回整数像素区域 (x, y, w, h); 完全越界时返回 None
    pub fn clamp_to(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x.max(0.0).floor() as i64;
        let y1 = self.y.max(0.0).floor() as i64;
        let x2 = (self.xmax().ceil() as i64).min(image_width as i64);
        let y2 = (self.ymax().ceil() as i64).min(image_height as i64);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
    }
}

/// 单个检测结果 (模型输出)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(class_name: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            class_name: class_name.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }

    pub fn center(&self) -> Point2 {
        self.bbox.center()
    }
}

/// 采集帧: 图像 + 采集时间
///
/// 异步处理时整帧复制入队, 同步处理时直接借用
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// 墙钟时间 (用于照片命名)
    pub captured_at: DateTime<Local>,
    /// 单调时钟 (用于间隔计算)
    pub captured_instant: Instant,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Local::now(),
            captured_instant: Instant::now(),
        }
    }

    /// 纯黑帧 (测试与占位)
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(RgbImage::new(width, height))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("size", &format_args!("{}x{}", self.width(), self.height()))
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_center() {
        let bbox = BBox::new(100.0, 100.0, 50.0, 100.0);
        assert_eq!(bbox.center(), Point2::new(125.0, 150.0));
    }

    #[test]
    fn test_clamp_to_frame() {
        let bbox = BBox::new(-10.0, 600.0, 100.0, 200.0);
        assert_eq!(bbox.clamp_to(1280, 720), Some((0, 600, 90, 120)));
        assert_eq!(BBox::new(2000.0, 0.0, 10.0, 10.0).clamp_to(1280, 720), None);
    }

    #[test]
    fn test_confidence_clamped() {
        let det = Detection::new("person", 1.7, BBox::default());
        assert_eq!(det.confidence, 1.0);
    }
}
