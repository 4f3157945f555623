//! 目标属性分析 (Object property analysis)
//!
//! 对静止目标的图像区域采样平均颜色, 并用二值图像二阶中心矩估计朝向

use image::{Pixel, RgbImage};

use crate::detection::tracker::TrackedObject;
use crate::detection::types::{BBox, Frame, Point2};

use super::SceneObject;

/// 以中心点和边长确定采样区域, 越界时平移回图像内 (尺寸不超过图像)
pub fn sample_region(center: Point2, width: f32, height: f32, image_width: u32, image_height: u32) -> BBox {
    let fit = |c: f32, size: f32, extent: u32| -> (f32, f32) {
        let size = size.max(1.0).min(extent as f32);
        let start = (c - size / 2.0).floor().clamp(0.0, (extent as f32 - size).max(0.0));
        (start, size)
    };
    let (x, w) = fit(center.x, width, image_width);
    let (y, h) = fit(center.y, height, image_height);
    BBox::new(x, y, w, h)
}

/// 区域平均颜色
pub fn dominant_color(image: &RgbImage, region: &BBox) -> [u8; 3] {
    let Some((x, y, w, h)) = region.clamp_to(image.width(), image.height()) else {
        return [0, 0, 0];
    };

    let mut sum = [0u64; 3];
    for py in y..y + h {
        for px in x..x + w {
            let pixel = image.get_pixel(px, py);
            for (acc, channel) in sum.iter_mut().zip(pixel.0) {
                *acc += channel as u64;
            }
        }
    }
    let n = (w as u64 * h as u64).max(1);
    [
        (sum[0] as f64 / n as f64).round() as u8,
        (sum[1] as f64 / n as f64).round() as u8,
        (sum[2] as f64 / n as f64).round() as u8,
    ]
}

/// 朝向估计 (度)
///
/// 灰度非零像素视为前景: θ = ½·atan2(2μ11, μ20 − μ02)
pub fn orientation(image: &RgbImage, region: &BBox) -> f32 {
    let Some((x, y, w, h)) = region.clamp_to(image.width(), image.height()) else {
        return 0.0;
    };

    // 1. 零阶、一阶矩
    let mut m00 = 0.0f64;
    let mut m10 = 0.0f64;
    let mut m01 = 0.0f64;
    let mut foreground = Vec::new();
    for py in y..y + h {
        for px in x..x + w {
            if image.get_pixel(px, py).to_luma().0[0] > 0 {
                let (fx, fy) = ((px - x) as f64, (py - y) as f64);
                m00 += 1.0;
                m10 += fx;
                m01 += fy;
                foreground.push((fx, fy));
            }
        }
    }
    if m00 == 0.0 {
        return 0.0;
    }

    // 2. 二阶中心矩
    let (cx, cy) = (m10 / m00, m01 / m00);
    let (mut mu20, mut mu02, mut mu11) = (0.0f64, 0.0f64, 0.0f64);
    for (fx, fy) in foreground {
        let (dx, dy) = (fx - cx, fy - cy);
        mu20 += dx * dx;
        mu02 += dy * dy;
        mu11 += dx * dy;
    }

    (0.5 * (2.0 * mu11).atan2(mu20 - mu02)).to_degrees() as f32
}

/// 由静止跟踪目标生成场景目标
///
/// 采样区域取最近一次检测框; 检测框为空时使用估计尺寸的正方形
pub fn describe_object(tracked: &TrackedObject, frame: &Frame, estimated_size: f32) -> SceneObject {
    let (width, height) = if tracked.bbox.area() > 0.0 {
        (tracked.bbox.width, tracked.bbox.height)
    } else {
        (estimated_size, estimated_size)
    };

    if frame.is_empty() {
        return SceneObject {
            class_name: tracked.class_name.clone(),
            position: tracked.center,
            region: BBox::centered(tracked.center, width, height),
            color: [0, 0, 0],
            orientation: 0.0,
        };
    }

    let region = sample_region(tracked.center, width, height, frame.width(), frame.height());
    SceneObject {
        class_name: tracked.class_name.clone(),
        position: tracked.center,
        region,
        color: dominant_color(&frame.image, &region),
        orientation: orientation(&frame.image, &region),
    }
}
