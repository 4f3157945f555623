//! 照片保存策略 (Photo retention policy)
//!
//! 出现新类别、某类别数量增加或跟踪器报告新进入目标时立即保存;
//! 否则按最小间隔保存。无目标检测的帧从不保存。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use phf::phf_map;
use tracing::debug;

use crate::detection::types::{Detection, Frame};
use crate::error::Result;

// ========== 类别颜色 ==========

static CLASS_COLORS: phf::Map<&'static str, [u8; 3]> = phf_map! {
    "person" => [0, 255, 0],       // 绿
    "cat" => [255, 0, 0],          // 红
    "dog" => [0, 0, 255],          // 蓝
    "bird" => [0, 255, 255],
    "bear" => [0, 128, 128],
    "car" => [255, 255, 0],        // 车辆: 黄
    "truck" => [255, 255, 0],
    "bus" => [255, 255, 0],
    "motorcycle" => [255, 0, 255], // 两轮: 品红
    "bicycle" => [255, 0, 255],
    "chair" => [128, 0, 128],
    "book" => [255, 128, 0],
};

const BOX_THICKNESS: i32 = 2;

/// 类别对应的标注颜色, 未知类别为白色
pub fn class_color(class_name: &str) -> Rgb<u8> {
    Rgb(CLASS_COLORS
        .get(class_name)
        .copied()
        .unwrap_or([255, 255, 255]))
}

/// 照片文件名: `2025-10-04 010000 cat person detected.jpg`
pub fn photo_filename(captured_at: &DateTime<Local>, detections: &[Detection]) -> String {
    let mut classes: Vec<&str> = detections.iter().map(|d| d.class_name.as_str()).collect();
    classes.sort_unstable();
    classes.dedup();

    let mut name = captured_at.format("%Y-%m-%d %H%M%S").to_string();
    for class in classes {
        name.push(' ');
        name.push_str(class);
    }
    name.push_str(" detected.jpg");
    name
}

/// 在帧上绘制各检测框
pub fn annotate(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = image.clone();
    for detection in detections {
        let Some((x, y, w, h)) = detection.bbox.clamp_to(canvas.width(), canvas.height()) else {
            continue;
        };
        let color = class_color(&detection.class_name);
        for inset in 0..BOX_THICKNESS {
            let (iw, ih) = (w as i32 - 2 * inset, h as i32 - 2 * inset);
            if iw <= 0 || ih <= 0 {
                break;
            }
            let rect = Rect::at(x as i32 + inset, y as i32 + inset).of_size(iw as u32, ih as u32);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
    }
    canvas
}

/// 保存标注照片, 返回文件路径
pub fn save_photo(frame: &Frame, detections: &[Detection], output_dir: &Path) -> Result<PathBuf> {
    let path = output_dir.join(photo_filename(&frame.captured_at, detections));
    annotate(&frame.image, detections).save(&path)?;
    Ok(path)
}

// ========== 保存策略 ==========

/// 触发保存的原因
#[derive(Debug, Clone, PartialEq)]
pub enum PhotoTrigger {
    /// 上次保存时没有的类别
    NewClass(String),
    /// 某类别数量增加
    CountIncreased {
        class_name: String,
        from: usize,
        to: usize,
    },
    /// 跟踪器报告新进入目标
    FreshEntry,
    /// 距上次保存已超过间隔
    Interval,
}

impl PhotoTrigger {
    pub fn is_novelty(&self) -> bool {
        !matches!(self, PhotoTrigger::Interval)
    }
}

#[derive(Debug, Default)]
struct PolicyState {
    last_counts: BTreeMap<String, usize>,
    last_saved: Option<Instant>,
}

/// 照片保存策略 (状态由一把锁保护, 多个工作线程共享)
#[derive(Debug)]
pub struct PhotoPolicy {
    interval: Duration,
    stationary_timeout: Option<Duration>,
    state: Mutex<PolicyState>,
}

impl PhotoPolicy {
    pub fn new(interval: Duration, stationary_timeout: Option<Duration>) -> Self {
        Self {
            interval,
            stationary_timeout,
            state: Mutex::new(PolicyState::default()),
        }
    }

    pub fn stationary_timeout(&self) -> Option<Duration> {
        self.stationary_timeout
    }

    /// 判定本帧是否保存照片
    ///
    /// 判定为保存时立即记录本次类别计数与时间 (在锁内完成, 并发帧不会重复保存)
    ///
    /// # 参数
    /// - `detections`: 目标类别过滤后的检测
    /// - `fresh_entry`: 跟踪器本帧有新进入目标
    /// - `stationary_quiet`: 本帧所有目标均已静止超时 (抑制按间隔保存)
    pub fn evaluate(
        &self,
        detections: &[Detection],
        fresh_entry: bool,
        stationary_quiet: bool,
        now: Instant,
    ) -> Option<PhotoTrigger> {
        if detections.is_empty() {
            return None;
        }

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for detection in detections {
            *counts.entry(detection.class_name.clone()).or_insert(0) += 1;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        // 1. 新类别 → 2. 数量增加 → 3. 新进入目标 → 4. 间隔
        let novelty = counts
            .keys()
            .find(|class| !state.last_counts.contains_key(*class))
            .map(|class| PhotoTrigger::NewClass(class.clone()))
            .or_else(|| {
                counts.iter().find_map(|(class, &count)| {
                    let previous = state.last_counts.get(class).copied()?;
                    (count > previous).then(|| PhotoTrigger::CountIncreased {
                        class_name: class.clone(),
                        from: previous,
                        to: count,
                    })
                })
            })
            .or_else(|| fresh_entry.then_some(PhotoTrigger::FreshEntry));

        let trigger = match novelty {
            Some(trigger) => trigger,
            None => {
                let interval_elapsed = state
                    .last_saved
                    .map(|at| now.saturating_duration_since(at) >= self.interval)
                    .unwrap_or(true);
                let suppressed = self.stationary_timeout.is_some() && stationary_quiet;
                if !interval_elapsed || suppressed {
                    return None;
                }
                PhotoTrigger::Interval
            }
        };

        debug!(?trigger, "photo save triggered");
        state.last_counts = counts;
        state.last_saved = Some(now);
        Some(trigger)
    }
}
