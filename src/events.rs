//! 结构化事件输出 (Structured event sinks)
//!
//! 核心只产生事件, 传输与格式 (文件/Webhook/SSE/控制台) 由下游负责

use std::path::PathBuf;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{info, warn};

use crate::detection::tracker::TrackEvent;
use crate::detection::types::Point2;

/// 核心产生的事件
#[derive(Debug, Clone, PartialEq)]
pub enum SentinelEvent {
    /// 目标进入
    ObjectEntered {
        id: u64,
        class_name: String,
        position: Point2,
        confidence: f32,
    },
    /// 目标移动
    ObjectMoved {
        id: u64,
        class_name: String,
        from: Point2,
        to: Point2,
        confidence: f32,
    },
    /// 目标离开 (超时驱逐)
    ObjectExited {
        id: u64,
        class_name: String,
        last_position: Point2,
    },
    /// 照片已保存
    PhotoSaved { path: PathBuf, classes: Vec<String> },
    /// 队列已满, 丢弃新帧
    FrameDropped { queue_len: usize },
    /// 单帧处理失败
    FrameFailed { reason: String },
    /// 识别为之前的场景
    SceneRecognized {
        scene_id: i64,
        score: f64,
        description: String,
    },
    /// 新场景
    SceneCreated { scene_id: i64, description: String },
}

impl From<TrackEvent> for SentinelEvent {
    fn from(event: TrackEvent) -> Self {
        match event {
            TrackEvent::Entered {
                id,
                class_name,
                position,
                confidence,
            } => SentinelEvent::ObjectEntered {
                id,
                class_name,
                position,
                confidence,
            },
            TrackEvent::Moved {
                id,
                class_name,
                from,
                to,
                confidence,
            } => SentinelEvent::ObjectMoved {
                id,
                class_name,
                from,
                to,
                confidence,
            },
            TrackEvent::Exited {
                id,
                class_name,
                last_position,
            } => SentinelEvent::ObjectExited {
                id,
                class_name,
                last_position,
            },
        }
    }
}

/// 事件接收端 Trait
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SentinelEvent);
}

/// 丢弃所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &SentinelEvent) {}
}

/// 通过 tracing 输出事件
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &SentinelEvent) {
        match event {
            SentinelEvent::ObjectEntered {
                id,
                class_name,
                position,
                confidence,
            } => info!(
                id,
                class = %class_name,
                x = position.x as i32,
                y = position.y as i32,
                confidence = (*confidence * 100.0) as i32,
                "new {} entered frame",
                class_name
            ),
            SentinelEvent::ObjectMoved {
                id,
                class_name,
                from,
                to,
                ..
            } => info!(
                id,
                class = %class_name,
                "{} moved from ({}, {}) to ({}, {})",
                class_name,
                from.x as i32,
                from.y as i32,
                to.x as i32,
                to.y as i32
            ),
            SentinelEvent::ObjectExited {
                id,
                class_name,
                last_position,
            } => info!(
                id,
                class = %class_name,
                x = last_position.x as i32,
                y = last_position.y as i32,
                "{} left frame",
                class_name
            ),
            SentinelEvent::PhotoSaved { path, classes } => info!(
                path = %path.display(),
                classes = %classes.join(" "),
                "saved detection photo"
            ),
            SentinelEvent::FrameDropped { queue_len } => {
                warn!(queue_len, "frame queue full, dropping frame")
            }
            SentinelEvent::FrameFailed { reason } => warn!(%reason, "frame processing failed"),
            SentinelEvent::SceneRecognized {
                scene_id,
                score,
                description,
            } => info!(
                scene_id,
                score = *score,
                "recognised return to earlier scene: {}",
                description
            ),
            SentinelEvent::SceneCreated {
                scene_id,
                description,
            } => info!(scene_id, "new scene identified: {}", description),
        }
    }
}

/// 通过 crossbeam 通道转发事件 (通知、推流等下游订阅)
///
/// 下游处理不过来时丢弃事件, 不阻塞工作线程
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<SentinelEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<SentinelEvent>) -> Self {
        Self { tx }
    }

    /// 创建有界通道及其接收端
    pub fn bounded(capacity: usize) -> (Self, Receiver<SentinelEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &SentinelEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => warn!("event channel full, dropping event"),
        }
    }
}

/// 多路分发
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &SentinelEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
