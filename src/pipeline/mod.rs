/// 帧处理流水线 (Frame Processing Pipeline)
///
/// 采集线程提交帧, 工作线程池完成检测:
/// - processor: 有界队列 + 工作线程 + 背压 (满则丢弃新帧)
/// - photo:     照片保存策略与标注输出
///
/// 每一帧通过自己的 `FrameHandle` 返回结果, 完成顺序不保证
pub mod photo;
pub mod processor;

use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::detection::types::Detection;

pub use photo::{class_color, photo_filename, PhotoPolicy};
pub use processor::{EngineStats, FrameProcessor};

// ========== 帧处理结果 ==========

/// 单帧处理结果
#[derive(Debug, Clone, PartialEq)]
pub struct FrameResult {
    pub captured_at: DateTime<Local>,
    /// false: 被丢弃 / 关闭时未处理 / 处理失败
    pub processed: bool,
    /// 目标类别过滤后的检测结果
    pub detections: Vec<Detection>,
}

impl FrameResult {
    pub fn processed(captured_at: DateTime<Local>, detections: Vec<Detection>) -> Self {
        Self {
            captured_at,
            processed: true,
            detections,
        }
    }

    pub fn unprocessed(captured_at: DateTime<Local>) -> Self {
        Self {
            captured_at,
            processed: false,
            detections: Vec::new(),
        }
    }
}

/// 单帧结果句柄
///
/// 结果只投递一次, 取到后缓存在句柄内
#[derive(Debug)]
pub struct FrameHandle {
    rx: Receiver<FrameResult>,
    captured_at: DateTime<Local>,
    result: Option<FrameResult>,
}

impl FrameHandle {
    /// 非阻塞查询
    pub fn try_result(&mut self) -> Option<&FrameResult> {
        if self.result.is_none() {
            match self.rx.try_recv() {
                Ok(result) => self.result = Some(result),
                Err(TryRecvError::Disconnected) => {
                    self.result = Some(FrameResult::unprocessed(self.captured_at))
                }
                Err(TryRecvError::Empty) => {}
            }
        }
        self.result.as_ref()
    }

    /// 限时等待, 超时返回 None
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<&FrameResult> {
        if self.result.is_none() {
            match self.rx.recv_timeout(timeout) {
                Ok(result) => self.result = Some(result),
                Err(RecvTimeoutError::Disconnected) => {
                    self.result = Some(FrameResult::unprocessed(self.captured_at))
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        self.result.as_ref()
    }

    /// 阻塞等待结果
    pub fn wait(mut self) -> FrameResult {
        if let Some(result) = self.result.take() {
            return result;
        }
        self.rx
            .recv()
            .unwrap_or_else(|_| FrameResult::unprocessed(self.captured_at))
    }
}

/// 完成端: 未显式完成就被丢弃时, 以 `processed = false` 完成
pub(crate) struct Completion {
    tx: Option<Sender<FrameResult>>,
    captured_at: DateTime<Local>,
}

impl Completion {
    pub(crate) fn channel(captured_at: DateTime<Local>) -> (Completion, FrameHandle) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (
            Completion {
                tx: Some(tx),
                captured_at,
            },
            FrameHandle {
                rx,
                captured_at,
                result: None,
            },
        )
    }

    pub(crate) fn complete(mut self, result: FrameResult) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    pub(crate) fn reject(self) {
        let captured_at = self.captured_at;
        self.complete(FrameResult::unprocessed(captured_at));
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(FrameResult::unprocessed(self.captured_at));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_completion_resolves_unprocessed() {
        let (completion, mut handle) = Completion::channel(Local::now());
        assert!(handle.try_result().is_none());
        drop(completion);
        assert!(!handle.try_result().unwrap().processed);
    }

    #[test]
    fn test_result_cached_after_first_read() {
        let (completion, mut handle) = Completion::channel(Local::now());
        completion.complete(FrameResult::processed(Local::now(), Vec::new()));

        assert!(handle.wait_timeout(Duration::from_millis(10)).unwrap().processed);
        assert!(handle.try_result().unwrap().processed);
        assert!(handle.wait().processed);
    }

    #[test]
    fn test_wait_timeout_pending() {
        let (_completion, mut handle) = Completion::channel(Local::now());
        assert!(handle.wait_timeout(Duration::from_millis(5)).is_none());
    }
}
