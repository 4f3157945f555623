//! 帧处理引擎 (Frame processing engine)
//!
//! ## 线程模型
//! ```text
//! 采集线程 ──submit_frame──► [有界队列] ──► 工作线程 × N
//!                              │ 满: 立即拒绝新帧          │
//!                              ▼                          ▼
//!                       FrameHandle(processed=false)   detect → 过滤 → 跟踪 → 照片策略
//! ```
//! `workers <= 1` 时在调用线程同步处理, 返回的句柄已完成。

use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Local};
use crossbeam_channel::{select, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::detection::model::{is_target_class, DetectionModel};
use crate::detection::tracker::ObjectTracker;
use crate::detection::types::{Detection, Frame};
use crate::error::{Result, SentinelError};
use crate::events::{EventSink, SentinelEvent};

use super::photo::{save_photo, PhotoPolicy};
use super::{Completion, FrameHandle, FrameResult};

// ========== 统计 ==========

/// 引擎统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub submitted: u64,
    pub processed: u64,
    /// 队列满、关闭后提交或关闭时仍在队列中的帧
    pub dropped: u64,
    pub failed: u64,
    pub photos_saved: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    photos_saved: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> EngineStats {
        EngineStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            photos_saved: self.photos_saved.load(Ordering::Relaxed),
        }
    }
}

// ========== 内部结构 ==========

struct Job {
    frame: Frame,
    completion: Completion,
}

/// 工作线程共享的处理上下文
struct Shared {
    model: Arc<dyn DetectionModel>,
    tracker: Arc<Mutex<ObjectTracker>>,
    events: Arc<dyn EventSink>,
    policy: PhotoPolicy,
    config: EngineConfig,
    counters: Counters,
    stopping: AtomicBool,
}

impl Shared {
    /// 处理一帧: 检测 → 目标类别过滤 → 跟踪 → 照片策略
    fn process(&self, frame: &Frame) -> FrameResult {
        let captured_at = frame.captured_at;
        let now = frame.captured_instant;

        // 1. 检测 (模型错误与 panic 只影响本帧)
        let detections =
            match panic::catch_unwind(AssertUnwindSafe(|| self.model.detect(frame))) {
                Ok(Ok(detections)) => detections,
                Ok(Err(e)) => return self.fail(captured_at, format!("detection failed: {e:#}")),
                Err(payload) => {
                    return self.fail(
                        captured_at,
                        format!("detection model panicked: {}", panic_message(payload.as_ref())),
                    )
                }
            };

        // 2. 目标类别过滤
        let targets: Vec<Detection> = detections
            .into_iter()
            .filter(|d| is_target_class(&self.config.target_classes, &d.class_name))
            .collect();
        for detection in &targets {
            let center = detection.center();
            debug!(
                class = %detection.class_name,
                x = center.x as i32,
                y = center.y as i32,
                confidence = (detection.confidence * 100.0) as i32,
                "detected {}",
                detection.class_name
            );
        }

        // 3. 跟踪 (空帧同样更新, 用于驱逐)
        let (track_events, fresh_entry, stationary_quiet) = {
            let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
            let events = tracker.update_tracking_at(&targets, now);
            let fresh_entry = tracker.has_fresh_entry();
            let stationary_quiet = self
                .policy
                .stationary_timeout()
                .map(|timeout| tracker.all_present_stationary_past(timeout, now))
                .unwrap_or(false);
            (events, fresh_entry, stationary_quiet)
        };
        for event in track_events {
            self.events.emit(&event.into());
        }

        // 4. 照片保存
        if self.config.save_photos {
            if let Some(trigger) =
                self.policy
                    .evaluate(&targets, fresh_entry, stationary_quiet, now)
            {
                match save_photo(frame, &targets, &self.config.output_dir) {
                    Ok(path) => {
                        self.counters.photos_saved.fetch_add(1, Ordering::Relaxed);
                        if trigger.is_novelty() {
                            info!(?trigger, "saving photo immediately due to new objects");
                        }
                        let mut classes: Vec<String> =
                            targets.iter().map(|d| d.class_name.clone()).collect();
                        classes.sort();
                        classes.dedup();
                        self.events.emit(&SentinelEvent::PhotoSaved { path, classes });
                    }
                    Err(e) => {
                        return self.fail(captured_at, format!("failed to save detection photo: {e}"))
                    }
                }
            }
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        FrameResult::processed(captured_at, targets)
    }

    fn fail(&self, captured_at: DateTime<Local>, reason: String) -> FrameResult {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        error!(%reason, "error processing frame");
        self.events.emit(&SentinelEvent::FrameFailed { reason });
        FrameResult::unprocessed(captured_at)
    }

    fn reject(&self, completion: Completion, queue_len: usize) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        self.events.emit(&SentinelEvent::FrameDropped { queue_len });
        completion.reject();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 工作线程: 阻塞等待任务或关闭信号
fn worker_loop(shared: Arc<Shared>, jobs: Receiver<Job>, shutdown: Receiver<()>) {
    debug!("worker thread started");
    loop {
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }

        select! {
            recv(jobs) -> msg => match msg {
                Ok(job) => {
                    // 关闭期间取到的任务直接拒绝
                    if shared.stopping.load(Ordering::Acquire) {
                        shared.reject(job.completion, jobs.len());
                        break;
                    }
                    let result = shared.process(&job.frame);
                    job.completion.complete(result);
                }
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    debug!("worker thread exiting");
}

// ========== 帧处理引擎 ==========

/// 帧处理引擎
///
/// 模型、跟踪器与事件接收端由组合根注入
pub struct FrameProcessor {
    shared: Arc<Shared>,
    job_tx: Mutex<Option<Sender<Job>>>,
    job_rx: Option<Receiver<Job>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FrameProcessor {
    /// 创建引擎并启动工作线程
    ///
    /// 仅输出目录创建失败、线程创建失败时返回错误
    pub fn new(
        model: Arc<dyn DetectionModel>,
        tracker: Arc<Mutex<ObjectTracker>>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Result<Self> {
        if config.save_photos {
            fs::create_dir_all(&config.output_dir)?;
        }

        let policy = PhotoPolicy::new(config.photo_interval(), config.stationary_photo_timeout());
        let workers = config.workers;
        let queue_capacity = config.queue_capacity.max(1);

        let shared = Arc::new(Shared {
            model,
            tracker,
            events,
            policy,
            config,
            counters: Counters::default(),
            stopping: AtomicBool::new(false),
        });

        if workers <= 1 {
            info!(model = %shared.model.name(), "parallel processing disabled, using sequential processing");
            return Ok(Self {
                shared,
                job_tx: Mutex::new(None),
                job_rx: None,
                shutdown_tx: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
            });
        }

        info!(workers, queue_capacity, model = %shared.model.name(), "initializing parallel frame processor");
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(queue_capacity);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        let processor = Self {
            shared,
            job_tx: Mutex::new(Some(job_tx)),
            job_rx: Some(job_rx.clone()),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            workers: Mutex::new(Vec::with_capacity(workers)),
        };

        // 创建失败时 processor 被丢弃, Drop 会关闭已启动的线程
        for i in 0..workers {
            let shared = Arc::clone(&processor.shared);
            let jobs = job_rx.clone();
            let shutdown = shutdown_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("frame-worker-{i}"))
                .spawn(move || worker_loop(shared, jobs, shutdown))
                .map_err(|e| SentinelError::Spawn(e.to_string()))?;
            processor.lock_workers().push(handle);
        }

        Ok(processor)
    }

    /// 提交一帧
    ///
    /// 异步模式下复制帧入队; 队列已满或引擎已关闭时立即返回 `processed = false`
    pub fn submit_frame(&self, frame: &Frame) -> FrameHandle {
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let (completion, handle) = Completion::channel(frame.captured_at);

        if self.shared.stopping.load(Ordering::Acquire) {
            self.shared.reject(completion, self.queue_len());
            return handle;
        }

        if self.job_rx.is_none() {
            let result = self.shared.process(frame);
            completion.complete(result);
            return handle;
        }

        let job = Job {
            frame: frame.clone(),
            completion,
        };
        let rejected = {
            let job_tx = self.job_tx.lock().unwrap_or_else(PoisonError::into_inner);
            let outcome = match job_tx.as_ref() {
                Some(tx) => match tx.try_send(job) {
                    Ok(()) => None,
                    Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                        Some((job.completion, tx.len()))
                    }
                },
                None => Some((job.completion, 0)),
            };
            outcome
        };
        if let Some((completion, queue_len)) = rejected {
            debug!(queue_len, "frame rejected");
            self.shared.reject(completion, queue_len);
        }
        handle
    }

    /// 关闭引擎: 停止接收 → 唤醒并等待工作线程 → 队列剩余帧以未处理完成
    ///
    /// 可重复调用
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.job_rx.is_none() {
            return;
        }

        info!("shutting down parallel frame processor...");
        self.job_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.shutdown_tx.lock().unwrap_or_else(PoisonError::into_inner).take();

        let workers = std::mem::take(&mut *self.lock_workers());
        for worker in workers {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }

        let mut drained = 0usize;
        if let Some(rx) = &self.job_rx {
            for job in rx.try_iter() {
                self.shared.reject(job.completion, 0);
                drained += 1;
            }
        }
        info!(drained, "parallel frame processor shutdown complete");
    }

    /// 当前排队帧数
    pub fn queue_len(&self) -> usize {
        self.job_rx.as_ref().map(|rx| rx.len()).unwrap_or(0)
    }

    pub fn is_parallel(&self) -> bool {
        self.job_rx.is_some()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.counters.snapshot()
    }

    /// 已保存照片总数
    pub fn total_images_saved(&self) -> u64 {
        self.shared.counters.photos_saved.load(Ordering::Relaxed)
    }

    /// 共享跟踪器 (组合根用于场景分析)
    pub fn tracker(&self) -> Arc<Mutex<ObjectTracker>> {
        Arc::clone(&self.shared.tracker)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for FrameProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::replay::{RecordedFrame, ReplayModel};
    use crate::detection::types::{BBox, Point2};
    use crate::events::{ChannelSink, NullSink};

    fn engine_config(workers: usize, save_photos: bool) -> EngineConfig {
        EngineConfig {
            workers,
            save_photos,
            ..EngineConfig::default()
        }
    }

    fn recording(classes: &[&str]) -> Arc<dyn DetectionModel> {
        let detections = classes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Detection::new(*c, 0.8, BBox::centered(Point2::new(100.0 + 200.0 * i as f32, 100.0), 40.0, 40.0))
            })
            .collect();
        Arc::new(ReplayModel::new(vec![RecordedFrame { detections }]))
    }

    #[test]
    fn test_sync_mode_filters_targets() {
        let processor = FrameProcessor::new(
            recording(&["person", "chair"]),
            Arc::new(Mutex::new(ObjectTracker::default())),
            Arc::new(NullSink),
            engine_config(1, false),
        )
        .unwrap();

        assert!(!processor.is_parallel());
        let mut handle = processor.submit_frame(&Frame::blank(320, 240));
        let result = handle.try_result().cloned().unwrap();
        assert!(result.processed);
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].class_name, "person");
        assert_eq!(processor.tracker().lock().unwrap().track_count(), 1);
    }

    #[test]
    fn test_sync_photo_saved_with_event() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, rx) = ChannelSink::bounded(16);
        let config = EngineConfig {
            output_dir: dir.path().to_path_buf(),
            ..engine_config(1, true)
        };
        let processor = FrameProcessor::new(
            recording(&["cat"]),
            Arc::new(Mutex::new(ObjectTracker::default())),
            Arc::new(sink),
            config,
        )
        .unwrap();

        assert!(processor.submit_frame(&Frame::blank(320, 240)).wait().processed);
        assert_eq!(processor.total_images_saved(), 1);

        let events: Vec<SentinelEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, SentinelEvent::ObjectEntered { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, SentinelEvent::PhotoSaved { classes, .. } if classes == &vec!["cat".to_string()])));
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let processor = FrameProcessor::new(
            recording(&["person"]),
            Arc::new(Mutex::new(ObjectTracker::default())),
            Arc::new(NullSink),
            engine_config(2, false),
        )
        .unwrap();

        processor.shutdown();
        processor.shutdown();
        assert!(processor.is_shutdown());
        assert!(!processor.submit_frame(&Frame::blank(16, 16)).wait().processed);
        assert_eq!(processor.stats().dropped, 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
