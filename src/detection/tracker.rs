//! 目标持续性跟踪 (Object permanence tracking)
//!
//! 按类别 + 空间连续性维持跨帧身份:
//! 1. 同类别最近中心点匹配 (距离阈值内视为同一目标)
//! 2. 未匹配检测 → 新目标 (进入)
//! 3. 长时间未出现 → 驱逐 (离开)
//! 4. 位置历史离散度 → 静止/运动判定

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::TrackerConfig;

use super::types::{BBox, Detection, Point2};

// ========== 公共数据结构 ==========

/// 跟踪对象
#[derive(Debug, Clone)]
pub struct TrackedObject {
    /// 唯一跟踪ID
    pub id: u64,

    /// 目标类别
    pub class_name: String,

    /// 当前中心点
    pub center: Point2,

    /// 上一次的中心点 (新目标与当前相同)
    pub previous_center: Point2,

    /// 最近一次检测框
    pub bbox: BBox,

    /// 最近一次检测置信度
    pub confidence: f32,

    /// 历史中心点 (环形缓冲, 超出容量丢弃最旧)
    pub history: VecDeque<Point2>,

    /// 连续未出现帧数
    pub frames_since_last_seen: u32,

    /// 是否为新进入目标
    pub is_new: bool,

    /// 是否静止
    pub is_stationary: bool,

    /// 进入静止状态的时刻
    pub stationary_since: Option<Instant>,
}

impl TrackedObject {
    fn new(id: u64, detection: &Detection, capacity: usize) -> Self {
        let center = detection.center();
        let mut history = VecDeque::with_capacity(capacity);
        history.push_back(center);

        Self {
            id,
            class_name: detection.class_name.clone(),
            center,
            previous_center: center,
            bbox: detection.bbox,
            confidence: detection.confidence,
            history,
            frames_since_last_seen: 0,
            is_new: true,
            is_stationary: false,
            stationary_since: None,
        }
    }

    /// 本帧是否被检测到
    pub fn seen_this_frame(&self) -> bool {
        self.frames_since_last_seen == 0
    }

    /// 相对上一位置的位移
    pub fn displacement(&self) -> f32 {
        self.previous_center.distance(&self.center)
    }

    /// 静止持续时间 (非静止为 None)
    pub fn dwell_time(&self, now: Instant) -> Option<Duration> {
        self.stationary_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// 最近 `window` 个历史点的最大两两距离
    fn spread(&self, window: usize) -> f32 {
        let skip = self.history.len().saturating_sub(window);
        let recent: Vec<&Point2> = self.history.iter().skip(skip).collect();

        let mut max_distance = 0.0f32;
        for i in 0..recent.len() {
            for j in (i + 1)..recent.len() {
                max_distance = max_distance.max(recent[i].distance(recent[j]));
            }
        }
        max_distance
    }

    fn observe(&mut self, detection: &Detection, capacity: usize) {
        self.previous_center = self.center;
        self.center = detection.center();
        self.bbox = detection.bbox;
        self.confidence = detection.confidence;
        self.history.push_back(self.center);
        while self.history.len() > capacity {
            self.history.pop_front();
        }
        self.frames_since_last_seen = 0;
        self.is_new = false;
    }
}

/// 跟踪事件 (进入 / 移动 / 离开)
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    Entered {
        id: u64,
        class_name: String,
        position: Point2,
        confidence: f32,
    },
    Moved {
        id: u64,
        class_name: String,
        from: Point2,
        to: Point2,
        confidence: f32,
    },
    Exited {
        id: u64,
        class_name: String,
        last_position: Point2,
    },
}

// ========== 跟踪器 ==========

/// 目标跟踪器
///
/// 关联复杂度 O(已有目标 × 本帧检测), 适用于每帧几十个目标的规模
pub struct ObjectTracker {
    config: TrackerConfig,
    objects: Vec<TrackedObject>,
    next_id: u64,
}

impl ObjectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            objects: Vec::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// 更新跟踪 (使用当前时刻)
    pub fn update_tracking(&mut self, detections: &[Detection]) -> Vec<TrackEvent> {
        self.update_tracking_at(detections, Instant::now())
    }

    /// 更新跟踪
    ///
    /// # 参数
    /// - `detections`: 本帧已过滤的目标检测
    /// - `now`: 本帧时刻 (记录静止起始时间)
    ///
    /// # 返回
    /// 本帧产生的进入/移动/离开事件
    pub fn update_tracking_at(&mut self, detections: &[Detection], now: Instant) -> Vec<TrackEvent> {
        let capacity = self.config.history_capacity.max(1);
        let mut events = Vec::new();

        // 1. 所有目标先记为未出现
        for tracked in &mut self.objects {
            tracked.frames_since_last_seen += 1;
        }

        // 2. 同类别最近邻匹配 (每个目标每帧最多匹配一次)
        let mut matched = vec![false; self.objects.len()];
        for detection in detections {
            let center = detection.center();

            let nearest = self
                .objects
                .iter()
                .enumerate()
                .filter(|(idx, t)| !matched[*idx] && t.class_name == detection.class_name)
                .map(|(idx, t)| (idx, t.center.distance(&center)))
                .filter(|(_, distance)| *distance < self.config.max_movement_distance)
                .min_by(|a, b| a.1.total_cmp(&b.1));

            match nearest {
                Some((idx, _)) => {
                    matched[idx] = true;
                    let tracked = &mut self.objects[idx];
                    tracked.observe(detection, capacity);

                    if tracked.displacement() > self.config.movement_noise {
                        events.push(TrackEvent::Moved {
                            id: tracked.id,
                            class_name: tracked.class_name.clone(),
                            from: tracked.previous_center,
                            to: tracked.center,
                            confidence: tracked.confidence,
                        });
                    }
                }
                None => {
                    // 首次出现, 或距离同类目标过远 (视为另一个目标)
                    let tracked = TrackedObject::new(self.next_id, detection, capacity);
                    self.next_id += 1;
                    events.push(TrackEvent::Entered {
                        id: tracked.id,
                        class_name: tracked.class_name.clone(),
                        position: tracked.center,
                        confidence: tracked.confidence,
                    });
                    self.objects.push(tracked);
                    matched.push(true);
                }
            }
        }

        // 3. 静止判定
        let window = self.config.stationary_window.max(3);
        let jitter = self.config.stationary_jitter;
        for tracked in &mut self.objects {
            if tracked.seen_this_frame() {
                Self::classify_motion(tracked, window, jitter, now);
            }
        }

        // 4. 驱逐丢失太久的目标
        let eviction_frames = self.config.eviction_frames;
        self.objects.retain(|t| {
            if t.frames_since_last_seen > eviction_frames {
                events.push(TrackEvent::Exited {
                    id: t.id,
                    class_name: t.class_name.clone(),
                    last_position: t.center,
                });
                false
            } else {
                true
            }
        });

        events
    }

    /// 至少3个历史点; 最近窗口内最大两两距离小于抖动阈值即为静止
    fn classify_motion(tracked: &mut TrackedObject, window: usize, jitter: f32, now: Instant) {
        if tracked.history.len() < 3 {
            return;
        }

        let stationary = tracked.spread(window) < jitter;

        if stationary && !tracked.is_stationary {
            tracked.is_stationary = true;
            tracked.stationary_since = Some(now);
        } else if !stationary && tracked.is_stationary {
            tracked.is_stationary = false;
            tracked.stationary_since = None;
        }
    }

    /// 当前所有跟踪目标
    pub fn tracked_objects(&self) -> &[TrackedObject] {
        &self.objects
    }

    /// 当前静止目标 (快照)
    ///
    /// 连续漏检超过 `stationary_grace_frames` 的目标不计入
    pub fn stationary_objects(&self) -> Vec<TrackedObject> {
        self.objects
            .iter()
            .filter(|t| t.is_stationary && t.frames_since_last_seen <= self.config.stationary_grace_frames)
            .cloned()
            .collect()
    }

    /// 本帧是否有新进入的目标
    pub fn has_fresh_entry(&self) -> bool {
        self.objects
            .iter()
            .any(|t| t.is_new && t.frames_since_last_seen == 0)
    }

    /// 目标静止时长是否超过超时
    pub fn is_stationary_past_timeout(
        &self,
        tracked: &TrackedObject,
        timeout: Duration,
        now: Instant,
    ) -> bool {
        tracked.is_stationary
            && tracked
                .dwell_time(now)
                .map(|dwell| dwell >= timeout)
                .unwrap_or(false)
    }

    /// 本帧出现的目标是否全部静止超时
    pub fn all_present_stationary_past(&self, timeout: Duration, now: Instant) -> bool {
        let mut present = self.objects.iter().filter(|t| t.seen_this_frame()).peekable();
        present.peek().is_some()
            && present.all(|t| self.is_stationary_past_timeout(t, timeout, now))
    }

    /// 跟踪数量
    pub fn track_count(&self) -> usize {
        self.objects.len()
    }

    /// 清除所有跟踪
    pub fn reset(&mut self) {
        self.objects.clear();
    }

    /// 获取跟踪统计信息
    pub fn stats(&self) -> String {
        let stationary = self.objects.iter().filter(|t| t.is_stationary).count();
        format!(
            "跟踪: {} 个 | 静止: {} | 总ID: {}",
            self.objects.len(),
            stationary,
            self.next_id - 1
        )
    }
}

impl Default for ObjectTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_at(cx: f32, cy: f32) -> Detection {
        Detection::new("person", 0.9, BBox::centered(Point2::new(cx, cy), 50.0, 100.0))
    }

    #[test]
    fn test_association_keeps_identity() {
        let mut tracker = ObjectTracker::default();
        let now = Instant::now();
        for i in 0..6 {
            tracker.update_tracking_at(&[person_at(100.0 + i as f32 * 20.0, 100.0)], now);
        }

        let tracked = tracker.tracked_objects();
        assert_eq!(tracked.len(), 1);
        assert!(!tracked[0].is_new);
        assert_eq!(tracked[0].center, Point2::new(200.0, 100.0));
        assert_eq!(tracked[0].previous_center, Point2::new(180.0, 100.0));
    }

    #[test]
    fn test_far_detection_is_new_object() {
        let mut tracker = ObjectTracker::default();
        tracker.update_tracking(&[person_at(100.0, 100.0)]);
        let events = tracker.update_tracking(&[person_at(400.0, 100.0)]);

        assert_eq!(tracker.track_count(), 2);
        assert!(matches!(events[0], TrackEvent::Entered { id: 2, .. }));
    }

    #[test]
    fn test_other_class_never_matches() {
        let mut tracker = ObjectTracker::default();
        tracker.update_tracking(&[person_at(100.0, 100.0)]);
        let cat = Detection::new("cat", 0.7, BBox::centered(Point2::new(105.0, 100.0), 20.0, 20.0));
        tracker.update_tracking(&[cat]);
        assert_eq!(tracker.track_count(), 2);
    }

    #[test]
    fn test_two_detections_do_not_share_one_track() {
        let mut tracker = ObjectTracker::default();
        tracker.update_tracking(&[person_at(100.0, 100.0)]);
        tracker.update_tracking(&[person_at(110.0, 100.0), person_at(130.0, 100.0)]);

        let tracked = tracker.tracked_objects();
        assert_eq!(tracked.len(), 2);
        assert_eq!(tracked[0].center, Point2::new(110.0, 100.0));
        assert!(tracked[1].is_new);
    }

    #[test]
    fn test_history_bounded() {
        let mut tracker = ObjectTracker::default();
        for i in 0..25 {
            tracker.update_tracking(&[person_at(100.0 + i as f32, 100.0)]);
        }
        let tracked = &tracker.tracked_objects()[0];
        assert_eq!(tracked.history.len(), tracker.config().history_capacity);
        assert_eq!(tracked.history.back(), Some(&Point2::new(124.0, 100.0)));
    }

    #[test]
    fn test_eviction_after_threshold() {
        let mut tracker = ObjectTracker::default();
        tracker.update_tracking(&[person_at(100.0, 100.0)]);

        let eviction = tracker.config().eviction_frames;
        for _ in 0..eviction {
            let events = tracker.update_tracking(&[]);
            assert!(events.is_empty());
        }
        assert_eq!(tracker.track_count(), 1);

        let events = tracker.update_tracking(&[]);
        assert_eq!(tracker.track_count(), 0);
        assert!(matches!(&events[0], TrackEvent::Exited { class_name, .. } if class_name == "person"));
    }

    #[test]
    fn test_stationary_transition_and_reset() {
        let mut tracker = ObjectTracker::default();
        let now = Instant::now();
        for _ in 0..3 {
            tracker.update_tracking_at(&[person_at(100.0, 100.0)], now);
        }
        assert!(tracker.tracked_objects()[0].is_stationary);
        assert_eq!(tracker.stationary_objects().len(), 1);

        tracker.update_tracking_at(&[person_at(130.0, 100.0)], now);
        let tracked = &tracker.tracked_objects()[0];
        assert!(!tracked.is_stationary);
        assert!(tracked.stationary_since.is_none());
    }

    #[test]
    fn test_stationary_objects_skip_missing() {
        let mut tracker = ObjectTracker::default();
        let now = Instant::now();
        for _ in 0..3 {
            tracker.update_tracking_at(&[person_at(100.0, 100.0)], now);
        }

        let grace = tracker.config().stationary_grace_frames;
        for _ in 0..grace {
            tracker.update_tracking_at(&[], now);
        }
        assert_eq!(tracker.stationary_objects().len(), 1);

        // 已离开但尚未驱逐
        tracker.update_tracking_at(&[], now);
        assert!(tracker.stationary_objects().is_empty());
        assert_eq!(tracker.track_count(), 1);
    }

    #[test]
    fn test_reset_clears_tracks() {
        let mut tracker = ObjectTracker::default();
        tracker.update_tracking(&[person_at(100.0, 100.0)]);
        tracker.update_tracking(&[person_at(101.0, 100.0)]);
        assert!(!tracker.tracked_objects()[0].is_new);

        tracker.reset();
        assert_eq!(tracker.track_count(), 0);

        tracker.update_tracking(&[person_at(101.0, 100.0)]);
        assert!(tracker.tracked_objects()[0].is_new);
        assert!(tracker.has_fresh_entry());
    }

    #[test]
    fn test_movement_event_above_noise() {
        let mut tracker = ObjectTracker::default();
        tracker.update_tracking(&[person_at(100.0, 100.0)]);

        let jitter = tracker.update_tracking(&[person_at(103.0, 100.0)]);
        assert!(jitter.is_empty());

        let moved = tracker.update_tracking(&[person_at(120.0, 100.0)]);
        assert!(matches!(moved[0], TrackEvent::Moved { .. }));
    }

    #[test]
    fn test_stationary_past_timeout() {
        let mut tracker = ObjectTracker::default();
        let start = Instant::now();
        for _ in 0..3 {
            tracker.update_tracking_at(&[person_at(100.0, 100.0)], start);
        }
        let tracked = tracker.tracked_objects()[0].clone();
        let timeout = Duration::from_secs(2);

        assert!(!tracker.is_stationary_past_timeout(&tracked, timeout, start + Duration::from_secs(1)));
        assert!(tracker.is_stationary_past_timeout(&tracked, timeout, start + Duration::from_secs(3)));
        assert!(tracker.all_present_stationary_past(timeout, start + Duration::from_secs(3)));
    }
}
