//! 场景匹配 (Scene matcher)
//!
//! 1. 观察窗口: 出现静止目标时开启, 空更新时关闭
//! 2. 窗口持续 `min_observation` 后可分析
//! 3. 与最近的候选场景比较指纹, 最高分 >= 阈值即为回到旧场景, 否则持久化新场景

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::SceneConfig;
use crate::detection::tracker::TrackedObject;
use crate::detection::types::Frame;
use crate::error::Result;
use crate::events::{EventSink, SentinelEvent};

use super::analysis::describe_object;
use super::{cmp_f64, Scene, SceneObject, SceneStore};

/// 场景分析结果
#[derive(Debug, Clone, PartialEq)]
pub enum SceneOutcome {
    /// 回到之前的场景
    Recognized {
        scene_id: i64,
        score: f64,
        description: String,
    },
    /// 新场景已持久化
    Created { scene_id: i64, description: String },
    /// 观察时间不足或没有静止目标
    NotReady,
    /// 读写场景库失败 (已回滚)
    PersistFailed,
}

/// 场景匹配器
pub struct SceneMatcher {
    store: SceneStore,
    config: SceneConfig,
    events: Arc<dyn EventSink>,
    observation_start: Option<Instant>,
    current_objects: Vec<SceneObject>,
    /// 最近一次观察的帧尺寸 (空间网格基准)
    frame_size: (u32, u32),
}

impl SceneMatcher {
    pub fn new(store: SceneStore, config: SceneConfig, events: Arc<dyn EventSink>) -> Self {
        info!(
            distance_tolerance = config.distance_tolerance,
            angle_tolerance = config.angle_tolerance,
            min_match_score = config.min_match_score,
            "scene matcher initialized"
        );
        Self {
            frame_size: (config.frame_width, config.frame_height),
            store,
            config,
            events,
            observation_start: None,
            current_objects: Vec::new(),
        }
    }

    /// 打开配置中的数据库
    pub fn open(config: SceneConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        let store = SceneStore::open(&config.db_path)?;
        Ok(Self::new(store, config, events))
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// 更新观察 (使用当前时刻)
    pub fn update_observation(&mut self, tracked: &[TrackedObject], frame: &Frame) {
        self.update_observation_at(tracked, frame, Instant::now());
    }

    /// 更新观察: 只保留静止目标
    pub fn update_observation_at(&mut self, tracked: &[TrackedObject], frame: &Frame, now: Instant) {
        let objects: Vec<SceneObject> = tracked
            .iter()
            .filter(|t| t.is_stationary)
            .map(|t| describe_object(t, frame, self.config.estimated_object_size))
            .collect();

        if objects.is_empty() {
            if self.observation_start.take().is_some() {
                debug!("scene observation closed");
            }
            self.current_objects.clear();
            return;
        }

        if self.observation_start.is_none() {
            debug!(objects = objects.len(), "started new scene observation");
            self.observation_start = Some(now);
        }
        self.current_objects = objects;
        // 空帧沿用配置的工作分辨率
        self.frame_size = if frame.is_empty() {
            (self.config.frame_width, self.config.frame_height)
        } else {
            (frame.width(), frame.height())
        };
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready_at(Instant::now())
    }

    /// 观察窗口已开启、有静止目标, 且持续时间足够
    pub fn is_ready_at(&self, now: Instant) -> bool {
        match self.observation_start {
            Some(start) => {
                !self.current_objects.is_empty()
                    && now.saturating_duration_since(start) >= self.config.min_observation()
            }
            None => false,
        }
    }

    /// 当前观察到的静止目标
    pub fn observed_objects(&self) -> &[SceneObject] {
        &self.current_objects
    }

    pub fn analyze_and_persist_scene(&mut self) -> SceneOutcome {
        self.analyze_and_persist_scene_at(Instant::now())
    }

    /// 分析当前观察: 匹配旧场景或持久化新场景
    pub fn analyze_and_persist_scene_at(&mut self, now: Instant) -> SceneOutcome {
        if !self.is_ready_at(now) {
            debug!("scene not ready for analysis yet");
            return SceneOutcome::NotReady;
        }

        let scene = Scene::build_in_frame(self.current_objects.clone(), &self.config, self.frame_size);
        info!(objects = scene.objects.len(), "analyzing scene with stationary objects");

        let candidates = match self.store.load_scenes(self.config.max_candidates) {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "failed to load stored scenes");
                return SceneOutcome::PersistFailed;
            }
        };

        // 同分时保留ID较小者
        let best = candidates
            .iter()
            .map(|stored| (stored, scene.fingerprint.similarity(&stored.fingerprint, &self.config)))
            .fold(None, |best: Option<(&Scene, f64)>, (stored, score)| match best {
                Some((_, best_score)) if cmp_f64(score, best_score).is_le() => best,
                _ => Some((stored, score)),
            });

        if let Some((stored, score)) = best {
            if score >= self.config.min_match_score {
                let outcome = SceneOutcome::Recognized {
                    scene_id: stored.id,
                    score,
                    description: stored.description.clone(),
                };
                self.events.emit(&SentinelEvent::SceneRecognized {
                    scene_id: stored.id,
                    score,
                    description: stored.description.clone(),
                });
                return outcome;
            }
            debug!(best_id = stored.id, score, "no stored scene above match threshold");
        }

        match self.store.insert_scene(&scene) {
            Ok(scene_id) => {
                self.events.emit(&SentinelEvent::SceneCreated {
                    scene_id,
                    description: scene.description.clone(),
                });
                SceneOutcome::Created {
                    scene_id,
                    description: scene.description,
                }
            }
            Err(e) => {
                error!(error = %e, "failed to persist scene, rolled back");
                SceneOutcome::PersistFailed
            }
        }
    }

    /// 所有已存储场景
    pub fn all_scenes(&self) -> Result<Vec<Scene>> {
        self.store.load_scenes(None)
    }

    pub fn scene(&self, id: i64) -> Result<Option<Scene>> {
        self.store.scene(id)
    }

    pub fn scene_count(&self) -> usize {
        self.store.scene_count().unwrap_or_else(|e| {
            warn!(error = %e, "failed to count scenes");
            0
        })
    }

    /// 关闭观察窗口
    pub fn reset_observation(&mut self) {
        self.observation_start = None;
        self.current_objects.clear();
        debug!("scene observation reset");
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &SceneStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::tracker::ObjectTracker;
    use crate::detection::types::{BBox, Detection, Point2};
    use crate::events::{ChannelSink, NullSink};
    use std::time::Duration;

    fn config() -> SceneConfig {
        SceneConfig {
            min_observation_secs: 2.0,
            ..SceneConfig::default()
        }
    }

    fn stationary(tracker: &mut ObjectTracker, objects: &[(&str, f32, f32)], now: Instant) -> Vec<TrackedObject> {
        let detections: Vec<Detection> = objects
            .iter()
            .map(|(c, x, y)| Detection::new(*c, 0.9, BBox::centered(Point2::new(*x, *y), 60.0, 60.0)))
            .collect();
        for _ in 0..3 {
            tracker.update_tracking_at(&detections, now);
        }
        tracker.stationary_objects()
    }

    #[test]
    fn test_not_ready_until_min_observation() {
        let mut matcher = SceneMatcher::new(SceneStore::open_in_memory().unwrap(), config(), Arc::new(NullSink));
        let frame = Frame::blank(1280, 720);
        let t0 = Instant::now();
        let objects = stationary(&mut ObjectTracker::default(), &[("person", 200.0, 300.0)], t0);

        matcher.update_observation_at(&objects, &frame, t0);
        assert!(!matcher.is_ready_at(t0 + Duration::from_secs(1)));
        assert_eq!(matcher.analyze_and_persist_scene_at(t0 + Duration::from_secs(1)), SceneOutcome::NotReady);
        assert!(matcher.is_ready_at(t0 + Duration::from_secs(2)));

        // 空更新关闭窗口
        matcher.update_observation_at(&[], &frame, t0 + Duration::from_secs(3));
        assert!(!matcher.is_ready_at(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_create_then_recognize() {
        let (sink, rx) = ChannelSink::bounded(8);
        let mut matcher = SceneMatcher::new(SceneStore::open_in_memory().unwrap(), config(), Arc::new(sink));
        let frame = Frame::blank(1280, 720);
        let t0 = Instant::now();
        let layout = [("person", 200.0, 300.0), ("car", 900.0, 500.0)];
        let objects = stationary(&mut ObjectTracker::default(), &layout, t0);

        matcher.update_observation_at(&objects, &frame, t0);
        let created = matcher.analyze_and_persist_scene_at(t0 + Duration::from_secs(3));
        let SceneOutcome::Created { scene_id, description } = created.clone() else {
            panic!("expected new scene, got {created:?}");
        };
        assert_eq!(description, "1x car, 1x person arranged in frame");

        let recognized = matcher.analyze_and_persist_scene_at(t0 + Duration::from_secs(4));
        assert!(matches!(recognized, SceneOutcome::Recognized { scene_id: id, .. } if id == scene_id));
        assert_eq!(matcher.scene_count(), 1);

        let events: Vec<SentinelEvent> = rx.try_iter().collect();
        assert!(matches!(events[0], SentinelEvent::SceneCreated { .. }));
        assert!(matches!(events[1], SentinelEvent::SceneRecognized { .. }));
    }

    #[test]
    fn test_persist_failure_reported() {
        let mut matcher = SceneMatcher::new(SceneStore::open_in_memory().unwrap(), config(), Arc::new(NullSink));
        matcher
            .store()
            .connection()
            .execute_batch("DROP TABLE object_relationships;")
            .unwrap();

        let t0 = Instant::now();
        let objects = stationary(
            &mut ObjectTracker::default(),
            &[("person", 200.0, 300.0), ("dog", 700.0, 400.0)],
            t0,
        );
        matcher.update_observation_at(&objects, &Frame::blank(1280, 720), t0);
        assert_eq!(matcher.analyze_and_persist_scene_at(t0 + Duration::from_secs(5)), SceneOutcome::PersistFailed);
        assert_eq!(matcher.scene_count(), 0);
    }

    #[test]
    fn test_reset_observation() {
        let mut matcher = SceneMatcher::new(SceneStore::open_in_memory().unwrap(), config(), Arc::new(NullSink));
        let t0 = Instant::now();
        let objects = stationary(&mut ObjectTracker::default(), &[("cat", 100.0, 100.0)], t0);
        matcher.update_observation_at(&objects, &Frame::blank(1280, 720), t0);
        assert_eq!(matcher.observed_objects().len(), 1);

        matcher.reset_observation();
        assert!(matcher.observed_objects().is_empty());
        assert!(!matcher.is_ready_at(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_single_object_never_matches_pair_in_same_cell() {
        let mut matcher = SceneMatcher::new(SceneStore::open_in_memory().unwrap(), config(), Arc::new(NullSink));
        let frame = Frame::blank(1280, 720);
        let t0 = Instant::now();

        let pair = stationary(
            &mut ObjectTracker::default(),
            &[("person", 100.0, 100.0), ("car", 250.0, 150.0)],
            t0,
        );
        matcher.update_observation_at(&pair, &frame, t0);
        let stored = matcher.analyze_and_persist_scene_at(t0 + Duration::from_secs(3));
        assert!(matches!(stored, SceneOutcome::Created { scene_id: 1, .. }), "got {stored:?}");

        let alone = stationary(&mut ObjectTracker::default(), &[("person", 100.0, 100.0)], t0);
        matcher.reset_observation();
        matcher.update_observation_at(&alone, &frame, t0);
        let outcome = matcher.analyze_and_persist_scene_at(t0 + Duration::from_secs(3));
        assert!(matches!(outcome, SceneOutcome::Created { scene_id: 2, .. }), "got {outcome:?}");
    }

    #[test]
    fn test_grid_follows_observed_frame_size() {
        let mut matcher = SceneMatcher::new(SceneStore::open_in_memory().unwrap(), config(), Arc::new(NullSink));
        let t0 = Instant::now();
        // 640x480 下分属不同单元; 按 1280x720 划分则同在 [0][0]
        let objects = stationary(
            &mut ObjectTracker::default(),
            &[("person", 100.0, 100.0), ("dog", 300.0, 150.0)],
            t0,
        );
        matcher.update_observation_at(&objects, &Frame::blank(640, 480), t0);
        let outcome = matcher.analyze_and_persist_scene_at(t0 + Duration::from_secs(3));
        let SceneOutcome::Created { scene_id, .. } = outcome else {
            panic!("expected new scene, got {outcome:?}");
        };

        let grid = matcher.scene(scene_id).unwrap().unwrap().fingerprint.grid;
        assert_eq!(grid[0][0], 1);
        assert_eq!(grid[1][1], 1);
    }
}
