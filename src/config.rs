//! 系统配置 - 通过JSON文件调整参数

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detection::model::default_target_classes;
use crate::error::{Result, SentinelError};

/// 帧处理引擎参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,        // 工作线程数 (<=1 为同步模式)
    pub queue_capacity: usize, // 队列容量 (满则丢弃新帧)
    pub target_classes: Vec<String>,

    // === 照片保存策略 ===
    pub save_photos: bool,
    pub output_dir: PathBuf,
    pub photo_interval_secs: f64, // 无新目标时的最小保存间隔
    /// 全部目标静止超过该时长后不再按间隔保存 (None = 不限制)
    pub stationary_photo_timeout_secs: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 10,
            target_classes: default_target_classes(),
            save_photos: true,
            output_dir: PathBuf::from("detections"),
            photo_interval_secs: 10.0,
            stationary_photo_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn photo_interval(&self) -> Duration {
        Duration::from_secs_f64(self.photo_interval_secs.max(0.0))
    }

    pub fn stationary_photo_timeout(&self) -> Option<Duration> {
        self.stationary_photo_timeout_secs
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// 跟踪器参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_movement_distance: f32, // 同一目标帧间最大位移(像素)
    pub eviction_frames: u32,       // 超过该帧数未出现则驱逐
    pub history_capacity: usize,    // 历史轨迹长度
    pub stationary_window: usize,   // 静止判定窗口 (最近K个点)
    pub stationary_jitter: f32,     // 静止判定抖动阈值(像素)
    pub movement_noise: f32,        // 移动事件噪声阈值(像素)
    pub stationary_grace_frames: u32, // 静止目标漏检超过该帧数不再计入场景
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_movement_distance: 100.0,
            eviction_frames: 30,
            history_capacity: 10,
            stationary_window: 5,
            stationary_jitter: 10.0,
            movement_noise: 5.0,
            stationary_grace_frames: 5,
        }
    }
}

/// 场景匹配参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub db_path: PathBuf,
    pub frame_width: u32,  // 工作分辨率 (空间网格基准)
    pub frame_height: u32,
    pub grid_size: usize,  // 空间网格 N×N
    pub min_observation_secs: f64,
    pub analysis_interval_secs: f64, // 组合根调用场景分析的周期
    pub distance_tolerance: f32,     // 距离相对容差
    pub angle_tolerance: f32,        // 角度容差(度)
    pub object_count_tolerance: f64, // 目标总数相对容差, 超出直接判为不相似
    pub min_match_score: f64,
    pub max_candidates: Option<usize>, // 只比较最近K个场景 (None = 全部)
    pub estimated_object_size: f32,    // 无检测框时的估计尺寸(像素)
    pub weights: SimilarityWeights,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("scenes.db"),
            frame_width: crate::detection::types::WORKING_WIDTH,
            frame_height: crate::detection::types::WORKING_HEIGHT,
            grid_size: 4,
            min_observation_secs: 60.0,
            analysis_interval_secs: 30.0,
            distance_tolerance: 0.2,
            angle_tolerance: 15.0,
            object_count_tolerance: 0.2,
            min_match_score: 0.7,
            max_candidates: None,
            estimated_object_size: 100.0,
            weights: SimilarityWeights::default(),
        }
    }
}

impl SceneConfig {
    pub fn min_observation(&self) -> Duration {
        Duration::from_secs_f64(self.min_observation_secs.max(0.0))
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_secs_f64(self.analysis_interval_secs.max(0.0))
    }
}

/// 相似度权重 (经验调参值)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    // 两侧均有 >=2 个目标
    pub counts: f64,
    pub spatial: f64,
    pub relationships: f64,
    // 任一侧少于2个目标 (无关系可比)
    pub sparse_counts: f64,
    pub sparse_spatial: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            counts: 0.4,
            spatial: 0.4,
            relationships: 0.2,
            sparse_counts: 0.5,
            sparse_spatial: 0.5,
        }
    }
}

/// 系统总配置
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub engine: EngineConfig,
    pub tracker: TrackerConfig,
    pub scene: SceneConfig,
}

impl SentinelConfig {
    /// 从JSON文件加载配置
    ///
    /// 文件不存在时写出默认配置; 解析失败时使用默认值
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!(path = %path.display(), "配置已加载");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "配置文件解析失败, 使用默认值");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "配置文件不存在, 创建默认配置");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!(path = %path.display(), error = %e, "保存默认配置失败");
                }
                config
            }
        }
    }

    /// 检查取值范围
    pub fn validate(&self) -> Result<()> {
        if self.engine.queue_capacity == 0 {
            return Err(SentinelError::config("engine.queue_capacity must be at least 1"));
        }
        if self.tracker.history_capacity < 3 {
            return Err(SentinelError::config("tracker.history_capacity must be at least 3"));
        }
        if self.scene.grid_size == 0 {
            return Err(SentinelError::config("scene.grid_size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.scene.min_match_score) {
            return Err(SentinelError::config(format!(
                "scene.min_match_score {} outside 0..=1",
                self.scene.min_match_score
            )));
        }
        if self.scene.object_count_tolerance < 0.0 {
            return Err(SentinelError::config("scene.object_count_tolerance must not be negative"));
        }
        Ok(())
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        info!(
            workers = self.engine.workers,
            queue_capacity = self.engine.queue_capacity,
            photo_interval_secs = self.engine.photo_interval_secs,
            "引擎配置"
        );
        info!(
            max_movement = self.tracker.max_movement_distance,
            eviction_frames = self.tracker.eviction_frames,
            stationary_jitter = self.tracker.stationary_jitter,
            "跟踪器配置"
        );
        info!(
            db = %self.scene.db_path.display(),
            min_observation_secs = self.scene.min_observation_secs,
            min_match_score = self.scene.min_match_score,
            "场景匹配配置"
        );
    }
}
