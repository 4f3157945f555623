// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod cancel; // 取消令牌
pub mod config; // 系统配置
pub mod detection; // 检测模型接口与目标跟踪
pub mod error; // 错误类型
pub mod events; // 结构化事件
pub mod pipeline; // 帧处理引擎
pub mod scene; // 场景识别

pub use crate::cancel::CancellationToken;
pub use crate::config::{EngineConfig, SceneConfig, SentinelConfig, SimilarityWeights, TrackerConfig};
pub use crate::detection::{
    BBox, Detection, DetectionModel, Frame, ModelMetrics, ObjectTracker, Point2, ReplayModel,
    TrackEvent, TrackedObject,
};
pub use crate::error::{Result, SentinelError};
pub use crate::events::{ChannelSink, EventSink, FanoutSink, NullSink, SentinelEvent, TracingSink};
pub use crate::pipeline::{EngineStats, FrameHandle, FrameProcessor, FrameResult};
pub use crate::scene::{Scene, SceneMatcher, SceneObject, SceneOutcome, SceneStore};
