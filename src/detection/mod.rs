/// 检测与跟踪 (Detection & Tracking)
///
/// - types:   帧、检测框等基础数据结构
/// - model:   检测模型 Trait (推理后端对核心透明)
/// - replay:  回放录制检测结果的模型
/// - tracker: 目标持续性跟踪
pub mod model;
pub mod replay;
pub mod tracker;
pub mod types;

pub use model::{default_target_classes, is_target_class, DetectionModel, ModelMetrics};
pub use replay::{RecordedFrame, ReplayModel};
pub use tracker::{ObjectTracker, TrackEvent, TrackedObject};
pub use types::{BBox, Detection, Frame, Point2};
