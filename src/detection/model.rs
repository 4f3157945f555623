/// 检测模型统一接口
///
/// 推理后端 (CPU/GPU, 不同网络结构) 对核心透明, 核心只依赖此 trait。
///
/// ## 核心流程
/// ```text
/// Frame → detect → [Detection] → 目标类别过滤 → 跟踪器
/// ```
use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::types::{Detection, Frame};

/// 安防关注的目标类别 (人、车辆、小动物)
pub const TARGET_CLASSES: &[&str] = &[
    "person",     // 人
    "car",        // 车辆
    "truck",
    "bus",
    "motorcycle",
    "bicycle",
    "cat",        // 小动物
    "dog",
];

/// 模型性能指标
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_name: String,
    pub model_type: String,
    /// 相对精度 (0.0 - 1.0)
    pub accuracy_score: f32,
    pub avg_inference_ms: u32,
    pub model_size_mb: u32,
    pub description: String,
}

/// 检测模型 Trait
///
/// 工作线程共享同一个模型实例, 因此要求 `Send + Sync`;
/// 需要可变状态的后端自行在内部加锁。
pub trait DetectionModel: Send + Sync {
    /// 检测一帧
    ///
    /// # Returns
    /// * `Vec<Detection>` - 全部类别的检测结果 (未做目标类别过滤)
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;

    /// 预热 (一次空推理, 让计时更准确)
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }

    /// 模型性能指标
    fn metrics(&self) -> ModelMetrics;

    /// 模型名称
    fn name(&self) -> String {
        self.metrics().model_name
    }
}

/// 目标类别判定
pub fn is_target_class(target_classes: &[String], class_name: &str) -> bool {
    target_classes.iter().any(|c| c == class_name)
}

/// 默认目标类别列表
pub fn default_target_classes() -> Vec<String> {
    TARGET_CLASSES.iter().map(|c| c.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_classes() {
        let targets = default_target_classes();
        assert!(is_target_class(&targets, "person"));
        assert!(is_target_class(&targets, "dog"));
        assert!(!is_target_class(&targets, "chair"));
    }
}
