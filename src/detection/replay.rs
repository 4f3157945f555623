//! 回放模型 (Replay model)
//! 按帧序号回放录制好的检测结果, 用于离线运行与测试

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::model::{DetectionModel, ModelMetrics};
use super::types::{Detection, Frame};

/// 录制文件中的一帧
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordedFrame {
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// 回放检测模型
///
/// 每次 `detect` 取下一帧录制结果, 到末尾后循环
pub struct ReplayModel {
    frames: Vec<RecordedFrame>,
    cursor: AtomicUsize,
}

impl ReplayModel {
    pub fn new(frames: Vec<RecordedFrame>) -> Self {
        Self {
            frames,
            cursor: AtomicUsize::new(0),
        }
    }

    /// 从JSON文件加载 (`[{"detections": [...]}, ...]`)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("读取检测录制文件失败: {}", path.display()))?;
        let frames: Vec<RecordedFrame> = serde_json::from_str(&json)
            .with_context(|| format!("解析检测录制文件失败: {}", path.display()))?;
        Ok(Self::new(frames))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl DetectionModel for ReplayModel {
    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
        if self.frames.is_empty() {
            return Ok(Vec::new());
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.frames.len();
        Ok(self.frames[idx].detections.clone())
    }

    fn metrics(&self) -> ModelMetrics {
        ModelMetrics {
            model_name: "replay".to_string(),
            model_type: "recorded".to_string(),
            accuracy_score: 1.0,
            avg_inference_ms: 0,
            model_size_mb: 0,
            description: format!("回放 {} 帧录制检测结果", self.frames.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::BBox;

    #[test]
    fn test_replay_cycles() {
        let model = ReplayModel::new(vec![
            RecordedFrame {
                detections: vec![Detection::new("cat", 0.8, BBox::new(0.0, 0.0, 10.0, 10.0))],
            },
            RecordedFrame::default(),
        ]);
        let frame = Frame::blank(4, 4);
        assert_eq!(model.detect(&frame).unwrap().len(), 1);
        assert!(model.detect(&frame).unwrap().is_empty());
        assert_eq!(model.detect(&frame).unwrap()[0].class_name, "cat");
    }

    #[test]
    fn test_parse_recording() {
        let json = r#"[{"detections":[{"class_name":"person","confidence":0.9,
            "bbox":{"x":75.0,"y":50.0,"width":50.0,"height":100.0}}]}, {}]"#;
        let frames: Vec<RecordedFrame> = serde_json::from_str(json).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].detections[0].center().x, 100.0);
    }
}
