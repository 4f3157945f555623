/// 场景识别 (Scene recognition)
///
/// 静止目标的空间布局构成一个场景:
/// - analysis:    区域颜色、朝向等目标属性
/// - fingerprint: 场景指纹与相似度
/// - store:       SQLite 持久化 (只追加)
/// - matcher:     观察窗口、匹配或新建场景
pub mod analysis;
pub mod fingerprint;
pub mod matcher;
pub mod store;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Local};

use crate::config::SceneConfig;
use crate::detection::types::{BBox, Point2};

pub use fingerprint::Fingerprint;
pub use matcher::{SceneMatcher, SceneOutcome};
pub use store::SceneStore;

// ========== 数据结构 ==========

/// 场景中的一个静止目标
#[derive(Debug, Clone, PartialEq)]
pub struct SceneObject {
    pub class_name: String,
    pub position: Point2,
    /// 采样区域
    pub region: BBox,
    /// 区域平均颜色 (RGB)
    pub color: [u8; 3],
    /// 朝向 (度, 二阶矩估计)
    pub orientation: f32,
}

impl SceneObject {
    /// 颜色的 `#rrggbb` 表示
    pub fn color_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.color[0], self.color[1], self.color[2])
    }

    /// 尺寸的 `WxH` 表示
    pub fn size_label(&self) -> String {
        format!("{}x{}", self.region.width.round() as i64, self.region.height.round() as i64)
    }
}

/// 两个目标之间的空间关系 (下标指向 `Scene::objects`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Relationship {
    pub object1_idx: usize,
    pub object2_idx: usize,
    pub distance: f32,
    /// 由目标1指向目标2的方向角 (度)
    pub angle: f32,
}

/// 场景快照 (创建后不再修改)
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    /// 数据库ID (0 = 尚未持久化)
    pub id: i64,
    pub created_at: DateTime<Local>,
    pub description: String,
    pub objects: Vec<SceneObject>,
    pub relationships: Vec<Relationship>,
    pub fingerprint: Fingerprint,
}

impl Scene {
    /// 由静止目标构建场景 (网格按配置的工作分辨率划分)
    pub fn build(objects: Vec<SceneObject>, config: &SceneConfig) -> Self {
        Self::build_in_frame(objects, config, (config.frame_width, config.frame_height))
    }

    /// 由静止目标构建场景, 网格按实际帧尺寸划分
    ///
    /// 目标按 (类别, x, y) 排序, 保证配对顺序稳定
    pub fn build_in_frame(
        mut objects: Vec<SceneObject>,
        config: &SceneConfig,
        (frame_width, frame_height): (u32, u32),
    ) -> Self {
        sort_objects(&mut objects);
        let relationships = relationships(&objects);
        let grid = Fingerprint::occupancy_grid(&objects, config.grid_size, frame_width, frame_height);
        let fingerprint = Fingerprint::new(&objects, &relationships, grid);

        Self {
            id: 0,
            created_at: Local::now(),
            description: describe(&objects),
            objects,
            relationships,
            fingerprint,
        }
    }

    /// 各类别数量
    pub fn object_counts(&self) -> &BTreeMap<String, usize> {
        &self.fingerprint.counts
    }
}

// ========== 辅助函数 ==========

/// 按 (类别, x, y) 排序
pub fn sort_objects(objects: &mut [SceneObject]) {
    objects.sort_by(|a, b| {
        a.class_name
            .cmp(&b.class_name)
            .then_with(|| a.position.x.total_cmp(&b.position.x))
            .then_with(|| a.position.y.total_cmp(&b.position.y))
    });
}

/// 两两空间关系 (i < j)
pub fn relationships(objects: &[SceneObject]) -> Vec<Relationship> {
    let mut relations = Vec::new();
    for i in 0..objects.len() {
        for j in (i + 1)..objects.len() {
            let (a, b) = (&objects[i].position, &objects[j].position);
            relations.push(Relationship {
                object1_idx: i,
                object2_idx: j,
                distance: a.distance(b),
                angle: a.angle_to(b),
            });
        }
    }
    relations
}

/// 场景描述: `2x person, 1x car arranged in frame`
pub fn describe(objects: &[SceneObject]) -> String {
    if objects.is_empty() {
        return String::new();
    }
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for object in objects {
        *counts.entry(object.class_name.as_str()).or_insert(0) += 1;
    }
    let parts: Vec<String> = counts
        .iter()
        .map(|(class, count)| format!("{count}x {class}"))
        .collect();
    format!("{} arranged in frame", parts.join(", "))
}

/// 对浮点数排序比较 (NaN 视为相等)
pub(crate) fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}
