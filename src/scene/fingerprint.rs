//! 场景指纹 (Scene fingerprint)
//!
//! 指纹 = 类别计数 + 两两空间关系 + N×N 占用网格。
//! 目标总数相差超过 `object_count_tolerance` 时直接为 0, 否则为三个 [0,1] 子分数的加权和:
//! 1. 类别计数: 各类别 min/max 的平均
//! 2. 空间分布: 网格 Pearson 相关系数映射到 (r+1)/2
//! 3. 空间关系: 同类别对中距离、角度均在容差内的一对一匹配比例 (取误差最小者)

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{SceneConfig, SimilarityWeights};

use super::{Relationship, SceneObject};

/// 带类别的空间关系 (class_a <= class_b)
#[derive(Debug, Clone, PartialEq)]
pub struct PairRelation {
    pub class_a: String,
    pub class_b: String,
    pub distance: f32,
    pub angle: f32,
}

/// 场景指纹
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fingerprint {
    pub counts: BTreeMap<String, usize>,
    pub relations: Vec<PairRelation>,
    /// 占用网格 (行优先, grid[row][col])
    pub grid: Vec<Vec<u32>>,
}

impl Fingerprint {
    /// 由已排序的目标与其关系构建
    pub fn new(objects: &[SceneObject], relationships: &[Relationship], grid: Vec<Vec<u32>>) -> Self {
        let mut counts = BTreeMap::new();
        for object in objects {
            *counts.entry(object.class_name.clone()).or_insert(0) += 1;
        }
        Self::from_parts(counts, grid, objects, relationships)
    }

    /// 由持久化数据重建 (计数与网格直接取自存储)
    pub fn from_parts(
        counts: BTreeMap<String, usize>,
        grid: Vec<Vec<u32>>,
        objects: &[SceneObject],
        relationships: &[Relationship],
    ) -> Self {
        let relations = relationships
            .iter()
            .filter_map(|r| {
                let a = objects.get(r.object1_idx)?;
                let b = objects.get(r.object2_idx)?;
                let (class_a, class_b) = if a.class_name <= b.class_name {
                    (a.class_name.clone(), b.class_name.clone())
                } else {
                    (b.class_name.clone(), a.class_name.clone())
                };
                Some(PairRelation {
                    class_a,
                    class_b,
                    distance: r.distance,
                    angle: r.angle,
                })
            })
            .collect();

        Self {
            counts,
            relations,
            grid,
        }
    }

    /// 目标中心点落入的网格计数
    pub fn occupancy_grid(
        objects: &[SceneObject],
        grid_size: usize,
        frame_width: u32,
        frame_height: u32,
    ) -> Vec<Vec<u32>> {
        let n = grid_size.max(1);
        let mut grid = vec![vec![0u32; n]; n];
        let cell = |v: f32, extent: u32| -> usize {
            if extent == 0 || !v.is_finite() {
                return 0;
            }
            let idx = (v / extent as f32 * n as f32).floor();
            (idx.max(0.0) as usize).min(n - 1)
        };
        for object in objects {
            let col = cell(object.position.x, frame_width);
            let row = cell(object.position.y, frame_height);
            grid[row][col] += 1;
        }
        grid
    }

    pub fn object_count(&self) -> usize {
        self.counts.values().sum()
    }

    /// 与另一指纹的相似度 (0.0 - 1.0)
    pub fn similarity(&self, other: &Fingerprint, config: &SceneConfig) -> f64 {
        let (n1, n2) = (self.object_count(), other.object_count());
        if n1.abs_diff(n2) as f64 > n1.max(n2) as f64 * config.object_count_tolerance {
            return 0.0;
        }

        let counts = count_similarity(&self.counts, &other.counts);
        let spatial = spatial_similarity(&self.grid, &other.grid);

        let SimilarityWeights {
            counts: w_counts,
            spatial: w_spatial,
            relationships: w_relations,
            sparse_counts,
            sparse_spatial,
        } = config.weights;

        if n1 >= 2 && n2 >= 2 {
            let relations = relation_similarity(
                &self.relations,
                &other.relations,
                config.distance_tolerance,
                config.angle_tolerance,
            );
            weighted(&[(w_counts, counts), (w_spatial, spatial), (w_relations, relations)])
        } else {
            weighted(&[(sparse_counts, counts), (sparse_spatial, spatial)])
        }
    }
}

/// 加权平均 (权重和不为1时归一化)
fn weighted(parts: &[(f64, f64)]) -> f64 {
    let total: f64 = parts.iter().map(|(w, _)| w.max(0.0)).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let score: f64 = parts.iter().map(|(w, s)| w.max(0.0) * s).sum();
    (score / total).clamp(0.0, 1.0)
}

/// 类别计数相似度: 类别并集上 min/max 的平均
pub fn count_similarity(a: &BTreeMap<String, usize>, b: &BTreeMap<String, usize>) -> f64 {
    let classes: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    if classes.is_empty() {
        return 1.0;
    }
    let sum: f64 = classes
        .iter()
        .map(|class| {
            let x = a.get(*class).copied().unwrap_or(0);
            let y = b.get(*class).copied().unwrap_or(0);
            let max = x.max(y);
            if max == 0 {
                1.0
            } else {
                x.min(y) as f64 / max as f64
            }
        })
        .sum();
    sum / classes.len() as f64
}

/// 空间分布相似度: Pearson 相关系数 r → (r+1)/2
///
/// 任一网格无方差时: 完全相同为 1.0, 否则 0.5
pub fn spatial_similarity(a: &[Vec<u32>], b: &[Vec<u32>]) -> f64 {
    let xs: Vec<f64> = a.iter().flatten().map(|&v| v as f64).collect();
    let ys: Vec<f64> = b.iter().flatten().map(|&v| v as f64).collect();
    if xs.len() != ys.len() || xs.is_empty() {
        return 0.5;
    }

    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(&ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return if xs == ys { 1.0 } else { 0.5 };
    }

    let r = (cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0);
    (r + 1.0) / 2.0
}

/// 两个角度之差 (0..=180)
fn angle_difference(a: f32, b: f32) -> f32 {
    let d = (a - b).abs() % 360.0;
    d.min(360.0 - d)
}

/// 空间关系相似度: 贪心一对一匹配数 / 较大的关系数
///
/// 每条关系取容差内归一化误差最小的未用关系
pub fn relation_similarity(
    a: &[PairRelation],
    b: &[PairRelation],
    distance_tolerance: f32,
    angle_tolerance: f32,
) -> f64 {
    let larger = a.len().max(b.len());
    if larger == 0 {
        return 1.0;
    }

    let mut used = vec![false; b.len()];
    let mut matched = 0usize;
    for ra in a {
        let candidate = b
            .iter()
            .enumerate()
            .filter(|(idx, rb)| !used[*idx] && ra.class_a == rb.class_a && ra.class_b == rb.class_b)
            .filter_map(|(idx, rb)| {
                let distance_limit = ra.distance.max(rb.distance) * distance_tolerance;
                let distance_error = (ra.distance - rb.distance).abs();
                let angle_error = angle_difference(ra.angle, rb.angle);
                if distance_error > distance_limit || angle_error > angle_tolerance {
                    return None;
                }
                let cost = distance_error / distance_limit.max(f32::EPSILON)
                    + angle_error / angle_tolerance.max(f32::EPSILON);
                Some((idx, cost))
            })
            .min_by(|x, y| x.1.total_cmp(&y.1))
            .map(|(idx, _)| idx);
        if let Some(idx) = candidate {
            used[idx] = true;
            matched += 1;
        }
    }
    matched as f64 / larger as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::test_support::object;
    use crate::scene::Scene;

    fn fingerprint_of(objects: Vec<SceneObject>) -> Fingerprint {
        Scene::build(objects, &SceneConfig::default()).fingerprint
    }

    #[test]
    fn test_identical_scene_scores_one() {
        let config = SceneConfig::default();
        let objects = vec![
            object("person", 200.0, 300.0),
            object("car", 900.0, 500.0),
            object("dog", 400.0, 600.0),
        ];
        let a = fingerprint_of(objects.clone());
        let b = fingerprint_of(objects);
        assert!((a.similarity(&b, &config) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fingerprint_independent_of_input_order() {
        let objects = vec![
            object("person", 200.0, 300.0),
            object("car", 900.0, 500.0),
            object("person", 600.0, 100.0),
        ];
        let mut reversed = objects.clone();
        reversed.reverse();
        assert_eq!(fingerprint_of(objects), fingerprint_of(reversed));
    }

    #[test]
    fn test_object_count_gate() {
        let config = SceneConfig::default();
        // 同一网格单元: 两侧网格成比例, 不做数量门限时空间分为 1.0
        let alone = fingerprint_of(vec![object("person", 100.0, 100.0)]);
        let with_car = fingerprint_of(vec![object("person", 100.0, 100.0), object("car", 250.0, 150.0)]);
        assert_eq!(alone.similarity(&with_car, &config), 0.0);
        assert_eq!(with_car.similarity(&alone, &config), 0.0);

        // 6 对 5: 相差 1 <= 6 * 0.2, 仍参与打分
        let five: Vec<SceneObject> = (0..5).map(|i| object("car", 100.0 + 200.0 * i as f32, 300.0)).collect();
        let mut six = five.clone();
        six.push(object("car", 1100.0, 600.0));
        let score = fingerprint_of(five).similarity(&fingerprint_of(six), &config);
        assert!(score > 0.0 && score < 1.0, "score = {score}");
    }

    #[test]
    fn test_count_similarity() {
        let a: BTreeMap<String, usize> = [("person".to_string(), 2)].into();
        let b: BTreeMap<String, usize> = [("person".to_string(), 1), ("car".to_string(), 1)].into();
        assert!((count_similarity(&a, &b) - 0.25).abs() < 1e-9);
        assert_eq!(count_similarity(&BTreeMap::new(), &BTreeMap::new()), 1.0);
    }

    #[test]
    fn test_spatial_zero_variance() {
        let empty = vec![vec![0u32; 4]; 4];
        let mut ones = vec![vec![1u32; 4]; 4];
        assert_eq!(spatial_similarity(&empty, &empty), 1.0);
        assert_eq!(spatial_similarity(&empty, &ones), 0.5);
        ones[0][0] = 3;
        assert_eq!(spatial_similarity(&empty, &ones), 0.5);
    }

    #[test]
    fn test_relations_within_tolerance() {
        let rel = |distance, angle| PairRelation {
            class_a: "car".into(),
            class_b: "person".into(),
            distance,
            angle,
        };
        assert_eq!(relation_similarity(&[rel(100.0, 10.0)], &[rel(115.0, 20.0)], 0.2, 15.0), 1.0);
        assert_eq!(relation_similarity(&[rel(100.0, 10.0)], &[rel(150.0, 10.0)], 0.2, 15.0), 0.0);
        // 角度跨越 ±180
        assert_eq!(relation_similarity(&[rel(100.0, 175.0)], &[rel(100.0, -178.0)], 0.2, 15.0), 1.0);
        // 一对一: 两条只能匹配一条
        assert_eq!(
            relation_similarity(&[rel(100.0, 0.0), rel(100.0, 0.0)], &[rel(100.0, 0.0)], 0.2, 15.0),
            0.5
        );
    }

    #[test]
    fn test_relations_pick_closest_candidate() {
        let rel = |distance| PairRelation {
            class_a: "car".into(),
            class_b: "car".into(),
            distance,
            angle: 0.0,
        };
        // 100 若先占用 120, 130 就无可匹配
        let a = [rel(100.0), rel(130.0)];
        let b = [rel(120.0), rel(100.0)];
        assert_eq!(relation_similarity(&a, &b, 0.2, 15.0), 1.0);
    }

    #[test]
    fn test_grid_clamps_edges() {
        let grid = Fingerprint::occupancy_grid(
            &[object("cat", 1280.0, 720.0), object("cat", -5.0, 0.0)],
            4,
            1280,
            720,
        );
        assert_eq!(grid[3][3], 1);
        assert_eq!(grid[0][0], 1);
    }
}
