//! 场景持久化 (SQLite scene store)
//!
//! 场景只追加不修改; 一个场景的 scenes / scene_objects / object_relationships
//! 三表写入在同一事务内完成, 任一步失败整体回滚。

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::detection::types::{BBox, Point2};
use crate::error::Result;

use super::{Fingerprint, Relationship, Scene, SceneObject};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS scenes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        description TEXT NOT NULL,
        object_counts TEXT NOT NULL,
        spatial_histogram TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS scene_objects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scene_id INTEGER NOT NULL REFERENCES scenes(id),
        object_type TEXT NOT NULL,
        position_x REAL NOT NULL,
        position_y REAL NOT NULL,
        color TEXT NOT NULL,
        size TEXT NOT NULL,
        orientation REAL NOT NULL
    );
    CREATE TABLE IF NOT EXISTS object_relationships (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scene_id INTEGER NOT NULL REFERENCES scenes(id),
        object1_idx INTEGER NOT NULL,
        object2_idx INTEGER NOT NULL,
        distance REAL NOT NULL,
        angle REAL NOT NULL
    );
";

struct SceneRow {
    id: i64,
    created_at: String,
    description: String,
    object_counts: String,
    spatial_histogram: String,
}

/// SQLite 场景库 (单写者)
pub struct SceneStore {
    conn: Connection,
}

impl SceneStore {
    /// 打开 (或创建) 数据库文件
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(db = %path.display(), "opening scene database");
        Self::with_connection(Connection::open(path)?)
    }

    /// 内存数据库 (测试)
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    pub fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// 写入新场景, 返回场景ID
    pub fn insert_scene(&mut self, scene: &Scene) -> Result<i64> {
        let object_counts = serde_json::to_string(&scene.fingerprint.counts)?;
        let spatial_histogram = serde_json::to_string(&scene.fingerprint.grid)?;

        // 出错时 tx 被丢弃即回滚
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO scenes (created_at, description, object_counts, spatial_histogram)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                scene.created_at.to_rfc3339(),
                scene.description,
                object_counts,
                spatial_histogram
            ],
        )?;
        let scene_id = tx.last_insert_rowid();

        {
            let mut insert_object = tx.prepare(
                "INSERT INTO scene_objects
                 (scene_id, object_type, position_x, position_y, color, size, orientation)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for object in &scene.objects {
                insert_object.execute(params![
                    scene_id,
                    object.class_name,
                    object.position.x as f64,
                    object.position.y as f64,
                    object.color_hex(),
                    object.size_label(),
                    object.orientation as f64
                ])?;
            }

            let mut insert_relation = tx.prepare(
                "INSERT INTO object_relationships
                 (scene_id, object1_idx, object2_idx, distance, angle)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for relation in &scene.relationships {
                insert_relation.execute(params![
                    scene_id,
                    relation.object1_idx as i64,
                    relation.object2_idx as i64,
                    relation.distance as f64,
                    relation.angle as f64
                ])?;
            }
        }

        tx.commit()?;
        debug!(scene_id, objects = scene.objects.len(), "scene persisted");
        Ok(scene_id)
    }

    /// 加载场景 (按ID升序); `limit` 为 Some(K) 时只取最近K个
    pub fn load_scenes(&self, limit: Option<usize>) -> Result<Vec<Scene>> {
        let limit = limit.map(|k| k as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, description, object_counts, spatial_histogram
             FROM scenes ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], Self::scene_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut scenes = rows
            .into_iter()
            .map(|row| self.hydrate(row))
            .collect::<Result<Vec<_>>>()?;
        scenes.reverse();
        Ok(scenes)
    }

    /// 按ID加载单个场景
    pub fn scene(&self, id: i64) -> Result<Option<Scene>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, created_at, description, object_counts, spatial_histogram
                 FROM scenes WHERE id = ?1",
                params![id],
                Self::scene_row,
            )
            .optional()?;
        row.map(|row| self.hydrate(row)).transpose()
    }

    pub fn scene_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM scenes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn scene_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SceneRow> {
        Ok(SceneRow {
            id: row.get(0)?,
            created_at: row.get(1)?,
            description: row.get(2)?,
            object_counts: row.get(3)?,
            spatial_histogram: row.get(4)?,
        })
    }

    /// 加载目标与关系, 重建指纹
    fn hydrate(&self, row: SceneRow) -> Result<Scene> {
        let mut object_stmt = self.conn.prepare(
            "SELECT object_type, position_x, position_y, color, size, orientation
             FROM scene_objects WHERE scene_id = ?1 ORDER BY id",
        )?;
        let objects = object_stmt
            .query_map(params![row.id], |r| {
                let position = Point2::new(r.get::<_, f64>(1)? as f32, r.get::<_, f64>(2)? as f32);
                let color: String = r.get(3)?;
                let size: String = r.get(4)?;
                let (width, height) = parse_size(&size);
                Ok(SceneObject {
                    class_name: r.get(0)?,
                    position,
                    region: BBox::centered(position, width, height),
                    color: parse_color(&color),
                    orientation: r.get::<_, f64>(5)? as f32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut relation_stmt = self.conn.prepare(
            "SELECT object1_idx, object2_idx, distance, angle
             FROM object_relationships WHERE scene_id = ?1 ORDER BY id",
        )?;
        let relationships = relation_stmt
            .query_map(params![row.id], |r| {
                Ok(Relationship {
                    object1_idx: r.get::<_, i64>(0)? as usize,
                    object2_idx: r.get::<_, i64>(1)? as usize,
                    distance: r.get::<_, f64>(2)? as f32,
                    angle: r.get::<_, f64>(3)? as f32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let counts: BTreeMap<String, usize> = serde_json::from_str(&row.object_counts)?;
        let grid: Vec<Vec<u32>> = serde_json::from_str(&row.spatial_histogram)?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map(|t| t.with_timezone(&Local))
            .unwrap_or_else(|e| {
                warn!(scene_id = row.id, error = %e, "invalid scene timestamp");
                Local::now()
            });

        let fingerprint = Fingerprint::from_parts(counts, grid, &objects, &relationships);
        Ok(Scene {
            id: row.id,
            created_at,
            description: row.description,
            objects,
            relationships,
            fingerprint,
        })
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// `#rrggbb` → RGB, 无法解析时为黑色
fn parse_color(hex: &str) -> [u8; 3] {
    let digits = hex.trim_start_matches('#');
    if digits.len() != 6 || !digits.is_ascii() {
        return [0, 0, 0];
    }
    let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).unwrap_or(0);
    [channel(0), channel(2), channel(4)]
}

/// `WxH` → (W, H)
fn parse_size(size: &str) -> (f32, f32) {
    let mut parts = size.split('x').map(|p| p.trim().parse::<f32>().unwrap_or(0.0));
    (parts.next().unwrap_or(0.0), parts.next().unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SceneConfig;
    use crate::scene::test_support::object;

    fn sample_scene() -> Scene {
        Scene::build(
            vec![
                object("person", 200.0, 300.0),
                object("car", 900.0, 500.0),
                object("person", 640.0, 360.0),
            ],
            &SceneConfig::default(),
        )
    }

    #[test]
    fn test_insert_and_reload() {
        let mut store = SceneStore::open_in_memory().unwrap();
        let scene = sample_scene();
        let id = store.insert_scene(&scene).unwrap();

        let loaded = store.scene(id).unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.description, scene.description);
        assert_eq!(loaded.objects.len(), 3);
        assert_eq!(loaded.objects[0].color, [10, 20, 30]);
        assert_eq!(loaded.relationships.len(), 3);
        assert_eq!(loaded.fingerprint, scene.fingerprint);
        assert!(store.scene(id + 1).unwrap().is_none());
    }

    #[test]
    fn test_load_most_recent() {
        let mut store = SceneStore::open_in_memory().unwrap();
        let ids: Vec<i64> = (0..3).map(|_| store.insert_scene(&sample_scene()).unwrap()).collect();

        let all = store.load_scenes(None).unwrap();
        assert_eq!(all.iter().map(|s| s.id).collect::<Vec<_>>(), ids);

        let recent = store.load_scenes(Some(2)).unwrap();
        assert_eq!(recent.iter().map(|s| s.id).collect::<Vec<_>>(), ids[1..].to_vec());
        assert_eq!(store.scene_count().unwrap(), 3);
    }

    #[test]
    fn test_failed_insert_rolls_back() {
        let mut store = SceneStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch("DROP TABLE object_relationships;")
            .unwrap();

        assert!(store.insert_scene(&sample_scene()).is_err());
        assert_eq!(store.scene_count().unwrap(), 0);
        let objects: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM scene_objects", [], |row| row.get(0))
            .unwrap();
        assert_eq!(objects, 0);
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_color("#ff8000"), [255, 128, 0]);
        assert_eq!(parse_color("bad"), [0, 0, 0]);
        assert_eq!(parse_size("120x80"), (120.0, 80.0));
    }
}
