//! NPC 配置存储
//!
//! 命名配置记录落在 SQLite：主键为小写名称，记录本体按 JSON 存储，
//! uuid 单列冗余以支持按 id 查询。

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::NpcConfig;

/// 命名 NPC 配置记录存储
pub struct NpcConfigStore {
    conn: Mutex<Connection>,
}

impl NpcConfigStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// 进程内临时库（测试用）
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS npc_configs (
                name TEXT PRIMARY KEY,
                uuid CHARACTER(36) NOT NULL,
                record TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 写入或整体替换一条记录
    pub fn save(&self, config: &NpcConfig) -> Result<()> {
        let record = serde_json::to_string(config)?;
        self.conn.lock().unwrap().execute(
            "INSERT OR REPLACE INTO npc_configs (name, uuid, record) VALUES (?1, ?2, ?3)",
            params![config.record_name(), config.uuid.to_string(), record],
        )?;
        Ok(())
    }

    pub fn get(&self, uuid: Uuid) -> Result<Option<NpcConfig>> {
        let conn = self.conn.lock().unwrap();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM npc_configs WHERE uuid = ?1",
                [uuid.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        decode(record)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<NpcConfig>> {
        let conn = self.conn.lock().unwrap();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM npc_configs WHERE name = ?1",
                [name.to_lowercase()],
                |row| row.get(0),
            )
            .optional()?;
        decode(record)
    }

    /// 按记忆片段 id 查找持有它的配置（全表扫描，记录数以个位计）
    pub fn get_by_memory_id(&self, memory_id: &str) -> Result<Option<NpcConfig>> {
        Ok(self
            .all()?
            .into_iter()
            .find(|c| c.memory_fragment(memory_id).is_some()))
    }

    pub fn delete(&self, uuid: Uuid) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "DELETE FROM npc_configs WHERE uuid = ?1",
            [uuid.to_string()],
        )?;
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<NpcConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT record FROM npc_configs ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut configs = Vec::new();
        for record in rows {
            configs.push(serde_json::from_str(&record?)?);
        }
        Ok(configs)
    }
}

fn decode(record: Option<String>) -> Result<Option<NpcConfig>> {
    match record {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}
