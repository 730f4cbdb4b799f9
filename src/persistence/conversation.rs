//! 会话持久化仓库
//!
//! conversations 表按插入序保存每个 NPC 的消息；读取时只取最近 100 条
//! 并恢复为插入顺序。

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::history::{Message, Role};

/// 读取时的最近消息上限
const SELECT_LIMIT: usize = 100;

/// SQLite 会话仓库
pub struct ConversationRepository {
    conn: Mutex<Connection>,
}

impl ConversationRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// 进程内临时库（测试用）
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid CHARACTER(36) NOT NULL,
                role CHARACTER(9) NOT NULL,
                message TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, uuid: Uuid, message: &Message) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "INSERT INTO conversations (uuid, role, message) VALUES (?1, ?2, ?3)",
            params![uuid.to_string(), message.role.as_str(), message.content],
        )?;
        Ok(())
    }

    /// 取某个 NPC 最近 100 条消息，按插入顺序返回
    pub fn select_by_uuid(&self, uuid: Uuid) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT role, message FROM conversations WHERE uuid = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![uuid.to_string(), SELECT_LIMIT as i64], |row| {
            let role: String = row.get(0)?;
            let content: String = row.get(1)?;
            Ok(Message {
                role: Role::parse(&role),
                content,
            })
        })?;

        let mut messages = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// 删除某个 NPC 的全部会话记录
    pub fn delete_by_uuid(&self, uuid: Uuid) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "DELETE FROM conversations WHERE uuid = ?1",
            [uuid.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_select_preserves_order_and_roles() {
        let repo = ConversationRepository::in_memory().unwrap();
        let uuid = Uuid::new_v4();
        repo.insert(uuid, &Message::user("first")).unwrap();
        repo.insert(uuid, &Message::assistant("second")).unwrap();
        repo.insert(uuid, &Message::user("third")).unwrap();

        let messages = repo.select_by_uuid(uuid).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Message::user("first"));
        assert_eq!(messages[1], Message::assistant("second"));
        assert_eq!(messages[2], Message::user("third"));
    }

    #[test]
    fn test_select_is_scoped_to_uuid() {
        let repo = ConversationRepository::in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        repo.insert(a, &Message::user("for a")).unwrap();
        repo.insert(b, &Message::user("for b")).unwrap();

        assert_eq!(repo.select_by_uuid(a).unwrap().len(), 1);
        assert_eq!(repo.select_by_uuid(b).unwrap()[0].content, "for b");
    }

    #[test]
    fn test_select_caps_at_most_recent_hundred() {
        let repo = ConversationRepository::in_memory().unwrap();
        let uuid = Uuid::new_v4();
        for i in 0..120 {
            repo.insert(uuid, &Message::user(format!("msg-{i}"))).unwrap();
        }
        let messages = repo.select_by_uuid(uuid).unwrap();
        assert_eq!(messages.len(), 100);
        // 保留的是最近 100 条，且为插入顺序
        assert_eq!(messages[0].content, "msg-20");
        assert_eq!(messages[99].content, "msg-119");
    }

    #[test]
    fn test_delete_by_uuid() {
        let repo = ConversationRepository::in_memory().unwrap();
        let uuid = Uuid::new_v4();
        repo.insert(uuid, &Message::user("gone soon")).unwrap();
        repo.delete_by_uuid(uuid).unwrap();
        assert!(repo.select_by_uuid(uuid).unwrap().is_empty());
    }
}
