//! SQLite 存储：agents（含墓地）、swarm_messages、logbook
//!
//! 单连接 + Mutex；每个操作是单条记录的原子更新，不需要跨记录事务。
//! 唯一活跃根由部分唯一索引保证：同一时刻最多一条 tier = 1 且未终止的记录。

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};

use crate::swarm::{
    AgentRecord, AgentStatus, LogbookEntry, MessageTarget, PersistenceMode, SwarmMessage, ROOT_TIER,
};

const AGENT_COLUMNS: &str = "id, name, tier, parent_id, status, mission, model_role, persistence,
     created_at, last_active_at, terminated_at, termination_reason";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// 打开（或创建）数据库文件并初始化 schema
    pub fn open(path: impl AsRef<Path>) -> SqliteResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                tier INTEGER NOT NULL,
                parent_id TEXT,
                status TEXT NOT NULL,
                mission TEXT NOT NULL DEFAULT '',
                model_role TEXT,
                persistence TEXT NOT NULL DEFAULT 'ephemeral',
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL,
                terminated_at TEXT,
                termination_reason TEXT
             );
             CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_single_root
                ON agents(tier) WHERE tier = 1 AND status != 'terminated';
             CREATE INDEX IF NOT EXISTS idx_agents_name_tier ON agents(name, tier);

             CREATE TABLE IF NOT EXISTS swarm_messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                target_kind TEXT NOT NULL,
                target TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                delivered INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_swarm_messages_pending
                ON swarm_messages(target, delivered);

             CREATE TABLE IF NOT EXISTS logbook (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                agent_name TEXT,
                tier INTEGER,
                event TEXT NOT NULL,
                detail TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ---------- agents ----------

    pub fn insert_agent(&self, record: &AgentRecord) -> SqliteResult<()> {
        let conn = self.lock();
        insert_agent_row(&conn, record)
    }

    /// 查找或创建活跃根：在同一把锁内完成，并由部分唯一索引兜底
    pub fn ensure_root(&self, candidate: &AgentRecord) -> SqliteResult<(AgentRecord, bool)> {
        let conn = self.lock();
        if let Some(existing) = query_active_root(&conn)? {
            return Ok((existing, false));
        }
        match insert_agent_row(&conn, candidate) {
            Ok(()) => Ok((candidate.clone(), true)),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let existing = query_active_root(&conn)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                Ok((existing, false))
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_agent(&self, id: &str) -> SqliteResult<Option<AgentRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
            params![id],
            row_to_agent,
        )
        .optional()
    }

    pub fn find_active_by_name_and_tier(&self, name: &str, tier: u32) -> SqliteResult<Option<AgentRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "SELECT {AGENT_COLUMNS} FROM agents
                 WHERE name = ?1 AND tier = ?2 AND status != 'terminated'
                 ORDER BY created_at LIMIT 1"
            ),
            params![name, tier],
            row_to_agent,
        )
        .optional()
    }

    pub fn list_active(&self) -> SqliteResult<Vec<AgentRecord>> {
        self.query_agents(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE status != 'terminated' ORDER BY tier, created_at"),
        )
    }

    pub fn list_graveyard(&self) -> SqliteResult<Vec<AgentRecord>> {
        self.query_agents(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE status = 'terminated' ORDER BY terminated_at"),
        )
    }

    fn query_agents(&self, sql: &str) -> SqliteResult<Vec<AgentRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_agent)?;
        rows.collect()
    }

    /// 更新活跃 Agent 的状态；已终止的记录不受影响。返回是否有记录被更新
    pub fn update_status(&self, id: &str, status: AgentStatus, now: DateTime<Utc>) -> SqliteResult<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE agents SET status = ?2, last_active_at = ?3
             WHERE id = ?1 AND status != 'terminated'",
            params![id, status.as_str(), now],
        )?;
        Ok(changed > 0)
    }

    /// 记录活跃时间
    pub fn touch(&self, id: &str, at: DateTime<Utc>) -> SqliteResult<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE agents SET last_active_at = ?2 WHERE id = ?1 AND status != 'terminated'",
            params![id, at],
        )?;
        Ok(changed > 0)
    }

    /// 移入墓地；已终止时不改动原因与时间戳。返回是否本次完成了终止
    pub fn move_to_graveyard(&self, id: &str, reason: &str, now: DateTime<Utc>) -> SqliteResult<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE agents SET status = 'terminated', terminated_at = ?2, termination_reason = ?3
             WHERE id = ?1 AND status != 'terminated'",
            params![id, now, reason],
        )?;
        Ok(changed > 0)
    }

    // ---------- swarm_messages ----------

    pub fn insert_message(&self, message: &SwarmMessage) -> SqliteResult<()> {
        let (kind, target) = message.target.encode();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO swarm_messages (id, sender_id, target_kind, target, payload, created_at, delivered)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.sender_id,
                kind,
                target,
                message.payload,
                message.timestamp,
                message.delivered as i32,
            ],
        )?;
        Ok(())
    }

    pub fn mark_delivered(&self, message_id: &str) -> SqliteResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE swarm_messages SET delivered = 1 WHERE id = ?1",
            params![message_id],
        )?;
        Ok(())
    }

    /// 某 Agent 尚未确认的消息（按时间顺序）；只读，确认由 mark_delivered 完成
    pub fn pending_messages(&self, agent_id: &str) -> SqliteResult<Vec<SwarmMessage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, target_kind, target, payload, created_at, delivered
             FROM swarm_messages
             WHERE target_kind = 'agent' AND target = ?1 AND delivered = 0
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![agent_id], row_to_message)?;
        rows.collect()
    }

    /// 审计用：某目标的全部消息
    pub fn messages_for(&self, target: &MessageTarget) -> SqliteResult<Vec<SwarmMessage>> {
        let (kind, value) = target.encode();
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, target_kind, target, payload, created_at, delivered
             FROM swarm_messages WHERE target_kind = ?1 AND target = ?2
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![kind, value], row_to_message)?;
        rows.collect()
    }

    // ---------- logbook ----------

    pub fn append_logbook(&self, entries: &[LogbookEntry]) -> SqliteResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "INSERT INTO logbook (timestamp, agent_name, tier, event, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for e in entries {
            stmt.execute(params![e.timestamp, e.agent_name, e.tier, e.event, e.detail])?;
        }
        Ok(())
    }

    /// 最近的 `limit` 条，按写入顺序返回
    pub fn list_logbook(&self, limit: usize) -> SqliteResult<Vec<LogbookEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, agent_name, tier, event, detail FROM
                (SELECT * FROM logbook ORDER BY id DESC LIMIT ?1)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(LogbookEntry {
                timestamp: row.get(0)?,
                agent_name: row.get(1)?,
                tier: row.get(2)?,
                event: row.get(3)?,
                detail: row.get(4)?,
            })
        })?;
        rows.collect()
    }
}

fn insert_agent_row(conn: &Connection, r: &AgentRecord) -> SqliteResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO agents ({AGENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            r.id,
            r.name,
            r.tier,
            r.parent_id,
            r.status.as_str(),
            r.mission,
            r.model_role,
            r.persistence.as_str(),
            r.created_at,
            r.last_active_at,
            r.terminated_at,
            r.termination_reason,
        ],
    )?;
    Ok(())
}

fn query_active_root(conn: &Connection) -> SqliteResult<Option<AgentRecord>> {
    conn.query_row(
        &format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE tier = ?1 AND status != 'terminated' LIMIT 1"
        ),
        params![ROOT_TIER],
        row_to_agent,
    )
    .optional()
}

fn row_to_agent(row: &Row<'_>) -> SqliteResult<AgentRecord> {
    let status: String = row.get(4)?;
    let persistence: String = row.get(7)?;
    Ok(AgentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        tier: row.get(2)?,
        parent_id: row.get(3)?,
        status: AgentStatus::parse(&status),
        mission: row.get(5)?,
        model_role: row.get(6)?,
        persistence: PersistenceMode::parse(&persistence),
        created_at: row.get(8)?,
        last_active_at: row.get(9)?,
        terminated_at: row.get(10)?,
        termination_reason: row.get(11)?,
    })
}

fn row_to_message(row: &Row<'_>) -> SqliteResult<SwarmMessage> {
    let kind: String = row.get(2)?;
    let target: String = row.get(3)?;
    Ok(SwarmMessage {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        target: MessageTarget::decode(&kind, target),
        payload: row.get(4)?,
        timestamp: row.get(5)?,
        delivered: row.get::<_, i32>(6)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_index_allows_only_one_active_root() {
        let db = Database::open_in_memory().unwrap();
        db.insert_agent(&AgentRecord::new("root", 1, None, "")).unwrap();
        let second = db.insert_agent(&AgentRecord::new("root", 1, None, ""));
        assert!(second.is_err());
    }

    #[test]
    fn test_terminated_root_frees_the_slot() {
        let db = Database::open_in_memory().unwrap();
        let first = AgentRecord::new("root", 1, None, "");
        db.insert_agent(&first).unwrap();
        assert!(db.move_to_graveyard(&first.id, "replaced", Utc::now()).unwrap());

        let (root, created) = db.ensure_root(&AgentRecord::new("root", 1, None, "")).unwrap();
        assert!(created);
        assert_ne!(root.id, first.id);
    }

    #[test]
    fn test_graveyard_keeps_first_reason() {
        let db = Database::open_in_memory().unwrap();
        let agent = AgentRecord::new("a", 2, None, "");
        db.insert_agent(&agent).unwrap();
        assert!(db.move_to_graveyard(&agent.id, "requested", Utc::now()).unwrap());
        assert!(!db.move_to_graveyard(&agent.id, "timeout", Utc::now()).unwrap());
        // 终止后的状态更新被忽略
        assert!(!db.update_status(&agent.id, AgentStatus::Working, Utc::now()).unwrap());

        let stored = db.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Terminated);
        assert_eq!(stored.termination_reason.as_deref(), Some("requested"));
    }

    #[test]
    fn test_pending_messages_stay_until_marked() {
        let db = Database::open_in_memory().unwrap();
        let target = MessageTarget::Agent("b".into());
        for payload in ["one", "two"] {
            db.insert_message(&SwarmMessage::new("a", target.clone(), payload)).unwrap();
        }
        let pending = db.pending_messages("b").unwrap();
        assert_eq!(
            pending.iter().map(|m| m.payload.as_str()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
        // 读取不改变状态
        assert_eq!(db.pending_messages("b").unwrap().len(), 2);

        db.mark_delivered(&pending[0].id).unwrap();
        let rest = db.pending_messages("b").unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, "two");
        assert_eq!(db.messages_for(&target).unwrap().len(), 2);
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.db");
        let agent = AgentRecord::new("keeper", 2, None, "watch");
        {
            let db = Database::open(&path).unwrap();
            db.insert_agent(&agent).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.get_agent(&agent.id).unwrap().unwrap().mission, "watch");
    }
}
