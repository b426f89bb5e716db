//! 会话持久化
//!
//! 每个 Agent 一个目录，每个会话一个 JSON 文件，只保留最近的若干条消息；
//! 用于进程重启后通过 seed_context 恢复会话。与流式事件无关（事件不回放）。

use std::path::{Path, PathBuf};

use crate::memory::Message;

/// 内部会话前缀：系统 / 蜂群 / 定时触发产生的会话，不参与恢复
const INTERNAL_PREFIXES: [&str; 3] = ["system:", "swarm:", "cron:"];

/// 是否为内部（非用户发起）会话
pub fn is_internal_session(session_id: &str) -> bool {
    INTERNAL_PREFIXES.iter().any(|p| session_id.starts_with(p))
}

/// 简单的文件持久化：<root>/<session>.json
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    keep_messages: usize,
}

impl SessionStore {
    pub fn new(root: impl AsRef<Path>, keep_messages: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            keep_messages: keep_messages.max(1),
        }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{}.json", safe))
    }

    /// 写入会话最近的消息；目录不存在时自动创建
    pub fn save(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let start = messages.len().saturating_sub(self.keep_messages);
        let snapshot = SessionSnapshot {
            session_id: session_id.to_string(),
            messages: messages[start..].to_vec(),
        };
        std::fs::write(
            self.session_path(session_id),
            serde_json::to_string_pretty(&snapshot)?,
        )?;
        Ok(())
    }

    /// 读取单个会话；文件不存在时返回空 Vec
    pub fn load(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&path)?;
        let snapshot: SessionSnapshot = serde_json::from_str(&data)?;
        Ok(snapshot.messages)
    }

    /// 读取全部会话；损坏的文件跳过并记录告警
    pub fn load_all(&self) -> Vec<(String, Vec<Message>)> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|d| serde_json::from_str::<SessionSnapshot>(&d).map_err(Into::into));
            match parsed {
                Ok(s) => sessions.push((s.session_id, s.messages)),
                Err(e) => tracing::warn!("Skipping unreadable session file {}: {}", path.display(), e),
            }
        }
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SessionSnapshot {
    session_id: String,
    messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_session_prefixes() {
        assert!(is_internal_session("swarm:agent-1"));
        assert!(is_internal_session("cron:daily"));
        assert!(!is_internal_session("web-42"));
    }

    #[test]
    fn test_save_keeps_recent_messages_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), 2);
        let msgs = vec![
            Message::user("one"),
            Message::assistant("two"),
            Message::user("three"),
        ];
        store.save("s/1", &msgs).unwrap();
        let loaded = store.load("s/1").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content, "two");

        let all = store.load_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "s/1");
    }

    #[test]
    fn test_load_missing_session_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nope"), 10);
        assert!(store.load("x").unwrap().is_empty());
        assert!(store.load_all().is_empty());
    }
}
