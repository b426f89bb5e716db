//! Logbook：只追加的审计记录
//!
//! append 不阻塞调用方：条目进入 mpsc 队列，由后台写入任务批量落盘。
//! flush 等待此前排队的条目全部写入；close 在落盘后结束写入任务。

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::SwarmError;
use crate::swarm::{Database, LogbookEntry};

enum Command {
    Append(LogbookEntry),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

pub struct Logbook {
    tx: mpsc::UnboundedSender<Command>,
    db: Arc<Database>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Logbook {
    /// 启动后台写入任务（需在 tokio 运行时内调用）
    pub fn start(db: Arc<Database>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(Arc::clone(&db), rx));
        Arc::new(Self {
            tx,
            db,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// 追加一条；写入任务已结束时直接同步写入
    pub fn append(&self, entry: LogbookEntry) {
        tracing::debug!(event = %entry.event, detail = %entry.detail, "logbook");
        if let Err(mpsc::error::SendError(Command::Append(entry))) = self.tx.send(Command::Append(entry)) {
            if let Err(e) = self.db.append_logbook(std::slice::from_ref(&entry)) {
                tracing::warn!("Logbook write failed: {}", e);
            }
        }
    }

    /// 等待此前排队的条目全部写入
    pub async fn flush(&self) -> Result<(), SwarmError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(tx))
            .map_err(|_| SwarmError::ShuttingDown)?;
        rx.await.map_err(|_| SwarmError::ShuttingDown)
    }

    /// 落盘并结束写入任务（幂等）
    pub async fn close(&self) -> Result<(), SwarmError> {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(writer) = writer else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Close(tx)).is_ok() {
            let _ = rx.await;
        }
        let _ = writer.await;
        Ok(())
    }

    /// 最近的条目（读取前先 flush）
    pub async fn recent(&self, limit: usize) -> Result<Vec<LogbookEntry>, SwarmError> {
        // 写入任务已关闭时直接读库
        let _ = self.flush().await;
        Ok(self.db.list_logbook(limit)?)
    }
}

async fn write_loop(db: Arc<Database>, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut batch: Vec<LogbookEntry> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut done: Option<(oneshot::Sender<()>, bool)> = None;
        match cmd {
            Command::Append(entry) => batch.push(entry),
            Command::Flush(ack) => done = Some((ack, false)),
            Command::Close(ack) => done = Some((ack, true)),
        }
        // 合并已排队的条目
        while done.is_none() {
            match rx.try_recv() {
                Ok(Command::Append(entry)) => batch.push(entry),
                Ok(Command::Flush(ack)) => done = Some((ack, false)),
                Ok(Command::Close(ack)) => done = Some((ack, true)),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            if let Err(e) = db.append_logbook(&batch) {
                tracing::error!(count = batch.len(), "Logbook batch write failed: {}", e);
            }
            batch.clear();
        }

        if let Some((ack, close)) = done {
            let _ = ack.send(());
            if close {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::LogEvent;

    #[tokio::test]
    async fn test_flush_persists_entries_in_order() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let logbook = Logbook::start(Arc::clone(&db));
        for i in 0..5 {
            logbook.append(LogbookEntry::new(LogEvent::SwarmAction, format!("action {i}")));
        }
        logbook.flush().await.unwrap();
        let entries = db.list_logbook(10).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].detail, "action 0");
        assert_eq!(entries[4].detail, "action 4");
    }

    #[tokio::test]
    async fn test_append_after_close_still_lands() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let logbook = Logbook::start(Arc::clone(&db));
        logbook.close().await.unwrap();
        logbook.close().await.unwrap();
        logbook.append(LogbookEntry::new(LogEvent::Shutdown, "late"));
        assert_eq!(logbook.recent(10).await.unwrap().len(), 1);
    }
}
