//! 任务调度：工具池
//!
//! 同一轮内的工具调用并发执行，用 Semaphore 限制扇出。每一轮各自持有信号量，
//! 不同 Agent、不同轮次之间互不占用许可。

use tokio::sync::{Semaphore, SemaphorePermit};

/// 任务调度器：只记录每轮的扇出上限
#[derive(Debug, Clone, Copy)]
pub struct TaskScheduler {
    max_concurrent_tools: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            max_concurrent_tools: max_concurrent_tools.max(1),
        }
    }

    pub fn max_concurrent_tools(&self) -> usize {
        self.max_concurrent_tools
    }

    /// 为一轮工具调用开一个新的许可池
    pub fn turn(&self) -> ToolTurn {
        ToolTurn {
            semaphore: Semaphore::new(self.max_concurrent_tools),
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}

/// 一轮调用共享的许可池
pub struct ToolTurn {
    semaphore: Semaphore,
}

impl ToolTurn {
    /// 获取执行许可；信号量已关闭时返回 None
    pub async fn acquire(&self) -> Option<SemaphorePermit<'_>> {
        self.semaphore.acquire().await.ok()
    }
}
