//! 节点生命周期（引用计数）
//!
//! 多个设备会话可以共享同一个底层节点。第一个 [`NodeContext::acquire`] 调用
//! `NodeRuntime::init`，最后一个 [`NodeGuard`] 被 drop 时调用 `NodeRuntime::shutdown`。
//! 会话在连接期间持有 guard，因此节点不会在仍有会话连接时被关闭。

use crate::TransportError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// 节点运行时（由具体传输实现）
pub trait NodeRuntime: Send + Sync {
    fn init(&self) -> Result<(), TransportError>;
    fn shutdown(&self);
}

/// 什么都不做的运行时（进程内总线使用）
#[derive(Debug, Default)]
pub struct NoopRuntime;

impl NodeRuntime for NoopRuntime {
    fn init(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn shutdown(&self) {}
}

/// 引用计数的节点上下文
pub struct NodeContext {
    runtime: Box<dyn NodeRuntime>,
    /// 当前持有者数量；锁同时串行化 init/shutdown
    refs: Mutex<usize>,
    /// 已执行的 init 次数
    generation: AtomicU64,
}

impl NodeContext {
    pub fn new(runtime: impl NodeRuntime + 'static) -> Arc<Self> {
        Arc::new(Self {
            runtime: Box::new(runtime),
            refs: Mutex::new(0),
            generation: AtomicU64::new(0),
        })
    }

    /// 获取一个节点引用
    ///
    /// 计数从 0 变为 1 时执行 `init`；`init` 失败则计数保持为 0。
    pub fn acquire(self: &Arc<Self>) -> Result<NodeGuard, TransportError> {
        let mut refs = self.refs.lock();
        if *refs == 0 {
            self.runtime.init()?;
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            info!("Node initialized (generation {})", generation);
        }
        *refs += 1;
        debug!("Node acquired, refs = {}", *refs);

        Ok(NodeGuard {
            ctx: Arc::clone(self),
        })
    }

    /// 当前持有者数量
    pub fn ref_count(&self) -> usize {
        *self.refs.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.ref_count() > 0
    }

    /// 累计 init 次数
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    fn release(&self) {
        let mut refs = self.refs.lock();
        *refs = refs.saturating_sub(1);
        debug!("Node released, refs = {}", *refs);
        if *refs == 0 {
            self.runtime.shutdown();
            info!("Node shut down");
        }
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("refs", &self.ref_count())
            .field("generation", &self.generation())
            .finish()
    }
}

/// 节点引用（RAII）
#[derive(Debug)]
pub struct NodeGuard {
    ctx: Arc<NodeContext>,
}

impl NodeGuard {
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        self.ctx.release();
    }
}
