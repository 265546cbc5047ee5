//! 会话指标
//!
//! 原子计数器，可在任何线程读取，不引入锁竞争。

use std::sync::atomic::{AtomicU64, Ordering};

/// 设备会话实时指标
#[derive(Debug, Default)]
pub struct SessionMetrics {
    /// 回调成功解码并写入缓冲的样本数
    pub samples_received: AtomicU64,
    /// 回调解码/变换失败次数（旧样本保留）
    pub decode_failures: AtomicU64,
    /// `read()` 成功次数
    pub reads_ok: AtomicU64,
    /// `read()` 失败次数（未连接、无数据）
    pub reads_failed: AtomicU64,
    /// 后台轮询迭代次数
    pub poller_iterations: AtomicU64,
    /// 后台轮询中被捕获的错误次数
    pub poller_errors: AtomicU64,
    /// 成功发布的写命令数
    pub writes: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            samples_received: self.samples_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            reads_ok: self.reads_ok.load(Ordering::Relaxed),
            reads_failed: self.reads_failed.load(Ordering::Relaxed),
            poller_iterations: self.poller_iterations.load(Ordering::Relaxed),
            poller_errors: self.poller_errors.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.samples_received.store(0, Ordering::Relaxed);
        self.decode_failures.store(0, Ordering::Relaxed);
        self.reads_ok.store(0, Ordering::Relaxed);
        self.reads_failed.store(0, Ordering::Relaxed);
        self.poller_iterations.store(0, Ordering::Relaxed);
        self.poller_errors.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub samples_received: u64,
    pub decode_failures: u64,
    pub reads_ok: u64,
    pub reads_failed: u64,
    pub poller_iterations: u64,
    pub poller_errors: u64,
    pub writes: u64,
}

impl MetricsSnapshot {
    /// 解码失败率（百分比）；没有任何到达样本时返回 0.0
    pub fn decode_failure_rate(&self) -> f64 {
        let total = self.samples_received + self.decode_failures;
        if total == 0 {
            return 0.0;
        }
        (self.decode_failures as f64 / total as f64) * 100.0
    }
}
