//! 帧缓冲与时间日志
//!
//! [`FrameBuffer`] 是单槽、覆盖写的最新样本容器：
//! - 写入方（传输层投递线程）用一次原子指针交换替换整个样本
//! - 读取方无锁加载，永远不会看到写了一半的样本
//! - 不保留历史，新样本直接覆盖旧样本

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 带到达信息的样本
#[derive(Debug)]
pub struct Stamped<S> {
    pub sample: S,
    /// 单调递增序号（从 1 开始）
    pub seq: u64,
    pub received_at: Instant,
}

/// 单槽最新样本缓冲
#[derive(Debug)]
pub struct FrameBuffer<S> {
    slot: ArcSwapOption<Stamped<S>>,
    seq: AtomicU64,
}

impl<S> Default for FrameBuffer<S> {
    fn default() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            seq: AtomicU64::new(0),
        }
    }
}

impl<S> FrameBuffer<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 原子替换样本
    ///
    /// 返回与上一个样本的到达间隔（首个样本返回 `None`）。
    pub fn store(&self, sample: S) -> Option<Duration> {
        let received_at = Instant::now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.slot.swap(Some(Arc::new(Stamped {
            sample,
            seq,
            received_at,
        })));
        previous.map(|prev| received_at.saturating_duration_since(prev.received_at))
    }

    /// 无锁加载最新样本
    pub fn load(&self) -> Option<Arc<Stamped<S>>> {
        self.slot.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load().is_none()
    }

    /// 已写入的样本总数（清空不会重置）
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.slot.store(None);
    }
}

impl<S: Clone> FrameBuffer<S> {
    /// 按值返回最新样本
    pub fn latest(&self) -> Option<S> {
        self.slot.load().as_ref().map(|stamped| stamped.sample.clone())
    }
}

/// 时间日志
///
/// 日志键 → 数值，每次成功读写时覆盖，从不清空。
/// 常用键：
/// - `timestamp_utc`：最近一个样本的到达时间（UNIX 秒）
/// - `delta_timestamp_s`：相邻两个样本的到达间隔
/// - `delta_timestamp_s_read`：`read()` 耗时
/// - `delta_timestamp_s_write_<Register>`：写寄存器耗时
#[derive(Debug, Default)]
pub struct TimingLog {
    entries: RwLock<HashMap<String, f64>>,
}

impl TimingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: f64) {
        self.entries.write().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries.read().get(key).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.entries.read().clone()
    }
}

/// 当前 UNIX 时间（秒）
pub fn capture_timestamp_utc() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
