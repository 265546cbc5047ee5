//! 后台轮询线程
//!
//! 每个会话最多一个轮询线程，首次 `async_read()` 时惰性启动。
//! 线程的创建与停止由一个显式状态机保护：
//!
//! ```text
//! NotStarted ──start()──▶ Running ──stop()──▶ Stopped ──reset()──▶ NotStarted
//! ```
//!
//! `stop()` 在 `NotStarted` 下同样进入 `Stopped`，断开后到达的 `start()` 因此不会生效。
//!
//! 所有状态转换都在同一把锁内完成，并发的 `start()` 只有一个会真正创建线程。

use crate::DeviceError;
use parking_lot::Mutex;
use std::sync::{Arc, mpsc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// 有界 join 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinOutcome {
    Joined,
    Panicked,
    TimedOut,
}

/// 由看门狗线程 join 轮询线程，最多等待 `timeout`
///
/// 超时后看门狗继续等待，进程退出时由 OS 回收。
fn join_bounded(handle: JoinHandle<()>, timeout: Duration) -> JoinOutcome {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(handle.join().is_ok());
    });

    match rx.recv_timeout(timeout) {
        Ok(true) => JoinOutcome::Joined,
        Ok(false) | Err(mpsc::RecvTimeoutError::Disconnected) => JoinOutcome::Panicked,
        Err(mpsc::RecvTimeoutError::Timeout) => JoinOutcome::TimedOut,
    }
}

/// 轮询线程配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// 停止时等待线程退出的上限
    pub join_timeout: Duration,
    /// 等待首个样本（`ConnectPolicy::WaitForFirstSample`）时的检查间隔
    pub wait_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(1),
            wait_interval: Duration::from_millis(1),
        }
    }
}

/// 轮询线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollerState {
    #[default]
    NotStarted,
    Running,
    Stopped,
}

struct PollerInner {
    state: PollerState,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// 线程退出（包括 panic 展开）时清除存活标志
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 后台轮询线程句柄
pub struct Poller {
    name: String,
    join_timeout: Duration,
    inner: Mutex<PollerInner>,
    alive: Arc<AtomicBool>,
}

impl Poller {
    pub fn new(name: impl Into<String>, join_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            join_timeout,
            inner: Mutex::new(PollerInner {
                state: PollerState::NotStarted,
                cancel: Arc::new(AtomicBool::new(false)),
                handle: None,
            }),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> PollerState {
        self.inner.lock().state
    }

    /// 线程是否仍在运行（panic 或退出后为 false）
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// 启动轮询线程（仅在 `NotStarted` 状态下生效）
    ///
    /// 每次迭代调用 `body`，然后休眠 `interval`。
    /// 返回 `Ok(true)` 表示本次调用创建了线程。
    pub fn start<F>(&self, interval: Duration, mut body: F) -> Result<bool, DeviceError>
    where
        F: FnMut() + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.state != PollerState::NotStarted {
            trace!("Poller '{}' not started: state is {:?}", self.name, inner.state);
            return Ok(false);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = cancel.clone();
        let alive = self.alive.clone();
        alive.store(true, Ordering::Release);

        let spawned = std::thread::Builder::new()
            .name(format!("poller-{}", self.name))
            .spawn(move || {
                let _alive = AliveGuard(alive);
                while !thread_cancel.load(Ordering::Acquire) {
                    body();
                    spin_sleep::sleep(interval);
                }
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.alive.store(false, Ordering::Release);
                return Err(e.into());
            },
        };

        inner.cancel = cancel;
        inner.handle = Some(handle);
        inner.state = PollerState::Running;
        debug!("Poller '{}' started (interval {:?})", self.name, interval);
        Ok(true)
    }

    /// 停止轮询线程并有界等待其退出
    ///
    /// 任何状态下调用后都处于 `Stopped`，之后的 `start()` 不再创建线程，
    /// 直到 `reset()`。超时后不再等待（尽力而为）。在轮询线程自身内调用时不 join。
    pub fn stop(&self) {
        let handle = {
            let mut inner = self.inner.lock();
            inner.cancel.store(true, Ordering::Release);
            inner.state = PollerState::Stopped;
            inner.handle.take()
        };

        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        match join_bounded(handle, self.join_timeout) {
            JoinOutcome::Joined => debug!("Poller '{}' stopped", self.name),
            JoinOutcome::Panicked => error!("Poller '{}' panicked", self.name),
            JoinOutcome::TimedOut => warn!(
                "Poller '{}' did not shut down within {:?}",
                self.name, self.join_timeout
            ),
        }
    }

    /// `Stopped → NotStarted`（新连接周期）
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state == PollerState::Stopped {
            inner.state = PollerState::NotStarted;
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("alive", &self.is_alive())
            .finish()
    }
}
