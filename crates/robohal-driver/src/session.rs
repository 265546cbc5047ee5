//! # 设备会话
//!
//! 相机与电机总线共用的连接/读取/轮询逻辑，设备差异由 [`DeviceAdapter`] 提供。
//!
//! ## 数据流
//!
//! ```text
//! 传输层投递线程 ──on_message──▶ decode ──▶ FrameBuffer ◀── read()
//!                                                     │
//!                                 Poller: refresh() + read() ──▶ polled ◀── async_read()
//! ```
//!
//! - `read()`：只报告最近缓冲的样本，不做任何 IO
//! - `refresh()`：显式拉取（适配器支持时），结果与回调样本一样写入缓冲
//! - `async_read()`：惰性启动后台轮询线程，返回轮询线程最近一次读到的样本

use crate::DeviceError;
use crate::buffer::{FrameBuffer, TimingLog, capture_timestamp_utc};
use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::poller::{Poller, PollerConfig, PollerState};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use robohal_transport::{Message, MessageCallback, NodeGuard, SubscriptionHandle, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 设备适配器
///
/// 只负责设备相关的部分：订阅哪些主题、如何解码样本、轮询频率。
pub trait DeviceAdapter: Send + Sync + 'static {
    /// 缓冲的样本类型
    type Sample: Clone + Send + Sync + 'static;

    /// 日志和错误信息中使用的设备描述
    fn describe(&self) -> String;

    /// 期望的采样频率（Hz），决定轮询间隔和启动预算
    fn fps(&self) -> f64;

    /// 样本主题
    fn sample_topic(&self) -> &str;

    /// 解码并做设备相关变换
    fn decode(&self, message: &Message) -> Result<Self::Sample, DeviceError>;

    /// 额外订阅的主题（如力矩状态）
    fn auxiliary_topics(&self) -> Vec<String> {
        Vec::new()
    }

    fn on_auxiliary(&self, _topic: &str, _message: &Message) -> Result<(), DeviceError> {
        Ok(())
    }

    /// 显式拉取一个样本；纯推送设备返回 `Ok(None)`
    fn pull(&self) -> Result<Option<Self::Sample>, DeviceError> {
        Ok(None)
    }

    /// 断开连接时清理适配器内部状态
    fn on_disconnect(&self) {}
}

/// 连接策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConnectPolicy {
    /// 订阅后立即返回（默认）
    #[default]
    Immediate,
    /// 订阅后阻塞直到收到首个样本，超时则回滚连接
    WaitForFirstSample { timeout_ms: u64 },
}

/// 会话配置
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub poller: PollerConfig,
    pub connect_policy: ConnectPolicy,
}

/// 会话与回调、轮询线程共享的状态
pub(crate) struct SessionShared<A: DeviceAdapter> {
    pub(crate) adapter: A,
    pub(crate) name: String,
    /// 回调写入的最新样本
    pub(crate) buffer: FrameBuffer<A::Sample>,
    /// 轮询线程最近一次读到的样本
    pub(crate) polled: FrameBuffer<A::Sample>,
    pub(crate) timing: TimingLog,
    pub(crate) metrics: SessionMetrics,
    pub(crate) connected: AtomicBool,
    last_error: ArcSwapOption<String>,
}

impl<A: DeviceAdapter> SessionShared<A> {
    fn ensure_connected(&self) -> Result<(), DeviceError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(DeviceError::NotConnected(self.name.clone()));
        }
        Ok(())
    }

    /// 写入一个新样本并更新时间日志
    fn accept(&self, sample: A::Sample) {
        let delta = self.buffer.store(sample);
        self.timing.set("timestamp_utc", capture_timestamp_utc());
        if let Some(delta) = delta {
            self.timing.set("delta_timestamp_s", delta.as_secs_f64());
        }
        self.metrics.samples_received.fetch_add(1, Ordering::Relaxed);
    }

    /// 样本回调：任何错误都在这里截住
    fn on_sample(&self, message: &Message) {
        match self.adapter.decode(message) {
            Ok(sample) => self.accept(sample),
            Err(e) => self.record_callback_error(e),
        }
    }

    fn record_callback_error(&self, err: DeviceError) {
        self.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
        let msg = format!("Failed to decode sample for {}: {}", self.name, err);
        error!("{}", msg);
        self.last_error.store(Some(Arc::new(msg)));
    }

    fn read(&self) -> Result<A::Sample, DeviceError> {
        let start = Instant::now();
        let result = self.ensure_connected().and_then(|_| {
            self.buffer
                .latest()
                .ok_or_else(|| DeviceError::NoData(self.name.clone()))
        });

        match &result {
            Ok(_) => {
                self.metrics.reads_ok.fetch_add(1, Ordering::Relaxed);
                self.timing
                    .set("delta_timestamp_s_read", start.elapsed().as_secs_f64());
                self.timing.set("timestamp_utc_read", capture_timestamp_utc());
            },
            Err(_) => {
                self.metrics.reads_failed.fetch_add(1, Ordering::Relaxed);
            },
        }
        result
    }

    fn refresh(&self) -> Result<bool, DeviceError> {
        self.ensure_connected()?;
        match self.adapter.pull()? {
            Some(sample) => {
                self.accept(sample);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// 轮询线程的一次迭代：错误只记录，不终止循环
    fn poll_once(&self) {
        self.metrics.poller_iterations.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.refresh() {
            self.metrics.poller_errors.fetch_add(1, Ordering::Relaxed);
            error!("Poller refresh failed for {}: {}", self.name, e);
        }

        match self.read() {
            Ok(sample) => {
                self.polled.store(sample);
            },
            Err(DeviceError::NoData(_)) => {
                self.metrics.poller_errors.fetch_add(1, Ordering::Relaxed);
                trace!("Poller for {}: no data yet", self.name);
            },
            Err(e) => {
                self.metrics.poller_errors.fetch_add(1, Ordering::Relaxed);
                error!("Poller read failed for {}: {}", self.name, e);
            },
        }
    }
}

struct SampleCallback<A: DeviceAdapter> {
    shared: Arc<SessionShared<A>>,
}

impl<A: DeviceAdapter> MessageCallback for SampleCallback<A> {
    fn on_message(&self, message: &Message) {
        self.shared.on_sample(message);
    }
}

struct AuxiliaryCallback<A: DeviceAdapter> {
    shared: Arc<SessionShared<A>>,
    topic: String,
}

impl<A: DeviceAdapter> MessageCallback for AuxiliaryCallback<A> {
    fn on_message(&self, message: &Message) {
        if let Err(e) = self.shared.adapter.on_auxiliary(&self.topic, message) {
            self.shared.record_callback_error(e);
        }
    }
}

/// 连接期间持有的资源
struct Link {
    subscriptions: Vec<SubscriptionHandle>,
    /// 持有期间节点不会被关闭
    _node: NodeGuard,
}

/// 设备会话
///
/// 连接状态：`Disconnected ⇄ Connected`。
/// `read()`/`async_read()`/写操作要求已连接；重复 `connect()` 返回 `AlreadyConnected`；
/// `disconnect()` 在未连接时是空操作，Drop 时自动调用。
pub struct DeviceSession<A: DeviceAdapter> {
    shared: Arc<SessionShared<A>>,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    link: Mutex<Option<Link>>,
    poller: Poller,
}

impl<A: DeviceAdapter> DeviceSession<A> {
    pub fn new(adapter: A, transport: Arc<dyn Transport>) -> Self {
        Self::with_config(adapter, transport, SessionConfig::default())
    }

    pub fn with_config(adapter: A, transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let name = adapter.describe();
        let poller = Poller::new(name.clone(), config.poller.join_timeout);
        Self {
            shared: Arc::new(SessionShared {
                adapter,
                name,
                buffer: FrameBuffer::new(),
                polled: FrameBuffer::new(),
                timing: TimingLog::new(),
                metrics: SessionMetrics::new(),
                connected: AtomicBool::new(false),
                last_error: ArcSwapOption::empty(),
            }),
            transport,
            config,
            link: Mutex::new(None),
            poller,
        }
    }

    /// 设备描述
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn adapter(&self) -> &A {
        &self.shared.adapter
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// 建立订阅，`Disconnected → Connected`
    pub fn connect(&self) -> Result<(), DeviceError> {
        {
            let mut link = self.link.lock();
            if link.is_some() {
                return Err(DeviceError::AlreadyConnected(self.shared.name.clone()));
            }

            let node = self.transport.acquire_node()?;
            let subscriptions = self.subscribe_all()?;

            self.poller.reset();
            self.shared.connected.store(true, Ordering::Release);
            *link = Some(Link {
                subscriptions,
                _node: node,
            });
        }
        info!("{} connected", self.shared.name);

        if let ConnectPolicy::WaitForFirstSample { timeout_ms } = self.config.connect_policy {
            let timeout = Duration::from_millis(timeout_ms);
            if let Err(e) = self.wait_for_first_sample(timeout) {
                if let Err(teardown_err) = self.disconnect() {
                    error!(
                        "Failed to roll back connection of {}: {}",
                        self.shared.name, teardown_err
                    );
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// 已连接时只记录警告
    pub fn reconnect(&self) -> Result<(), DeviceError> {
        if self.is_connected() {
            warn!("{}: already connected, reconnect call is unnecessary", self.shared.name);
            return Ok(());
        }
        self.connect()
    }

    fn subscribe_all(&self) -> Result<Vec<SubscriptionHandle>, DeviceError> {
        let mut topics: Vec<(String, Arc<dyn MessageCallback>)> = vec![(
            self.shared.adapter.sample_topic().to_string(),
            Arc::new(SampleCallback {
                shared: self.shared.clone(),
            }),
        )];
        for topic in self.shared.adapter.auxiliary_topics() {
            let callback = Arc::new(AuxiliaryCallback {
                shared: self.shared.clone(),
                topic: topic.clone(),
            });
            topics.push((topic, callback));
        }

        let mut handles = Vec::with_capacity(topics.len());
        for (topic, callback) in topics {
            match self.transport.subscribe(&topic, callback) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        if let Err(teardown_err) = self.transport.teardown(handle) {
                            warn!("Rollback teardown failed: {}", teardown_err);
                        }
                    }
                    return Err(e.into());
                },
            }
        }
        Ok(handles)
    }

    /// 等待首个样本（期间会调用 `refresh()`）
    pub fn wait_for_first_sample(&self, timeout: Duration) -> Result<(), DeviceError> {
        let start = Instant::now();

        loop {
            self.shared.ensure_connected()?;
            if !self.shared.buffer.is_empty() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(DeviceError::Timeout(timeout));
            }

            if let Err(e) = self.shared.refresh() {
                debug!("refresh while waiting for {} failed: {}", self.shared.name, e);
            }
            std::thread::sleep(self.config.poller.wait_interval);
        }
    }

    /// 最近缓冲的样本（按值返回，不做 IO）
    pub fn read(&self) -> Result<A::Sample, DeviceError> {
        self.shared.read()
    }

    /// 显式拉取；返回是否得到了新样本
    pub fn refresh(&self) -> Result<bool, DeviceError> {
        self.shared.refresh()
    }

    /// 轮询间隔 `1 / fps`
    pub fn poll_interval(&self) -> Duration {
        let fps = self.shared.adapter.fps();
        if fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::from_millis(100)
        }
    }

    /// 启动预算：连续 `fps` 次空轮询
    pub fn startup_tries(&self) -> u32 {
        (self.shared.adapter.fps().ceil() as u32).max(1)
    }

    /// 返回后台轮询线程最近读到的样本
    ///
    /// 首次调用时启动轮询线程（每个连接周期至多一个）。每 `1/fps` 检查一次：
    /// - 有样本立即返回
    /// - 连续 `fps` 次为空（轮询线程已退出或从未读到样本）返回 `PollerStartup`
    /// - 总耗时超过 `timeout` 返回 `Timeout`
    pub fn async_read(&self, timeout: Duration) -> Result<A::Sample, DeviceError> {
        self.shared.ensure_connected()?;

        let interval = self.poll_interval();
        let shared = self.shared.clone();
        if self.poller.start(interval, move || shared.poll_once())? {
            debug!("Background poller started for {}", self.shared.name);
        }

        let tries = self.startup_tries();
        let start = Instant::now();
        let mut empty_polls = 0u32;

        loop {
            if let Some(sample) = self.shared.polled.latest() {
                return Ok(sample);
            }
            self.shared.ensure_connected()?;

            empty_polls += 1;
            if empty_polls >= tries {
                let alive = self.poller.is_alive();
                warn!(
                    "{}: no sample from background poller after {} tries (poller alive: {})",
                    self.shared.name, tries, alive
                );
                return Err(DeviceError::PollerStartup {
                    device: self.shared.name.clone(),
                    tries,
                });
            }
            if start.elapsed() >= timeout {
                return Err(DeviceError::Timeout(timeout));
            }
            spin_sleep::sleep(interval);
        }
    }

    /// 停止轮询、注销订阅、清空缓冲，`Connected → Disconnected`
    ///
    /// 未连接时是空操作。清理总是完整执行；若注销订阅失败，返回第一个错误。
    pub fn disconnect(&self) -> Result<(), DeviceError> {
        let Some(link) = self.link.lock().take() else {
            trace!("{}: disconnect on a disconnected session", self.shared.name);
            return Ok(());
        };

        self.shared.connected.store(false, Ordering::Release);
        self.poller.stop();

        let mut first_err = None;
        let Link {
            subscriptions,
            _node,
        } = link;
        for handle in subscriptions {
            if let Err(e) = self.transport.teardown(handle) {
                error!("Failed to tear down subscription of {}: {}", self.shared.name, e);
                first_err.get_or_insert(e);
            }
        }

        self.shared.buffer.clear();
        self.shared.polled.clear();
        self.shared.adapter.on_disconnect();
        drop(_node);
        info!("{} disconnected", self.shared.name);

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn poller_state(&self) -> PollerState {
        self.poller.state()
    }

    pub fn is_poller_alive(&self) -> bool {
        self.poller.is_alive()
    }

    /// 时间日志快照
    pub fn logs(&self) -> HashMap<String, f64> {
        self.shared.timing.snapshot()
    }

    pub fn timing(&self) -> &TimingLog {
        &self.shared.timing
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// 最近一次回调错误
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.load().as_ref().map(|msg| msg.as_ref().clone())
    }

    /// 最新样本（不检查连接、不记时间日志）
    pub fn latest_sample(&self) -> Option<A::Sample> {
        self.shared.buffer.latest()
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), DeviceError> {
        self.shared.ensure_connected()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn session_metrics(&self) -> &SessionMetrics {
        &self.shared.metrics
    }
}

impl<A: DeviceAdapter> Drop for DeviceSession<A> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            error!("Error while disconnecting {} on drop: {}", self.shared.name, e);
        }
    }
}

impl<A: DeviceAdapter> std::fmt::Debug for DeviceSession<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("name", &self.shared.name)
            .field("connected", &self.is_connected())
            .field("poller", &self.poller)
            .finish()
    }
}
