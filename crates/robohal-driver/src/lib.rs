//! # robohal Driver
//!
//! 设备会话层：相机与电机总线的连接管理、最新样本缓冲、后台轮询线程。
//!
//! ## 核心组件
//!
//! - [`session`]: 通用设备会话（连接/断开、`read`/`refresh`/`async_read`）
//! - [`buffer`]: 无锁最新样本缓冲（ArcSwap）与耗时日志
//! - [`poller`]: 后台轮询线程（显式状态机，有界 join）
//! - [`camera`]: 图像解码、通道交换、旋转
//! - [`motor`]: 关节状态、寄存器读写、标定集成
//! - [`config`]: TOML 设备配置
//! - [`builder`]: 按配置构造整机设备集合
//! - [`metrics`]: 原子计数器
//!
//! ## 线程模型
//!
//! - 传输层投递线程：调用回调，解码后写入 [`FrameBuffer`]
//! - 调用方线程：`read()` 只读缓冲，不阻塞投递线程
//! - 后台轮询线程：首次 `async_read()` 时启动，每个连接周期至多一个

mod error;

pub mod buffer;
pub mod builder;
pub mod camera;
pub mod config;
pub mod metrics;
pub mod motor;
pub mod poller;
pub mod session;

pub use buffer::{FrameBuffer, Stamped, TimingLog, capture_timestamp_utc};
pub use builder::{Hal, HalBuilder};
pub use camera::{
    Camera, CameraAdapter, ColorMode, Image, PixelFormat, Rotation, decode_image,
    make_cameras_from_configs, rotate_image,
};
pub use config::{CameraConfig, HalConfig, MotorBusConfig, MotorConfig};
pub use error::DeviceError;
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use motor::{JointSnapshot, Motor, MotorBus, MotorBusAdapter};
pub use poller::{Poller, PollerConfig, PollerState};
pub use session::{ConnectPolicy, DeviceAdapter, DeviceSession, SessionConfig};
