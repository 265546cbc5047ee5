//! robohal - 机器人设备硬件抽象层
//!
//! 相机与电机总线的统一会话接口，以及电机标定。
//!
//! # 架构设计
//!
//! 从底层到高层：
//!
//! - **传输层** (`transport`): 发布/订阅抽象、消息类型、进程内总线
//! - **标定层** (`calibration`): 数值变换、标定记录、交互式标定流程
//! - **驱动层** (`driver`): 设备会话、最新样本缓冲、后台轮询
//!
//! # 快速开始
//!
//! ```no_run
//! use robohal::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! robohal::init_logger();
//!
//! let transport = Arc::new(LoopbackTransport::new());
//! let camera = Camera::from_config("top", CameraConfig::new("/top/image_raw"), transport)?;
//! camera.connect()?;
//! let frame = camera.async_read(Duration::from_secs(1))?;
//! println!("{:?}", frame.shape());
//! # Ok::<(), DeviceError>(())
//! ```

pub use robohal_calibration as calibration;
pub use robohal_driver as driver;
pub use robohal_transport as transport;

pub mod prelude;

// --- 常用类型 ---

pub use calibration::{CalibrationError, CalibrationRecord, OperatorPrompt, StdinPrompt};
pub use driver::{
    Camera, CameraConfig, DeviceError, DeviceSession, Hal, HalBuilder, HalConfig, MotorBus,
    MotorBusConfig,
};
pub use transport::{LoopbackTransport, Message, Transport, TransportError};

use std::sync::Once;

static LOGGER: Once = Once::new();

/// 初始化日志（可重复调用，只有第一次生效）
///
/// 过滤级别取自 `RUST_LOG`，未设置时为 `info`。
/// 依赖 `log` crate 的库输出也会被转发到 tracing。
pub fn init_logger() {
    LOGGER.call_once(|| {
        // 宿主程序已装有 log 后端时保留它
        let _ = tracing_log::LogTracer::init();
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_idempotent() {
        init_logger();
        init_logger();
        tracing::info!("logger initialized twice without panicking");
        // log 桥接已由 init_logger 安装
        assert!(tracing_log::LogTracer::init().is_err());
    }
}
