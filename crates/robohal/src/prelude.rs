//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use robohal::prelude::*;
//! ```

// 设备会话
pub use crate::driver::{
    Camera, ConnectPolicy, DeviceAdapter, DeviceSession, Hal, HalBuilder, Image, MotorBus,
    PollerState,
};

// 配置
pub use crate::driver::{CameraConfig, ColorMode, HalConfig, MotorBusConfig, Rotation};

// 标定
pub use crate::calibration::{
    CalibrationMode, CalibrationRecord, CalibrationStep, ModelTable, OperatorPrompt, Register,
    StdinPrompt, TorqueMode,
};

// 传输层
pub use crate::transport::{LoopbackTransport, Message, Transport};

// 错误类型
pub use crate::calibration::CalibrationError;
pub use crate::driver::DeviceError;
pub use crate::transport::TransportError;
