//! 设备层错误类型定义

use robohal_calibration::{CalibrationError, Register};
use robohal_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// 设备层错误类型
#[derive(Error, Debug)]
pub enum DeviceError {
    /// 重复连接（调用方用法错误）
    #[error("{0} is already connected. Do not call `connect()` twice.")]
    AlreadyConnected(String),

    /// 未连接
    #[error("{0} is not connected. You need to run `connect()` first.")]
    NotConnected(String),

    /// 尚未收到任何样本
    #[error("No data received yet from {0}")]
    NoData(String),

    /// 后台轮询线程未能在启动预算内提供样本
    #[error("Background poller of {device} did not deliver a sample after {tries} tries")]
    PollerStartup { device: String, tries: u32 },

    /// 操作超时
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// 样本解码失败
    #[error("Decode error: {0}")]
    Decode(String),

    /// 总线上没有该电机
    #[error("Unknown motor: {0}")]
    UnknownMotor(String),

    /// 该型号或当前传输不支持此寄存器
    #[error("Register {register} is not supported by {target}")]
    UnsupportedRegister { register: Register, target: String },

    /// 数值个数与电机个数不一致
    #[error("Length mismatch: {values} values for {motors} motors")]
    LengthMismatch { values: usize, motors: usize },

    /// 配置无效
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// 传输层错误
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 标定错误
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// 线程创建、文件读取等 IO 错误
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DeviceError> for CalibrationError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Calibration(inner) => inner,
            other => CalibrationError::Target(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let err = DeviceError::AlreadyConnected("RosCamera(/camera/image_raw)".to_string());
        assert!(format!("{}", err).contains("Do not call `connect()` twice"));

        let err = DeviceError::PollerStartup {
            device: "cam".to_string(),
            tries: 10,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("cam") && msg.contains("10 tries"));

        let err = DeviceError::UnsupportedRegister {
            register: Register::Led,
            target: "motor bus 'follower'".to_string(),
        };
        assert!(format!("{}", err).contains("LED"));
    }

    #[test]
    fn test_into_calibration_error() {
        let err: CalibrationError = DeviceError::NoData("arm".to_string()).into();
        assert!(matches!(err, CalibrationError::Target(_)));

        let err: CalibrationError =
            DeviceError::Calibration(CalibrationError::UnknownModel("x".to_string())).into();
        assert!(matches!(err, CalibrationError::UnknownModel(_)));
    }

    #[test]
    fn test_from_transport_error() {
        let err: DeviceError = TransportError::Closed.into();
        assert!(matches!(err, DeviceError::Transport(TransportError::Closed)));
    }
}
