//! 标定错误类型定义

use thiserror::Error;

/// 标定错误类型
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// drive mode 只能是 0 或 1
    #[error("`drive_mode` contains values other than 0 or 1: {0:?}")]
    InvalidDriveMode(Vec<i32>),

    /// 标定前置条件不满足（力矩未关闭）
    ///
    /// 在力矩使能状态下标定得到的偏移没有意义，流程必须中止。
    #[error(
        "Calibration precondition failed: torque must be disabled on all motors (enabled: {enabled_motors:?})"
    )]
    Precondition { enabled_motors: Vec<String> },

    /// 标定后的值超出允许范围
    #[error(
        "Wrong motor position range detected for {motor}: {value:.3} not in [{lower}, {upper}]"
    )]
    JointOutOfRange {
        motor: String,
        value: f64,
        lower: f64,
        upper: f64,
    },

    /// 直线电机的起止位置相同
    #[error("Degenerate linear range for {motor}: start_pos == end_pos")]
    DegenerateLinearRange { motor: String },

    /// 自动修正找不到整圈偏移
    #[error("No integer turn shift brings {motor} back into range ({low:.3} .. {high:.3})")]
    NoTurnShift { motor: String, low: f64, high: f64 },

    /// 未知电机型号
    #[error("Unknown motor model: {0}")]
    UnknownModel(String),

    /// 标定记录中没有该电机
    #[error("Motor '{0}' is not present in the calibration record")]
    MissingMotor(String),

    /// 标定记录字段长度不一致等
    #[error("Inconsistent calibration record: {0}")]
    RecordMismatch(String),

    /// 操作员确认失败
    #[error("Operator prompt failed: {0}")]
    Prompt(String),

    /// 被标定设备读数失败
    #[error("Calibration target error: {0}")]
    Target(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::CalibrationError;

    #[test]
    fn test_calibration_error_display() {
        let err = CalibrationError::InvalidDriveMode(vec![0, 2]);
        assert!(format!("{}", err).contains("[0, 2]"));

        let err = CalibrationError::Precondition {
            enabled_motors: vec!["elbow".to_string()],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("torque must be disabled") && msg.contains("elbow"));

        let err = CalibrationError::JointOutOfRange {
            motor: "wrist".to_string(),
            value: 300.0,
            lower: -270.0,
            upper: 270.0,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("wrist") && msg.contains("300.000"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CalibrationError = io.into();
        assert!(matches!(err, CalibrationError::Io(_)));
    }
}
