//! 传输层消息类型
//!
//! 字段布局与常见中间件的 `sensor_msgs/Image`、`sensor_msgs/JointState` 对齐，
//! 但不依赖任何具体中间件。

use bytes::Bytes;

/// 原始图像消息（未解码）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMessage {
    /// 采集时间戳（微秒，UNIX epoch）
    pub stamp_us: u64,
    pub frame_id: String,
    pub width: u32,
    pub height: u32,
    /// 像素编码，如 "rgb8"、"bgr8"、"mono8"
    pub encoding: String,
    /// 每行字节数（可能大于 `width * channels`）
    pub step: u32,
    pub data: Bytes,
}

/// 关节状态消息
///
/// `name` 与 `position` 按下标一一对应；`velocity`/`effort` 可为空。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JointStateMessage {
    pub stamp_us: u64,
    pub name: Vec<String>,
    pub position: Vec<f64>,
    pub velocity: Vec<f64>,
    pub effort: Vec<f64>,
}

impl JointStateMessage {
    /// 由名称和位置构造（时间戳取当前时间）
    pub fn from_positions(
        names: impl IntoIterator<Item = impl Into<String>>,
        positions: impl IntoIterator<Item = f64>,
    ) -> Self {
        Self {
            stamp_us: current_time_us(),
            name: names.into_iter().map(Into::into).collect(),
            position: positions.into_iter().collect(),
            velocity: Vec::new(),
            effort: Vec::new(),
        }
    }
}

/// 力矩使能状态消息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorqueStateMessage {
    pub stamp_us: u64,
    pub name: Vec<String>,
    pub enabled: Vec<bool>,
}

/// 传输层消息
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Image(ImageMessage),
    JointState(JointStateMessage),
    TorqueState(TorqueStateMessage),
}

impl Message {
    /// 消息类型名（日志用）
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Image(_) => "image",
            Message::JointState(_) => "joint_state",
            Message::TorqueState(_) => "torque_state",
        }
    }

    pub fn stamp_us(&self) -> u64 {
        match self {
            Message::Image(m) => m.stamp_us,
            Message::JointState(m) => m.stamp_us,
            Message::TorqueState(m) => m.stamp_us,
        }
    }
}

/// 获取当前时间（微秒）
pub fn current_time_us() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind() {
        assert_eq!(Message::Image(ImageMessage::default()).kind(), "image");
        assert_eq!(
            Message::JointState(JointStateMessage::default()).kind(),
            "joint_state"
        );
        assert_eq!(
            Message::TorqueState(TorqueStateMessage::default()).kind(),
            "torque_state"
        );
    }

    #[test]
    fn test_from_positions() {
        let msg = JointStateMessage::from_positions(["shoulder", "elbow"], [0.5, -1.0]);
        assert_eq!(msg.name, vec!["shoulder".to_string(), "elbow".to_string()]);
        assert_eq!(msg.position, vec![0.5, -1.0]);
        assert!(msg.stamp_us > 0);
        assert_eq!(Message::JointState(msg.clone()).stamp_us(), msg.stamp_us);
    }
}
