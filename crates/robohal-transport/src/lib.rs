//! # robohal Transport Layer
//!
//! 发布/订阅传输抽象层，为相机和电机总线提供统一的消息通道。
//!
//! - [`Transport`]: `subscribe` / `publish` / `teardown` 三个原语
//! - [`MessageCallback`]: 传输层投递线程上执行的回调
//! - [`NodeContext`]: 引用计数的节点生命周期（多个会话共享一个节点）
//! - [`LoopbackTransport`]: 进程内总线（仿真与测试）

use std::sync::Arc;
use thiserror::Error;

pub mod lifecycle;
pub mod loopback;
pub mod message;

pub use lifecycle::{NodeContext, NodeGuard, NodeRuntime, NoopRuntime};
pub use loopback::{LoopbackStats, LoopbackTransport};
pub use message::{
    ImageMessage, JointStateMessage, Message, TorqueStateMessage, current_time_us,
};

/// 传输层统一错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Node is not initialized")]
    NodeNotInitialized,
    #[error("Node init failed: {0}")]
    NodeInit(String),
    #[error("Unknown subscription {id} on topic '{topic}'")]
    UnknownSubscription { id: u64, topic: String },
    #[error("Invalid topic name: '{0}'")]
    InvalidTopic(String),
    #[error("Transport closed")]
    Closed,
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// 订阅句柄
///
/// 由 [`Transport::subscribe`] 返回，传回 [`Transport::teardown`] 以注销订阅。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: String,
}

/// 消息回调 Trait
///
/// 在传输层自己的投递线程上调用，调用方无法控制其时机。
/// 实现必须快速返回，且不能 panic。
pub trait MessageCallback: Send + Sync {
    fn on_message(&self, message: &Message);
}

impl<F> MessageCallback for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn on_message(&self, message: &Message) {
        self(message)
    }
}

/// 传输层抽象
///
/// 设备会话只通过这几个操作访问底层传输，具体实现（进程内总线、
/// 中间件桥接、串口网关）由适配器提供。
pub trait Transport: Send + Sync {
    /// 持有节点引用（首个引用触发 `init`，最后一个释放触发 `shutdown`）
    fn acquire_node(&self) -> Result<NodeGuard, TransportError>;

    fn subscribe(
        &self,
        topic: &str,
        callback: Arc<dyn MessageCallback>,
    ) -> Result<SubscriptionHandle, TransportError>;

    fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError>;

    fn teardown(&self, handle: SubscriptionHandle) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn acquire_node(&self) -> Result<NodeGuard, TransportError> {
        (**self).acquire_node()
    }

    fn subscribe(
        &self,
        topic: &str,
        callback: Arc<dyn MessageCallback>,
    ) -> Result<SubscriptionHandle, TransportError> {
        (**self).subscribe(topic, callback)
    }

    fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        (**self).publish(topic, message)
    }

    fn teardown(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        (**self).teardown(handle)
    }
}

/// 校验 topic 名称（非空，`/` 分隔，不含空白）
pub fn validate_topic(topic: &str) -> Result<(), TransportError> {
    if topic.is_empty()
        || topic.chars().any(char::is_whitespace)
        || (topic.ends_with('/') && topic.len() > 1)
    {
        return Err(TransportError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("/joint_states").is_ok());
        assert!(validate_topic("camera/image_raw").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("/bad topic").is_err());
        assert!(validate_topic("/trailing/").is_err());
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::UnknownSubscription {
            id: 7,
            topic: "/joint_states".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("7") && msg.contains("/joint_states"));

        assert_eq!(format!("{}", TransportError::Closed), "Transport closed");
    }

    #[test]
    fn test_closure_callback() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let callback: Arc<dyn MessageCallback> = Arc::new(move |_msg: &Message| {
            hits_clone.fetch_add(1, Ordering::Relaxed);
        });

        callback.on_message(&Message::JointState(JointStateMessage::default()));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
