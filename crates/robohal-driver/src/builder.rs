//! Builder 模式实现
//!
//! 按 [`HalConfig`] 一次性构造所有相机与电机总线。
//!
//! # Example
//!
//! ```no_run
//! use robohal_driver::{HalBuilder, HalConfig};
//! use robohal_transport::LoopbackTransport;
//! use std::sync::Arc;
//!
//! let config = HalConfig::from_toml_str(r#"
//! [cameras.top]
//! image_topic = "/top/image_raw"
//! "#).unwrap();
//!
//! let hal = HalBuilder::new(Arc::new(LoopbackTransport::new()))
//!     .build(&config)
//!     .unwrap();
//! hal.connect_all().unwrap();
//! ```

use crate::DeviceError;
use crate::camera::{Camera, CameraAdapter};
use crate::config::{CameraConfig, HalConfig, MotorBusConfig};
use crate::motor::{MotorBus, MotorBusAdapter};
use crate::poller::PollerConfig;
use crate::session::{ConnectPolicy, DeviceSession, SessionConfig};
use robohal_calibration::ModelTable;
use robohal_transport::Transport;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// 设备集合 Builder（链式构造）
pub struct HalBuilder {
    transport: Arc<dyn Transport>,
    models: Option<ModelTable>,
    poller_config: Option<PollerConfig>,
}

impl HalBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            models: None,
            poller_config: None,
        }
    }

    /// 电机型号表（默认 [`ModelTable::dynamixel`]）
    pub fn models(mut self, models: ModelTable) -> Self {
        self.models = Some(models);
        self
    }

    pub fn poller_config(mut self, config: PollerConfig) -> Self {
        self.poller_config = Some(config);
        self
    }

    fn session_config(&self, connect_policy: ConnectPolicy) -> SessionConfig {
        SessionConfig {
            poller: self.poller_config.clone().unwrap_or_default(),
            connect_policy,
        }
    }

    pub fn build_camera(&self, name: &str, config: &CameraConfig) -> Result<Camera, DeviceError> {
        let session_config = self.session_config(config.connect_policy);
        let adapter = CameraAdapter::new(name, config.clone())?;
        Ok(DeviceSession::with_config(adapter, self.transport.clone(), session_config))
    }

    pub fn build_motor_bus(&self, name: &str, config: &MotorBusConfig) -> Result<MotorBus, DeviceError> {
        let session_config = self.session_config(config.connect_policy);
        let models = self.models.clone().unwrap_or_else(ModelTable::dynamixel);
        let adapter = MotorBusAdapter::new(name, config.clone(), &models)?;
        Ok(DeviceSession::with_config(adapter, self.transport.clone(), session_config))
    }

    /// 校验整份配置后构造所有设备（不连接）
    pub fn build(self, config: &HalConfig) -> Result<Hal, DeviceError> {
        let models = self.models.clone().unwrap_or_else(ModelTable::dynamixel);
        config.validate(&models)?;

        let cameras = config
            .cameras
            .iter()
            .map(|(name, c)| self.build_camera(name, c).map(|cam| (name.clone(), cam)))
            .collect::<Result<BTreeMap<_, _>, DeviceError>>()?;
        let motor_buses = config
            .motor_buses
            .iter()
            .map(|(name, c)| self.build_motor_bus(name, c).map(|bus| (name.clone(), bus)))
            .collect::<Result<BTreeMap<_, _>, DeviceError>>()?;

        info!(
            "Built {} camera(s) and {} motor bus(es)",
            cameras.len(),
            motor_buses.len()
        );
        Ok(Hal {
            cameras,
            motor_buses,
        })
    }
}

/// 一台机器人的全部设备
#[derive(Debug)]
pub struct Hal {
    pub cameras: BTreeMap<String, Camera>,
    pub motor_buses: BTreeMap<String, MotorBus>,
}

impl Hal {
    pub fn camera(&self, name: &str) -> Option<&Camera> {
        self.cameras.get(name)
    }

    pub fn motor_bus(&self, name: &str) -> Option<&MotorBus> {
        self.motor_buses.get(name)
    }

    /// 连接所有设备；任一失败时断开已连接的设备并返回该错误
    pub fn connect_all(&self) -> Result<(), DeviceError> {
        let result = self
            .motor_buses
            .values()
            .try_for_each(|bus| bus.connect())
            .and_then(|_| self.cameras.values().try_for_each(|cam| cam.connect()));

        if let Err(e) = result {
            error!("Failed to connect all devices: {}", e);
            if let Err(rollback) = self.disconnect_all() {
                error!("Rollback after failed connect also failed: {}", rollback);
            }
            return Err(e);
        }
        Ok(())
    }

    /// 断开所有设备（全部执行，返回第一个错误）
    pub fn disconnect_all(&self) -> Result<(), DeviceError> {
        let mut first_err = None;
        let results = self
            .cameras
            .values()
            .map(|cam| cam.disconnect())
            .chain(self.motor_buses.values().map(|bus| bus.disconnect()));
        for result in results {
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
