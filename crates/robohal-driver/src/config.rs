//! # 设备配置
//!
//! 相机与电机总线的 TOML 配置：
//!
//! ```toml
//! [cameras.wrist]
//! image_topic = "/wrist/image_raw"
//! fps = 30
//! rotation = 90
//! color_mode = "bgr"
//!
//! [motor_buses.follower]
//! command_topic = "/joint_command"
//! state_topic = "/joint_states"
//! robot_type = "koch"
//!
//! [[motor_buses.follower.motors]]
//! name = "shoulder_pan"
//! id = 1
//! model = "xl430-w250"
//! ```

use crate::DeviceError;
use crate::camera::{ColorMode, Rotation};
use crate::session::ConnectPolicy;
use robohal_calibration::ModelTable;
use robohal_transport::validate_topic;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

fn default_fps() -> u32 {
    30
}

fn default_channels() -> u32 {
    3
}

fn default_robot_type() -> String {
    "koch".to_string()
}

fn check_topic(field: &str, topic: &str) -> Result<(), DeviceError> {
    validate_topic(topic)
        .map_err(|e| DeviceError::InvalidConfig(format!("`{}`: {}", field, e)))
}

/// 相机配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub image_topic: String,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// 期望的原始帧宽度（旋转前）；为空时不检查
    #[serde(default)]
    pub width: Option<u32>,

    #[serde(default)]
    pub height: Option<u32>,

    #[serde(default = "default_channels")]
    pub channels: u32,

    #[serde(default)]
    pub color_mode: ColorMode,

    /// 顺时针旋转角度：-90、0、90、180
    #[serde(default)]
    pub rotation: Rotation,

    /// 不订阅真实数据，由 `refresh()` 生成测试图案
    #[serde(default)]
    pub mock: bool,

    #[serde(default)]
    pub connect_policy: ConnectPolicy,
}

impl CameraConfig {
    pub fn new(image_topic: impl Into<String>) -> Self {
        Self {
            image_topic: image_topic.into(),
            fps: default_fps(),
            width: None,
            height: None,
            channels: default_channels(),
            color_mode: ColorMode::default(),
            rotation: Rotation::default(),
            mock: false,
            connect_policy: ConnectPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), DeviceError> {
        check_topic("image_topic", &self.image_topic)?;
        if self.fps == 0 {
            return Err(DeviceError::InvalidConfig("`fps` must be > 0".to_string()));
        }
        if !matches!(self.channels, 1 | 3 | 4) {
            return Err(DeviceError::InvalidConfig(format!(
                "`channels` must be 1, 3 or 4, got {}",
                self.channels
            )));
        }
        if self.mock && (self.width.is_none() || self.height.is_none()) {
            return Err(DeviceError::InvalidConfig(
                "mock camera requires `width` and `height`".to_string(),
            ));
        }
        Ok(())
    }
}

/// 单个电机
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub name: String,
    pub id: u8,
    pub model: String,
}

impl MotorConfig {
    pub fn new(name: impl Into<String>, id: u8, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id,
            model: model.into(),
        }
    }
}

/// 电机总线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorBusConfig {
    /// 关节命令主题
    pub command_topic: String,
    /// 关节状态主题
    pub state_topic: String,

    #[serde(default)]
    pub torque_command_topic: Option<String>,

    #[serde(default)]
    pub torque_state_topic: Option<String>,

    /// 机器人类型（决定夹爪是否为直线标定）
    #[serde(default = "default_robot_type")]
    pub robot_type: String,

    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default)]
    pub connect_policy: ConnectPolicy,

    /// 按总线下标排列
    #[serde(default)]
    pub motors: Vec<MotorConfig>,
}

impl MotorBusConfig {
    pub fn new(command_topic: impl Into<String>, state_topic: impl Into<String>) -> Self {
        Self {
            command_topic: command_topic.into(),
            state_topic: state_topic.into(),
            torque_command_topic: None,
            torque_state_topic: None,
            robot_type: default_robot_type(),
            fps: default_fps(),
            connect_policy: ConnectPolicy::default(),
            motors: Vec::new(),
        }
    }

    pub fn with_motor(mut self, name: impl Into<String>, id: u8, model: impl Into<String>) -> Self {
        self.motors.push(MotorConfig::new(name, id, model));
        self
    }

    pub fn validate(&self, models: &ModelTable) -> Result<(), DeviceError> {
        check_topic("command_topic", &self.command_topic)?;
        check_topic("state_topic", &self.state_topic)?;
        if let Some(topic) = &self.torque_command_topic {
            check_topic("torque_command_topic", topic)?;
        }
        if let Some(topic) = &self.torque_state_topic {
            check_topic("torque_state_topic", topic)?;
        }
        if self.fps == 0 {
            return Err(DeviceError::InvalidConfig("`fps` must be > 0".to_string()));
        }
        if self.motors.is_empty() {
            return Err(DeviceError::InvalidConfig("motor bus has no motors".to_string()));
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for motor in &self.motors {
            if !names.insert(motor.name.as_str()) {
                return Err(DeviceError::InvalidConfig(format!(
                    "duplicate motor name '{}'",
                    motor.name
                )));
            }
            if !ids.insert(motor.id) {
                return Err(DeviceError::InvalidConfig(format!(
                    "duplicate motor id {} ('{}')",
                    motor.id, motor.name
                )));
            }
            if !models.contains(&motor.model) {
                return Err(DeviceError::InvalidConfig(format!(
                    "unknown model '{}' for motor '{}'",
                    motor.model, motor.name
                )));
            }
        }
        Ok(())
    }
}

/// 整机配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HalConfig {
    #[serde(default)]
    pub cameras: BTreeMap<String, CameraConfig>,

    #[serde(default)]
    pub motor_buses: BTreeMap<String, MotorBusConfig>,
}

impl HalConfig {
    /// 解析 TOML（不做校验）
    pub fn from_toml_str(content: &str) -> Result<Self, DeviceError> {
        toml::from_str(content).map_err(|e| DeviceError::InvalidConfig(e.to_string()))
    }

    /// 从文件加载并校验
    pub fn load<P: AsRef<Path>>(path: P, models: &ModelTable) -> Result<Self, DeviceError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&content)?;
        config.validate(models)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, DeviceError> {
        toml::to_string_pretty(self).map_err(|e| DeviceError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self, models: &ModelTable) -> Result<(), DeviceError> {
        for (name, camera) in &self.cameras {
            camera
                .validate()
                .map_err(|e| DeviceError::InvalidConfig(format!("camera '{}': {}", name, e)))?;
        }
        for (name, bus) in &self.motor_buses {
            bus.validate(models)
                .map_err(|e| DeviceError::InvalidConfig(format!("motor bus '{}': {}", name, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[cameras.wrist]
image_topic = "/wrist/image_raw"
fps = 15
rotation = -90
color_mode = "bgr"

[cameras.top]
image_topic = "/top/image_raw"

[motor_buses.follower]
command_topic = "/joint_command"
state_topic = "/joint_states"
torque_state_topic = "/torque_state"
robot_type = "aloha"
connect_policy = { mode = "wait_for_first_sample", timeout_ms = 500 }

[[motor_buses.follower.motors]]
name = "waist"
id = 1
model = "xm430-w350"

[[motor_buses.follower.motors]]
name = "gripper"
id = 9
model = "xl430-w250"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = HalConfig::from_toml_str(SAMPLE).unwrap();
        config.validate(&ModelTable::dynamixel()).unwrap();

        let wrist = &config.cameras["wrist"];
        assert_eq!(wrist.fps, 15);
        assert_eq!(wrist.rotation, Rotation::Ccw90);
        assert_eq!(wrist.color_mode, ColorMode::Bgr);

        let top = &config.cameras["top"];
        assert_eq!(top.fps, 30);
        assert_eq!(top.rotation, Rotation::None);
        assert_eq!(top.connect_policy, ConnectPolicy::Immediate);

        let bus = &config.motor_buses["follower"];
        assert_eq!(bus.motors[1], MotorConfig::new("gripper", 9, "xl430-w250"));
        assert_eq!(bus.robot_type, "aloha");
        assert_eq!(
            bus.connect_policy,
            ConnectPolicy::WaitForFirstSample { timeout_ms: 500 }
        );
    }

    #[test]
    fn test_invalid_rotation_rejected() {
        let content = r#"
[cameras.front]
image_topic = "/front"
rotation = 45
"#;
        assert!(matches!(
            HalConfig::from_toml_str(content),
            Err(DeviceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validation_errors() {
        let models = ModelTable::dynamixel();

        let mut camera = CameraConfig::new("/front");
        camera.fps = 0;
        assert!(camera.validate().is_err());

        let bus = MotorBusConfig::new("/cmd", "/state")
            .with_motor("a", 1, "xl430-w250")
            .with_motor("b", 1, "xl430-w250");
        let err = bus.validate(&models).unwrap_err();
        assert!(format!("{}", err).contains("duplicate motor id"));

        let bus = MotorBusConfig::new("/cmd", "/state").with_motor("a", 1, "no-such-model");
        assert!(format!("{}", bus.validate(&models).unwrap_err()).contains("unknown model"));

        let bus = MotorBusConfig::new("", "/state").with_motor("a", 1, "xl430-w250");
        assert!(bus.validate(&models).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("robot.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = HalConfig::load(&path, &ModelTable::dynamixel()).unwrap();
        assert_eq!(config.cameras.len(), 2);

        let round = HalConfig::from_toml_str(&config.to_toml_string().unwrap()).unwrap();
        assert_eq!(round, config);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            HalConfig::load("/nonexistent/robot.toml", &ModelTable::dynamixel()),
            Err(DeviceError::Io(_))
        ));
    }
}
