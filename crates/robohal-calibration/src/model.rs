//! 电机型号表
//!
//! 每个型号给出一圈对应的原始单位数（resolution）和控制表布局。
//! 表在会话构造时提供，之后只读。

use crate::CalibrationError;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// 力矩使能状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TorqueMode {
    #[default]
    Disabled = 0,
    Enabled = 1,
}

impl TorqueMode {
    pub fn from_flag(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }

    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

/// 控制表寄存器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    ModelNumber,
    Id,
    BaudRate,
    DriveMode,
    OperatingMode,
    HomingOffset,
    MaxPositionLimit,
    MinPositionLimit,
    TorqueEnable,
    Led,
    ProfileAcceleration,
    ProfileVelocity,
    GoalCurrent,
    GoalVelocity,
    GoalPosition,
    Moving,
    PresentCurrent,
    PresentVelocity,
    PresentPosition,
    PresentTemperature,
}

impl Register {
    pub const ALL: [Register; 20] = [
        Register::ModelNumber,
        Register::Id,
        Register::BaudRate,
        Register::DriveMode,
        Register::OperatingMode,
        Register::HomingOffset,
        Register::MaxPositionLimit,
        Register::MinPositionLimit,
        Register::TorqueEnable,
        Register::Led,
        Register::ProfileAcceleration,
        Register::ProfileVelocity,
        Register::GoalCurrent,
        Register::GoalVelocity,
        Register::GoalPosition,
        Register::Moving,
        Register::PresentCurrent,
        Register::PresentVelocity,
        Register::PresentPosition,
        Register::PresentTemperature,
    ];

    /// 控制表中的名称（如 "Present_Position"）
    pub fn name(self) -> &'static str {
        match self {
            Register::ModelNumber => "Model_Number",
            Register::Id => "ID",
            Register::BaudRate => "Baud_Rate",
            Register::DriveMode => "Drive_Mode",
            Register::OperatingMode => "Operating_Mode",
            Register::HomingOffset => "Homing_Offset",
            Register::MaxPositionLimit => "Max_Position_Limit",
            Register::MinPositionLimit => "Min_Position_Limit",
            Register::TorqueEnable => "Torque_Enable",
            Register::Led => "LED",
            Register::ProfileAcceleration => "Profile_Acceleration",
            Register::ProfileVelocity => "Profile_Velocity",
            Register::GoalCurrent => "Goal_Current",
            Register::GoalVelocity => "Goal_Velocity",
            Register::GoalPosition => "Goal_Position",
            Register::Moving => "Moving",
            Register::PresentCurrent => "Present_Current",
            Register::PresentVelocity => "Present_Velocity",
            Register::PresentPosition => "Present_Position",
            Register::PresentTemperature => "Present_Temperature",
        }
    }

    /// 读写时需要经过标定变换的寄存器
    pub fn requires_calibration(self) -> bool {
        matches!(self, Register::GoalPosition | Register::PresentPosition)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Register {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Register::ALL
            .iter()
            .copied()
            .find(|r| r.name() == s)
            .ok_or_else(|| format!("unknown register '{}'", s))
    }
}

/// 寄存器地址与字节数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpec {
    pub address: u16,
    pub size: u8,
}

/// 控制表布局
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlTable {
    registers: HashMap<Register, RegisterSpec>,
}

impl ControlTable {
    pub fn new(entries: impl IntoIterator<Item = (Register, u16, u8)>) -> Self {
        Self {
            registers: entries
                .into_iter()
                .map(|(register, address, size)| (register, RegisterSpec { address, size }))
                .collect(),
        }
    }

    /// X 系列（Dynamixel XL/XM/XC）控制表
    pub fn x_series() -> Self {
        Self::new([
            (Register::ModelNumber, 0, 2),
            (Register::Id, 7, 1),
            (Register::BaudRate, 8, 1),
            (Register::DriveMode, 10, 1),
            (Register::OperatingMode, 11, 1),
            (Register::HomingOffset, 20, 4),
            (Register::MaxPositionLimit, 48, 4),
            (Register::MinPositionLimit, 52, 4),
            (Register::TorqueEnable, 64, 1),
            (Register::Led, 65, 1),
            (Register::GoalCurrent, 102, 2),
            (Register::GoalVelocity, 104, 4),
            (Register::ProfileAcceleration, 108, 4),
            (Register::ProfileVelocity, 112, 4),
            (Register::GoalPosition, 116, 4),
            (Register::Moving, 122, 1),
            (Register::PresentCurrent, 126, 2),
            (Register::PresentVelocity, 128, 4),
            (Register::PresentPosition, 132, 4),
            (Register::PresentTemperature, 146, 1),
        ])
    }

    pub fn get(&self, register: Register) -> Option<RegisterSpec> {
        self.registers.get(&register).copied()
    }

    pub fn contains(&self, register: Register) -> bool {
        self.registers.contains_key(&register)
    }
}

/// 单个型号参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    /// 一整圈的原始单位数
    pub resolution: u32,
    pub control_table: Arc<ControlTable>,
}

impl ModelSpec {
    pub fn new(resolution: u32, control_table: Arc<ControlTable>) -> Self {
        Self {
            resolution,
            control_table,
        }
    }
}

/// 型号表（型号名 → 参数）
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    models: HashMap<String, ModelSpec>,
}

impl ModelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dynamixel X 系列型号（分辨率均为 4096）
    pub fn dynamixel() -> Self {
        let table = Arc::new(ControlTable::x_series());
        let mut models = Self::new();
        for name in [
            "x_series",
            "xl330-m077",
            "xl330-m288",
            "xl430-w250",
            "xm430-w350",
            "xm540-w270",
            "xc430-w150",
        ] {
            models = models.with_model(name, ModelSpec::new(4096, table.clone()));
        }
        models
    }

    pub fn with_model(mut self, name: impl Into<String>, spec: ModelSpec) -> Self {
        self.models.insert(name.into(), spec);
        self
    }

    pub fn get(&self, model: &str) -> Result<&ModelSpec, CalibrationError> {
        self.models
            .get(model)
            .ok_or_else(|| CalibrationError::UnknownModel(model.to_string()))
    }

    pub fn resolution(&self, model: &str) -> Result<u32, CalibrationError> {
        self.get(model).map(|spec| spec.resolution)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_names_round_trip() {
        for register in Register::ALL {
            assert_eq!(register.name().parse::<Register>(), Ok(register));
        }
        assert!("Not_A_Register".parse::<Register>().is_err());
    }

    #[test]
    fn test_x_series_layout() {
        let table = ControlTable::x_series();
        assert_eq!(
            table.get(Register::PresentPosition),
            Some(RegisterSpec {
                address: 132,
                size: 4
            })
        );
        assert_eq!(table.get(Register::TorqueEnable).map(|s| s.address), Some(64));
    }

    #[test]
    fn test_dynamixel_models() {
        let models = ModelTable::dynamixel();
        assert_eq!(models.resolution("xl330-m288").unwrap(), 4096);
        assert!(matches!(
            models.resolution("unknown"),
            Err(CalibrationError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_requires_calibration() {
        assert!(Register::GoalPosition.requires_calibration());
        assert!(Register::PresentPosition.requires_calibration());
        assert!(!Register::TorqueEnable.requires_calibration());
    }

    #[test]
    fn test_torque_mode() {
        assert_eq!(TorqueMode::from_flag(true), TorqueMode::Enabled);
        assert!(!TorqueMode::default().is_enabled());
        assert_eq!(TorqueMode::Enabled as u8, 1);
    }
}
