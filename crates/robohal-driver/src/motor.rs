//! # 电机总线
//!
//! 关节状态通过订阅获得，命令通过发布下发。
//! 设置标定记录后，位置寄存器的读写自动经过标定变换：
//! - 读 `Present_Position`：原始单位 → 度/百分比（超出范围时自动整圈修正）
//! - 写 `Goal_Position`：度/百分比 → 原始单位（取整）

use crate::DeviceError;
use crate::config::MotorBusConfig;
use crate::session::{DeviceAdapter, DeviceSession, SessionConfig};
use parking_lot::RwLock;
use robohal_calibration::{
    CalibrationError, CalibrationRecord, CalibrationTarget, ModelSpec, ModelTable,
    OperatorPrompt, Register, TorqueMode, apply_calibration_autocorrect, revert_calibration,
    run_arm_calibration,
};
use robohal_transport::{
    JointStateMessage, Message, TorqueStateMessage, Transport, current_time_us,
};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, info, warn};

/// 单个电机（构造后不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Motor {
    pub name: String,
    pub id: u8,
    pub model: String,
}

/// 关节状态快照（电机名 → 数值）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JointSnapshot {
    pub stamp_us: u64,
    pub position: BTreeMap<String, f64>,
    pub velocity: BTreeMap<String, f64>,
    pub effort: BTreeMap<String, f64>,
}

impl JointSnapshot {
    fn from_message(message: &JointStateMessage) -> Result<Self, DeviceError> {
        if message.position.len() != message.name.len() {
            return Err(DeviceError::Decode(format!(
                "joint state has {} names but {} positions",
                message.name.len(),
                message.position.len()
            )));
        }

        // velocity/effort 可以为空；非空时必须与 name 对齐
        let optional = |field: &str, values: &[f64]| -> Result<BTreeMap<String, f64>, DeviceError> {
            if values.is_empty() {
                return Ok(BTreeMap::new());
            }
            if values.len() != message.name.len() {
                return Err(DeviceError::Decode(format!(
                    "joint state has {} names but {} {} values",
                    message.name.len(),
                    values.len(),
                    field
                )));
            }
            Ok(message.name.iter().cloned().zip(values.iter().copied()).collect())
        };

        Ok(Self {
            stamp_us: message.stamp_us,
            position: message
                .name
                .iter()
                .cloned()
                .zip(message.position.iter().copied())
                .collect(),
            velocity: optional("velocity", &message.velocity)?,
            effort: optional("effort", &message.effort)?,
        })
    }

    fn field(&self, register: Register) -> Option<&BTreeMap<String, f64>> {
        match register {
            Register::PresentPosition => Some(&self.position),
            Register::PresentVelocity => Some(&self.velocity),
            Register::PresentCurrent => Some(&self.effort),
            _ => None,
        }
    }
}

/// 电机总线适配器
#[derive(Debug)]
pub struct MotorBusAdapter {
    name: String,
    config: MotorBusConfig,
    motors: Vec<Motor>,
    specs: Vec<ModelSpec>,
    resolutions: BTreeMap<String, u32>,
    calibration: RwLock<Option<CalibrationRecord>>,
    torque: RwLock<Vec<TorqueMode>>,
}

impl MotorBusAdapter {
    pub fn new(
        name: impl Into<String>,
        config: MotorBusConfig,
        models: &ModelTable,
    ) -> Result<Self, DeviceError> {
        config.validate(models)?;

        let motors: Vec<Motor> = config
            .motors
            .iter()
            .map(|m| Motor {
                name: m.name.clone(),
                id: m.id,
                model: m.model.clone(),
            })
            .collect();
        let specs = motors
            .iter()
            .map(|m| models.get(&m.model).cloned())
            .collect::<Result<Vec<_>, CalibrationError>>()?;
        let resolutions = motors
            .iter()
            .zip(&specs)
            .map(|(m, spec)| (m.name.clone(), spec.resolution))
            .collect();
        let torque = RwLock::new(vec![TorqueMode::Disabled; motors.len()]);

        Ok(Self {
            name: name.into(),
            config,
            motors,
            specs,
            resolutions,
            calibration: RwLock::new(None),
            torque,
        })
    }

    pub fn config(&self) -> &MotorBusConfig {
        &self.config
    }

    pub fn motors(&self) -> &[Motor] {
        &self.motors
    }

    fn index_of(&self, name: &str) -> Result<usize, DeviceError> {
        self.motors
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| DeviceError::UnknownMotor(name.to_string()))
    }

    /// 电机名 → 总线下标；`None` 表示全部电机
    fn resolve(&self, names: Option<&[&str]>) -> Result<SmallVec<[usize; 8]>, DeviceError> {
        match names {
            None => Ok((0..self.motors.len()).collect()),
            Some(names) => names.iter().map(|name| self.index_of(name)).collect(),
        }
    }

    fn names_at(&self, indices: &[usize]) -> Vec<String> {
        indices.iter().map(|&i| self.motors[i].name.clone()).collect()
    }
}

impl DeviceAdapter for MotorBusAdapter {
    type Sample = JointSnapshot;

    fn describe(&self) -> String {
        format!("MotorsBus({}, {})", self.name, self.config.state_topic)
    }

    fn fps(&self) -> f64 {
        self.config.fps as f64
    }

    fn sample_topic(&self) -> &str {
        &self.config.state_topic
    }

    fn decode(&self, message: &Message) -> Result<JointSnapshot, DeviceError> {
        match message {
            Message::JointState(state) => JointSnapshot::from_message(state),
            other => Err(DeviceError::Decode(format!(
                "expected a joint state message, got {}",
                other.kind()
            ))),
        }
    }

    fn auxiliary_topics(&self) -> Vec<String> {
        self.config.torque_state_topic.iter().cloned().collect()
    }

    fn on_auxiliary(&self, _topic: &str, message: &Message) -> Result<(), DeviceError> {
        let Message::TorqueState(state) = message else {
            return Err(DeviceError::Decode(format!(
                "expected a torque state message, got {}",
                message.kind()
            )));
        };
        if state.enabled.len() != state.name.len() {
            return Err(DeviceError::Decode(format!(
                "torque state has {} names but {} flags",
                state.name.len(),
                state.enabled.len()
            )));
        }

        let mut torque = self.torque.write();
        for (name, &enabled) in state.name.iter().zip(&state.enabled) {
            if let Ok(idx) = self.index_of(name) {
                torque[idx] = TorqueMode::from_flag(enabled);
            }
        }
        Ok(())
    }

    fn on_disconnect(&self) {
        self.torque.write().fill(TorqueMode::Disabled);
    }
}

/// 电机总线会话
pub type MotorBus = DeviceSession<MotorBusAdapter>;

impl DeviceSession<MotorBusAdapter> {
    pub fn from_config(
        name: impl Into<String>,
        config: MotorBusConfig,
        models: &ModelTable,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DeviceError> {
        let session_config = SessionConfig {
            connect_policy: config.connect_policy,
            ..Default::default()
        };
        let adapter = MotorBusAdapter::new(name, config, models)?;
        Ok(Self::with_config(adapter, transport, session_config))
    }

    pub fn motor_names(&self) -> Vec<String> {
        self.adapter().motors.iter().map(|m| m.name.clone()).collect()
    }

    pub fn motor_models(&self) -> Vec<String> {
        self.adapter().motors.iter().map(|m| m.model.clone()).collect()
    }

    pub fn motor_indices(&self) -> Vec<u8> {
        self.adapter().motors.iter().map(|m| m.id).collect()
    }

    /// 设置标定记录（必须覆盖总线上的所有电机）
    pub fn set_calibration(&self, record: CalibrationRecord) -> Result<(), DeviceError> {
        record.validate()?;
        for motor in &self.adapter().motors {
            record.index_of(&motor.name)?;
        }
        *self.adapter().calibration.write() = Some(record);
        info!("{}: calibration set", self.name());
        Ok(())
    }

    pub fn calibration(&self) -> Option<CalibrationRecord> {
        self.adapter().calibration.read().clone()
    }

    pub fn clear_calibration(&self) {
        *self.adapter().calibration.write() = None;
    }

    /// 读取寄存器（仅支持状态消息中携带的量和力矩使能）
    ///
    /// 设置了标定记录时，`Present_Position` 返回标定后的值。
    pub fn read_register(
        &self,
        register: Register,
        motor_names: Option<&[&str]>,
    ) -> Result<Vec<f64>, DeviceError> {
        let start = Instant::now();
        let adapter = self.adapter();
        let indices = adapter.resolve(motor_names)?;
        let names = adapter.names_at(&indices);

        let values = if register == Register::TorqueEnable {
            self.ensure_connected()?;
            let torque = adapter.torque.read();
            indices.iter().map(|&i| torque[i] as u8 as f64).collect()
        } else {
            let snapshot = self.read()?;
            let field = snapshot.field(register).ok_or_else(|| DeviceError::UnsupportedRegister {
                register,
                target: self.name().to_string(),
            })?;
            let raw = names
                .iter()
                .map(|name| {
                    field.get(name).copied().ok_or_else(|| {
                        DeviceError::NoData(format!("{}: no {} for motor '{}'", self.name(), register, name))
                    })
                })
                .collect::<Result<Vec<f64>, DeviceError>>()?;

            match adapter.calibration.write().as_mut() {
                Some(record) if register.requires_calibration() => {
                    apply_calibration_autocorrect(record, &adapter.resolutions, &raw, &names)?
                },
                _ => raw,
            }
        };

        self.timing().set(
            format!("delta_timestamp_s_read_{}", register),
            start.elapsed().as_secs_f64(),
        );
        Ok(values)
    }

    /// 读取位置（有标定时为度/百分比）
    pub fn read_positions(&self, motor_names: Option<&[&str]>) -> Result<Vec<f64>, DeviceError> {
        self.read_register(Register::PresentPosition, motor_names)
    }

    /// 未经标定的原始位置
    pub fn read_raw_positions(&self, motor_names: Option<&[&str]>) -> Result<Vec<f64>, DeviceError> {
        let indices = self.adapter().resolve(motor_names)?;
        let snapshot = self.read()?;
        indices
            .iter()
            .map(|&i| {
                let name = &self.adapter().motors[i].name;
                snapshot.position.get(name).copied().ok_or_else(|| {
                    DeviceError::NoData(format!("{}: no position for motor '{}'", self.name(), name))
                })
            })
            .collect()
    }

    /// 写寄存器
    ///
    /// 单个数值会广播到所有目标电机。位置寄存器在有标定时先做逆变换。
    pub fn write(
        &self,
        register: Register,
        values: &[f64],
        motor_names: Option<&[&str]>,
    ) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        let start = Instant::now();
        let adapter = self.adapter();
        let indices = adapter.resolve(motor_names)?;
        let names = adapter.names_at(&indices);

        let values: Vec<f64> = match values.len() {
            1 => vec![values[0]; names.len()],
            n if n == names.len() => values.to_vec(),
            n => {
                return Err(DeviceError::LengthMismatch {
                    values: n,
                    motors: names.len(),
                });
            },
        };

        for &i in &indices {
            if !adapter.specs[i].control_table.contains(register) {
                return Err(DeviceError::UnsupportedRegister {
                    register,
                    target: format!("model '{}'", adapter.motors[i].model),
                });
            }
        }

        let values = match adapter.calibration.read().as_ref() {
            Some(record) if register.requires_calibration() => {
                revert_calibration(record, &adapter.resolutions, &values, &names)?
                    .into_iter()
                    .map(f64::from)
                    .collect()
            },
            _ => values,
        };

        let (topic, message) = match register {
            Register::GoalPosition | Register::GoalVelocity | Register::GoalCurrent => {
                let mut state = JointStateMessage {
                    stamp_us: current_time_us(),
                    name: names,
                    ..Default::default()
                };
                match register {
                    Register::GoalPosition => state.position = values,
                    Register::GoalVelocity => state.velocity = values,
                    _ => state.effort = values,
                }
                (adapter.config.command_topic.as_str(), Message::JointState(state))
            },
            Register::TorqueEnable => {
                let enabled: Vec<bool> = values.iter().map(|&v| v != 0.0).collect();
                let update_local = |enabled: &[bool]| {
                    let mut torque = adapter.torque.write();
                    for (&i, &flag) in indices.iter().zip(enabled) {
                        torque[i] = TorqueMode::from_flag(flag);
                    }
                };
                let Some(topic) = adapter.config.torque_command_topic.as_deref() else {
                    debug!("{}: no torque command topic, torque state updated locally", self.name());
                    update_local(&enabled);
                    self.record_write(register, start);
                    return Ok(());
                };
                // 发布失败时本地状态保持不变
                self.transport().publish(
                    topic,
                    Message::TorqueState(TorqueStateMessage {
                        stamp_us: current_time_us(),
                        name: names,
                        enabled: enabled.clone(),
                    }),
                )?;
                update_local(&enabled);
                self.record_write(register, start);
                return Ok(());
            },
            other => {
                return Err(DeviceError::UnsupportedRegister {
                    register: other,
                    target: self.name().to_string(),
                });
            },
        };

        self.transport().publish(topic, message)?;
        self.record_write(register, start);
        Ok(())
    }

    fn record_write(&self, register: Register, start: Instant) {
        self.session_metrics().writes.fetch_add(1, Ordering::Relaxed);
        self.timing().set(
            format!("delta_timestamp_s_write_{}", register),
            start.elapsed().as_secs_f64(),
        );
    }

    pub fn set_torque(&self, mode: TorqueMode, motor_names: Option<&[&str]>) -> Result<(), DeviceError> {
        self.write(Register::TorqueEnable, &[mode as u8 as f64], motor_names)
    }

    /// 所有电机的力矩使能状态
    pub fn read_torque(&self) -> Result<Vec<TorqueMode>, DeviceError> {
        self.ensure_connected()?;
        Ok(self.adapter().torque.read().clone())
    }

    /// 最新状态中是否包含所有已配置的电机
    pub fn are_motors_configured(&self) -> Result<bool, DeviceError> {
        let snapshot = self.read()?;
        Ok(self
            .adapter()
            .motors
            .iter()
            .all(|m| snapshot.position.contains_key(&m.name)))
    }

    /// 在最新状态中出现的电机 id（可按候选 id 过滤）
    pub fn find_motor_indices(&self, possible_ids: Option<&[u8]>) -> Result<Vec<u8>, DeviceError> {
        let snapshot = self.read()?;
        let candidates: Option<HashSet<u8>> = possible_ids.map(|ids| ids.iter().copied().collect());
        Ok(self
            .adapter()
            .motors
            .iter()
            .filter(|m| snapshot.position.contains_key(&m.name))
            .filter(|m| candidates.as_ref().is_none_or(|ids| ids.contains(&m.id)))
            .map(|m| m.id)
            .collect())
    }

    /// 运行交互式标定并把结果设置到总线上
    pub fn calibrate<P: OperatorPrompt + ?Sized>(
        &self,
        prompt: &P,
        arm_name: &str,
        arm_type: &str,
    ) -> Result<CalibrationRecord, DeviceError> {
        if self.calibration().is_some() {
            warn!("{}: replacing existing calibration", self.name());
        }
        let robot_type = self.adapter().config.robot_type.clone();
        let record = run_arm_calibration(self, prompt, &robot_type, arm_name, arm_type)?;
        self.set_calibration(record.clone())?;
        Ok(record)
    }
}

impl CalibrationTarget for DeviceSession<MotorBusAdapter> {
    fn motor_names(&self) -> Vec<String> {
        DeviceSession::<MotorBusAdapter>::motor_names(self)
    }

    fn motor_models(&self) -> Result<Vec<ModelSpec>, CalibrationError> {
        Ok(self.adapter().specs.clone())
    }

    fn read_torque(&self) -> Result<Vec<TorqueMode>, CalibrationError> {
        Ok(DeviceSession::<MotorBusAdapter>::read_torque(self)?)
    }

    fn read_raw_positions(&self) -> Result<Vec<f64>, CalibrationError> {
        Ok(DeviceSession::<MotorBusAdapter>::read_raw_positions(self, None)?)
    }
}
