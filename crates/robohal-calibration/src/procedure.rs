//! # 交互式标定流程
//!
//! 状态机：`AwaitTorqueDisabled → AwaitZeroPose → AwaitRotatedPose → AwaitRestPose → Done`
//!
//! 每个姿态步骤先阻塞等待操作员确认，再读取一次原始位置。
//! 任何一步失败都不会产生标定记录（状态保持在失败前的位置）。
//!
//! ## 偏移的计算
//!
//! `homing_offset` 只由旋转姿态得出：
//!
//! ```text
//! drive_mode[i]    = rotated_pos[i] < zero_pos[i]
//! homing_offset[i] = rotated_target[i] - nearest_rotation(apply_drive_mode(rotated_pos)[i])
//! ```
//!
//! 零位姿态的读数只用作 drive mode 的参考和 `start_pos`。零位偏移只写入 debug 日志，
//! 不参与偏移计算。

use crate::engine::{
    ROTATED_POSITION_DEGREE, RawUnit, ZERO_POSITION_DEGREE, apply_drive_mode, degrees_to_steps,
    nearest_rotation,
};
use crate::model::{ModelSpec, TorqueMode};
use crate::prompt::OperatorPrompt;
use crate::record::{CalibrationMode, CalibrationRecord};
use crate::CalibrationError;
use std::fmt;
use tracing::{debug, info};

/// 参考姿态示意图地址模板
pub const REFERENCE_IMAGE_URL: &str =
    "https://raw.githubusercontent.com/huggingface/lerobot/main/media/{robot}/{arm}_{position}.webp";

/// 使用直线夹爪的机器人类型
pub const LINEAR_GRIPPER_ROBOTS: [&str; 2] = ["widowx", "aloha"];

/// 夹爪电机名称
pub const GRIPPER_MOTOR: &str = "gripper";

/// 需要操作员确认的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalibrationStep {
    ZeroPose,
    RotatedPose,
    RestPose,
}

impl CalibrationStep {
    /// 姿态名（用于示意图地址）
    pub fn position_name(self) -> &'static str {
        match self {
            CalibrationStep::ZeroPose => "zero",
            CalibrationStep::RotatedPose => "rotated",
            CalibrationStep::RestPose => "rest",
        }
    }
}

impl fmt::Display for CalibrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.position_name())
    }
}

/// 参考姿态示意图地址
pub fn reference_image_url(robot_type: &str, arm_type: &str, step: CalibrationStep) -> String {
    REFERENCE_IMAGE_URL
        .replace("{robot}", robot_type)
        .replace("{arm}", arm_type)
        .replace("{position}", step.position_name())
}

/// 被标定的设备（通常是电机总线会话）
pub trait CalibrationTarget {
    /// 电机名（按下标顺序）
    fn motor_names(&self) -> Vec<String>;

    /// 电机型号参数（与 `motor_names` 对齐）
    fn motor_models(&self) -> Result<Vec<ModelSpec>, CalibrationError>;

    /// 各电机的力矩使能状态
    fn read_torque(&self) -> Result<Vec<TorqueMode>, CalibrationError>;

    /// 未经标定的原始位置
    fn read_raw_positions(&self) -> Result<Vec<f64>, CalibrationError>;
}

impl<T: CalibrationTarget + ?Sized> CalibrationTarget for &T {
    fn motor_names(&self) -> Vec<String> {
        (**self).motor_names()
    }

    fn motor_models(&self) -> Result<Vec<ModelSpec>, CalibrationError> {
        (**self).motor_models()
    }

    fn read_torque(&self) -> Result<Vec<TorqueMode>, CalibrationError> {
        (**self).read_torque()
    }

    fn read_raw_positions(&self) -> Result<Vec<f64>, CalibrationError> {
        (**self).read_raw_positions()
    }
}

/// 标定状态
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationState {
    AwaitTorqueDisabled,
    AwaitZeroPose,
    AwaitRotatedPose {
        zero_pos: Vec<f64>,
    },
    AwaitRestPose {
        zero_pos: Vec<f64>,
        rotated_pos: Vec<f64>,
        drive_mode: Vec<i32>,
        homing_offset: Vec<i32>,
    },
    Done(CalibrationRecord),
}

impl CalibrationState {
    pub fn is_done(&self) -> bool {
        matches!(self, CalibrationState::Done(_))
    }
}

/// 标定流程
pub struct CalibrationProcedure<'a, T: ?Sized, P: ?Sized> {
    target: &'a T,
    prompt: &'a P,
    robot_type: String,
    arm_name: String,
    arm_type: String,
    state: CalibrationState,
}

impl<'a, T, P> CalibrationProcedure<'a, T, P>
where
    T: CalibrationTarget + ?Sized,
    P: OperatorPrompt + ?Sized,
{
    pub fn new(
        target: &'a T,
        prompt: &'a P,
        robot_type: impl Into<String>,
        arm_name: impl Into<String>,
        arm_type: impl Into<String>,
    ) -> Self {
        Self {
            target,
            prompt,
            robot_type: robot_type.into(),
            arm_name: arm_name.into(),
            arm_type: arm_type.into(),
            state: CalibrationState::AwaitTorqueDisabled,
        }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    /// 推进一步
    ///
    /// 失败时状态不变；`Done` 之后再调用是空操作。
    pub fn step(&mut self) -> Result<&CalibrationState, CalibrationError> {
        let next = match &self.state {
            CalibrationState::AwaitTorqueDisabled => {
                self.check_torque_disabled()?;
                info!(
                    "Running calibration of {} {} {}...",
                    self.robot_type, self.arm_name, self.arm_type
                );
                CalibrationState::AwaitZeroPose
            },
            CalibrationState::AwaitZeroPose => {
                self.confirm(CalibrationStep::ZeroPose)?;
                let zero_pos = self.read_positions()?;
                let zero_offset = self.homing_offset(&zero_pos, ZERO_POSITION_DEGREE)?;
                debug!(
                    "zero pose: {:?}, zero-pose offset {:?} (discarded)",
                    zero_pos, zero_offset
                );
                CalibrationState::AwaitRotatedPose { zero_pos }
            },
            CalibrationState::AwaitRotatedPose { zero_pos } => {
                self.confirm(CalibrationStep::RotatedPose)?;
                let rotated_pos = self.read_positions()?;
                debug!("rotated pose: {:?}", rotated_pos);

                let drive_mode: Vec<i32> = rotated_pos
                    .iter()
                    .zip(zero_pos)
                    .map(|(rotated, zero)| i32::from(rotated < zero))
                    .collect();
                let rotated_drived = apply_drive_mode(&rotated_pos, &drive_mode)?;
                let homing_offset = self.homing_offset(&rotated_drived, ROTATED_POSITION_DEGREE)?;

                CalibrationState::AwaitRestPose {
                    zero_pos: zero_pos.clone(),
                    rotated_pos,
                    drive_mode,
                    homing_offset,
                }
            },
            CalibrationState::AwaitRestPose {
                zero_pos,
                rotated_pos,
                drive_mode,
                homing_offset,
            } => {
                // 静止姿态只是确认点，不读数
                self.confirm(CalibrationStep::RestPose)?;

                let motor_names = self.target.motor_names();
                let calib_mode = calibration_modes(&self.robot_type, &motor_names);
                let record = CalibrationRecord {
                    homing_offset: homing_offset.clone(),
                    drive_mode: drive_mode.clone(),
                    start_pos: zero_pos.clone(),
                    end_pos: rotated_pos.clone(),
                    calib_mode,
                    motor_names,
                };
                record.validate()?;
                info!("Calibration of {} {} done", self.arm_name, self.arm_type);
                CalibrationState::Done(record)
            },
            CalibrationState::Done(_) => return Ok(&self.state),
        };

        self.state = next;
        Ok(&self.state)
    }

    /// 运行到结束，返回标定记录
    pub fn run(mut self) -> Result<CalibrationRecord, CalibrationError> {
        loop {
            self.step()?;
            if let CalibrationState::Done(record) = self.state {
                return Ok(record);
            }
        }
    }

    fn check_torque_disabled(&self) -> Result<(), CalibrationError> {
        let torque = self.target.read_torque()?;
        let names = self.target.motor_names();
        let enabled_motors: Vec<String> = names
            .into_iter()
            .zip(&torque)
            .filter(|(_, mode)| mode.is_enabled())
            .map(|(name, _)| name)
            .collect();

        if !enabled_motors.is_empty() {
            return Err(CalibrationError::Precondition { enabled_motors });
        }
        Ok(())
    }

    fn confirm(&self, step: CalibrationStep) -> Result<(), CalibrationError> {
        let action = match step {
            CalibrationStep::ZeroPose => "Move arm to zero position",
            CalibrationStep::RotatedPose => "Move arm to rotated target position",
            CalibrationStep::RestPose => "Move arm to rest position",
        };
        let message = format!(
            "{}\nSee: {}",
            action,
            reference_image_url(&self.robot_type, &self.arm_type, step)
        );
        info!("{}", action);
        self.prompt.confirm(step, &message)
    }

    fn read_positions(&self) -> Result<Vec<f64>, CalibrationError> {
        let positions = self.target.read_raw_positions()?;
        let expected = self.target.motor_names().len();
        if positions.len() != expected {
            return Err(CalibrationError::RecordMismatch(format!(
                "read {} positions for {} motors",
                positions.len(),
                expected
            )));
        }
        Ok(positions)
    }

    /// `target_degree` 对应的步数减去每个读数最近的整圈位置
    pub(crate) fn homing_offset(
        &self,
        positions: &[f64],
        target_degree: f64,
    ) -> Result<Vec<i32>, CalibrationError> {
        let models = self.target.motor_models()?;
        if models.len() != positions.len() {
            return Err(CalibrationError::RecordMismatch(format!(
                "{} motor models for {} positions",
                models.len(),
                positions.len()
            )));
        }

        Ok(positions
            .iter()
            .zip(&models)
            .map(|(&pos, model)| {
                let target = degrees_to_steps(target_degree, model.resolution) as f64;
                i32::from_f64(target - nearest_rotation(pos, model))
            })
            .collect())
    }
}

/// 每个电机的标定模式：直线夹爪机型的夹爪为 LINEAR，其余为 DEGREE
pub fn calibration_modes(robot_type: &str, motor_names: &[String]) -> Vec<CalibrationMode> {
    let linear_gripper = LINEAR_GRIPPER_ROBOTS.contains(&robot_type);
    motor_names
        .iter()
        .map(|name| {
            if linear_gripper && name == GRIPPER_MOTOR {
                CalibrationMode::Linear
            } else {
                CalibrationMode::Degree
            }
        })
        .collect()
}

/// 对一条机械臂运行完整标定流程
pub fn run_arm_calibration<T, P>(
    target: &T,
    prompt: &P,
    robot_type: &str,
    arm_name: &str,
    arm_type: &str,
) -> Result<CalibrationRecord, CalibrationError>
where
    T: CalibrationTarget + ?Sized,
    P: OperatorPrompt + ?Sized,
{
    CalibrationProcedure::new(target, prompt, robot_type, arm_name, arm_type).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ControlTable;
    use crate::prompt::ScriptedPrompt;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct SimArm {
        names: Vec<String>,
        resolution: u32,
        torque: Vec<TorqueMode>,
        positions: Arc<Mutex<Vec<f64>>>,
    }

    impl SimArm {
        fn new(names: &[&str], resolution: u32) -> Self {
            Self {
                names: names.iter().map(|n| n.to_string()).collect(),
                resolution,
                torque: vec![TorqueMode::Disabled; names.len()],
                positions: Arc::new(Mutex::new(vec![0.0; names.len()])),
            }
        }
    }

    impl CalibrationTarget for SimArm {
        fn motor_names(&self) -> Vec<String> {
            self.names.clone()
        }

        fn motor_models(&self) -> Result<Vec<ModelSpec>, CalibrationError> {
            let table = Arc::new(ControlTable::x_series());
            Ok(self
                .names
                .iter()
                .map(|_| ModelSpec::new(self.resolution, table.clone()))
                .collect())
        }

        fn read_torque(&self) -> Result<Vec<TorqueMode>, CalibrationError> {
            Ok(self.torque.clone())
        }

        fn read_raw_positions(&self) -> Result<Vec<f64>, CalibrationError> {
            Ok(self.positions.lock().clone())
        }
    }

    /// 确认时把机械臂"摆"到对应姿态
    fn posing_prompt(arm: &SimArm, zero: Vec<f64>, rotated: Vec<f64>) -> ScriptedPrompt {
        let positions = arm.positions.clone();
        ScriptedPrompt::with_hook(move |step| {
            match step {
                CalibrationStep::ZeroPose => *positions.lock() = zero.clone(),
                CalibrationStep::RotatedPose => *positions.lock() = rotated.clone(),
                CalibrationStep::RestPose => {},
            }
            Ok(())
        })
    }

    #[test]
    fn test_pipeline_offset_from_rotated_pose() {
        let arm = SimArm::new(&["shoulder", "elbow"], 1000);
        let prompt = posing_prompt(&arm, vec![100.0, 100.0], vec![50.0, 150.0]);

        let record = run_arm_calibration(&arm, &prompt, "koch", "main", "follower").unwrap();

        assert_eq!(record.drive_mode, vec![1, 0]);
        // 网格 250：[-50, 150] → [0, 250]，目标 250
        assert_eq!(record.homing_offset, vec![250, 0]);
        assert_eq!(record.start_pos, vec![100.0, 100.0]);
        assert_eq!(record.end_pos, vec![50.0, 150.0]);
        assert_eq!(record.calib_mode, vec![CalibrationMode::Degree; 2]);
        assert_eq!(
            prompt.steps(),
            vec![
                CalibrationStep::ZeroPose,
                CalibrationStep::RotatedPose,
                CalibrationStep::RestPose
            ]
        );
    }

    #[test]
    fn test_offset_independent_of_zero_pose_turns() {
        // 零位读数整圈漂移不影响偏移
        let arm = SimArm::new(&["shoulder", "elbow"], 1000);
        let prompt = posing_prompt(&arm, vec![100.0, 100.0], vec![50.0, 150.0]);
        let first = run_arm_calibration(&arm, &prompt, "koch", "main", "follower").unwrap();

        let prompt = posing_prompt(&arm, vec![90.0, -900.0], vec![50.0, 150.0]);
        let second = run_arm_calibration(&arm, &prompt, "koch", "main", "follower").unwrap();

        assert_eq!(first.homing_offset, second.homing_offset);
    }

    #[test]
    fn test_zero_pose_offset_is_diagnostic_only() {
        let arm = SimArm::new(&["shoulder", "elbow"], 1000);
        let prompt = posing_prompt(&arm, vec![260.0, 100.0], vec![50.0, 150.0]);
        let procedure = CalibrationProcedure::new(&arm, &prompt, "koch", "main", "follower");

        // 零位目标 0 步，最近整圈位置 [250, 0]
        assert_eq!(
            procedure.homing_offset(&[260.0, 100.0], ZERO_POSITION_DEGREE).unwrap(),
            vec![-250, 0]
        );

        let record = procedure.run().unwrap();
        assert_eq!(record.homing_offset, vec![250, 0]);
    }

    #[test]
    fn test_torque_enabled_is_fatal() {
        let mut arm = SimArm::new(&["shoulder", "elbow"], 4096);
        arm.torque[1] = TorqueMode::Enabled;
        let prompt = ScriptedPrompt::new();

        let mut procedure = CalibrationProcedure::new(&arm, &prompt, "koch", "main", "leader");
        let err = procedure.step().unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::Precondition { ref enabled_motors } if enabled_motors == &["elbow"]
        ));
        assert_eq!(procedure.state(), &CalibrationState::AwaitTorqueDisabled);
        // 没有任何姿态提示
        assert!(prompt.steps().is_empty());
    }

    #[test]
    fn test_step_by_step_states() {
        let arm = SimArm::new(&["waist", "gripper"], 4096);
        let prompt = posing_prompt(&arm, vec![2048.0, 2048.0], vec![3072.0, 1024.0]);
        let mut procedure = CalibrationProcedure::new(&arm, &prompt, "aloha", "left", "follower");

        assert_eq!(procedure.step().unwrap(), &CalibrationState::AwaitZeroPose);
        assert!(matches!(
            procedure.step().unwrap(),
            CalibrationState::AwaitRotatedPose { .. }
        ));
        assert!(matches!(
            procedure.step().unwrap(),
            CalibrationState::AwaitRestPose { .. }
        ));
        assert!(procedure.step().unwrap().is_done());
        // Done 之后不再提示
        assert!(procedure.step().unwrap().is_done());
        assert_eq!(prompt.steps().len(), 3);

        let CalibrationState::Done(record) = procedure.state() else {
            panic!("expected Done");
        };
        assert_eq!(
            record.calib_mode,
            vec![CalibrationMode::Degree, CalibrationMode::Linear]
        );
        assert_eq!(record.drive_mode, vec![0, 1]);
        // 3072 → 3072；-1024 → -1024；目标 1024
        assert_eq!(record.homing_offset, vec![-2048, 2048]);
    }

    #[test]
    fn test_prompt_abort_keeps_state() {
        let arm = SimArm::new(&["shoulder"], 4096);
        let prompt = ScriptedPrompt::with_hook(|step| match step {
            CalibrationStep::RotatedPose => Err(CalibrationError::Prompt("aborted".to_string())),
            _ => Ok(()),
        });
        let mut procedure = CalibrationProcedure::new(&arm, &prompt, "koch", "main", "leader");
        procedure.step().unwrap();
        procedure.step().unwrap();
        assert!(procedure.step().is_err());
        assert!(matches!(
            procedure.state(),
            CalibrationState::AwaitRotatedPose { .. }
        ));
    }

    #[test]
    fn test_reference_image_url() {
        assert_eq!(
            reference_image_url("aloha", "follower", CalibrationStep::RotatedPose),
            "https://raw.githubusercontent.com/huggingface/lerobot/main/media/aloha/follower_rotated.webp"
        );
    }

    #[test]
    fn test_calibration_modes() {
        let names = vec!["waist".to_string(), "gripper".to_string()];
        assert_eq!(
            calibration_modes("widowx", &names),
            vec![CalibrationMode::Degree, CalibrationMode::Linear]
        );
        assert_eq!(
            calibration_modes("koch", &names),
            vec![CalibrationMode::Degree; 2]
        );
    }
}
