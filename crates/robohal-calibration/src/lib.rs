//! # robohal Calibration
//!
//! 电机标定：把原始执行器读数映射到统一的逻辑坐标系（零点、旋转方向、
//! 旋转电机 vs 直线电机）。
//!
//! - [`model`]: 电机型号表（每圈原始单位数、控制表布局）
//! - [`engine`]: 纯数值变换（drive mode 翻转、就近取整、正/逆标定）
//! - [`record`]: 标定记录（持久化）
//! - [`procedure`]: 交互式标定流程（状态机）
//! - [`prompt`]: 操作员确认接口

mod error;

pub mod engine;
pub mod model;
pub mod procedure;
pub mod prompt;
pub mod record;

pub use engine::{
    RawUnit, ResolutionLookup, apply_calibration, apply_calibration_autocorrect,
    apply_drive_mode, assert_drive_mode, autocorrect_calibration, degrees_to_steps,
    nearest_rotation, revert_calibration,
};
pub use error::CalibrationError;
pub use model::{ControlTable, ModelSpec, ModelTable, Register, RegisterSpec, TorqueMode};
pub use procedure::{
    CalibrationProcedure, CalibrationState, CalibrationStep, CalibrationTarget, run_arm_calibration,
};
pub use prompt::{OperatorPrompt, ScriptedPrompt, StdinPrompt};
pub use record::{CalibrationMode, CalibrationRecord};
