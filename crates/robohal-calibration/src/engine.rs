//! 标定引擎：纯数值变换
//!
//! 除了传入的 [`CalibrationRecord`] 之外没有任何共享状态。
//!
//! - DEGREE：`raw → (±raw + homing_offset) / (resolution / 2) * 180`
//! - LINEAR：`raw → (raw - start_pos) / (end_pos - start_pos) * 100`
//!
//! `revert_calibration` 是严格逆变换，并四舍五入到设备原生整数单位。
//! 取整使用 ties-to-even，与数值库的 `round` 行为一致。

use crate::record::{CalibrationMode, CalibrationRecord};
use crate::{CalibrationError, ModelSpec};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use tracing::warn;

/// 半圈对应的角度
pub const HALF_TURN_DEGREE: f64 = 180.0;
/// DEGREE 模式允许范围
pub const LOWER_BOUND_DEGREE: f64 = -270.0;
pub const UPPER_BOUND_DEGREE: f64 = 270.0;
/// LINEAR 模式允许范围（百分比）
pub const LOWER_BOUND_LINEAR: f64 = -10.0;
pub const UPPER_BOUND_LINEAR: f64 = 110.0;

/// 零位姿态的目标角度
pub const ZERO_POSITION_DEGREE: f64 = 0.0;
/// 旋转姿态的目标角度（标定参考旋转）
pub const ROTATED_POSITION_DEGREE: f64 = 90.0;

/// 原始单位数值类型（整数或浮点）
///
/// 让 [`nearest_rotation`] 和 [`apply_drive_mode`] 保持输入的数值类型。
pub trait RawUnit: Copy + PartialOrd + Debug {
    fn to_f64(self) -> f64;
    /// 整数类型四舍五入（ties-to-even），浮点类型原样保留
    fn from_f64(value: f64) -> Self;
    fn negate(self) -> Self;
}

macro_rules! impl_raw_unit_int {
    ($($t:ty),*) => {$(
        impl RawUnit for $t {
            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                value.round_ties_even() as $t
            }

            fn negate(self) -> Self {
                self.wrapping_neg()
            }
        }
    )*};
}

impl_raw_unit_int!(i32, i64);

impl RawUnit for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn negate(self) -> Self {
        -self
    }
}

impl RawUnit for f64 {
    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn negate(self) -> Self {
        -self
    }
}

/// 电机名 → 每圈原始单位数
pub trait ResolutionLookup {
    fn resolution(&self, motor: &str) -> Result<u32, CalibrationError>;
}

impl ResolutionLookup for HashMap<String, u32> {
    fn resolution(&self, motor: &str) -> Result<u32, CalibrationError> {
        self.get(motor)
            .copied()
            .ok_or_else(|| CalibrationError::MissingMotor(motor.to_string()))
    }
}

impl ResolutionLookup for BTreeMap<String, u32> {
    fn resolution(&self, motor: &str) -> Result<u32, CalibrationError> {
        self.get(motor)
            .copied()
            .ok_or_else(|| CalibrationError::MissingMotor(motor.to_string()))
    }
}

/// 检查 drive mode 只含 0/1
pub fn assert_drive_mode(drive_mode: &[i32]) -> Result<(), CalibrationError> {
    if drive_mode.iter().any(|&d| d != 0 && d != 1) {
        return Err(CalibrationError::InvalidDriveMode(drive_mode.to_vec()));
    }
    Ok(())
}

/// 按 drive mode 翻转符号：`sign = -(drive_mode * 2 - 1)`
///
/// drive_mode 0 → +1，drive_mode 1 → -1。自逆。
pub fn apply_drive_mode<T: RawUnit>(
    position: &[T],
    drive_mode: &[i32],
) -> Result<Vec<T>, CalibrationError> {
    assert_drive_mode(drive_mode)?;
    if position.len() != drive_mode.len() {
        return Err(CalibrationError::RecordMismatch(format!(
            "{} positions for {} drive modes",
            position.len(),
            drive_mode.len()
        )));
    }

    Ok(position
        .iter()
        .zip(drive_mode)
        .map(|(&p, &d)| {
            let sign = -(d * 2 - 1);
            if sign < 0 { p.negate() } else { p }
        })
        .collect())
}

/// 角度 → 原始单位（向零截断）
pub fn degrees_to_steps(degrees: f64, resolution: u32) -> i64 {
    (degrees / HALF_TURN_DEGREE * resolution as f64 / 2.0) as i64
}

/// 就近取整到标定旋转网格（参考旋转 90° 对应的原始单位）
///
/// 用于消除多圈累积误差后再计算偏移。保持输入的整数/浮点类型。
pub fn nearest_rotation<T: RawUnit>(position: T, model: &ModelSpec) -> T {
    let grid = degrees_to_steps(ROTATED_POSITION_DEGREE, model.resolution) as f64;
    if grid == 0.0 {
        return position;
    }
    T::from_f64((position.to_f64() / grid).round_ties_even() * grid)
}

fn check_lengths<S: AsRef<str>>(values: &[f64], motor_names: &[S]) -> Result<(), CalibrationError> {
    if values.len() != motor_names.len() {
        return Err(CalibrationError::RecordMismatch(format!(
            "{} values for {} motors",
            values.len(),
            motor_names.len()
        )));
    }
    Ok(())
}

fn out_of_range(motor: &str, value: f64, lower: f64, upper: f64) -> CalibrationError {
    CalibrationError::JointOutOfRange {
        motor: motor.to_string(),
        value,
        lower,
        upper,
    }
}

/// 原始单位 → 逻辑单位（度或百分比）
pub fn apply_calibration<S: AsRef<str>>(
    record: &CalibrationRecord,
    resolutions: &impl ResolutionLookup,
    values: &[f64],
    motor_names: &[S],
) -> Result<Vec<f64>, CalibrationError> {
    check_lengths(values, motor_names)?;

    let mut out = Vec::with_capacity(values.len());
    for (&raw, name) in values.iter().zip(motor_names) {
        let name = name.as_ref();
        let idx = record.index_of(name)?;

        let value = match record.calib_mode[idx] {
            CalibrationMode::Degree => {
                let half = (resolutions.resolution(name)? / 2) as f64;
                let mut v = if record.drive_mode[idx] == 1 { -raw } else { raw };
                v += record.homing_offset[idx] as f64;
                v = v / half * HALF_TURN_DEGREE;
                if !(LOWER_BOUND_DEGREE..=UPPER_BOUND_DEGREE).contains(&v) {
                    return Err(out_of_range(name, v, LOWER_BOUND_DEGREE, UPPER_BOUND_DEGREE));
                }
                v
            },
            CalibrationMode::Linear => {
                let (start, end) = (record.start_pos[idx], record.end_pos[idx]);
                if end == start {
                    return Err(CalibrationError::DegenerateLinearRange {
                        motor: name.to_string(),
                    });
                }
                let v = (raw - start) / (end - start) * 100.0;
                if !(LOWER_BOUND_LINEAR..=UPPER_BOUND_LINEAR).contains(&v) {
                    return Err(out_of_range(name, v, LOWER_BOUND_LINEAR, UPPER_BOUND_LINEAR));
                }
                v
            },
        };
        out.push(value);
    }
    Ok(out)
}

/// 逻辑单位 → 原始单位（[`apply_calibration`] 的逆变换，取整到设备整数单位）
pub fn revert_calibration<S: AsRef<str>>(
    record: &CalibrationRecord,
    resolutions: &impl ResolutionLookup,
    values: &[f64],
    motor_names: &[S],
) -> Result<Vec<i32>, CalibrationError> {
    check_lengths(values, motor_names)?;

    let mut out = Vec::with_capacity(values.len());
    for (&logical, name) in values.iter().zip(motor_names) {
        let name = name.as_ref();
        let idx = record.index_of(name)?;

        let raw = match record.calib_mode[idx] {
            CalibrationMode::Degree => {
                let half = (resolutions.resolution(name)? / 2) as f64;
                let mut v = logical / HALF_TURN_DEGREE * half;
                v -= record.homing_offset[idx] as f64;
                if record.drive_mode[idx] == 1 { -v } else { v }
            },
            CalibrationMode::Linear => {
                let (start, end) = (record.start_pos[idx], record.end_pos[idx]);
                logical / 100.0 * (end - start) + start
            },
        };
        out.push(i32::from_f64(raw));
    }
    Ok(out)
}

/// 选择把读数移回范围内的整圈数
///
/// `low..=high` 为可行区间（单位：圈），取区间内最小的整数。
fn pick_turn_shift(motor: &str, low: f64, high: f64) -> Result<i64, CalibrationError> {
    let (lo, hi) = if low < high { (low, high) } else { (high, low) };
    let factor = lo.ceil();
    if factor > hi {
        return Err(CalibrationError::NoTurnShift {
            motor: motor.to_string(),
            low,
            high,
        });
    }
    Ok(factor as i64)
}

/// 自动修正：当读数超出范围时，以整圈为单位平移偏移
///
/// 电机上电后读数可能偏离若干整圈（多圈模式、掉电重启），
/// 这里求出使读数回到标称范围的整圈数并写回记录：
/// - DEGREE：`homing_offset += resolution * factor`，目标范围 [-180, 180]
/// - LINEAR：`start_pos/end_pos -= resolution * factor`，目标范围 [start, end]
///
/// 只有所有电机都修正成功才写回。
pub fn autocorrect_calibration<S: AsRef<str>>(
    record: &mut CalibrationRecord,
    resolutions: &impl ResolutionLookup,
    values: &[f64],
    motor_names: &[S],
) -> Result<(), CalibrationError> {
    check_lengths(values, motor_names)?;

    let mut corrected = record.clone();
    for (&raw, name) in values.iter().zip(motor_names) {
        let name = name.as_ref();
        let idx = corrected.index_of(name)?;
        let resolution = resolutions.resolution(name)?;
        let res = resolution as f64;

        match corrected.calib_mode[idx] {
            CalibrationMode::Degree => {
                let half = (resolution / 2) as f64;
                let offset = corrected.homing_offset[idx] as f64;
                let v = if corrected.drive_mode[idx] == 1 { -raw } else { raw };

                let calib_val = (v + offset) / half * HALF_TURN_DEGREE;
                if calib_val > LOWER_BOUND_DEGREE && calib_val < UPPER_BOUND_DEGREE {
                    continue;
                }

                let low_factor = (-half - v - offset) / res;
                let upp_factor = (half - v - offset) / res;
                let factor = pick_turn_shift(name, low_factor, upp_factor)?;
                let shift = resolution as i64 * factor;

                warn!(
                    "Auto-correct calibration of motor '{}' by shifting value by {} full turns, \
                     from '{:.1} degrees' to within [-180, 180] degrees",
                    name, factor, calib_val
                );
                corrected.homing_offset[idx] = (corrected.homing_offset[idx] as i64 + shift) as i32;
            },
            CalibrationMode::Linear => {
                let (start, end) = (corrected.start_pos[idx], corrected.end_pos[idx]);
                if end == start {
                    return Err(CalibrationError::DegenerateLinearRange {
                        motor: name.to_string(),
                    });
                }

                let calib_val = (raw - start) / (end - start) * 100.0;
                if calib_val > LOWER_BOUND_LINEAR && calib_val < UPPER_BOUND_LINEAR {
                    continue;
                }

                let low_factor = (start - raw) / res;
                let upp_factor = (end - raw) / res;
                let factor = pick_turn_shift(name, low_factor, upp_factor)?;
                let shift = res * factor as f64;

                warn!(
                    "Auto-correct calibration of motor '{}' by shifting value by {} full turns, \
                     from '{:.1} %' to within [0, 100] %",
                    name, factor, calib_val
                );
                corrected.start_pos[idx] -= shift;
                corrected.end_pos[idx] -= shift;
            },
        }
    }
    *record = corrected;
    Ok(())
}

/// 先尝试 [`apply_calibration`]，超出范围时自动修正记录后重试一次
pub fn apply_calibration_autocorrect<S: AsRef<str>>(
    record: &mut CalibrationRecord,
    resolutions: &impl ResolutionLookup,
    values: &[f64],
    motor_names: &[S],
) -> Result<Vec<f64>, CalibrationError> {
    match apply_calibration(record, resolutions, values, motor_names) {
        Err(CalibrationError::JointOutOfRange { .. }) => {
            autocorrect_calibration(record, resolutions, values, motor_names)?;
            apply_calibration(record, resolutions, values, motor_names)
        },
        other => other,
    }
}
