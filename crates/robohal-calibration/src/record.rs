//! # 标定记录
//!
//! 每个电机一项、按电机下标对齐的扁平记录，是唯一需要持久化的数据。
//! 使用 JSON（自描述格式）保存，加载时校验各数组长度与 `motor_names` 一致。

use crate::CalibrationError;
use crate::engine::assert_drive_mode;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// 标定模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CalibrationMode {
    /// 旋转电机：原始单位 → 角度（度）
    #[default]
    Degree,
    /// 直线电机（如平行夹爪）：原始单位 → 行程百分比
    Linear,
}

/// 标定记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub homing_offset: Vec<i32>,
    pub drive_mode: Vec<i32>,
    /// 零位姿态下的原始位置
    pub start_pos: Vec<f64>,
    /// 旋转姿态下的原始位置
    pub end_pos: Vec<f64>,
    pub calib_mode: Vec<CalibrationMode>,
    pub motor_names: Vec<String>,
}

impl CalibrationRecord {
    /// 电机数量
    pub fn len(&self) -> usize {
        self.motor_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motor_names.is_empty()
    }

    /// 电机在记录中的下标
    pub fn index_of(&self, motor: &str) -> Result<usize, CalibrationError> {
        self.motor_names
            .iter()
            .position(|name| name == motor)
            .ok_or_else(|| CalibrationError::MissingMotor(motor.to_string()))
    }

    /// 校验记录内部一致性
    ///
    /// - 所有数组长度等于 `motor_names.len()`
    /// - `drive_mode` 只含 0/1
    /// - 电机名不重复
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let expected = self.motor_names.len();
        let lengths = [
            ("homing_offset", self.homing_offset.len()),
            ("drive_mode", self.drive_mode.len()),
            ("start_pos", self.start_pos.len()),
            ("end_pos", self.end_pos.len()),
            ("calib_mode", self.calib_mode.len()),
        ];
        for (field, len) in lengths {
            if len != expected {
                return Err(CalibrationError::RecordMismatch(format!(
                    "`{}` has {} entries, expected {} (one per motor)",
                    field, len, expected
                )));
            }
        }

        assert_drive_mode(&self.drive_mode)?;

        for (i, name) in self.motor_names.iter().enumerate() {
            if self.motor_names[..i].contains(name) {
                return Err(CalibrationError::RecordMismatch(format!(
                    "duplicate motor name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// 保存为 JSON 文件
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibrationError> {
        self.validate()?;

        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// 从 JSON 文件加载并校验
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let file = File::open(path.as_ref())?;
        let record: CalibrationRecord = serde_json::from_reader(BufReader::new(file))?;
        record.validate()?;
        Ok(record)
    }

    pub fn to_json(&self) -> Result<String, CalibrationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CalibrationError> {
        let record: CalibrationRecord = serde_json::from_str(json)?;
        record.validate()?;
        Ok(record)
    }
}
