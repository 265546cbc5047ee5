//! 操作员确认接口
//!
//! 标定流程的每一步都阻塞等待操作员把机械臂摆到参考姿态并确认。

use crate::CalibrationError;
use crate::procedure::CalibrationStep;
use parking_lot::Mutex;
use std::io::{BufRead, Write};

/// 操作员确认（阻塞直到操作员确认）
pub trait OperatorPrompt {
    fn confirm(&self, step: CalibrationStep, message: &str) -> Result<(), CalibrationError>;
}

/// 终端确认：打印提示，等待回车
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl OperatorPrompt for StdinPrompt {
    fn confirm(&self, _step: CalibrationStep, message: &str) -> Result<(), CalibrationError> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "\n{}", message)?;
        write!(stdout, "Press Enter to continue...")?;
        stdout.flush()?;

        let mut input = String::new();
        let read = std::io::stdin().lock().read_line(&mut input)?;
        if read == 0 {
            return Err(CalibrationError::Prompt("stdin closed".to_string()));
        }
        Ok(())
    }
}

type StepHook = Box<dyn Fn(CalibrationStep) -> Result<(), CalibrationError> + Send + Sync>;

/// 脚本化确认（测试与仿真使用）
///
/// 记录每一步的提示信息；可选的钩子在确认时执行，用于在仿真中"移动机械臂"。
#[derive(Default)]
pub struct ScriptedPrompt {
    messages: Mutex<Vec<(CalibrationStep, String)>>,
    hook: Option<StepHook>,
}

impl ScriptedPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(
        hook: impl Fn(CalibrationStep) -> Result<(), CalibrationError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            hook: Some(Box::new(hook)),
        }
    }

    /// 已确认的步骤（按顺序）
    pub fn steps(&self) -> Vec<CalibrationStep> {
        self.messages.lock().iter().map(|(step, _)| *step).collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().iter().map(|(_, msg)| msg.clone()).collect()
    }
}

impl OperatorPrompt for ScriptedPrompt {
    fn confirm(&self, step: CalibrationStep, message: &str) -> Result<(), CalibrationError> {
        self.messages.lock().push((step, message.to_string()));
        if let Some(hook) = &self.hook {
            hook(step)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ScriptedPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedPrompt")
            .field("steps", &self.steps())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_scripted_prompt_records_steps() {
        let prompt = ScriptedPrompt::new();
        prompt.confirm(CalibrationStep::ZeroPose, "zero").unwrap();
        prompt.confirm(CalibrationStep::RestPose, "rest").unwrap();

        assert_eq!(
            prompt.steps(),
            vec![CalibrationStep::ZeroPose, CalibrationStep::RestPose]
        );
        assert_eq!(prompt.messages(), vec!["zero".to_string(), "rest".to_string()]);
    }

    #[test]
    fn test_scripted_prompt_hook_runs_and_propagates_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let prompt = ScriptedPrompt::with_hook(move |step| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            if step == CalibrationStep::RestPose {
                return Err(CalibrationError::Prompt("operator aborted".to_string()));
            }
            Ok(())
        });

        assert!(prompt.confirm(CalibrationStep::ZeroPose, "zero").is_ok());
        assert!(matches!(
            prompt.confirm(CalibrationStep::RestPose, "rest"),
            Err(CalibrationError::Prompt(_))
        ));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
