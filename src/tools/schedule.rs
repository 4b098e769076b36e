//! schedule_followup 工具：模型直接设置（或清除）下一次自主催促的时间

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::scheduler::Scheduler;
use crate::tools::Tool;

pub struct ScheduleFollowupTool {
    scheduler: Arc<Scheduler>,
}

impl ScheduleFollowupTool {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for ScheduleFollowupTool {
    fn name(&self) -> &str {
        "schedule_followup"
    }

    fn description(&self) -> &str {
        "Schedule a recurring follow-up check-in every N minutes. Use 0 to cancel once the task is complete."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "minutes": {
                    "type": "number",
                    "description": "Minutes until the next check-in (repeats at this interval); 0 clears the schedule"
                }
            },
            "required": ["minutes"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let minutes = args
            .get("minutes")
            .and_then(Value::as_f64)
            .ok_or_else(|| "missing numeric 'minutes'".to_string())?;
        if !minutes.is_finite() || minutes < 0.0 {
            return Err(format!("invalid minutes: {}", minutes));
        }
        let now = Utc::now();
        if minutes == 0.0 {
            self.scheduler.clear(now).await;
            return Ok("Follow-up schedule cleared.".to_string());
        }
        let state = self.scheduler.configure(Some(minutes), Some(minutes), now).await;
        match state.deadline {
            Some(deadline) => Ok(format!(
                "Next follow-up at {} (every {} minutes).",
                deadline, minutes
            )),
            None => Err(format!("could not schedule {} minutes", minutes)),
        }
    }
}
