//! 从 Agent 回复中解析截止时间指令
//!
//! `[deadline: 30 min]` / `[follow up in 30 minutes]` 设置循环催促，`[task complete]` / `[done]` 清除；
//! 同时识别全角括号形式（`【截止时间：30分钟】`、`【任务完成】` 等）。完成标记优先。

use std::sync::OnceLock;

use regex::Regex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// 每 N 分钟催促一次（N = 0 等同于 Complete）
    FollowUp { minutes: u32 },
    Complete,
}

const DEADLINE_PATTERNS: [&str; 5] = [
    r"(?i)\[\s*deadline\s*[:：]\s*(\d+)\s*min(?:ute)?s?\s*\]",
    r"(?i)\[\s*follow[\s-]?up\s+in\s+(\d+)\s*min(?:ute)?s?\s*\]",
    r"【截止时间[：:]\s*(\d+)\s*分钟】",
    r"【任务截止[：:]\s*(\d+)\s*分钟后?】",
    r"【(\d+)\s*分钟后催促】",
];

const COMPLETE_PATTERNS: [&str; 3] = [
    r"(?i)\[\s*(?:task\s+complete|done)\s*\]",
    r"【任务完成】",
    r"【完成】",
];

fn compiled(cell: &'static OnceLock<Vec<Regex>>, patterns: &[&str]) -> &'static [Regex] {
    cell.get_or_init(|| patterns.iter().filter_map(|p| Regex::new(p).ok()).collect())
}

fn deadline_patterns() -> &'static [Regex] {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(&CELL, &DEADLINE_PATTERNS)
}

fn complete_patterns() -> &'static [Regex] {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(&CELL, &COMPLETE_PATTERNS)
}

pub fn parse_directive(text: &str) -> Option<Directive> {
    if complete_patterns().iter().any(|re| re.is_match(text)) {
        return Some(Directive::Complete);
    }
    deadline_patterns().iter().find_map(|re| {
        let minutes = re.captures(text)?.get(1)?.as_str().parse::<u32>().ok()?;
        Some(if minutes == 0 {
            Directive::Complete
        } else {
            Directive::FollowUp { minutes }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_follow_up_forms() {
        assert_eq!(
            parse_directive("Get the outline done. [deadline: 30 min]"),
            Some(Directive::FollowUp { minutes: 30 })
        );
        assert_eq!(
            parse_directive("[Follow up in 5 minutes]"),
            Some(Directive::FollowUp { minutes: 5 })
        );
        assert_eq!(
            parse_directive("快去写！【截止时间：45分钟】"),
            Some(Directive::FollowUp { minutes: 45 })
        );
        assert_eq!(
            parse_directive("【10分钟后催促】"),
            Some(Directive::FollowUp { minutes: 10 })
        );
    }

    #[test]
    fn test_completion_wins() {
        assert_eq!(
            parse_directive("[deadline: 30 min] ... actually [task complete]"),
            Some(Directive::Complete)
        );
        assert_eq!(parse_directive("【任务完成】"), Some(Directive::Complete));
        assert_eq!(parse_directive("[deadline: 0 min]"), Some(Directive::Complete));
    }

    #[test]
    fn test_plain_text_has_no_directive() {
        assert_eq!(parse_directive("deadline is 30 min from now"), None);
        assert_eq!(parse_directive(""), None);
    }
}
