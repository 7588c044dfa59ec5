//! 容错 JSON 提取
//!
//! LLM 回复常被解释性文字、```json 代码块或 <think> 段包裹；这里找出第一个可解析的 JSON 对象。
//! 解析失败时再尝试修复尾逗号。所有调用方按 Result 分支处理，不依赖 panic。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// 解析错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanParseError {
    #[error("response contains no JSON object")]
    NoJson,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("JSON value is not an object")]
    NotAnObject,

    #[error("plan JSON has no 'steps' array")]
    MissingSteps,
}

static FENCE_RE: OnceLock<Regex> = OnceLock::new();
static THINK_RE: OnceLock<Regex> = OnceLock::new();
static TRAILING_COMMA_RE: OnceLock<Regex> = OnceLock::new();

fn fence_re() -> &'static Regex {
    FENCE_RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").unwrap())
}

fn think_re() -> &'static Regex {
    THINK_RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").unwrap())
}

fn trailing_comma_re() -> &'static Regex {
    TRAILING_COMMA_RE.get_or_init(|| Regex::new(r",(\s*[}\]])").unwrap())
}

/// 从任意文本中提取第一个格式正确的 JSON 对象
pub fn extract_json_object(text: &str) -> Result<Value, PlanParseError> {
    let cleaned = think_re().replace_all(text, "");

    let mut candidates: Vec<&str> = fence_re()
        .captures_iter(&cleaned)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    candidates.push(&cleaned);

    let mut saw_brace = false;
    let mut last_error = None;
    for candidate in candidates {
        let scan = scan_objects(candidate);
        saw_brace |= scan.saw_brace;
        for (start, end) in scan.spans {
            match parse_object(&candidate[start..=end]) {
                Ok(value) => return Ok(value),
                Err(e) => last_error = Some(e),
            }
        }
        if scan.unclosed {
            last_error.get_or_insert_with(|| "unbalanced braces".to_string());
        }
    }

    if serde_json::from_str::<Value>(cleaned.trim()).is_ok() {
        return Err(PlanParseError::NotAnObject);
    }
    if saw_brace {
        Err(PlanParseError::InvalidJson(
            last_error.unwrap_or_else(|| "no parsable object".to_string()),
        ))
    } else {
        Err(PlanParseError::NoJson)
    }
}

fn parse_object(slice: &str) -> Result<Value, String> {
    let first = match serde_json::from_str::<Value>(slice) {
        Ok(v) if v.is_object() => return Ok(v),
        Ok(_) => return Err("not an object".to_string()),
        Err(e) => e.to_string(),
    };
    let repaired = trailing_comma_re().replace_all(slice, "$1");
    match serde_json::from_str::<Value>(&repaired) {
        Ok(v) if v.is_object() => Ok(v),
        _ => Err(first),
    }
}

/// 一次扫描得到的对象区间
struct ObjectScan {
    /// 最外层且已闭合的 `{...}` 区间（首尾字节下标，互不重叠，按出现顺序）
    spans: Vec<(usize, usize)>,
    /// 扫描结束时仍有未闭合的 '{'
    unclosed: bool,
    saw_brace: bool,
}

/// 单遍扫描括号配对：只在对象内部跟踪字符串与转义，字符串中的括号不计入
fn scan_objects(text: &str) -> ObjectScan {
    let mut open: Vec<usize> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut saw_brace = false;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if !open.is_empty() => in_string = true,
            '{' => {
                saw_brace = true;
                open.push(i);
            }
            '}' => {
                if let Some(start) = open.pop() {
                    // 外层闭合时丢弃其内部已记录的区间
                    while spans.last().is_some_and(|&(s, _)| s > start) {
                        spans.pop();
                    }
                    spans.push((start, i));
                }
            }
            _ => {}
        }
    }

    ObjectScan {
        spans,
        unclosed: !open.is_empty(),
        saw_brace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json() {
        let v = extract_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_wrapped_in_prose_and_fence() {
        let text = "Sure! Here is the plan:\n```json\n{\"goal\": \"x\", \"steps\": []}\n```\nLet me know.";
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["goal"], "x");
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"plan: {"args": {"expression": "{step_1_result} * 2"}, "note": "}"} trailing"#;
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["args"]["expression"], "{step_1_result} * 2");
    }

    #[test]
    fn test_trailing_comma_repaired() {
        let v = extract_json_object(r#"{"steps": [1, 2,], "x": 1,}"#).unwrap();
        assert_eq!(v["steps"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_think_block_skipped() {
        let text = "<think>maybe {not json}</think>{\"ok\": true}";
        assert_eq!(extract_json_object(text).unwrap()["ok"], true);
    }

    #[test]
    fn test_prose_only() {
        assert_eq!(
            extract_json_object("I cannot help with that."),
            Err(PlanParseError::NoJson)
        );
    }

    #[test]
    fn test_array_is_not_an_object() {
        assert_eq!(extract_json_object("[1, 2]"), Err(PlanParseError::NotAnObject));
    }

    #[test]
    fn test_prose_braces_before_object() {
        let text = r#"Keep {this} in mind. {"ok": 1}"#;
        assert_eq!(extract_json_object(text).unwrap()["ok"], 1);
    }

    #[test]
    fn test_long_unbalanced_input() {
        let text = "{".repeat(200_000);
        assert_eq!(
            extract_json_object(&text),
            Err(PlanParseError::InvalidJson("unbalanced braces".to_string()))
        );

        let text = format!("{}{}", "{\"a\": ".repeat(50_000), "1");
        assert!(matches!(extract_json_object(&text), Err(PlanParseError::InvalidJson(_))));
    }

    #[test]
    fn test_broken_json() {
        assert!(matches!(
            extract_json_object("{\"steps\": [ oops"),
            Err(PlanParseError::InvalidJson(_))
        ));
    }
}
