//! 分词：中英文混合，供计划库按查询相似度检索
//!
//! 含 CJK 字符时使用 jieba 搜索引擎模式分词；否则按非字母数字字符切分。
//! 单字符的非 CJK 词（数字、符号、单字母）不计入。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

fn keep(token: &str) -> bool {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => is_cjk(c),
        (Some(_), Some(_)) => token.chars().any(|c| c.is_alphanumeric()),
        _ => false,
    }
}

/// 智能分词：按文本内容选择策略，结果统一小写
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| keep(s))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|s| keep(s))
            .collect()
    }
}

pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard 相似度；任一集合为空时为 0
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_chinese_words() {
        let tokens = tokenize_to_set("对比指标");
        assert!(tokens.contains("对比"));
        assert!(tokens.contains("指标"));
    }

    #[test]
    fn test_tokenize_english_drops_symbols() {
        let tokens = tokenize("2+2 is what?");
        assert_eq!(tokens, vec!["is", "what"]);
    }

    #[test]
    fn test_tokenize_mixed() {
        let tokens = tokenize("对比 Rust 的指标");
        assert!(tokens.iter().any(|t| t == "rust"));
        assert!(tokens.iter().any(|t| t == "指标"));
    }

    #[test]
    fn test_jaccard_similarity() {
        let a = tokenize_to_set("对比两个指标");
        let b = tokenize_to_set("对比指标");
        assert!(jaccard_similarity(&a, &b) > 0.0);
        assert_eq!(jaccard_similarity(&a, &HashSet::new()), 0.0);
    }
}
