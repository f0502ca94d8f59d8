//! 分词模块
//!
//! 中英文混合分词，用于知识检索的关键词相似度与回复依据校验。
//! 含 CJK 字符时使用 jieba（搜索引擎模式），否则按非字母数字字符切分。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // Extension A
        '\u{F900}'..='\u{FAFF}' |   // Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "could", "did", "do", "does",
    "for", "from", "had", "has", "have", "he", "her", "his", "how", "i", "if", "in", "is", "it",
    "its", "me", "my", "no", "not", "of", "on", "or", "our", "please", "she", "so", "than", "that", "the",
    "their", "them", "then", "there", "these", "they", "this", "to", "us", "was", "we", "were",
    "what", "when", "where", "which", "who", "why", "will", "with", "would", "you", "your",
    "的", "了", "是", "在", "我", "你", "他", "她", "它", "们", "和", "与", "吗", "呢", "吧", "啊",
    "把", "被", "也", "就", "都", "一个", "这", "那", "请", "什么", "怎么",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// 分词（小写，去掉空白与标点）
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .flat_map(split_non_alphanumeric)
            .filter(|s| s.chars().count() > 1 || s.chars().next().map(is_cjk).unwrap_or(false))
            .collect()
    } else {
        split_non_alphanumeric(text)
            .into_iter()
            .filter(|s| s.chars().count() > 1 || s.chars().all(|c| c.is_ascii_digit()))
            .collect()
    }
}

fn split_non_alphanumeric(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 内容词：去掉停用词与纯数字（数字由依据校验单独处理）
pub fn content_terms(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stopword(t) && !t.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

/// Jaccard 相似度
pub fn jaccard_similarity(set1: &HashSet<String>, set2: &HashSet<String>) -> f32 {
    if set1.is_empty() || set2.is_empty() {
        return 0.0;
    }
    let intersection = set1.intersection(set2).count() as f32;
    let union = set1.union(set2).count() as f32;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("我喜欢编程和人工智能");
        assert!(tokens.iter().any(|t| t.contains("编程") || t.contains("人工") || t.contains("智能")));
    }

    #[test]
    fn test_tokenize_english_strips_punctuation() {
        let tokens = tokenize("What's the weather, Jarvis?");
        assert!(tokens.contains(&"weather".to_string()));
        assert!(tokens.contains(&"jarvis".to_string()));
        assert!(!tokens.iter().any(|t| t.contains(',') || t.contains('?')));
    }

    #[test]
    fn test_tokenize_mixed() {
        let tokens = tokenize("我喜欢 Rust 编程语言");
        assert!(tokens.iter().any(|t| t == "rust"));
    }

    #[test]
    fn test_content_terms_drop_stopwords_and_numbers() {
        let terms = content_terms("The answer is 4 and the weather is sunny");
        assert!(terms.contains("answer"));
        assert!(terms.contains("sunny"));
        assert!(!terms.contains("the"));
        assert!(!terms.contains("4"));
    }

    #[test]
    fn test_jaccard_similarity() {
        let set1 = tokenize_to_set("Rust programming language");
        let set2 = tokenize_to_set("Rust language");
        let sim = jaccard_similarity(&set1, &set2);
        assert!((sim - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(jaccard_similarity(&HashSet::new(), &set2), 0.0);
    }
}
