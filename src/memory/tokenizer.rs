//! 分词与相关度
//!
//! 工作记忆按主题检索摘要时使用：含 CJK 字符的文本交给 jieba 分词，纯英文按非字母数字切分。

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

/// 分词：小写化，丢弃单字符英文词与标点
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
            .filter(|s| s.chars().count() > 1 || s.chars().next().is_some_and(is_cjk))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .map(|s| s.to_lowercase())
            .filter(|s| s.len() > 1)
            .collect()
    }
}

pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 查询与文档的相关度：命中词按长度开方加权，再按查询总权重归一化到 0..=1
pub fn relevance(query: &HashSet<String>, doc: &HashSet<String>) -> f32 {
    if query.is_empty() || doc.is_empty() {
        return 0.0;
    }
    let weight = |t: &String| (t.chars().count() as f32).sqrt();
    let total: f32 = query.iter().map(weight).sum();
    let hit: f32 = query.intersection(doc).map(weight).sum();
    if total > 0.0 {
        hit / total
    } else {
        0.0
    }
}
