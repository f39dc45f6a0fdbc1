//! Token 估算
//!
//! 历史存储只需要粗略的计数来做预算剪枝，因此用可替换的 trait 表达，默认按字符数 / 4。

/// Token 估算器
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// 按字符数 / ratio 估算；非空文本至少 1，空文本为 0
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        (chars / self.chars_per_token).max(1)
    }
}

/// 中英混排估算：ASCII 约 4 字符/token，其他字符约 1.5 字符/token
#[derive(Debug, Clone, Copy, Default)]
pub struct MixedScriptEstimator;

impl TokenEstimator for MixedScriptEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let (ascii, other) = text.chars().fold((0usize, 0usize), |(a, o), c| {
            if c.is_ascii() {
                (a + 1, o)
            } else {
                (a, o + 1)
            }
        });
        (ascii / 4 + (other as f64 / 1.5).ceil() as usize).max(1)
    }
}
