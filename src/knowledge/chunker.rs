//! 文档分块
//!
//! 按字符计数（UTF-8 安全），在目标长度内优先于分隔符处断开；相邻块保留 overlap 个字符的重叠。

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// {doc_id}#{序号}
    pub id: String,
    pub text: String,
    pub source_id: String,
    /// 在原文中的字节偏移
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// 目标块大小（字符数）
    pub chunk_size: usize,
    /// 块之间的重叠（字符数）
    pub chunk_overlap: usize,
    /// 分隔符优先级（从高到低）
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            separators: ["\n\n", "\n", "。", ". ", "！", "？", "! ", "? ", " "]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn chunk(&self, doc_id: &str, text: &str) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let size = self.config.chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < total {
            let target_end = (start + size).min(total);
            let mut end = target_end;

            if target_end < total {
                let window: String = chars[start..target_end].iter().collect();
                for sep in &self.config.separators {
                    if let Some(pos) = window.rfind(sep.as_str()) {
                        let to_sep = window[..pos].chars().count() + sep.chars().count();
                        if to_sep > 0 {
                            end = start + to_sep;
                            break;
                        }
                    }
                }
            }
            if end <= start {
                end = (start + 1).min(total);
            }

            let piece: String = chars[start..end].iter().collect();
            let trimmed = piece.trim();
            if !trimmed.is_empty() {
                let offset = chars[..start].iter().map(|c| c.len_utf8()).sum();
                chunks.push(Chunk {
                    id: format!("{}#{}", doc_id, chunks.len()),
                    text: trimmed.to_string(),
                    source_id: doc_id.to_string(),
                    offset,
                });
            }

            if end == total {
                break;
            }
            let overlap = self.config.chunk_overlap.min(end - start);
            let next = end.saturating_sub(overlap);
            start = if next > start { next } else { end };
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(size: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkingConfig {
            chunk_size: size,
            chunk_overlap: overlap,
            ..ChunkingConfig::default()
        })
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunker(100, 10).chunk("doc", "Hello world.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "doc#0");
        assert_eq!(chunks[0].text, "Hello world.");
    }

    #[test]
    fn test_breaks_at_separator() {
        let text = "First paragraph here.\n\nSecond paragraph follows.";
        let chunks = chunker(30, 0).chunk("doc", text);
        assert_eq!(chunks[0].text, "First paragraph here.");
        assert_eq!(chunks.last().map(|c| c.text.as_str()), Some("Second paragraph follows."));
    }

    #[test]
    fn test_utf8_safe_with_overlap() {
        let text = "人工智能正在改变世界。机器学习是人工智能的一个分支。深度学习又是机器学习的一部分。";
        let chunks = chunker(12, 3).chunk("zh", text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 12);
            assert!(text.is_char_boundary(chunk.offset));
        }
    }

    #[test]
    fn test_no_duplicate_tail_chunk() {
        let chunks = chunker(10, 5).chunk("doc", "abcdefghij");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_empty_text() {
        assert!(Chunker::default().chunk("doc", "").is_empty());
    }
}
