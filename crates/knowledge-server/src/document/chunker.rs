use crate::config::ChunkingConfig;
use crate::document::parser::HeaderInfo;
use crate::utils::error::ApiError;

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// 0-based position within the document's chunk sequence.
    pub index: usize,
    pub content: String,
    /// 1-based body line range, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    /// Stack of headings (H1..Hn) in effect at the chunk's first line.
    pub header_path: Vec<String>,
}

#[derive(Debug, Clone)]
struct Paragraph {
    text: String,
    start_line: usize,
    end_line: usize,
}

impl Paragraph {
    fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Paragraph-aware chunker. The chunk sequence is a pure function of
/// (body, config): equal inputs yield byte-identical chunks.
pub struct TextChunker {
    chunk_size: usize,
    overlap: usize,
    respect_paragraphs: bool,
}

impl TextChunker {
    pub fn new(config: &ChunkingConfig) -> Result<Self, ApiError> {
        if config.size == 0 {
            return Err(ApiError::InvalidArgument(
                "chunk size must be positive".to_string(),
            ));
        }
        if config.overlap >= config.size {
            return Err(ApiError::InvalidArgument(format!(
                "overlap ({}) must be smaller than chunk size ({})",
                config.overlap, config.size
            )));
        }
        Ok(Self {
            chunk_size: config.size,
            overlap: config.overlap,
            respect_paragraphs: config.respect_paragraphs,
        })
    }

    pub fn chunk(&self, body: &str, headers: &[HeaderInfo]) -> Vec<Chunk> {
        let paragraphs = split_paragraphs(body);
        if paragraphs.is_empty() {
            return Vec::new();
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        // Seed paragraphs carried over from the previous chunk for overlap.
        let mut current: Vec<Paragraph> = Vec::new();
        let mut seeded = 0usize;

        for para in paragraphs {
            let para_len = para.char_len();

            if !current.is_empty()
                && joined_len(&current) + 2 + para_len > self.chunk_size
            {
                if current.len() > seeded {
                    chunks.push(self.emit(&current, chunks.len(), headers));
                }
                let mut seed = self.overlap_tail(&current);
                // Shrink the seed rather than producing a chunk that starts
                // over budget before the new paragraph is even added.
                while !seed.is_empty() && joined_len(&seed) + 2 + para_len > self.chunk_size {
                    seed.remove(0);
                }
                seeded = seed.len();
                current = seed;
            }

            current.push(para);

            // A single paragraph larger than the budget goes out whole;
            // splitting mid-sentence is worse than an oversized chunk.
            if current.len() == seeded + 1 && joined_len(&current) > self.chunk_size {
                chunks.push(self.emit(&current, chunks.len(), headers));
                let seed = self.overlap_tail(&current);
                seeded = seed.len();
                current = seed;
            }
        }

        if current.len() > seeded {
            chunks.push(self.emit(&current, chunks.len(), headers));
        }

        chunks
    }

    fn emit(&self, paras: &[Paragraph], index: usize, headers: &[HeaderInfo]) -> Chunk {
        let content = paras
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let start_line = paras.first().map(|p| p.start_line).unwrap_or(1);
        let end_line = paras.last().map(|p| p.end_line).unwrap_or(start_line);

        Chunk {
            index,
            content,
            start_line,
            end_line,
            header_path: header_path_at(headers, start_line),
        }
    }

    /// Tail of the chunk reused as the next chunk's seed. With paragraph
    /// boundaries respected the tail is rounded to the nearest boundary;
    /// otherwise it is rounded to line granularity.
    fn overlap_tail(&self, paras: &[Paragraph]) -> Vec<Paragraph> {
        if self.overlap == 0 || paras.is_empty() {
            return Vec::new();
        }

        if self.respect_paragraphs {
            let mut tail: Vec<Paragraph> = Vec::new();
            let mut total = 0usize;
            for para in paras.iter().rev() {
                let len = para.char_len();
                if tail.is_empty() || total + len <= self.overlap {
                    // Round to the nearest boundary: take the boundary
                    // paragraph only if it lands closer to the target.
                    let with = (total + len).abs_diff(self.overlap);
                    let without = total.abs_diff(self.overlap);
                    if tail.is_empty() && with > without {
                        break;
                    }
                    total += len;
                    tail.insert(0, para.clone());
                    if total >= self.overlap {
                        break;
                    }
                } else {
                    break;
                }
            }
            // Seeding everything would make no forward progress.
            if tail.len() == paras.len() {
                tail.remove(0);
            }
            tail
        } else {
            let mut lines: Vec<(usize, String)> = Vec::new();
            for para in paras {
                for (offset, line) in para.text.split('\n').enumerate() {
                    lines.push((para.start_line + offset, line.to_string()));
                }
            }
            let mut total = 0usize;
            let mut taken: Vec<(usize, String)> = Vec::new();
            for (line_no, line) in lines.into_iter().rev() {
                let len = line.chars().count();
                if !taken.is_empty() && total + len > self.overlap {
                    break;
                }
                total += len;
                taken.insert(0, (line_no, line));
                if total >= self.overlap {
                    break;
                }
            }
            match (taken.first(), taken.last()) {
                (Some(&(start, _)), Some(&(end, _))) => vec![Paragraph {
                    text: taken
                        .iter()
                        .map(|(_, l)| l.as_str())
                        .collect::<Vec<_>>()
                        .join("\n"),
                    start_line: start,
                    end_line: end,
                }],
                _ => Vec::new(),
            }
        }
    }
}

fn joined_len(paras: &[Paragraph]) -> usize {
    if paras.is_empty() {
        return 0;
    }
    let text: usize = paras.iter().map(Paragraph::char_len).sum();
    text + 2 * (paras.len() - 1)
}

/// Split on blank lines. Paragraph ranges are widened over the surrounding
/// blank lines so the union of chunk ranges covers every body line.
fn split_paragraphs(body: &str) -> Vec<Paragraph> {
    let lines: Vec<&str> = body.lines().collect();
    let total_lines = lines.len();

    let mut paragraphs: Vec<Paragraph> = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();
    let mut buffer_start = 0usize;

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            if !buffer.is_empty() {
                paragraphs.push(Paragraph {
                    text: buffer.join("\n"),
                    start_line: buffer_start + 1,
                    end_line: idx,
                });
                buffer.clear();
            }
        } else {
            if buffer.is_empty() {
                buffer_start = idx;
            }
            buffer.push(line);
        }
    }
    if !buffer.is_empty() {
        paragraphs.push(Paragraph {
            text: buffer.join("\n"),
            start_line: buffer_start + 1,
            end_line: total_lines,
        });
    }

    // Widen ranges over blank separator lines.
    let count = paragraphs.len();
    for i in 0..count {
        if i == 0 {
            paragraphs[0].start_line = 1;
        }
        if i + 1 < count {
            let next_start = paragraphs[i + 1].start_line;
            paragraphs[i].end_line = next_start - 1;
        } else {
            paragraphs[i].end_line = paragraphs[i].end_line.max(total_lines);
        }
    }

    paragraphs
}

/// Heading stack in effect at a body line: each level pops deeper or equal
/// levels before pushing.
fn header_path_at(headers: &[HeaderInfo], line: usize) -> Vec<String> {
    let mut stack: Vec<(usize, String)> = Vec::new();
    for header in headers {
        if header.line > line {
            break;
        }
        while stack
            .last()
            .map(|(level, _)| *level >= header.level)
            .unwrap_or(false)
        {
            stack.pop();
        }
        stack.push((header.level, header.text.clone()));
    }
    stack.into_iter().map(|(_, text)| text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(size: usize, overlap: usize, respect: bool) -> ChunkingConfig {
        ChunkingConfig {
            size,
            overlap,
            respect_paragraphs: respect,
        }
    }

    fn chunker(size: usize, overlap: usize) -> TextChunker {
        TextChunker::new(&config(size, overlap, true)).expect("valid config")
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        assert!(TextChunker::new(&config(100, 100, true)).is_err());
        assert!(TextChunker::new(&config(100, 150, true)).is_err());
        assert!(TextChunker::new(&config(0, 0, true)).is_err());
        assert!(TextChunker::new(&config(100, 0, true)).is_ok());
    }

    #[test]
    fn empty_input_yields_zero_chunks() {
        assert!(chunker(100, 20).chunk("", &[]).is_empty());
        assert!(chunker(100, 20).chunk("\n\n\n", &[]).is_empty());
    }

    #[test]
    fn short_body_is_one_chunk() {
        let body = "# Title\n\nA short paragraph.";
        let chunks = chunker(1000, 200).chunk(body, &[]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
        assert_eq!(chunks[0].content, "# Title\n\nA short paragraph.");
    }

    #[test]
    fn packs_paragraphs_greedily_and_overlaps() {
        let p1 = "a".repeat(40);
        let p2 = "b".repeat(40);
        let p3 = "c".repeat(40);
        let body = format!("{p1}\n\n{p2}\n\n{p3}");

        let chunks = chunker(100, 40).chunk(&body, &[]);
        assert_eq!(chunks.len(), 2);
        // First chunk packs p1+p2, second is seeded with p2 as overlap.
        assert_eq!(chunks[0].content, format!("{p1}\n\n{p2}"));
        assert_eq!(chunks[1].content, format!("{p2}\n\n{p3}"));
        assert_eq!(chunks[1].start_line, 3);
    }

    #[test]
    fn oversized_paragraph_is_one_chunk() {
        let huge = "x".repeat(500);
        let body = format!("small one\n\n{huge}\n\ntail text");
        let chunks = chunker(100, 20).chunk(&body, &[]);

        assert!(chunks.iter().any(|c| c.content.contains(&huge)));
        for chunk in &chunks {
            if chunk.content.contains(&huge) {
                // Emitted whole rather than split mid-sentence.
                assert!(chunk.content.chars().count() >= 500);
            }
        }
    }

    #[test]
    fn chunks_are_deterministic() {
        let body = (0..30)
            .map(|i| format!("paragraph number {i} with some filler text"))
            .collect::<Vec<_>>()
            .join("\n\n");
        let a = chunker(120, 30).chunk(&body, &[]);
        let b = chunker(120, 30).chunk(&body, &[]);
        assert_eq!(a, b);
        assert!(a.len() >= 2);
    }

    #[test]
    fn line_ranges_cover_body_and_indexes_are_unique() {
        let body = (0..20)
            .map(|i| format!("paragraph {i} lorem ipsum dolor sit amet"))
            .collect::<Vec<_>>()
            .join("\n\n");
        let total_lines = body.lines().count();
        let chunks = chunker(150, 40).chunk(&body, &[]);
        assert!(chunks.len() >= 2);

        let mut covered = vec![false; total_lines + 1];
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert!(chunk.start_line <= chunk.end_line);
            for line in chunk.start_line..=chunk.end_line {
                covered[line] = true;
            }
        }
        assert!(
            covered[1..].iter().all(|&c| c),
            "all body lines must be covered by some chunk"
        );
    }

    #[test]
    fn header_path_tracks_heading_stack() {
        let headers = vec![
            HeaderInfo {
                level: 1,
                text: "Guide".into(),
                line: 1,
            },
            HeaderInfo {
                level: 2,
                text: "Install".into(),
                line: 5,
            },
            HeaderInfo {
                level: 2,
                text: "Usage".into(),
                line: 9,
            },
        ];
        assert_eq!(header_path_at(&headers, 3), vec!["Guide"]);
        assert_eq!(header_path_at(&headers, 6), vec!["Guide", "Install"]);
        assert_eq!(header_path_at(&headers, 20), vec!["Guide", "Usage"]);
        assert!(header_path_at(&headers, 0).is_empty());
    }

    #[test]
    fn line_overlap_mode_rounds_to_lines() {
        let body = "first line aaaa\nsecond line bbbb\n\nnext paragraph cccc dddd eeee ffff";
        let chunker = TextChunker::new(&config(60, 16, false)).expect("valid");
        let chunks = chunker.chunk(body, &[]);
        assert!(chunks.len() >= 2);
        // The second chunk is seeded with trailing lines of the first.
        assert!(chunks[1].content.starts_with("second line bbbb"));
    }
}
