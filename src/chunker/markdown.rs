//! Markdown heading pass — line scanner, no tree-sitter.
//!
//! Scans for ATX headings (fences tracked so `#` inside code blocks is
//! literal) and groups the remaining lines into top-level blocks. Each
//! block becomes one heading-chunk carrying the `>`-joined heading path;
//! a heading with no block beneath it is preserved as a title-only chunk.

use super::Chunk;

#[derive(Debug)]
enum Block {
    Heading {
        /// 1-6 as written.
        level: usize,
        title: String,
        line: i64,
    },
    Content {
        content: String,
        begin_line: i64,
        end_line: i64,
    },
    ThematicBreak {
        content: String,
        line: i64,
    },
}

fn heading_level(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim_end().to_string();
    Some((hashes, title))
}

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

fn is_thematic_break(line: &str) -> bool {
    let t = line.trim();
    if t.len() < 3 {
        return false;
    }
    for marker in ['-', '*', '_'] {
        if t.chars().all(|c| c == marker || c == ' ') && t.chars().filter(|&c| c == marker).count() >= 3 {
            return true;
        }
    }
    false
}

fn scan_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<(String, i64, i64)> = None; // (content, begin, end)
    let mut in_fence = false;

    let flush = |current: &mut Option<(String, i64, i64)>, blocks: &mut Vec<Block>| {
        if let Some((content, begin_line, end_line)) = current.take() {
            blocks.push(Block::Content {
                content,
                begin_line,
                end_line,
            });
        }
    };

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx as i64;

        if in_fence {
            if let Some((content, _, end)) = current.as_mut() {
                content.push_str(line);
                content.push('\n');
                *end = line_no;
            }
            if is_fence(line) {
                in_fence = false;
            }
            continue;
        }

        if is_fence(line) {
            in_fence = true;
            let (content, _, end) = current.get_or_insert_with(|| (String::new(), line_no, line_no));
            content.push_str(line);
            content.push('\n');
            *end = line_no;
            continue;
        }

        if line.trim().is_empty() {
            flush(&mut current, &mut blocks);
            continue;
        }

        if let Some((level, title)) = heading_level(line) {
            flush(&mut current, &mut blocks);
            blocks.push(Block::Heading {
                level,
                title,
                line: line_no,
            });
            continue;
        }

        if is_thematic_break(line) {
            flush(&mut current, &mut blocks);
            blocks.push(Block::ThematicBreak {
                content: line.trim().to_string(),
                line: line_no,
            });
            continue;
        }

        let (content, _, end) = current.get_or_insert_with(|| (String::new(), line_no, line_no));
        content.push_str(line);
        content.push('\n');
        *end = line_no;
    }
    flush(&mut current, &mut blocks);
    blocks
}

fn heading_path(stack: &[String]) -> String {
    stack
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(">")
}

/// Walk top-level blocks, maintaining a heading stack indexed by level
/// (skipped levels synthesized as empty), and emit one heading-chunk per
/// block plus title-only chunks for childless headings.
pub(crate) fn heading_chunks(text: &str) -> Vec<Chunk> {
    let blocks = scan_blocks(text);
    let mut chunks = Vec::new();
    let mut stack: Vec<String> = Vec::new();

    for (idx, block) in blocks.iter().enumerate() {
        match block {
            Block::Heading { level, title, line } => {
                let depth = level - 1;
                while stack.len() > depth {
                    stack.pop();
                }
                while stack.len() < depth {
                    stack.push(String::new());
                }
                stack.push(title.clone());

                // A heading directly followed by another heading, a break,
                // or nothing would otherwise vanish; keep the title itself.
                let has_body = matches!(blocks.get(idx + 1), Some(Block::Content { .. }));
                if !has_body {
                    chunks.push(Chunk {
                        content: title.clone(),
                        metadata: heading_path(&stack),
                        nested_level: stack.len(),
                        begin_line: *line,
                        end_line: *line,
                    });
                }
            }
            Block::Content {
                content,
                begin_line,
                end_line,
            } => {
                chunks.push(Chunk {
                    content: content.clone(),
                    metadata: heading_path(&stack),
                    nested_level: stack.len(),
                    begin_line: *begin_line,
                    end_line: *end_line,
                });
            }
            Block::ThematicBreak { content, line } => {
                chunks.push(Chunk {
                    content: content.clone(),
                    metadata: heading_path(&stack),
                    nested_level: stack.len(),
                    begin_line: *line,
                    end_line: *line,
                });
            }
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heading_path_nesting() {
        let text = "# Title\n\nintro text\n\n## Section\n\nbody here\n";
        let chunks = heading_chunks(text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "intro text\n");
        assert_eq!(chunks[0].metadata, "Title");
        assert_eq!(chunks[1].metadata, "Title>Section");
        assert_eq!(chunks[1].nested_level, 2);
    }

    #[test]
    fn test_childless_heading_kept_as_title_chunk() {
        let text = "# Alpha\n## Beta\n\ncontent\n";
        let chunks = heading_chunks(text);
        assert_eq!(chunks[0].content, "Alpha");
        assert_eq!(chunks[0].metadata, "Alpha");
        assert_eq!(chunks[1].metadata, "Alpha>Beta");
    }

    #[test]
    fn test_skipped_level_synthesized() {
        let text = "# Top\n\n### Deep\n\nbody\n";
        let chunks = heading_chunks(text);
        // Level 2 is empty; the path skips it.
        let body = chunks.iter().find(|c| c.content == "body\n").unwrap();
        assert_eq!(body.metadata, "Top>Deep");
        assert_eq!(body.nested_level, 3);
    }

    #[test]
    fn test_hash_inside_fence_is_not_heading() {
        let text = "# Real\n\n```\n# not a heading\ncode\n```\n";
        let chunks = heading_chunks(text);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("# not a heading"));
        assert_eq!(chunks[0].metadata, "Real");
    }

    #[test]
    fn test_headings_only_document() {
        let text = "# One\n\n## Two\n\n## Three\n";
        let chunks = heading_chunks(text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| !c.content.is_empty()));
    }

    #[test]
    fn test_line_numbers() {
        let text = "# Title\n\npara one\npara one b\n\npara two\n";
        let chunks = heading_chunks(text);
        assert_eq!(chunks[0].begin_line, 2);
        assert_eq!(chunks[0].end_line, 3);
        assert_eq!(chunks[1].begin_line, 5);
    }

    #[test]
    fn test_heading_after_thematic_break_title_kept() {
        let text = "# Lone\n\n---\n\ntext\n";
        let chunks = heading_chunks(text);
        assert_eq!(chunks[0].content, "Lone");
        assert_eq!(chunks[1].content, "---");
    }
}
