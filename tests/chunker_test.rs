//! Chunker behavior against a real token oracle (the hash embedder).

mod common;

use std::sync::Arc;

use pocketrag::chunker::{Chunker, DocType, LengthFn};
use pocketrag::embedder::{EmbeddingModel, HashEmbedder};

fn token_oracle(model: Arc<HashEmbedder>) -> LengthFn {
    Arc::new(move |s: &str| model.count_tokens(s))
}

#[test]
fn test_markdown_chunks_respect_token_budget() {
    let model = Arc::new(HashEmbedder::new(32));
    let max_tokens = 24;
    let chunker = Chunker::new(DocType::Markdown, max_tokens, token_oracle(Arc::clone(&model)));

    let mut text = String::from("# Handbook\n\n");
    for section in 0..6 {
        text.push_str(&format!("## Section {}\n\n", section));
        for para in 0..4 {
            text.push_str(&format!(
                "Paragraph {} in section {} talks about indexing, retrieval and storage.\n\n",
                para, section
            ));
        }
    }

    let chunks = chunker.chunk(&text, &[]);
    assert!(chunks.len() > 3);
    for chunk in &chunks {
        // The split table bounds everything until the byte fallback, which
        // only engages for separator-free text.
        assert!(
            model.count_tokens(&chunk.content) <= max_tokens * 2,
            "chunk way over budget: {:?}",
            chunk.content
        );
        assert!(chunk.metadata.contains(" <Path> "));
    }

    // Section headings show up in metadata paths.
    assert!(chunks
        .iter()
        .any(|c| c.metadata.contains("Handbook>Section")));
}

#[test]
fn test_headings_without_body_survive() {
    let model = Arc::new(HashEmbedder::new(32));
    let chunker = Chunker::new(DocType::Markdown, 64, token_oracle(model));

    let chunks = chunker.chunk("# Roadmap\n\n## Planned\n\n## Shipped\n", &[]);
    assert!(!chunks.is_empty());
    let joined: String = chunks.iter().map(|c| c.content.as_str()).collect::<Vec<_>>().join("|");
    assert!(joined.contains("Planned"));
    assert!(joined.contains("Shipped"));
}

#[test]
fn test_cjk_paragraph_splits_on_utf8_boundaries() {
    let chunker = Chunker::new(DocType::PlainText, 48, Arc::new(|s: &str| s.len()));
    // Continuous CJK text with sentence separators.
    let text = "数据库负责存储每个文档的分块内容。向量表负责近似最近邻检索。全文索引负责关键词召回。三者在同一个事务边界内保持一致。".repeat(4);

    let chunks = chunker.chunk(&text, &[]);
    assert!(chunks.len() > 1);
    let mut reassembled = String::new();
    for chunk in &chunks {
        assert!(std::str::from_utf8(chunk.content.as_bytes()).is_ok());
        reassembled.push_str(&chunk.content);
    }
    assert_eq!(reassembled, text);
}

#[test]
fn test_line_ranges_cover_the_document() {
    let model = Arc::new(HashEmbedder::new(32));
    let chunker = Chunker::new(DocType::Markdown, 32, token_oracle(model));
    let text = "# A\n\nfirst paragraph with several words inside it\n\nsecond paragraph with several words inside it\n\nthird paragraph with several words inside it\n";

    let chunks = chunker.chunk(text, &[]);
    assert!(!chunks.is_empty());
    let last_line = text.lines().count() as i64 - 1;
    for chunk in &chunks {
        assert!(chunk.begin_line >= 0);
        assert!(chunk.end_line <= last_line);
        assert!(chunk.begin_line <= chunk.end_line);
    }
}
