//! Local knowledge base used for retrieval-augmented suggestions.
//!
//! Articles are markdown files in a directory. They are flattened to plain
//! text, split into overlapping word windows and scored by keyword overlap
//! with the query.

use std::{collections::HashSet, path::Path};

use regex::Regex;
use sha2::{Digest, Sha256};

const CHUNK_WORDS: usize = 120;
const CHUNK_OVERLAP_WORDS: usize = 24;
const SNIPPET_CHARS: usize = 900;

#[derive(Debug, Clone)]
pub struct KnowledgeChunk {
    pub article: String,
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct Retrieved {
    pub block: String,
    pub sources_used: u32,
    pub contexts_used: u32,
}

#[derive(Debug, Default)]
pub struct KnowledgeBase {
    chunks: Vec<KnowledgeChunk>,
}

impl KnowledgeBase {
    pub fn empty() -> Self {
        Self::default()
    }

    pub async fn load_dir(dir: &Path) -> std::io::Result<Self> {
        let mut base = Self::default();
        let mut seen = HashSet::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("md") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let markdown = tokio::fs::read_to_string(&path).await?;
            let article = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("article")
                .to_string();
            base.add_article(&article, &markdown, &mut seen);
        }

        tracing::info!(
            dir = %dir.display(),
            chunks = base.chunks.len(),
            "knowledge base loaded"
        );
        Ok(base)
    }

    pub fn from_articles<'a>(articles: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut base = Self::default();
        let mut seen = HashSet::new();
        for (article, markdown) in articles {
            base.add_article(article, markdown, &mut seen);
        }
        base
    }

    fn add_article(&mut self, article: &str, markdown: &str, seen: &mut HashSet<String>) {
        let plain = markdown_to_plain_text(markdown);
        for (index, text) in chunk_text(&plain, CHUNK_WORDS, CHUNK_OVERLAP_WORDS)
            .into_iter()
            .enumerate()
        {
            // identical boilerplate shared between articles is indexed once
            if !seen.insert(chunk_digest(&text)) {
                continue;
            }
            self.chunks.push(KnowledgeChunk {
                article: article.to_string(),
                index,
                text,
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn retrieve(&self, query: &str, top_k: usize) -> Retrieved {
        let terms = query_terms(query);
        if terms.is_empty() || self.chunks.is_empty() {
            return Retrieved::default();
        }

        let mut scored = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let score = keyword_score(&terms, &chunk.text);
                (score > 0).then_some((score, chunk))
            })
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1.article.cmp(&b.1.article))
                .then_with(|| a.1.index.cmp(&b.1.index))
        });
        scored.truncate(top_k);

        if scored.is_empty() {
            return Retrieved::default();
        }

        let sources = scored
            .iter()
            .map(|(_, chunk)| chunk.article.as_str())
            .collect::<HashSet<_>>();
        let block = scored
            .iter()
            .enumerate()
            .map(|(idx, (score, chunk))| {
                let clipped = chunk.text.chars().take(SNIPPET_CHARS).collect::<String>();
                format!("[{}] {} (matches {})\n{}", idx + 1, chunk.article, score, clipped)
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        Retrieved {
            block,
            sources_used: sources.len() as u32,
            contexts_used: scored.len() as u32,
        }
    }
}

/// Rewrites applied in order; fenced code goes first so its contents never
/// reach the later rules.
const MARKDOWN_RULES: [(&str, &str); 4] = [
    (r"(?s)```.*?```", " "),
    (r"`([^`]+)`", "$1"),
    (r"\[([^\]]+)\]\([^)]+\)", "$1"),
    (r"(?m)^#{1,6}\s*|[*_>#]", ""),
];

fn markdown_to_plain_text(markdown: &str) -> String {
    let flattened = MARKDOWN_RULES
        .iter()
        .fold(markdown.to_string(), |text, (pattern, replacement)| {
            match Regex::new(pattern) {
                Ok(re) => re.replace_all(&text, *replacement).into_owned(),
                Err(error) => {
                    tracing::warn!(pattern, %error, "skipping markdown rule");
                    text
                }
            }
        });
    flattened.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Word windows of `window` words, each starting `window - overlap` words
/// after the previous one. The last window always reaches the final word.
fn chunk_text(text: &str, window: usize, overlap: usize) -> Vec<String> {
    let words = text.split_whitespace().collect::<Vec<_>>();
    let window = window.max(1);
    let stride = window.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    for start in (0..words.len()).step_by(stride) {
        let end = words.len().min(start + window);
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
    }
    chunks
}

fn chunk_digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn query_terms(query: &str) -> HashSet<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|term| term.chars().count() > 2)
        .collect()
}

fn keyword_score(terms: &HashSet<String>, text: &str) -> usize {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|word| terms.contains(word))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_is_flattened() {
        let plain = markdown_to_plain_text(
            "# Refunds\n\nSee [the policy](https://example.com) and run `refund`.\n```\ncode\n```",
        );
        assert_eq!(plain, "Refunds See the policy and run refund.");
    }

    #[test]
    fn chunks_overlap() {
        let text = (0..10).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let chunks = chunk_text(&text, 4, 1);
        assert_eq!(chunks, vec!["0 1 2 3", "3 4 5 6", "6 7 8 9"]);

        assert!(chunk_text("   ", 4, 1).is_empty());
        assert_eq!(chunk_text("a b", 4, 8), vec!["a b"]);
        assert_eq!(chunk_text("a b c", 1, 1), vec!["a", "b", "c"]);
    }

    #[test]
    fn retrieval_ranks_by_keyword_overlap() {
        let base = KnowledgeBase::from_articles([
            ("shipping", "Orders ship within two days. Shipping is free over $50."),
            ("refunds", "Refunds are issued within 5 days of receiving the returned order."),
            ("duplicate", "Refunds are issued within 5 days of receiving the returned order."),
        ]);
        assert_eq!(base.len(), 2);

        let retrieved = base.retrieve("How long do refunds take for my order?", 1);
        assert!(retrieved.block.contains("refunds"));
        assert_eq!(retrieved.contexts_used, 1);
        assert_eq!(retrieved.sources_used, 1);
    }

    #[test]
    fn unrelated_query_retrieves_nothing() {
        let base = KnowledgeBase::from_articles([("shipping", "Orders ship within two days.")]);
        let retrieved = base.retrieve("password reset", 3);
        assert!(retrieved.block.is_empty());
        assert_eq!(retrieved.contexts_used, 0);
    }
}
