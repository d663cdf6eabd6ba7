use crate::extractor::TextUnit;
use crate::models::{Chunk, PipelineOptions, SourceLocator};
use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Whitespace-token approximation, good enough for sizing.
pub fn approx_token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[derive(Debug)]
struct SemanticUnit {
    text: String,
    locator: SourceLocator,
    tokens: usize,
    hard_split: bool,
}

fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut after_terminator = false;

    for ch in paragraph.chars() {
        if after_terminator && ch.is_whitespace() {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current.clear();
            after_terminator = false;
            continue;
        }
        after_terminator = matches!(ch, '.' | '!' | '?');
        current.push(ch);
    }
    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }
    sentences
}

/// Paragraphs first, sentences for long paragraphs, and a flagged hard cut
/// for a single sentence that still exceeds the target.
fn split_semantic_units(units: &[TextUnit], target: usize) -> Vec<SemanticUnit> {
    let mut out = Vec::new();

    for unit in units {
        for paragraph in unit.text.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }

            let pieces: Vec<String> = if approx_token_count(paragraph) <= target {
                vec![paragraph.to_string()]
            } else {
                split_sentences(paragraph)
            };

            for piece in pieces {
                let tokens = approx_token_count(&piece);
                if tokens <= target {
                    out.push(SemanticUnit {
                        text: piece,
                        locator: unit.locator.clone(),
                        tokens,
                        hard_split: false,
                    });
                } else {
                    let words: Vec<&str> = piece.split_whitespace().collect();
                    for slice in words.chunks(target) {
                        out.push(SemanticUnit {
                            text: slice.join(" "),
                            locator: unit.locator.clone(),
                            tokens: slice.len(),
                            hard_split: true,
                        });
                    }
                }
            }
        }
    }

    out
}

#[derive(Default)]
struct Draft {
    parts: Vec<String>,
    locators: Vec<SourceLocator>,
    tokens: usize,
    hard_split: bool,
    has_unit: bool,
}

impl Draft {
    fn push_locator(&mut self, locator: &SourceLocator) {
        if self.locators.last() != Some(locator) {
            self.locators.push(locator.clone());
        }
    }
}

fn make_chunk_id(tenant_id: &str, material_id: Uuid, sequence: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(material_id.as_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Empty input yields an empty output, never an error.
pub fn build_chunks(
    material_id: Uuid,
    tenant_id: &str,
    units: &[TextUnit],
    options: &PipelineOptions,
) -> Vec<Chunk> {
    let target = options.target_tokens.max(1);
    let overlap = options.overlap_tokens.min(target.saturating_sub(1));
    let semantic = split_semantic_units(units, target);

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut draft = Draft::default();

    let seal = |draft: &mut Draft, chunks: &mut Vec<Chunk>| {
        let text = draft.parts.join("\n\n");
        let sequence = chunks.len() as u64;
        chunks.push(Chunk {
            id: make_chunk_id(tenant_id, material_id, sequence, &text),
            material_id,
            tenant_id: tenant_id.to_string(),
            sequence_index: sequence,
            token_count: approx_token_count(&text),
            locators: std::mem::take(&mut draft.locators),
            hard_split: draft.hard_split,
            embedding_ref: None,
            created_at: Utc::now(),
            text,
        });
    };

    for unit in &semantic {
        if draft.has_unit && draft.tokens + unit.tokens > target {
            let sealed_text = draft.parts.join("\n\n");
            let sealed_locator = draft.locators.last().cloned();
            seal(&mut draft, &mut chunks);

            draft = Draft::default();
            // Re-seed with the tail of the sealed chunk, trimmed so the
            // triggering unit still fits under the target.
            let seed_budget = overlap.min(target.saturating_sub(unit.tokens));
            if seed_budget > 0 {
                let words: Vec<&str> = sealed_text.split_whitespace().collect();
                if words.len() > seed_budget {
                    let tail = words[words.len() - seed_budget..].join(" ");
                    draft.tokens = seed_budget;
                    draft.parts.push(tail);
                    if let Some(locator) = sealed_locator {
                        draft.push_locator(&locator);
                    }
                }
            }
        }

        draft.push_locator(&unit.locator);
        draft.parts.push(unit.text.clone());
        draft.tokens += unit.tokens;
        draft.hard_split |= unit.hard_split;
        draft.has_unit = true;
    }

    if draft.has_unit {
        seal(&mut draft, &mut chunks);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(number: u32, words: usize, prefix: &str) -> TextUnit {
        let text = (0..words)
            .map(|i| format!("{prefix}{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        TextUnit::new(text, SourceLocator::Page { number })
    }

    fn small_options(target: usize, overlap: usize) -> PipelineOptions {
        PipelineOptions {
            target_tokens: target,
            overlap_tokens: overlap,
            ..PipelineOptions::default()
        }
    }

    #[test]
    fn sequence_indices_are_contiguous_from_zero() {
        let units = vec![page(1, 80, "a"), page(2, 80, "b"), page(3, 80, "c")];
        let chunks = build_chunks(Uuid::new_v4(), "tenant-a", &units, &small_options(100, 10));
        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence_index, i as u64);
        }
    }

    #[test]
    fn chunks_respect_the_token_bound() {
        let units = vec![page(1, 80, "a"), page(2, 80, "b"), page(3, 80, "c")];
        let options = small_options(100, 10);
        for chunk in build_chunks(Uuid::new_v4(), "tenant-a", &units, &options) {
            assert!(chunk.token_count <= options.target_tokens);
        }
    }

    #[test]
    fn consecutive_chunks_share_the_overlap_tail() {
        let units = vec![page(1, 80, "a"), page(2, 80, "b")];
        let options = small_options(100, 10);
        let chunks = build_chunks(Uuid::new_v4(), "tenant-a", &units, &options);
        assert_eq!(chunks.len(), 2);

        let tail: Vec<&str> = chunks[0]
            .text
            .split_whitespace()
            .rev()
            .take(options.overlap_tokens)
            .collect();
        let head: Vec<&str> = chunks[1]
            .text
            .split_whitespace()
            .take(options.overlap_tokens)
            .collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        assert_eq!(tail, head);
    }

    #[test]
    fn overlap_never_exceeds_the_configured_bound() {
        let units = vec![page(1, 90, "a"), page(2, 90, "b"), page(3, 90, "c")];
        let options = small_options(100, 15);
        let chunks = build_chunks(Uuid::new_v4(), "tenant-a", &units, &options);
        for pair in chunks.windows(2) {
            let prev: Vec<&str> = pair[0].text.split_whitespace().collect();
            let next: Vec<&str> = pair[1].text.split_whitespace().collect();
            let mut shared = 0;
            for k in (1..=options.overlap_tokens.min(prev.len()).min(next.len())).rev() {
                if prev[prev.len() - k..] == next[..k] {
                    shared = k;
                    break;
                }
            }
            assert!(shared <= options.overlap_tokens);
        }
    }

    #[test]
    fn oversized_sentence_is_hard_split_and_flagged() {
        // 250 words, no sentence punctuation.
        let units = vec![page(1, 250, "w")];
        let chunks = build_chunks(Uuid::new_v4(), "tenant-a", &units, &small_options(100, 0));
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.token_count <= 100));
        assert!(chunks.iter().any(|c| c.hard_split));
    }

    #[test]
    fn long_paragraph_falls_back_to_sentence_boundaries() {
        let sentences = (0..20)
            .map(|i| format!("Sentence number {i} talks about the pump housing."))
            .collect::<Vec<_>>()
            .join(" ");
        let units = vec![TextUnit::new(sentences, SourceLocator::Page { number: 1 })];
        let chunks = build_chunks(Uuid::new_v4(), "tenant-a", &units, &small_options(30, 0));
        assert!(chunks.len() > 1);
        // Sentence splitting means no hard cuts were needed.
        assert!(chunks.iter().all(|c| !c.hard_split));
    }

    #[test]
    fn empty_document_yields_zero_chunks() {
        let chunks = build_chunks(
            Uuid::new_v4(),
            "tenant-a",
            &[],
            &PipelineOptions::default(),
        );
        assert!(chunks.is_empty());
    }

    #[test]
    fn chunk_ids_are_deterministic_and_distinct() {
        let material = Uuid::new_v4();
        let units = vec![page(1, 80, "a"), page(2, 80, "b")];
        let options = small_options(100, 10);
        let first = build_chunks(material, "tenant-a", &units, &options);
        let second = build_chunks(material, "tenant-a", &units, &options);
        assert_eq!(
            first.iter().map(|c| &c.id).collect::<Vec<_>>(),
            second.iter().map(|c| &c.id).collect::<Vec<_>>()
        );
        assert_ne!(first[0].id, first[1].id);
    }

    #[test]
    fn chunks_carry_the_locators_they_span() {
        let units = vec![page(1, 60, "a"), page(2, 60, "b")];
        let chunks = build_chunks(Uuid::new_v4(), "tenant-a", &units, &small_options(200, 0));
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].locators,
            vec![
                SourceLocator::Page { number: 1 },
                SourceLocator::Page { number: 2 }
            ]
        );
    }
}
