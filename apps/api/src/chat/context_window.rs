//! Context window assembly and citation for grounded answers.

use uuid::Uuid;

use crate::chat::completion::{ContextBlock, HistoryTurn};
use crate::models::chat::{ChatMessage, Citation, SenderRole};
use crate::models::chunk::ScoredChunk;

/// Every reply given without grounding contains this phrase.
pub const NOT_COVERED_MARKER: &str = "not covered in this profile";

pub fn not_covered_reply() -> String {
    format!(
        "That's {NOT_COVERED_MARKER}. Try asking about their experience, skills or education."
    )
}

pub const DEGRADED_REPLY: &str =
    "I couldn't find that in this profile right now. Please try again in a moment.";

/// Keeps the best-ranked chunks whose token counts fit `budget`, dropping the
/// lowest-scored first. `ranked` must already be in retrieval order. The top
/// chunk is always kept.
pub fn assemble(ranked: &[ScoredChunk], budget: u32) -> Vec<ScoredChunk> {
    let mut window: Vec<ScoredChunk> = ranked.to_vec();
    let mut total: u32 = window.iter().map(|r| r.chunk.token_count).sum();
    while total > budget && window.len() > 1 {
        if let Some(dropped) = window.pop() {
            total -= dropped.chunk.token_count;
        }
    }
    window
}

pub fn context_blocks(window: &[ScoredChunk]) -> Vec<ContextBlock> {
    window
        .iter()
        .map(|r| ContextBlock {
            chunk_id: r.chunk.id,
            section: r.chunk.section.clone(),
            text: r.chunk.text.clone(),
        })
        .collect()
}

/// The last `turns` visitor/assistant messages followed by `question`.
/// The model expects the conversation to open with a visitor turn, so
/// leading assistant turns are dropped.
pub fn history_window(messages: &[ChatMessage], turns: usize, question: &str) -> Vec<HistoryTurn> {
    let recent: Vec<&ChatMessage> = messages
        .iter()
        .filter(|m| m.role != SenderRole::System)
        .collect();
    let start = recent.len().saturating_sub(turns);

    let mut history: Vec<HistoryTurn> = recent[start..]
        .iter()
        .skip_while(|m| m.role == SenderRole::Assistant)
        .map(|m| HistoryTurn {
            role: m.role,
            text: m.text.clone(),
        })
        .collect();
    history.push(HistoryTurn {
        role: SenderRole::Visitor,
        text: question.to_string(),
    });
    history
}

/// Citations are the context chunks the model reports using; when it reports
/// none that were in context, every context chunk is cited. Confidence is
/// the mean similarity of the cited chunks.
pub fn cite(window: &[ScoredChunk], used_chunk_ids: &[Uuid]) -> (Vec<Citation>, Option<f32>) {
    let used: Vec<&ScoredChunk> = window
        .iter()
        .filter(|r| used_chunk_ids.contains(&r.chunk.id))
        .collect();
    let cited: Vec<&ScoredChunk> = if used.is_empty() {
        window.iter().collect()
    } else {
        used
    };
    if cited.is_empty() {
        return (Vec::new(), None);
    }

    let confidence = cited.iter().map(|r| r.similarity).sum::<f32>() / cited.len() as f32;
    let citations = cited
        .into_iter()
        .map(|r| Citation {
            chunk_id: r.chunk.id,
            section: r.chunk.section.clone(),
            similarity: r.similarity,
        })
        .collect();
    (citations, Some(confidence))
}
