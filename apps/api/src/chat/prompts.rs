use crate::chat::completion::ContextBlock;
use crate::llm_client::prompts::{GROUNDING_INSTRUCTION, JSON_ONLY_SYSTEM};

/// System prompt for the portal assistant: persona, grounding rules, the
/// retrieved context and the required JSON reply shape.
pub fn assistant_system_prompt(subject: &str, language: &str, context: &[ContextBlock]) -> String {
    let sources = context
        .iter()
        .map(|block| {
            format!(
                "<chunk id=\"{}\" section=\"{}\">\n{}\n</chunk>",
                block.chunk_id, block.section, block.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"{JSON_ONLY_SYSTEM}

You answer recruiter and visitor questions about {subject}'s professional profile.
Answer in the language with code "{language}". Keep answers under 120 words,
third person, factual and friendly.

{GROUNDING_INSTRUCTION}
Use ONLY the source chunks below. If they do not answer the question, say the
profile does not cover it.

SOURCE CHUNKS:
{sources}

Return JSON with exactly these fields:
{{
  "answer": "<your answer>",
  "used_chunk_ids": ["<id of every chunk you relied on>"]
}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_prompt_embeds_every_chunk_id() {
        let blocks = vec![
            ContextBlock {
                chunk_id: Uuid::new_v4(),
                section: "Skills".into(),
                text: "Python, Go".into(),
            },
            ContextBlock {
                chunk_id: Uuid::new_v4(),
                section: "Summary".into(),
                text: "Backend engineer".into(),
            },
        ];
        let prompt = assistant_system_prompt("Jane Doe", "en", &blocks);
        for block in &blocks {
            assert!(prompt.contains(&block.chunk_id.to_string()));
        }
        assert!(prompt.contains("used_chunk_ids"));
    }
}
