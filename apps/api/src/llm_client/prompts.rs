// Shared prompt fragments. Each service that needs LLM calls defines its own
// prompts.rs alongside it; this file holds the cross-cutting pieces.

/// System prompt fragment that enforces JSON-only output.
pub const JSON_ONLY_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Common instruction appended to every grounded prompt.
pub const GROUNDING_INSTRUCTION: &str = "\
    CRITICAL: Every claim you make must be traceable to a specific source chunk ID \
    provided in the context. Do NOT infer, interpolate, or invent details. \
    If the context does not support a claim, omit it entirely.";
