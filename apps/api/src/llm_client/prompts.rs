// Shared prompt fragments. Each service that calls the LLM keeps its own
// prompts.rs next to it; only cross-cutting pieces live here.

/// System prompt fragment that enforces JSON-only output.
pub const JSON_ONLY_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Keeps the model from inventing work nobody asked for.
pub const NO_INVENTION_INSTRUCTION: &str = "\
    Only report action items that a participant explicitly asked for or agreed to. \
    Do NOT infer tasks from general remarks, praise or questions that were already answered. \
    If nothing actionable was said, return an empty task list.";
