use crate::llm_client::prompts::{JSON_ONLY_SYSTEM, NO_INVENTION_INSTRUCTION};
use crate::models::discussion::{DiscussionThread, ParsedDiscussion};

pub fn system_prompt() -> String {
    format!(
        "{JSON_ONLY_SYSTEM} You read team discussions from collaboration tools and \
         extract the follow-up work they ask for."
    )
}

/// Builds the analysis prompt for one discussion thread.
pub fn build_analysis_prompt(discussion: &ParsedDiscussion, thread: &DiscussionThread) -> String {
    let participants: Vec<&str> = thread.participants.iter().map(String::as_str).collect();
    format!(
        r#"Analyze this {source} discussion and return one JSON object.

TITLE: {title}
LINK: {url}
PARTICIPANTS: {participants}
MESSAGES ({count}, oldest first):
{transcript}

{rule}

Return exactly this shape:
{{
  "summary": {{
    "summary": "<two sentences at most>",
    "key_points": ["<point>"],
    "sentiment": "positive" | "neutral" | "negative",
    "confidence": <0.0 - 1.0>
  }},
  "tasks": [
    {{
      "title": "<imperative, under 80 characters>",
      "description": "<what needs doing and why>",
      "priority": "low" | "medium" | "high" | "urgent",
      "assignee": "<participant handle or null>",
      "tags": ["<tag>"]
    }}
  ]
}}"#,
        source = discussion.source_type,
        title = discussion.title,
        url = discussion.source_url,
        participants = participants.join(", "),
        count = thread.message_count(),
        transcript = thread.transcript(),
        rule = NO_INVENTION_INSTRUCTION,
    )
}
