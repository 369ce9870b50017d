//! Prompt composition: per-project system prompt, retrieved context with
//! stable citation identifiers, bounded conversation history, and the user
//! turn.
//!
//! The whole sequence stays under `prompt.token_budget` (chars/4 estimate).
//! Excess context is dropped lowest-scored first; when a single block must
//! shrink, it is cut at a sentence boundary with a Unicode ellipsis. The
//! builder preserves both the prompt language and the context language; it
//! never translates.

use crate::chunk::CHARS_PER_TOKEN;
use crate::config::PromptConfig;
use crate::llm::ChatMessage;
use crate::models::{Project, SearchHit, Turn};

/// Built prompt plus the retrieved hits that made it into the context, in
/// citation order (`sources[0]` is `[1]`).
#[derive(Debug)]
pub struct BuiltPrompt {
    pub messages: Vec<ChatMessage>,
    pub sources: Vec<SearchHit>,
}

/// Estimate the token cost of a string.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Compose the message sequence for the LLM cluster.
pub fn build_prompt(
    project: &Project,
    history: &[Turn],
    hits: &[SearchHit],
    user_message: &str,
    config: &PromptConfig,
) -> BuiltPrompt {
    let system = system_message(project, config);

    let mut history_turns: Vec<ChatMessage> = history
        .iter()
        .rev()
        .take(config.max_history_turns)
        .rev()
        .map(|t| ChatMessage {
            role: t.role.clone(),
            content: t.text.clone(),
        })
        .collect();

    // Budget for context = total - system - history - user turn - slack.
    // History is expendable before context is: drop oldest turns while the
    // fixed cost alone busts the budget.
    let fixed_cost = |turns: &[ChatMessage]| {
        estimate_tokens(&system)
            + turns
                .iter()
                .map(|m| estimate_tokens(&m.content))
                .sum::<usize>()
            + estimate_tokens(user_message)
            + 64
    };
    while fixed_cost(&history_turns) >= config.token_budget && !history_turns.is_empty() {
        history_turns.remove(0);
    }
    let context_budget = config.token_budget.saturating_sub(fixed_cost(&history_turns));

    let (context, sources) = context_message(hits, context_budget);

    let mut messages = Vec::with_capacity(3 + history_turns.len());
    messages.push(ChatMessage::system(system));
    if let Some(context) = context {
        messages.push(ChatMessage::system(context));
    }
    messages.extend(history_turns);
    messages.push(ChatMessage::user(user_message));

    BuiltPrompt { messages, sources }
}

fn system_message(project: &Project, config: &PromptConfig) -> String {
    let mut out = project
        .system_prompt
        .clone()
        .unwrap_or_default()
        .trim()
        .to_string();

    out.push_str(
        "\n\nGround every answer in the provided context excerpts. \
         Cite the excerpts you used with their bracketed numbers, like [1]. ",
    );
    out.push_str(&format!(
        "If the context does not contain the answer, reply exactly: {}",
        config.no_answer_sentinel
    ));

    if project.crm_webhook_url.is_some() || project.mail_webhook_url.is_some() {
        out.push_str(
            "\n\nWhen the user asks for a follow-up that requires contacting \
             staff, emit as the FIRST line of your reply a single-line JSON \
             object {\"action\": {\"kind\": \"crm_ticket\"|\"email\", \
             \"subject\": ..., \"body\": ...}} and then continue with your \
             answer on the next line. Emit no action line otherwise.",
        );
    }

    out
}

/// Render the context message. Hits must arrive sorted by descending
/// score; the lowest-scored are dropped first when over budget.
fn context_message(hits: &[SearchHit], budget_tokens: usize) -> (Option<String>, Vec<SearchHit>) {
    if hits.is_empty() || budget_tokens == 0 {
        return (None, Vec::new());
    }

    const HEADER: &str = "Context excerpts from the knowledge base:";
    let mut remaining = budget_tokens.saturating_sub(estimate_tokens(HEADER));
    let mut included: Vec<SearchHit> = Vec::new();
    let mut blocks: Vec<String> = Vec::new();

    for hit in hits {
        let citation = included.len() + 1;
        let mut label = format!("[{}]", citation);
        if let Some(ref title) = hit.title {
            label.push_str(&format!(" {}", title));
        }
        if let Some(ref url) = hit.source_url {
            label.push_str(&format!(" ({})", url));
        }
        let block = format!("{}\n{}", label, hit.excerpt);
        let cost = estimate_tokens(&block);

        if cost <= remaining {
            remaining -= cost;
            blocks.push(block);
            included.push(hit.clone());
        } else if included.is_empty() && remaining > 16 {
            // Even the best hit is too big: truncate it to fit.
            let text_budget_chars = remaining.saturating_sub(estimate_tokens(&label)) * CHARS_PER_TOKEN;
            let truncated = truncate_sentence(&hit.excerpt, text_budget_chars);
            blocks.push(format!("{}\n{}", label, truncated));
            included.push(hit.clone());
            break;
        } else {
            // Lower-scored hits cannot fit either once this one does not;
            // stop rather than skip around.
            break;
        }
    }

    if included.is_empty() {
        return (None, Vec::new());
    }

    let mut message = String::from(HEADER);
    for block in blocks {
        message.push_str("\n\n");
        message.push_str(&block);
    }
    (Some(message), included)
}

/// Truncate to at most `max_chars` characters, preferring a sentence
/// boundary, with a Unicode ellipsis appended.
pub fn truncate_sentence(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return "…".to_string();
    }

    let cut: String = text.chars().take(max_chars).collect();
    let sentence_end = cut
        .rfind(|c| matches!(c, '.' | '!' | '?'))
        .map(|pos| pos + 1);

    match sentence_end {
        // Keep the boundary only when it preserves most of the window.
        Some(pos) if pos * 2 >= cut.len() => format!("{}…", cut[..pos].trim_end()),
        _ => {
            let word_end = cut.rfind(' ').unwrap_or(cut.len());
            format!("{}…", cut[..word_end].trim_end())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> Project {
        Project {
            slug: "demo".into(),
            title: "Demo".into(),
            domain: None,
            llm_model: None,
            system_prompt: Some("Answer in English.".into()),
            enabled: true,
            emotions_enabled: false,
            voice_enabled: false,
            sources_enabled: true,
            captions_enabled: false,
            debug_enabled: false,
            crm_webhook_url: None,
            mail_webhook_url: None,
            bot_token: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn hit(n: usize, excerpt: &str, score: f64) -> SearchHit {
        SearchHit {
            chunk_id: format!("c{}", n),
            document_id: format!("d{}", n),
            source_url: Some(format!("https://example.test/{}", n)),
            title: Some(format!("Doc {}", n)),
            excerpt: excerpt.to_string(),
            score,
        }
    }

    fn config() -> PromptConfig {
        PromptConfig::default()
    }

    #[test]
    fn test_message_order_and_citations() {
        let hits = vec![hit(1, "Alpha text.", 0.9), hit(2, "Beta text.", 0.5)];
        let history = vec![
            Turn {
                role: "user".into(),
                text: "earlier question".into(),
                at: 0,
            },
            Turn {
                role: "assistant".into(),
                text: "earlier answer".into(),
                at: 1,
            },
        ];
        let built = build_prompt(&project(), &history, &hits, "What is alpha?", &config());

        assert_eq!(built.messages[0].role, "system");
        assert!(built.messages[0].content.contains("Answer in English."));
        assert!(built.messages[1].content.contains("[1] Doc 1"));
        assert!(built.messages[1].content.contains("[2] Doc 2"));
        assert_eq!(built.messages.last().unwrap().content, "What is alpha?");
        assert_eq!(built.sources.len(), 2);
        assert_eq!(built.sources[0].chunk_id, "c1");
    }

    #[test]
    fn test_sentinel_instruction_present() {
        let built = build_prompt(&project(), &[], &[], "anything", &config());
        assert!(built.messages[0]
            .content
            .contains("I don't have that in the knowledge base."));
    }

    #[test]
    fn test_action_instruction_only_with_integrations() {
        let plain = build_prompt(&project(), &[], &[], "q", &config());
        assert!(!plain.messages[0].content.contains("\"action\""));

        let mut p = project();
        p.crm_webhook_url = Some("https://crm.example.test/hook".into());
        let wired = build_prompt(&p, &[], &[], "q", &config());
        assert!(wired.messages[0].content.contains("\"action\""));
    }

    #[test]
    fn test_budget_drops_lowest_scored_first() {
        let big = "x".repeat(4000);
        let hits = vec![hit(1, &big, 0.9), hit(2, &big, 0.8), hit(3, &big, 0.7)];
        let mut cfg = config();
        cfg.token_budget = 1500;
        let built = build_prompt(&project(), &[], &hits, "q", &cfg);

        assert!(!built.sources.is_empty());
        assert!(built.sources.len() < 3, "budget must drop trailing hits");
        assert_eq!(built.sources[0].chunk_id, "c1", "best hit survives");

        let total: usize = built
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
        assert!(total <= cfg.token_budget);
    }

    #[test]
    fn test_history_bounded() {
        let history: Vec<Turn> = (0..50)
            .map(|i| Turn {
                role: "user".into(),
                text: format!("turn {}", i),
                at: i,
            })
            .collect();
        let built = build_prompt(&project(), &history, &[], "q", &config());
        // system + bounded history + user.
        assert!(built.messages.len() <= 2 + config().max_history_turns);
        // The most recent turns are the ones kept.
        assert!(built
            .messages
            .iter()
            .any(|m| m.content == "turn 49"));
        assert!(!built.messages.iter().any(|m| m.content == "turn 0"));
    }

    #[test]
    fn test_truncate_sentence_boundary() {
        let text = "First sentence. Second sentence is longer. Third one here.";
        let out = truncate_sentence(text, 40);
        assert!(out.ends_with('…'));
        assert!(out.starts_with("First sentence."));
        assert!(out.chars().count() <= 41);
    }

    #[test]
    fn test_truncate_unicode_safe() {
        let text = "Ω".repeat(100);
        let out = truncate_sentence(&text, 10);
        assert!(out.chars().count() <= 11);
        assert!(out.ends_with('…'));
    }
}
