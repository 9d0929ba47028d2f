use crate::openai::Usage;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder() -> Option<&'static CoreBPE> {
    ENCODER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(err) => {
                tracing::warn!("token encoder unavailable, usage will be zero: {err}");
                None
            }
        })
        .as_ref()
}

pub fn count_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    encoder()
        .map(|bpe| bpe.encode_with_special_tokens(text).len() as u32)
        .unwrap_or(0)
}

/// Approximate usage; backends do not report token counts.
pub fn estimate_usage(prompt: &str, completion: &str) -> Usage {
    let prompt_tokens = count_tokens(prompt);
    let completion_tokens = count_tokens(completion);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_costs_nothing() {
        assert_eq!(estimate_usage("", ""), Usage::default());
    }

    #[test]
    fn totals_add_up() {
        let usage = estimate_usage("user:hello there\n", "Hello");
        assert!(usage.prompt_tokens > 0);
        assert!(usage.completion_tokens > 0);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }
}
