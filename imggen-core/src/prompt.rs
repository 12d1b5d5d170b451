//! Prompt rewriting applied before a prompt reaches a pipeline.

const QUALITY_SUFFIX: &str =
    ", 8k high resolution, detailed, high quality, perfect lighting, professional photography";
const QUALITY_KEYWORDS: [&str; 4] = ["8k", "high resolution", "detailed", "high quality"];

const IMG2IMG_SUFFIX: &str = ", high detail, 8k resolution";
const IMG2IMG_KEYWORDS: [&str; 3] = ["high detail", "8k", "high quality"];

fn word_count(prompt: &str) -> usize {
    prompt.split_whitespace().count()
}

fn mentions_any(prompt: &str, keywords: &[&str]) -> bool {
    let lower = prompt.to_lowercase();
    keywords.iter().any(|k| lower.contains(k))
}

/// Appends quality keywords to short prompts that do not already carry them.
pub fn enrich_prompt(prompt: &str) -> String {
    if word_count(prompt) > 10 || mentions_any(prompt, &QUALITY_KEYWORDS) {
        return prompt.to_string();
    }
    format!("{prompt}{QUALITY_SUFFIX}")
}

pub fn enrich_img2img_prompt(prompt: &str) -> String {
    if word_count(prompt) > 8 || mentions_any(prompt, &IMG2IMG_KEYWORDS) {
        return prompt.to_string();
    }
    format!("{prompt}{IMG2IMG_SUFFIX}")
}

/// Adds a LoRA trigger phrase unless the prompt already contains it.
pub fn apply_lora_trigger(prompt: &str, trigger: &str) -> String {
    if trigger.is_empty() || prompt.to_lowercase().contains(&trigger.to_lowercase()) {
        return prompt.to_string();
    }
    format!("{prompt}, {trigger}")
}
