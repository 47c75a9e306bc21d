//! Prompt construction.
//!
//! `construct` is pure and deterministic: identical inputs always produce an
//! identical string, which the golden tests rely on. Placeholders are
//! `[UPPER_SNAKE]` tokens; every occurrence of a context key is substituted,
//! and any placeholder left unresolved is stripped rather than leaked to the
//! provider.

pub const DEFAULT_MAX_PROMPT_CHARS: usize = 4_000;

pub fn construct(
    template: &str,
    asset_descriptions: &[String],
    context: &crate::model::PromptContext,
    max_chars: usize,
) -> String {
    let mut prompt = template.to_owned();

    for (key, value) in context {
        let placeholder = format!("[{}]", key.to_ascii_uppercase());
        prompt = prompt.replace(&placeholder, value);
    }

    prompt = strip_unresolved_placeholders(&prompt);

    let style_clause = build_style_clause(asset_descriptions);
    if !style_clause.is_empty() {
        if !prompt.is_empty() && !prompt.ends_with(char::is_whitespace) {
            prompt.push(' ');
        }
        prompt.push_str(&style_clause);
    }

    truncate_chars(prompt, max_chars)
}

/// Remove any remaining `[UPPER_SNAKE]` token. Brackets that do not form a
/// syntactically valid placeholder are kept verbatim.
fn strip_unresolved_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0usize;

    while let Some(rel) = input[cursor..].find('[') {
        let start = cursor + rel;
        out.push_str(&input[cursor..start]);

        let Some(rel_end) = input[start..].find(']') else {
            out.push_str(&input[start..]);
            return out;
        };
        let end = start + rel_end + 1;

        if is_placeholder_name(&input[start + 1..end - 1]) {
            cursor = end;
            continue;
        }

        out.push('[');
        cursor = start + 1;
    }

    out.push_str(&input[cursor..]);
    out
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn build_style_clause(asset_descriptions: &[String]) -> String {
    let parts = asset_descriptions
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .collect::<Vec<_>>();
    if parts.is_empty() {
        return String::new();
    }
    format!("Style reference: {}.", parts.join("; "))
}

fn truncate_chars(prompt: String, max_chars: usize) -> String {
    let char_count = prompt.chars().count();
    if char_count <= max_chars {
        return prompt;
    }

    tracing::warn!(
        chars = char_count,
        max_chars,
        "prompt exceeds maximum length; truncating"
    );
    prompt.chars().take(max_chars).collect()
}
