//! Request templates for backend-judged criteria.
//!
//! Domain logic for rendering scoring requests. Provider-agnostic.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::candidate::{CandidateItem, CandidateResult};
use crate::criteria::Scale;
use crate::gateway::Message;

/// Placeholders every template may use without declaring them.
pub const BUILTIN_PLACEHOLDERS: &[&str] = &[
    "criterion_id",
    "scale_min",
    "scale_max",
    "candidates",
    "guidance",
];

pub const DEFAULT_SYSTEM: &str = "You are a strict evaluator of ranked result lists. \
You grade the list on exactly one criterion, on the scale {scale_min} to {scale_max}.";

const OUTPUT_CONTRACT: &str = "Respond with a single JSON object and nothing else:\n\
{{\"score\": <number between {scale_min} and {scale_max}>, \
\"rationale\": \"<one or two sentences>\"}}";

/// Candidate items rendered into a request are capped to keep prompts bounded.
pub const MAX_RENDERED_ITEMS: usize = 50;

// =============================================================================
// Template
// =============================================================================

/// A validated request template with `{name}` placeholders.
///
/// `{{` and `}}` render as literal braces.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTemplate {
    pub system: String,
    pub user: String,
    placeholders: Vec<String>,
}

impl RequestTemplate {
    pub fn parse(system: Option<&str>, user: &str) -> Result<Self, String> {
        if user.trim().is_empty() {
            return Err("request template user text is empty".into());
        }
        let system = system.unwrap_or(DEFAULT_SYSTEM).to_string();
        let mut placeholders = scan_placeholders(&system)?;
        for name in scan_placeholders(user)? {
            if !placeholders.contains(&name) {
                placeholders.push(name);
            }
        }
        Ok(Self {
            system,
            user: user.to_string(),
            placeholders,
        })
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Placeholders that must be supplied through criterion parameters.
    pub fn declared_placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders
            .iter()
            .map(String::as_str)
            .filter(|p| !BUILTIN_PLACEHOLDERS.contains(p))
    }
}

fn scan_placeholders(text: &str) -> Result<Vec<String>, String> {
    let mut names = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                chars.next();
            }
            '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                chars.next();
            }
            '{' => {
                let rest = &text[idx + 1..];
                let end = rest
                    .find('}')
                    .ok_or_else(|| format!("unclosed placeholder at byte {idx}"))?;
                let name = &rest[..end];
                if !is_identifier(name) {
                    return Err(format!("invalid placeholder name '{{{name}}}'"));
                }
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
                for _ in 0..name.chars().count() + 1 {
                    chars.next();
                }
            }
            '}' => return Err(format!("unmatched '}}' at byte {idx}")),
            _ => {}
        }
    }
    Ok(names)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn substitute(text: &str, values: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let rest = &text[idx + 1..];
                match rest.find('}') {
                    Some(end) => {
                        let name = &rest[..end];
                        match values.get(name) {
                            Some(Value::String(s)) => out.push_str(s),
                            Some(other) => out.push_str(&other.to_string()),
                            None => {}
                        }
                        for _ in 0..name.chars().count() + 1 {
                            chars.next();
                        }
                    }
                    None => out.push('{'),
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// =============================================================================
// Rendered request
// =============================================================================

/// A rendered scoring request, identical for every sample of a criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeRequest {
    pub criterion_id: String,
    pub scale: Scale,
    pub system: String,
    pub user: String,
    /// Run this request belongs to, for usage attribution. Not part of the digest.
    pub run_id: Option<Uuid>,
}

impl JudgeRequest {
    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }

    /// Stable digest of the rendered request, for traces and reports.
    pub fn digest(&self) -> String {
        blake3::hash(format!("{}\n{}", self.system, self.user).as_bytes())
            .to_hex()
            .to_string()
    }
}

pub fn render_candidates(candidate: &CandidateResult) -> String {
    let items = candidate.top(Some(MAX_RENDERED_ITEMS));
    let mut blocks: Vec<String> = items
        .iter()
        .enumerate()
        .map(|(idx, item)| render_item(idx + 1, item))
        .collect();
    if candidate.items.len() > items.len() {
        blocks.push(format!(
            "<truncated remaining=\"{}\"/>",
            candidate.items.len() - items.len()
        ));
    }
    format!("<candidates>\n{}\n</candidates>", blocks.join("\n"))
}

fn render_item(rank: usize, item: &CandidateItem) -> String {
    let mut lines = Vec::new();
    if let Some(title) = &item.title {
        lines.push(format!("title: {}", escape_xml_chars(title)));
    }
    if let Some(score) = item.score {
        lines.push(format!("score: {score}"));
    }
    for (key, value) in &item.metadata {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        lines.push(format!(
            "{}: {}",
            escape_xml_chars(key),
            escape_xml_chars(&rendered)
        ));
    }
    format!(
        "<candidate rank=\"{rank}\" id=\"{}\">\n{}\n</candidate>",
        escape_xml_chars(&item.id),
        lines.join("\n")
    )
}

/// Render the request for one backend-judged criterion.
///
/// `params` are the criterion parameters after test-case overrides; their
/// values are escaped before interpolation.
pub fn render_request(
    criterion_id: &str,
    scale: Scale,
    template: &RequestTemplate,
    params: &Map<String, Value>,
    candidate: &CandidateResult,
    guidance: Option<&str>,
) -> JudgeRequest {
    let mut values: Map<String, Value> = params
        .iter()
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), Value::String(escape_xml_chars(&text)))
        })
        .collect();
    values.insert(
        "criterion_id".into(),
        Value::String(escape_xml_chars(criterion_id)),
    );
    values.insert("scale_min".into(), Value::String(format!("{}", scale.min)));
    values.insert("scale_max".into(), Value::String(format!("{}", scale.max)));
    values.insert(
        "candidates".into(),
        Value::String(render_candidates(candidate)),
    );
    let guidance_block = guidance
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(|g| format!("<guidance>\n{}\n</guidance>", escape_xml_chars(g)))
        .unwrap_or_default();
    values.insert("guidance".into(), Value::String(guidance_block.clone()));

    let system = substitute(&template.system, &values);
    let mut parts = vec![substitute(&template.user, &values).trim().to_string()];
    if !template.placeholders.iter().any(|p| p == "candidates") {
        parts.insert(0, render_candidates(candidate));
    }
    if !guidance_block.is_empty() && !template.placeholders.iter().any(|p| p == "guidance") {
        parts.push(guidance_block);
    }
    parts.push(substitute(OUTPUT_CONTRACT, &values));

    JudgeRequest {
        criterion_id: criterion_id.to_string(),
        scale,
        system: system.trim().to_string(),
        user: parts.join("\n\n"),
        run_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scale() -> Scale {
        Scale {
            min: 0.0,
            max: 10.0,
        }
    }

    #[test]
    fn parse_collects_placeholders_and_skips_escaped_braces() {
        let t = RequestTemplate::parse(
            None,
            "Rate {aspect} for {audience}. Literal {{not_a_param}}. {candidates}",
        )
        .unwrap();
        let declared: Vec<&str> = t.declared_placeholders().collect();
        assert_eq!(declared, vec!["aspect", "audience"]);
        assert!(t.placeholders().iter().any(|p| p == "scale_min"));
    }

    #[test]
    fn parse_rejects_malformed_templates() {
        assert!(RequestTemplate::parse(None, "Rate {aspect").is_err());
        assert!(RequestTemplate::parse(None, "Rate aspect}").is_err());
        assert!(RequestTemplate::parse(None, "Rate {two words}").is_err());
        assert!(RequestTemplate::parse(None, "   ").is_err());
    }

    #[test]
    fn render_substitutes_and_escapes() {
        let t =
            RequestTemplate::parse(Some("Judge {criterion_id}."), "Focus on {aspect}.").unwrap();
        let params = json!({"aspect": "<b>recency</b>"}).as_object().cloned().unwrap();
        let candidate = CandidateResult::new(vec![CandidateItem::new("doc-1").title("A & B")]);
        let req = render_request("recency", scale(), &t, &params, &candidate, Some("Be strict."));

        assert_eq!(req.system, "Judge recency.");
        assert!(req.user.contains("Focus on &lt;b&gt;recency&lt;/b&gt;."));
        assert!(req.user.contains("<candidate rank=\"1\" id=\"doc-1\">"));
        assert!(req.user.contains("title: A &amp; B"));
        assert!(req.user.contains("<guidance>\nBe strict.\n</guidance>"));
        assert!(req.user.contains("\"score\": <number between 0 and 10>"));
    }

    #[test]
    fn render_places_candidates_where_template_asks() {
        let t = RequestTemplate::parse(None, "List:\n{candidates}\nGrade it.").unwrap();
        let candidate = CandidateResult::new(vec![CandidateItem::new("x")]);
        let req = render_request("c", scale(), &t, &Map::new(), &candidate, None);
        assert_eq!(req.user.matches("<candidates>").count(), 1);
        assert!(req.user.starts_with("List:\n<candidates>"));
        assert!(!req.user.contains("<guidance>"));
    }

    #[test]
    fn digest_is_stable() {
        let t = RequestTemplate::parse(None, "Grade.").unwrap();
        let candidate = CandidateResult::default();
        let a = render_request("c", scale(), &t, &Map::new(), &candidate, None);
        let b = render_request("c", scale(), &t, &Map::new(), &candidate, None);
        assert_eq!(a.digest(), b.digest());
    }
}
