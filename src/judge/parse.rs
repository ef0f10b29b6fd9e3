//! Backend reply parsing.
//!
//! Three decode attempts applied in order, first success wins:
//! 1. the whole reply as JSON,
//! 2. each fenced code block in the reply,
//! 3. the outermost balanced `{...}` span.
//!
//! Exhausting all three is a `ParseError`; there is no default score.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::criteria::Scale;

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("Invalid fenced block regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStage {
    Direct,
    FencedBlock,
    BracketScan,
}

impl ParseStage {
    pub const ORDER: [ParseStage; 3] = [
        ParseStage::Direct,
        ParseStage::FencedBlock,
        ParseStage::BracketScan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStage::Direct => "direct",
            ParseStage::FencedBlock => "fenced_block",
            ParseStage::BracketScan => "bracket_scan",
        }
    }
}

/// A successfully decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedScore {
    pub score: f64,
    pub rationale: String,
    pub stage: ParseStage,
}

/// Every stage failed; one message per stage, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub attempts: Vec<(ParseStage, String)>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unparseable reply")?;
        for (stage, reason) in &self.attempts {
            write!(f, "; {}: {}", stage.as_str(), reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Wire shape of a reply. Numeric strings are tolerated for `score`.
#[derive(Debug, Deserialize)]
struct ScoreReplyJson {
    #[serde(default)]
    score: Option<ScoreValue>,
    #[serde(default, alias = "reasoning")]
    rationale: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScoreValue {
    Number(f64),
    Text(String),
}

pub fn parse_score_reply(raw: &str, scale: Scale) -> Result<ParsedScore, ParseError> {
    let mut attempts = Vec::with_capacity(ParseStage::ORDER.len());
    for stage in ParseStage::ORDER {
        let attempt = match stage {
            ParseStage::Direct => decode(raw.trim(), scale),
            ParseStage::FencedBlock => decode_fenced(raw, scale),
            ParseStage::BracketScan => match outermost_object(raw) {
                Some(span) => decode(span, scale),
                None => Err("no balanced object found".to_string()),
            },
        };
        match attempt {
            Ok((score, rationale)) => {
                return Ok(ParsedScore {
                    score,
                    rationale,
                    stage,
                })
            }
            Err(reason) => attempts.push((stage, reason)),
        }
    }
    Err(ParseError { attempts })
}

fn decode(text: &str, scale: Scale) -> Result<(f64, String), String> {
    let parsed: ScoreReplyJson = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let score = match parsed.score.ok_or_else(|| "missing 'score'".to_string())? {
        ScoreValue::Number(n) => n,
        ScoreValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("non-numeric score: {s}"))?,
    };
    if !score.is_finite() {
        return Err("score is not finite".into());
    }
    if !scale.contains(score) {
        return Err(format!(
            "score {score} outside scale [{}, {}]",
            scale.min, scale.max
        ));
    }
    Ok((score, parsed.rationale.unwrap_or_default().trim().to_string()))
}

fn decode_fenced(raw: &str, scale: Scale) -> Result<(f64, String), String> {
    let mut last_error = None;
    for caps in FENCED_BLOCK.captures_iter(raw) {
        let body = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        match decode(body, scale) {
            Ok(ok) => return Ok(ok),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| "no fenced block found".to_string()))
}

/// Span from the first `{` to its matching `}`, skipping braces inside strings.
fn outermost_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in raw[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALE: Scale = Scale {
        min: 0.0,
        max: 10.0,
    };

    #[test]
    fn direct_json() {
        let parsed =
            parse_score_reply(r#"{"score": 7.5, "rationale": "solid coverage"}"#, SCALE).unwrap();
        assert_eq!(parsed.score, 7.5);
        assert_eq!(parsed.rationale, "solid coverage");
        assert_eq!(parsed.stage, ParseStage::Direct);
    }

    #[test]
    fn fenced_block_with_prose() {
        let raw = "Here is my grade:\n```json\n{\"score\": 6, \"reasoning\": \"ok\"}\n```\nThanks.";
        let parsed = parse_score_reply(raw, SCALE).unwrap();
        assert_eq!(parsed.score, 6.0);
        assert_eq!(parsed.rationale, "ok");
        assert_eq!(parsed.stage, ParseStage::FencedBlock);
    }

    #[test]
    fn fenced_block_skips_non_json_blocks() {
        let raw = "```\nnot json\n```\nthen\n```json\n{\"score\": \"4\"}\n```";
        let parsed = parse_score_reply(raw, SCALE).unwrap();
        assert_eq!(parsed.score, 4.0);
        assert_eq!(parsed.stage, ParseStage::FencedBlock);
    }

    #[test]
    fn bracket_scan_ignores_braces_inside_strings() {
        let raw = r#"My verdict: {"score": 3, "rationale": "uses {curly} words"} - end"#;
        let parsed = parse_score_reply(raw, SCALE).unwrap();
        assert_eq!(parsed.score, 3.0);
        assert_eq!(parsed.rationale, "uses {curly} words");
        assert_eq!(parsed.stage, ParseStage::BracketScan);
    }

    #[test]
    fn exhausting_all_stages_is_an_error() {
        let err = parse_score_reply("I think it is pretty good, maybe an 8.", SCALE).unwrap_err();
        assert_eq!(err.attempts.len(), 3);
        assert_eq!(err.attempts[0].0, ParseStage::Direct);
        assert_eq!(err.attempts[2].1, "no balanced object found");
    }

    #[test]
    fn out_of_scale_and_missing_scores_are_rejected() {
        assert!(parse_score_reply(r#"{"score": 11}"#, SCALE).is_err());
        assert!(parse_score_reply(r#"{"rationale": "no number"}"#, SCALE).is_err());
        assert!(parse_score_reply(r#"{"score": "high"}"#, SCALE).is_err());
    }

    #[test]
    fn unbalanced_object_fails_bracket_scan() {
        let err = parse_score_reply(r#"result: {"score": 5"#, SCALE).unwrap_err();
        assert_eq!(err.attempts[2].1, "no balanced object found");
    }
}
