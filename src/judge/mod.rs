//! Backend-judged scoring: request rendering, backends, reply parsing.

pub mod backend;
pub mod client;
pub mod parse;
pub mod prompts;
pub mod simulated;

pub use backend::{GatewayBackend, ScoringBackend};
pub use client::{BackendClient, Sample, SampleFailure, SampleOutcome};
pub use parse::{parse_score_reply, ParseError, ParseStage, ParsedScore};
pub use prompts::{render_request, JudgeRequest, RequestTemplate};
pub use simulated::SimulatedBackend;
