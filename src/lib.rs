#![forbid(unsafe_code)]

//! # consensus-harness
//!
//! Scores a ranked result list against declarative test cases using a panel
//! of independent scoring backends.
//!
//! Each criterion is either computed directly from the list (deterministic)
//! or judged by every enabled backend several times. Judgements are reduced
//! in two stages: first within each backend (mean and spread of its valid
//! samples), then across backends. The cross-backend spread becomes a
//! consensus level, and criteria where the panel disagrees are flagged for
//! human review instead of being silently averaged away.
//!
//! The entry point is [`RunCoordinator::run`], which turns one [`TestCase`]
//! into one [`TestReport`].

pub mod aggregate;
pub mod cancel;
pub mod candidate;
pub mod config;
pub mod criteria;
pub mod error;
pub mod gateway;
pub mod judge;
pub mod report;
pub mod run;
pub mod sampling;
pub mod telemetry;
pub mod testcase;
pub mod trace;

pub use aggregate::{
    BackendOutcome, ConsensusLevel, ConsensusResult, SampleCounts, SampleRecord, SkipReason,
    SkippedBackend, WithinBackendAggregate,
};
pub use cancel::CancelScope;
pub use candidate::{
    CandidateError, CandidateItem, CandidateResult, CandidateSource, StaticCandidateSource,
};
pub use config::{BackendConfig, ConsensusPolicy, RunConfig, SamplingSettings};
pub use criteria::{CriterionDefinition, CriterionKind, CriterionRecord, CriterionRegistry, Scale};
pub use error::ConfigurationError;
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageLedger, UsageSink};
pub use judge::{
    parse_score_reply, GatewayBackend, JudgeRequest, ParseError, Sample, SampleFailure,
    ScoringBackend, SimulatedBackend,
};
pub use report::{
    CriterionReport, InMemoryReportStore, ReportStore, SqliteReportStore, Status, StoreError,
    TestReport,
};
pub use run::{RunCoordinator, RunError, RunObserver, RunState};
pub use sampling::{ConcurrencyLimiter, SamplingOrchestrator};
pub use testcase::{CaseSetup, CriterionRef, TestCase};
pub use trace::{JsonlTraceSink, SampleTrace, TraceError, TraceSink, TraceWorker};
