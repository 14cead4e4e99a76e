pub mod config;
pub mod report;
pub mod task;

pub use config::{BasketConfig, ClientConfig, EngineConfig, FiraConfig, ServerCommand, SourceConfig};
pub use report::{
    BasketFailure, CompletenessReport, CompletenessSummary, ConflictEntry, MetricValue,
    ResearchReport, Resolution, ResolvedMetric, SourceRecord, SourceRole, SwotSummary,
};
pub use task::{EventOutcome, PartialEvent, Task, TaskId, TaskStatus};
