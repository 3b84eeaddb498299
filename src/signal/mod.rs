pub mod engine;
pub mod lifecycle;
pub mod score;

pub use engine::{ProcessReport, SignalAction, SignalEngine};
pub use lifecycle::LifecycleOutcome;
pub use score::{score_direction, ScoreBreakdown};
