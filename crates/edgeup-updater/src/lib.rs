mod health;
mod orchestrator;
mod outcome;
mod runtime;
mod settings;

pub use health::{HealthProbe, HttpHealthProbe};
pub use orchestrator::{
    decide_update, query_latest, Capabilities, UpdateDecision, UpdateOrchestrator,
};
pub use outcome::{NoopObserver, RunObserver, RunOutcome, RunState};
pub use runtime::UpdaterRuntime;
pub use settings::{HealthGate, OrchestratorSettings};

#[cfg(test)]
mod tests;
