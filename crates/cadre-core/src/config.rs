//! Runner configuration.

/// Sentinel returned when an agent exhausts its iteration budget without
/// converging. Callers treat it as partial progress, not an error.
pub const UNFINISHED: &str = "Unfinished";

/// Tunables for agent runs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum reason-act-observe iterations per agent run.
    pub max_iterations: u32,

    /// Consecutive tool-execution failures tolerated before the run is
    /// terminated with the last error. The counter is shared across the
    /// whole run, not per tool, and resets on any success.
    pub max_consecutive_tool_errors: u32,

    /// Maximum tokens per completion, forwarded to the model.
    pub max_tokens: Option<u32>,

    /// Sampling temperature, forwarded to the model.
    pub temperature: Option<f32>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_consecutive_tool_errors: 10,
            max_tokens: None,
            temperature: None,
        }
    }
}
