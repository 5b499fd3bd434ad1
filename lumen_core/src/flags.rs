//! Runtime flags: the observable knobs of the execution engine.
//!
//! A `RuntimeFlags` value is built by the embedder and owned by the isolate.
//! Numeric thresholds drive the adaptive optimizer and the caches; the
//! `trace_*` switches gate diagnostic output on the corresponding slow paths.

/// Tunable thresholds and switches for one isolate.
#[derive(Debug, Clone)]
pub struct RuntimeFlags {
    /// Usage-counter value before a function is optimized. -1 means never.
    pub optimization_counter_threshold: i64,
    /// Usage-counter value before an already-deoptimized function is
    /// reoptimized.
    pub reoptimization_counter_threshold: i64,
    /// How many deoptimizations a function tolerates before optimization
    /// attempts are suppressed.
    pub deoptimization_counter_threshold: u32,
    /// Maximum number of checks cached per subtype-test cache.
    pub max_subtype_cache_entries: usize,
    /// Use on-stack replacement.
    pub use_osr: bool,
    /// Run assignment checks and bound checks (checked mode).
    pub enable_type_checks: bool,
    /// Deoptimize all live frames when returning to managed code from
    /// native entries. Debugging aid.
    pub deoptimize_alot: bool,
    /// Stop the program when the same function deoptimizes too often.
    pub stop_on_excessive_deoptimization: bool,
    /// Comma-separated substrings; only functions whose qualified name
    /// matches one of them are optimized. `None` optimizes everything.
    pub optimization_filter: Option<String>,

    pub trace_ic: bool,
    pub trace_ic_miss_in_optimized: bool,
    pub trace_optimized_ic_calls: bool,
    pub trace_patching: bool,
    pub trace_deoptimization: bool,
    pub trace_deoptimization_verbose: bool,
    pub trace_osr: bool,
    pub trace_type_checks: bool,
    pub trace_failed_optimization_attempts: bool,
    pub trace_runtime_calls: bool,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self {
            optimization_counter_threshold: 15_000,
            reoptimization_counter_threshold: 2_000,
            deoptimization_counter_threshold: 16,
            max_subtype_cache_entries: 100,
            use_osr: true,
            enable_type_checks: false,
            deoptimize_alot: false,
            stop_on_excessive_deoptimization: false,
            optimization_filter: None,
            trace_ic: false,
            trace_ic_miss_in_optimized: false,
            trace_optimized_ic_calls: false,
            trace_patching: false,
            trace_deoptimization: false,
            trace_deoptimization_verbose: false,
            trace_osr: false,
            trace_type_checks: false,
            trace_failed_optimization_attempts: false,
            trace_runtime_calls: false,
        }
    }
}

impl RuntimeFlags {
    /// Check a qualified function name against the optimization filter.
    ///
    /// The filter is a comma-separated list of substrings; a name matches
    /// if any non-empty token occurs in it. No filter matches everything.
    #[must_use]
    pub fn matches_optimization_filter(&self, qualified_name: &str) -> bool {
        match &self.optimization_filter {
            None => true,
            Some(filter) => filter
                .split(',')
                .filter(|token| !token.is_empty())
                .any(|token| qualified_name.contains(token)),
        }
    }
}
