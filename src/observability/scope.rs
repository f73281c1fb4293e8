//! ObservationScope for begin/complete logging around multi-step operations
//!
//! - Logs `{name}_BEGIN` on creation
//! - Logs `{name}_COMPLETE` when completed
//! - Logs `{name}_INCOMPLETE` if dropped first (early return through `?`)

use super::logger::{Logger, Severity};

/// A scope that logs start and completion of an operation
pub struct ObservationScope {
    name: &'static str,
    completed: bool,
    fields: Vec<(&'static str, String)>,
}

impl ObservationScope {
    /// Open a scope carrying `fields` on every event it logs
    pub fn new(name: &'static str, fields: &[(&'static str, String)]) -> Self {
        let scope = Self {
            name,
            completed: false,
            fields: fields.to_vec(),
        };
        scope.emit(Severity::Info, "BEGIN", &[]);
        scope
    }

    /// Mark the scope as completed
    pub fn complete(mut self, extra: &[(&str, &str)]) {
        self.completed = true;
        self.emit(Severity::Info, "COMPLETE", extra);
    }

    /// Check if the scope has been completed
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn emit(&self, severity: Severity, suffix: &str, extra: &[(&str, &str)]) {
        if !Logger::enabled(severity) {
            return;
        }
        let event = format!("{}_{}", self.name, suffix);
        let mut fields: Vec<(&str, &str)> =
            self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        fields.extend_from_slice(extra);
        Logger::log(severity, &event, &fields);
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.completed {
            self.emit(Severity::Warn, "INCOMPLETE", &[("reason", "scope dropped without completion")]);
        }
    }
}
