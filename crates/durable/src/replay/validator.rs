//! Determinism validation for replayed workflow runs

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::workflow::{CommandSignature, RecordedCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A different command was issued at a recorded position
    Mismatch,
    /// The run ended before re-issuing a recorded command
    Missing,
}

/// Replay diverged from recorded history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterminismViolation {
    /// Position among the workflow's recorded commands (0-based)
    pub position: usize,
    /// Sequence of the event that recorded the expected command
    pub sequence: i64,
    pub expected: CommandSignature,
    pub actual: Option<CommandSignature>,
    pub kind: ViolationKind,
}

impl fmt::Display for DeterminismViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.actual) {
            (ViolationKind::Mismatch, Some(actual)) => write!(
                f,
                "nondeterministic command at position {}: history has {} (sequence {}), replay issued {}",
                self.position, self.expected, self.sequence, actual
            ),
            _ => write!(
                f,
                "missing command at position {}: history has {} (sequence {}), replay never issued it",
                self.position, self.expected, self.sequence
            ),
        }
    }
}

impl std::error::Error for DeterminismViolation {}

/// Matches commands issued by a replayed run against recorded history
///
/// Commands are compared by position. Commands past the end of the
/// recorded history are new and always allowed.
#[derive(Debug, Clone, Default)]
pub struct DeterminismValidator {
    recorded: Vec<RecordedCommand>,
    cursor: usize,
}

impl DeterminismValidator {
    pub fn new(recorded: Vec<RecordedCommand>) -> Self {
        Self {
            recorded,
            cursor: 0,
        }
    }

    /// Position the next issued command will take
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Whether recorded commands remain to be matched
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.recorded.len()
    }

    /// The next recorded command, if any
    pub fn peek(&self) -> Option<&RecordedCommand> {
        self.recorded.get(self.cursor)
    }

    /// Check an issued command and move past it
    ///
    /// Returns the recorded command it matched, or `None` for a new command.
    pub fn advance(
        &mut self,
        signature: &CommandSignature,
    ) -> Result<Option<RecordedCommand>, DeterminismViolation> {
        let Some(recorded) = self.recorded.get(self.cursor) else {
            self.cursor += 1;
            return Ok(None);
        };

        if &recorded.signature != signature {
            return Err(DeterminismViolation {
                position: self.cursor,
                sequence: recorded.sequence,
                expected: recorded.signature.clone(),
                actual: Some(signature.clone()),
                kind: ViolationKind::Mismatch,
            });
        }

        self.cursor += 1;
        Ok(Some(recorded.clone()))
    }

    /// Verify that every recorded command was re-issued
    pub fn finish(&self) -> Result<(), DeterminismViolation> {
        match self.recorded.get(self.cursor) {
            Some(missing) => Err(DeterminismViolation {
                position: self.cursor,
                sequence: missing.sequence,
                expected: missing.signature.clone(),
                actual: None,
                kind: ViolationKind::Missing,
            }),
            None => Ok(()),
        }
    }

    /// Validate a complete sequence of issued commands in one go
    pub fn validate(
        recorded: &[RecordedCommand],
        issued: &[CommandSignature],
    ) -> Result<(), DeterminismViolation> {
        let mut validator = Self::new(recorded.to_vec());
        for signature in issued {
            validator.advance(signature)?;
        }
        validator.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{CommandKind, RecordedTarget};
    use uuid::Uuid;

    fn recorded(position: usize, kind: CommandKind, name: &str) -> RecordedCommand {
        RecordedCommand {
            position,
            sequence: position as i64 + 3,
            signature: CommandSignature::new(kind, name),
            target: RecordedTarget::Task(Uuid::now_v7()),
        }
    }

    fn history() -> Vec<RecordedCommand> {
        vec![
            recorded(0, CommandKind::ScheduleTask, "charge"),
            recorded(1, CommandKind::StartTimer, "cooldown"),
        ]
    }

    #[test]
    fn test_matching_prefix_then_new_commands() {
        let mut validator = DeterminismValidator::new(history());
        assert!(validator.is_replaying());

        let first = validator
            .advance(&CommandSignature::new(CommandKind::ScheduleTask, "charge"))
            .unwrap();
        assert!(first.is_some());
        validator
            .advance(&CommandSignature::new(CommandKind::StartTimer, "cooldown"))
            .unwrap();
        assert!(!validator.is_replaying());

        let new = validator
            .advance(&CommandSignature::new(CommandKind::ScheduleTask, "ship"))
            .unwrap();
        assert!(new.is_none());
        assert!(validator.finish().is_ok());
    }

    #[test]
    fn test_mismatch_names_position() {
        let mut validator = DeterminismValidator::new(history());
        validator
            .advance(&CommandSignature::new(CommandKind::ScheduleTask, "charge"))
            .unwrap();

        let err = validator
            .advance(&CommandSignature::new(CommandKind::ScheduleTask, "refund"))
            .unwrap_err();
        assert_eq!(err.position, 1);
        assert_eq!(err.kind, ViolationKind::Mismatch);
        assert_eq!(err.sequence, 4);
        assert!(err.to_string().contains("position 1"));
        assert!(err.to_string().contains("start_timer(cooldown)"));
    }

    #[test]
    fn test_same_kind_different_identity_is_a_mismatch() {
        let err = DeterminismValidator::validate(
            &history(),
            &[CommandSignature::new(CommandKind::ScheduleTask, "refund")],
        )
        .unwrap_err();
        assert_eq!(err.position, 0);
    }

    #[test]
    fn test_missing_command() {
        let err = DeterminismValidator::validate(
            &history(),
            &[CommandSignature::new(CommandKind::ScheduleTask, "charge")],
        )
        .unwrap_err();
        assert_eq!(err.kind, ViolationKind::Missing);
        assert_eq!(err.position, 1);
        assert!(err.to_string().starts_with("missing command at position 1"));
    }

    #[test]
    fn test_empty_history_allows_anything() {
        assert!(DeterminismValidator::validate(
            &[],
            &[CommandSignature::new(CommandKind::SetState, "k")]
        )
        .is_ok());
    }
}
