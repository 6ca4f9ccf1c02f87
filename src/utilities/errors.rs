//! Engine error taxonomy.
//!
//! Per-clone failures (`BoardError`, `WaitError`) never abort the game;
//! `EngineError` does.

use thiserror::Error;

use crate::board::EntryKind;

/// Errors raised while registering fact types or workers.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// A fact type name is already registered with a different shape.
    #[error("fact type '{name}' is already registered with a different declaration")]
    DuplicateFactType { name: String },

    /// A declared field collides with the public API surface.
    #[error("field '{field}' of fact type '{name}' uses a reserved name")]
    ReservedFieldName { name: String, field: String },

    /// A field default or allowed value does not match its declared kind.
    #[error("field '{field}' of fact type '{name}' is invalid: {detail}")]
    InvalidFieldSchema {
        name: String,
        field: String,
        detail: String,
    },

    /// An interest names neither a registered type nor a group.
    #[error("'{name}' is not a registered fact type or fact group")]
    UnknownInterest { name: String },

    /// A group interest expanded to zero concrete types.
    #[error("fact group '{name}' has no registered member types")]
    EmptyGroup { name: String },

    /// A version string could not be parsed.
    #[error("unparseable version string '{version}'")]
    InvalidVersion { version: String },

    /// A worker requires a newer engine than the one running.
    #[error("worker '{name}' requires engine {required}, running {running}")]
    IncompatibleEngine {
        name: String,
        required: String,
        running: String,
    },

    /// A worker template with this name already exists.
    #[error("worker '{name}' is already registered")]
    DuplicateWorker { name: String },
}

/// Errors raised by blackboard operations.
#[derive(Debug, Error)]
pub enum BoardError {
    /// No entry of the given kind with the given id.
    #[error("no {kind} entry with id {id}")]
    NotFound { kind: EntryKind, id: u64 },

    /// Attempt to mutate or re-add a sealed record.
    #[error("record is sealed: {detail}")]
    Immutable { detail: String },

    /// Fact carries a type name the registry does not know.
    #[error("unknown fact type '{name}'")]
    UnknownFactType { name: String },

    /// Attempt to set a field the type does not declare.
    #[error("fact type '{type_name}' declares no field '{field}'")]
    UnknownField { type_name: String, field: String },

    /// A field value does not match its declared kind.
    #[error("field '{field}': {detail}")]
    FieldType { field: String, detail: String },

    /// A required field was never set.
    #[error("required field '{field}' of fact type '{type_name}' is missing")]
    MissingField { type_name: String, field: String },

    /// A value is outside the field's allowed set.
    #[error("field '{field}' does not allow this value")]
    DisallowedValue { field: String },

    /// A record's taint state does not match the target table.
    #[error("tainted flag does not match the target table")]
    TaintMismatch,

    /// A worker-added record must name at least one parent.
    #[error("parentage must be populated before the record is added")]
    MissingParentage,

    /// Deriving an untainted fact from a hyp-triggered clone without
    /// acknowledgement.
    #[error("clone was triggered by a hyp; use add_fact_from_tainted to derive a fact")]
    TaintedLineage,
}

/// Errors surfaced by the wait primitives.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The deadline elapsed with no matching entry.
    #[error("timed out waiting for a matching entry")]
    Timeout,

    /// The game quiesced or aborted; must propagate out of the clone.
    #[error("wait cancelled by the game master")]
    Cancelled,
}

/// Errors raised by the snapshot codec and game load.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Save file written by a newer engine.
    #[error("save requires engine {found}, running {running}")]
    IncompatibleVersion { found: String, running: String },

    /// A saved worker has no template with that name in the running game.
    #[error("no registered worker named '{name}' to rebind")]
    UnknownWorker { name: String },

    /// A saved fact type is absent from the running registry.
    #[error("saved fact type '{name}' is not registered")]
    UnknownFactType { name: String },

    /// The save file violates its own internal structure.
    #[error("corrupt save: {detail}")]
    Corrupt { detail: String },
}

/// Errors raised setting up or tearing down temporary directories.
#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("path {path} exists but is not a directory")]
    NotADirectory { path: String },

    #[error("unable to manage temporary directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level engine error; anything that should abort the run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Board(#[from] BoardError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Temporary(#[from] TemporaryError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("scheduler invariant violated: {0}")]
    Invariant(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_location_and_detail() {
        let err = BoardError::NotFound {
            kind: EntryKind::Fact,
            id: 42,
        };
        assert_eq!(err.to_string(), "no fact entry with id 42");

        let err = RegistrationError::IncompatibleEngine {
            name: "HashPlayer".into(),
            required: "9.9".into(),
            running: "0.4.3".into(),
        };
        assert!(err.to_string().contains("HashPlayer"));
        assert!(err.to_string().contains("9.9"));
    }

    #[test]
    fn engine_error_wraps_component_errors() {
        let err: EngineError = RegistrationError::EmptyGroup {
            name: "hash".into(),
        }
        .into();
        match err {
            EngineError::Registration(RegistrationError::EmptyGroup { name }) => {
                assert_eq!(name, "hash")
            }
            other => panic!("unexpected variant: {other}"),
        }
    }
}
