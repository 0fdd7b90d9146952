use std::fmt;

use crate::key::{ModuleContainerId, ModuleId};

/// Broad category of a [`RuntimeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wiring mistake in the host program (duplicate ids, missing
    /// registration, unmet dependency). Never retried.
    Configuration,
    /// The outer document could not be read or written.
    Serialization,
}

/// Errors raised by the module runtime.
///
/// Lookup misses are not errors; they surface as `None`/`false`. Per-entry
/// state load problems are not errors either; they are collected in a
/// [`LoadReport`](crate::registry::LoadReport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    DuplicateModuleId {
        id: ModuleId,
    },
    DuplicateModuleType {
        type_name: &'static str,
        existing: ModuleId,
    },
    EventAlreadyRegistered {
        event: &'static str,
    },
    EventNotRegistered {
        event: &'static str,
    },
    UnmetContainerRequirement {
        required: &'static str,
        container: ModuleContainerId,
        found: &'static str,
    },
    UnmetSiblingRequirement {
        container: ModuleContainerId,
        missing: Vec<&'static str>,
    },
    DuplicateDependency {
        dependency: &'static str,
    },
    UndeclaredDependency {
        dependency: &'static str,
    },
    StaleAssociation {
        dependency: &'static str,
        module: ModuleId,
    },
    ModuleNotContained {
        container: ModuleContainerId,
        module: String,
    },
    ModuleBusy {
        module: ModuleId,
    },
    DuplicateStateType {
        name: &'static str,
        existing: &'static str,
    },
    SerializationIo(String),
    IncompatibleDocument {
        found: String,
        supported: String,
    },
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SerializationIo(_) | Self::IncompatibleDocument { .. } => {
                ErrorKind::Serialization
            }
            _ => ErrorKind::Configuration,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateModuleId { id } => write!(
                f,
                "module id '{id}' is already registered; module ids must be unique"
            ),
            Self::DuplicateModuleType {
                type_name,
                existing,
            } => write!(
                f,
                "module type {type_name} is already registered under id '{existing}'"
            ),
            Self::EventAlreadyRegistered { event } => {
                write!(f, "event {event} has already been registered")
            }
            Self::EventNotRegistered { event } => {
                write!(f, "event {event} has not been registered")
            }
            Self::UnmetContainerRequirement {
                required,
                container,
                found,
            } => write!(
                f,
                "container requirement not met: module needs {required}, \
                 but container '{container}' is a {found}"
            ),
            Self::UnmetSiblingRequirement { container, missing } => write!(
                f,
                "sibling requirement not met in container '{container}': missing {}",
                missing.join(", ")
            ),
            Self::DuplicateDependency { dependency } => write!(
                f,
                "dependency {dependency} is declared more than once; \
                 each dependency may appear under one requirement kind only"
            ),
            Self::UndeclaredDependency { dependency } => {
                write!(f, "dependency {dependency} was never declared")
            }
            Self::StaleAssociation { dependency, module } => write!(
                f,
                "associated module '{module}' ({dependency}) is no longer registered"
            ),
            Self::ModuleNotContained { container, module } => write!(
                f,
                "module '{module}' is not registered in container '{container}'"
            ),
            Self::ModuleBusy { module } => {
                write!(f, "module '{module}' is already borrowed")
            }
            Self::DuplicateStateType { name, existing } => write!(
                f,
                "state name '{name}' is already registered for {existing}"
            ),
            Self::SerializationIo(reason) => write!(f, "serialization failed: {reason}"),
            Self::IncompatibleDocument { found, supported } => write!(
                f,
                "document format version {found} is not compatible with {supported}"
            ),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationIo(err.to_string())
    }
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
