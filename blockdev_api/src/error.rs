use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Serialize};
use strum_macros::IntoStaticStr;

use crate::config::ConfigError;

/// The environment the engine runs in is missing something it needs.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionEnvironmentMisconfigurationError {
    #[error("Could not find binary '{binary}'")]
    MissingBinary { binary: &'static str },
}

/// User provided input was invalid.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidInputError {
    #[error("Failed to load parameter file from '{path}'")]
    LoadParams { path: String },
    #[error("Failed to parse parameter file")]
    ParseParams,
    #[error("No parameter file given, pass --params or set {}", crate::constants::PARAMS_ENV)]
    MissingParams,
    #[error("Failed to load block device configuration from '{path}'")]
    LoadConfig { path: String },
    #[error("Failed to parse block device configuration")]
    ParseConfig,
    #[error("Invalid block device configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),
}

/// A step of a phase failed while touching the host.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionError {
    #[error("Failed to run '{binary}': {explanation}")]
    CommandFailed {
        binary: &'static str,
        explanation: String,
    },
    #[error("Failed to execute '{binary}'")]
    CommandCouldNotExecute { binary: &'static str },
    #[error("Failed to create image file '{path}'")]
    CreateImage { path: String },
    #[error("Failed to remove image file '{path}'")]
    RemoveImage { path: String },
    #[error("Failed to attach loop device for '{path}'")]
    AttachLoopDevice { path: String },
    #[error("Failed to detach loop device '{device}'")]
    DetachLoopDevice { device: String },
    #[error("Failed to write partition table to '{path}'")]
    WritePartitionTable { path: String },
    #[error("Failed to make partitions of '{device}' visible")]
    MapPartitions { device: String },
    #[error("Failed to remove partition mappings of '{device}'")]
    UnmapPartitions { device: String },
    #[error("Failed to set up logical volumes for '{name}'")]
    CreateLvm { name: String },
    #[error("Failed to deactivate '{name}'")]
    DeactivateLvm { name: String },
    #[error("Failed to create filesystem '{name}'")]
    CreateFilesystem { name: String },
    #[error("Failed to mount '{mount_point}'")]
    Mount { mount_point: String },
    #[error("Failed to unmount '{mount_point}'")]
    Unmount { mount_point: String },
    #[error("Failed to install fstab")]
    InstallFstab,
}

/// Persisted config or state is missing or does not match the graph.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum StateError {
    #[error("Config not found at '{path}', was init run?")]
    ConfigNotFound { path: String },
    #[error("State dump not found at '{path}'")]
    StateNotFound { path: String },
    #[error("Failed to read '{path}'")]
    Read { path: String },
    #[error("Failed to write '{path}'")]
    Write { path: String },
    #[error("Failed to parse '{path}'")]
    Parse { path: String },
    #[error("Failed to remove state directory '{path}'")]
    RemoveStateDir { path: String },
    #[error("Rebuilt call order does not match the persisted one")]
    CallOrderMismatch,
    #[error("State has no entry '{namespace}.{key}'")]
    MissingKey { namespace: String, key: String },
    #[error("State entry '{namespace}.{key}' is already set")]
    KeyExists { namespace: String, key: String },
    #[error("State entry '{namespace}.{key}' is malformed")]
    Malformed { namespace: String, key: String },
}

#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Panicked: {0}")]
    Panic(String),
    #[error("Failed to serialize state")]
    SerializeState,
    #[error("Failed to dump graph")]
    DumpGraph,
}

/// Each variant of `ErrorKind` corresponds to a different category of error. The categories are
/// intended to be user-meaningful, so the outer build pipeline can tell a bad config apart from a
/// broken host.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// The host is missing a tool.
    #[error(transparent)]
    ExecutionEnvironmentMisconfiguration(#[from] ExecutionEnvironmentMisconfigurationError),

    /// The parameter file or the block device configuration is invalid.
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    /// An external tool or a file operation failed.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Persisted state is missing or inconsistent.
    #[error(transparent)]
    State(#[from] StateError),

    /// A bug was encountered.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct BlockDeviceErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct BlockDeviceError(Box<BlockDeviceErrorInner>);
impl BlockDeviceError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        BlockDeviceError(Box::new(BlockDeviceErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        BlockDeviceError(Box::new(BlockDeviceErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: Some(source),
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn secondary_error_context(mut self, secondary: BlockDeviceError) -> Self {
        self.0.context.push((format!(
            "While handling the error, an additional error was caught: \n\n{secondary:?}\n\nThe earlier error:"
        ).into(), Location::caller()));
        self
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

impl From<ConfigError> for BlockDeviceError {
    #[track_caller]
    fn from(value: ConfigError) -> Self {
        BlockDeviceError::new(InvalidInputError::InvalidConfiguration(value))
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured BlockDeviceError.
    fn structured(self, kind: K) -> Result<T, BlockDeviceError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, BlockDeviceError> {
        match self {
            Some(t) => Ok(t),
            None => Err(BlockDeviceError::new(kind)),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, BlockDeviceError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(BlockDeviceError::with_source(kind, e.into())),
        }
    }
}

pub trait BlockDeviceResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, BlockDeviceError>;
}

impl<T> BlockDeviceResultExt<T> for Result<T, BlockDeviceError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, BlockDeviceError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }
}

impl Serialize for BlockDeviceError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("block-device-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::ExecutionEnvironmentMisconfiguration(ref e) => {
                state.serialize_field("error", e)?
            }
            ErrorKind::InvalidInput(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Execution(ref e) => state.serialize_field("error", e)?,
            ErrorKind::State(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for BlockDeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_yaml::Value;

    use super::*;

    #[test]
    fn test_error_serialize() {
        let e = std::fs::read("/non-existent-call-order.json")
            .context("failed to read file")
            .structured(StateError::CallOrderMismatch)
            .unwrap_err();
        match serde_yaml::to_value(e).unwrap() {
            Value::Mapping(m) => {
                assert_eq!(m.len(), 5);
                assert_eq!(m["error"], Value::String("call-order-mismatch".into()));
                assert_eq!(m["category"], Value::String("state".into()));
                assert!(matches!(m["cause"], Value::String(_)));
                assert_eq!(
                    m["message"],
                    Value::String("Rebuilt call order does not match the persisted one".into())
                );
                match m["location"] {
                    Value::String(ref s) => assert!(s.contains("error.rs:")),
                    _ => panic!("location isn't string"),
                }
            }
            _ => panic!("value isn't mapping"),
        }
    }

    #[test]
    fn test_error_serialize_without_cause() {
        let e = BlockDeviceError::new(InternalError::SerializeState);
        let value = serde_yaml::to_value(e).unwrap();
        assert_eq!(value["error"], Value::String("serialize-state".into()));
        assert_eq!(value["category"], Value::String("internal".into()));
        assert_eq!(value["cause"], Value::Null);
    }

    #[test]
    fn test_error_debug() {
        let error = Err::<(), _>(anyhow::anyhow!("z"))
            .context("x\ny")
            .structured(InternalError::Internal("w"))
            .unwrap_err();
        assert_eq!(
            format!("{:?}", error),
            format!(
                "Internal error: w at {}:{}\n\nCaused by:\n    0: x\n       y\n    1: z\n",
                error.0.location.file(),
                error.0.location.line(),
            ),
        );
    }

    #[test]
    fn test_error_message_and_secondary_context() {
        let error = Err::<(), _>(BlockDeviceError::new(InternalError::Internal("first")))
            .message("while doing a thing")
            .unwrap_err()
            .secondary_error_context(BlockDeviceError::new(InternalError::Internal("second")));
        let rendered = format!("{error:?}");
        assert!(rendered.starts_with("Internal error: first at "));
        assert!(rendered.contains("Context:"));
        assert!(rendered.contains("    0: while doing a thing at "));
        assert!(rendered.contains("an additional error was caught"));
        assert!(rendered.contains("Internal error: second"));
    }
}
