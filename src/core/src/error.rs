use std::path::PathBuf;

use thiserror::Error;

/// Kiln build error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Invalid build options (no stages, unknown target, bad option file)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Variable or argument could not be resolved
    #[error("Resolution error: {0}")]
    ResolveError(String),

    /// A source or destination path resolves outside its root
    #[error("Path escape: {path} is outside of {}", .root.display())]
    PathEscape { path: String, root: PathBuf },

    /// `FROM` or `--from=` names a stage that has not completed
    #[error("the stage {0:?} has not been built")]
    StageNotBuilt(String),

    /// Instruction kind the executor does not know
    #[error("Unknown instruction: {0}")]
    UnknownInstruction(String),

    /// Instruction with bad flags or arguments
    #[error("Invalid instruction: {0}")]
    InvalidInstruction(String),

    /// Symlink chain exceeded the resolution bound
    #[error("Too many symlinks while resolving {path}")]
    TooManySymlinks { path: String },

    /// COPY/ADD source did not match anything
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// RUN process exited non-zero
    #[error("Command {command:?} exited with code {exit_code}")]
    RunFailed { command: String, exit_code: i32 },

    /// Container runtime failure
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Image/layer store failure
    #[error("Store error: {0}")]
    StoreError(String),

    /// Image lookup failed
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Volume save/restore failure
    #[error("Volume cache error: {0}")]
    VolumeCacheError(String),

    /// COPY/ADD failure
    #[error("Copy error: {0}")]
    CopyError(String),

    /// ADD <url> download failed
    #[error("Download failed: {url} -> {status_code}")]
    DownloadError { url: String, status_code: u16 },

    /// Build canceled by caller
    #[error("Build canceled")]
    Canceled,

    /// Stage-fatal error wrapped with the failing instruction
    #[error("stage {stage}: {instruction}: {source}")]
    Step {
        stage: String,
        instruction: String,
        source: Box<BuildError>,
    },

    /// Primary error with cleanup failures attached
    #[error("{source}; cleanup also failed: {cleanup}")]
    WithCleanup {
        source: Box<BuildError>,
        cleanup: String,
    },

    /// Cleanup failures after an otherwise successful build
    #[error("Cleanup failed: {}", .0.join("; "))]
    CleanupFailed(Vec<String>),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Error taxonomy used by callers to decide how to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal before any work starts
    Configuration,
    /// Fatal for the current stage; bad input
    Resolution,
    /// Fatal for the current stage; runtime or store failure
    Execution,
    /// Teardown failure
    Cleanup,
}

impl BuildError {
    /// Wrap this error with the stage and instruction that produced it.
    ///
    /// Already wrapped errors are returned unchanged so the innermost
    /// instruction wins.
    pub fn at_step(self, stage: impl Into<String>, instruction: impl Into<String>) -> Self {
        match self {
            BuildError::Step { .. } | BuildError::Canceled => self,
            other => BuildError::Step {
                stage: stage.into(),
                instruction: instruction.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Step { source, .. } | BuildError::WithCleanup { source, .. } => {
                source.kind()
            }
            BuildError::ConfigError(_) | BuildError::SerializationError(_) => {
                ErrorKind::Configuration
            }
            BuildError::ResolveError(_)
            | BuildError::PathEscape { .. }
            | BuildError::StageNotBuilt(_)
            | BuildError::UnknownInstruction(_)
            | BuildError::InvalidInstruction(_)
            | BuildError::TooManySymlinks { .. }
            | BuildError::SourceNotFound(_) => ErrorKind::Resolution,
            BuildError::CleanupFailed(_) => ErrorKind::Cleanup,
            _ => ErrorKind::Execution,
        }
    }

    /// Innermost error, looking through step and cleanup wrappers.
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::Step { source, .. } | BuildError::WithCleanup { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.root_cause(), BuildError::Canceled)
    }

    /// Combine a primary outcome with errors collected during cleanup.
    ///
    /// Cleanup errors become the result only when there is no primary
    /// error; otherwise they are attached to it as context.
    pub fn merge_cleanup(primary: Option<BuildError>, cleanup: Vec<BuildError>) -> Option<Self> {
        if cleanup.is_empty() {
            return primary;
        }
        let messages: Vec<String> = cleanup.iter().map(|e| e.to_string()).collect();
        match primary {
            None => Some(BuildError::CleanupFailed(messages)),
            Some(err) => Some(BuildError::WithCleanup {
                source: Box::new(err),
                cleanup: messages.join("; "),
            }),
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::SerializationError(err.to_string())
    }
}

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = BuildError::ConfigError("no stages to build".to_string());
        assert_eq!(error.to_string(), "Configuration error: no stages to build");
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_path_escape_display() {
        let error = BuildError::PathEscape {
            path: "../../etc/passwd".to_string(),
            root: PathBuf::from("/ctx"),
        };
        assert_eq!(
            error.to_string(),
            "Path escape: ../../etc/passwd is outside of /ctx"
        );
        assert_eq!(error.kind(), ErrorKind::Resolution);
    }

    #[test]
    fn test_stage_not_built_display() {
        let error = BuildError::StageNotBuilt("builder".to_string());
        assert_eq!(error.to_string(), "the stage \"builder\" has not been built");
    }

    #[test]
    fn test_run_failed_display() {
        let error = BuildError::RunFailed {
            command: "make".to_string(),
            exit_code: 2,
        };
        assert_eq!(error.to_string(), "Command \"make\" exited with code 2");
        assert_eq!(error.kind(), ErrorKind::Execution);
    }

    #[test]
    fn test_at_step_wraps_once() {
        let error = BuildError::RunFailed {
            command: "make".to_string(),
            exit_code: 1,
        }
        .at_step("builder", "RUN make")
        .at_step("final", "COPY --from=builder /out /out");

        assert_eq!(
            error.to_string(),
            "stage builder: RUN make: Command \"make\" exited with code 1"
        );
        assert_eq!(error.kind(), ErrorKind::Execution);
    }

    #[test]
    fn test_canceled_is_not_wrapped() {
        let error = BuildError::Canceled.at_step("s", "RUN true");
        assert!(matches!(error, BuildError::Canceled));
        assert!(error.is_canceled());
    }

    #[test]
    fn test_merge_cleanup_without_primary() {
        let merged = BuildError::merge_cleanup(
            None,
            vec![BuildError::StoreError("container busy".to_string())],
        )
        .unwrap();
        assert_eq!(merged.kind(), ErrorKind::Cleanup);
        assert_eq!(
            merged.to_string(),
            "Cleanup failed: Store error: container busy"
        );
    }

    #[test]
    fn test_merge_cleanup_keeps_primary() {
        let primary = BuildError::StageNotBuilt("x".to_string()).at_step("final", "COPY --from=x / /");
        let merged = BuildError::merge_cleanup(
            Some(primary),
            vec![BuildError::StoreError("gone".to_string())],
        )
        .unwrap();
        assert_eq!(merged.kind(), ErrorKind::Resolution);
        assert!(merged.to_string().starts_with("stage final: COPY --from=x / /"));
        assert!(merged.to_string().ends_with("cleanup also failed: Store error: gone"));
        assert!(matches!(merged.root_cause(), BuildError::StageNotBuilt(_)));
    }

    #[test]
    fn test_merge_cleanup_nothing() {
        assert!(BuildError::merge_cleanup(None, Vec::new()).is_none());
    }

    #[test]
    fn test_serde_json_conversion() {
        let err: BuildError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, BuildError::SerializationError(_)));
    }
}
