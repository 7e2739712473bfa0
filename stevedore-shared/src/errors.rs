//! Error taxonomy shared by the library and the command-line binary.
//!
//! Every failure is a [`StevedoreError`]. Variants are grouped into the
//! coarse categories returned by [`StevedoreError::kind`], which is what
//! retry loops and the CLI exit-code logic look at.

use std::fmt;
use std::io;

use thiserror::Error;

pub type StevedoreResult<T> = Result<T, StevedoreError>;

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller-facing mistakes: bad references, mount specs, limits.
    InvalidArgument,
    /// Image, container or other named object is absent.
    NotFound,
    /// Rootlessness or a capability prevents the operation.
    Permission,
    /// Network, rate-limit or layer-unknown races; safe to retry.
    Transient,
    /// Out of space, out of file descriptors.
    Resource,
    /// An external runtime or the child command failed.
    Runtime,
    /// Invariant violation or unexpected system failure.
    Internal,
}

/// How a child process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(i32),
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Exited(code) => write!(f, "exit status {}", code),
            ChildStatus::Signaled(sig) => write!(f, "killed by signal {}", sig),
        }
    }
}

#[derive(Debug, Error)]
pub enum StevedoreError {
    // ------------------------------------------------------------------
    // InvalidArgument
    // ------------------------------------------------------------------
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    #[error("invalid mount spec: {0}")]
    InvalidMountSpec(String),

    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    #[error("name {0:?} cannot be used as a local image name")]
    NameUnrepresentable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed image: {0}")]
    Image(String),

    // ------------------------------------------------------------------
    // NotFound
    // ------------------------------------------------------------------
    #[error("image not known: {0}")]
    ImageUnknown(String),

    #[error("container not known: {0}")]
    ContainerUnknown(String),

    #[error("container {0} was not created by stevedore")]
    NotOurContainer(String),

    #[error("image {0} is not present in local storage and the pull policy is \"never\"")]
    NotLocal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("name is already in use: {0}")]
    NameInUse(String),

    // ------------------------------------------------------------------
    // Permission
    // ------------------------------------------------------------------
    #[error("permission denied: {0}")]
    Permission(String),

    #[error("signature policy: {0}")]
    Policy(String),

    // ------------------------------------------------------------------
    // Transient
    // ------------------------------------------------------------------
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("layer not known: {0}")]
    LayerUnknown(String),

    // ------------------------------------------------------------------
    // Resource
    // ------------------------------------------------------------------
    #[error("resource exhausted: {0}")]
    Resource(String),

    // ------------------------------------------------------------------
    // Runtime
    // ------------------------------------------------------------------
    #[error("{runtime} exited with code {exit_code}: {stderr}")]
    Runtime {
        runtime: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("command failed in {isolation} isolation{}: {status}", runtime_suffix(.runtime))]
    RunFailed {
        isolation: String,
        runtime: Option<String>,
        status: ChildStatus,
    },

    #[error("slirp4netns failed: {0}")]
    SlirpFailed(String),

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<StevedoreError>),
}

fn runtime_suffix(runtime: &Option<String>) -> String {
    match runtime {
        Some(r) => format!(" (runtime {})", r),
        None => String::new(),
    }
}

fn join_errors(errors: &[StevedoreError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl StevedoreError {
    pub fn kind(&self) -> ErrorKind {
        use StevedoreError::*;
        match self {
            InvalidReference(_)
            | UnsupportedManifestType(_)
            | InvalidMountSpec(_)
            | InvalidLimit(_)
            | NameUnrepresentable(_)
            | InvalidArgument(_)
            | Unsupported(_)
            | Config(_)
            | Image(_) => ErrorKind::InvalidArgument,
            ImageUnknown(_) | ContainerUnknown(_) | NotOurContainer(_) | NotLocal(_)
            | NotFound(_) | NameInUse(_) => ErrorKind::NotFound,
            Permission(_) | Policy(_) => ErrorKind::Permission,
            Network(_) | RateLimited(_) | LayerUnknown(_) => ErrorKind::Transient,
            Resource(_) => ErrorKind::Resource,
            Runtime { .. } | RunFailed { .. } | SlirpFailed(_) => ErrorKind::Runtime,
            Storage(_) | Serialization(_) | Internal(_) => ErrorKind::Internal,
            Multiple(errors) => errors
                .first()
                .map(|e| e.kind())
                .unwrap_or(ErrorKind::Internal),
        }
    }

    /// Whether a pull may be retried after this error.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Process exit code for a CLI invocation that failed with this error:
    /// the child's own code when one exists, else 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            StevedoreError::RunFailed {
                status: ChildStatus::Exited(code),
                ..
            } if *code != 0 => *code,
            StevedoreError::Runtime { exit_code, .. } if *exit_code != 0 => *exit_code,
            _ => 1,
        }
    }

    /// Wrap an I/O error with context, classifying errno values that belong
    /// to a more specific category.
    pub fn io(context: impl fmt::Display, err: io::Error) -> Self {
        let message = format!("{}: {}", context, err);
        match err.raw_os_error() {
            Some(code) if is_resource_errno(code) => StevedoreError::Resource(message),
            Some(code) if code == EACCES || code == EPERM => StevedoreError::Permission(message),
            _ => StevedoreError::Storage(message),
        }
    }
}

const EPERM: i32 = 1;
const EACCES: i32 = 13;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;
const ENOSPC: i32 = 28;
const EDQUOT: i32 = 122;

fn is_resource_errno(code: i32) -> bool {
    matches!(code, ENFILE | EMFILE | ENOSPC | EDQUOT)
}

impl From<io::Error> for StevedoreError {
    fn from(err: io::Error) -> Self {
        StevedoreError::io("I/O error", err)
    }
}

impl From<serde_json::Error> for StevedoreError {
    fn from(err: serde_json::Error) -> Self {
        StevedoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            StevedoreError::InvalidLimit("x".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            StevedoreError::NotLocal("alpine".into()).kind(),
            ErrorKind::NotFound
        );
        assert!(StevedoreError::LayerUnknown("abc".into()).is_transient());
        assert!(StevedoreError::RateLimited("429".into()).is_transient());
        assert!(!StevedoreError::Policy("rejected".into()).is_transient());
    }

    #[test]
    fn test_exit_code_uses_child_status() {
        let err = StevedoreError::RunFailed {
            isolation: "chroot".into(),
            runtime: None,
            status: ChildStatus::Exited(42),
        };
        assert_eq!(err.exit_code(), 42);

        let err = StevedoreError::RunFailed {
            isolation: "oci".into(),
            runtime: Some("runc".into()),
            status: ChildStatus::Signaled(9),
        };
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("runtime runc"));

        assert_eq!(StevedoreError::Internal("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_io_errno_classification() {
        let err = StevedoreError::io("write", io::Error::from_raw_os_error(ENOSPC));
        assert_eq!(err.kind(), ErrorKind::Resource);
        let err = StevedoreError::io("open", io::Error::from_raw_os_error(EACCES));
        assert_eq!(err.kind(), ErrorKind::Permission);
        let err = StevedoreError::io("open", io::Error::from_raw_os_error(2));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_multiple_joins_messages() {
        let err = StevedoreError::Multiple(vec![
            StevedoreError::NotFound("a".into()),
            StevedoreError::Storage("b".into()),
        ]);
        assert_eq!(err.to_string(), "not found: a; storage error: b");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
