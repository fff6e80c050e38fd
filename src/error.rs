//! Error taxonomy.
//!
//! Invariant violations are not represented here: they are asserted with
//! `assert!`/`debug_assert!` at the entry and exit of stateful operations
//! and abort the process. What remains is the recoverable half: resource
//! exhaustion that the caller can react to, and the filesystem's named
//! failure modes. Running out of swap space is intentionally *not* a
//! variant here -- it is a `panic!` at the call site, not a `Result`.

use thiserror::Error;

/// Failures that `vm` operations can return without halting the system.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum VmError {
    /// Frame allocation failed and eviction could not make room either.
    #[error("out of physical frames")]
    OutOfMemory,
    /// The faulting address is null, lies in the kernel range, or is
    /// already resident.
    #[error("address space violation")]
    BadAddress,
    /// No SPT entry covers the address and the stack-growth heuristic did
    /// not apply.
    #[error("unmapped user address")]
    Unmapped,
}

/// Failures surfaced by file-system operations. Every variant here leaves
/// global state untouched -- the caller does not need to unwind anything
/// on receipt of one of these.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum FsError {
    #[error("name exceeds NAME_MAX")]
    NameTooLong,
    #[error("name already exists in directory")]
    NameCollision,
    #[error("component is not a directory")]
    NotADirectory,
    #[error("directory is not empty")]
    DirectoryNotEmpty,
    #[error("no such file or directory")]
    NotFound,
    #[error("disk is full")]
    NoSpace,
    #[error("write denied while file is mapped for execution")]
    WriteDenied,
}

pub type VmResult<T> = Result<T, VmError>;
pub type FsResult<T> = Result<T, FsError>;
