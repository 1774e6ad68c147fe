//! Kernel-level errors.

use agentmesh_types::error::MeshError;
use thiserror::Error;

/// Errors raised while assembling or running the mesh.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// The mesh could not be assembled (store unavailable, bad data dir, ...).
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

pub type KernelResult<T> = Result<T, KernelError>;
