//! The closed error taxonomy surfaced by [`crate::policy::update`].

use thiserror::Error;

pub type UpdateResult<T> = Result<T, UpdateError>;

/// Every way `update()` can fail (or the one internal signal that isn't a
/// real failure, [`UpdateError::NeedRoUpdate`]).
///
/// Success is `Ok(())`, matching the `Done` code in the originating error
/// taxonomy -- there's no `Done` variant here because a closed enum has no
/// use for a success case that carries no data.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("no target image supplied")]
    NoImage,

    #[error("could not read current flash image: {0}")]
    SystemImage(String),

    #[error("target image failed structural checks: {0}")]
    InvalidImage(String),

    #[error("target written but cookies failed: {0}")]
    SetCookies(String),

    #[error("failed to write firmware: {0}")]
    WriteFirmware(String),

    #[error("platform is not compatible: {0}")]
    Platform(String),

    #[error("could not pick an RW slot: {0}")]
    Target(String),

    #[error("target not signed by current root key: {0}")]
    RootKey(String),

    #[error("{0}")]
    TpmRollback(String),

    #[error("{0}")]
    Unknown(String),

    /// Try-RW saw an `RO_SECTION` difference with write-protect disabled.
    /// Only [`crate::policy::update`] may observe and recover from this --
    /// everywhere else it must propagate like any other error.
    #[error("internal: needs RO update")]
    NeedRoUpdate,
}
