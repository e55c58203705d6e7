//! Change detection for entities loaded into a session.
//!
//! An entity the application modified without calling `persist` is found
//! at prepare time by re-serializing it and comparing the digest with the
//! one recorded when it was loaded or last committed.

use fsdoc_types::ContentDigest;

use crate::entry::Entry;
use crate::error::SessionResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Dirtiness {
    Clean,
    /// The natural id changed, so the file moves.
    Renamed,
    Modified,
}

/// Cheap check that only compares natural ids.
pub(crate) fn renamed(entry: &Entry) -> SessionResult<bool> {
    let meta = entry.descriptor.meta(entry.object())?;
    Ok(entry.path.is_some() && meta.natural_id != entry.natural_id)
}

/// Full check. Entries that were never written have no digest and are
/// reported clean; their pending insert covers them.
pub(crate) fn check(entry: &Entry) -> SessionResult<Dirtiness> {
    if renamed(entry)? {
        return Ok(Dirtiness::Renamed);
    }
    let Some(recorded) = entry.digest else {
        return Ok(Dirtiness::Clean);
    };
    let bytes = entry.descriptor.serialize(entry.object())?;
    if ContentDigest::of(&bytes) == recorded {
        Ok(Dirtiness::Clean)
    } else {
        Ok(Dirtiness::Modified)
    }
}
