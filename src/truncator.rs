//! The crash-recovery hook a caller plugs into [`crate::Deque::parse_and_truncate`].

/// What to do with one record found during recovery scanning.
pub enum TruncatorAction {
    /// The record is well-formed; keep it and continue to the next one.
    Keep,
    /// The record (and everything after it in the segment) is invalid;
    /// drop it and stop scanning this segment.
    FullTruncate,
    /// The record is salvageable in modified form. The closure is given a
    /// scratch buffer to write the replacement bytes into and must return
    /// how many of them it used; the segment is truncated immediately
    /// after the rewritten record.
    PartialTruncate(Box<dyn FnOnce(&mut [u8]) -> usize + Send>),
}

/// Caller-supplied validator invoked once per record while recovering a
/// deque from segments left behind by a prior, possibly unclean, shutdown.
pub trait Truncator {
    type Error;

    /// Inspects one record's raw bytes and decides whether to keep it,
    /// discard it, or rewrite it in place.
    fn parse(&mut self, record: &[u8]) -> std::result::Result<TruncatorAction, Self::Error>;
}

/// A truncator that keeps every record unconditionally, for callers that
/// just want segment files reopened without any validation pass.
pub struct AcceptAll;

impl Truncator for AcceptAll {
    type Error = std::convert::Infallible;

    fn parse(&mut self, _record: &[u8]) -> std::result::Result<TruncatorAction, Self::Error> {
        Ok(TruncatorAction::Keep)
    }
}
