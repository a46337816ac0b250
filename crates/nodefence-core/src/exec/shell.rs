//! Quoting for scripts executed by a remote POSIX shell.
//!
//! The liveness probe ships a one-line script over ssh, and ssh hands that
//! string to the remote user's shell. Every value interpolated into the
//! script (the rid, status file paths) must be quoted for that shell, not for
//! the local one, so the unix rules are used unconditionally.

use std::borrow::Cow;

/// Quotes `value` as a single word for a POSIX shell.
///
/// Values made only of safe characters pass through unchanged; anything else
/// is wrapped in single quotes with embedded quotes escaped.
#[must_use]
pub fn quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}

/// Quotes each word and joins them with single spaces.
#[must_use]
pub fn join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
