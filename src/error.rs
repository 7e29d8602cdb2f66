//! `Error` and `Result` types arising out of datastore operations.
//!
//! There is one error type for the whole crate. Every error carries a
//! machine-readable [`ErrorKind`] and a human-readable message; the kinds
//! that have structured payload carry it in dedicated fields (the
//! offending key and field of a unique violation, the measured ratio of a
//! refused load) rather than in the message alone, and errors wrapping a
//! lower-level failure keep it reachable through `std::error::Error::source`.

use std::borrow::Cow;
use std::error;
use std::fmt;
use std::io;
use std::result;
use bson::Bson;

/// Type alias for a `Result` containing a Medlar `Error`.
pub type Result<T> = result::Result<T, Error>;

/// A structured, "machine-readable" error kind.
#[allow(clippy::stutter)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A field name began with `$` or contained a `.` in a user document.
    InvalidFieldName,
    /// A malformed query: `$or` with a non-array argument, an unknown
    /// logical or comparison operator, `$regex` with a non-regex argument,
    /// `$size` with a non-integer, a projection mixing inclusion and
    /// exclusion, or a sort specification that is not `±1`.
    InvalidQuery,
    /// A malformed update: an unknown modifier, a wrong argument shape, or
    /// a modifier applied to a target of the wrong type.
    InvalidModifier,
    /// A unique index rejected a key that is already present for another
    /// document. [`Error::unique_key`] and [`Error::unique_field`] name
    /// the offender.
    UniqueViolated,
    /// The data file had more unparseable lines than the corruption alert
    /// threshold tolerates. [`Error::corruption_ratio`] reports the
    /// measured fraction.
    Corruption,
    /// Exactly one of the two serialization hooks was declared, or the hook
    /// pair failed the bijection check on the canary string.
    HookMismatch,
    /// A document was missing its `_id` where one was required.
    MissingId,
    /// There was an error transcoding a document line to or from JSON.
    JsonTranscoding,
    /// An underlying filesystem error.
    Io,
}

impl ErrorKind {
    /// Returns a human-readable error description for this kind.
    pub fn as_str(self) -> &'static str {
        use self::ErrorKind::*;

        match self {
            InvalidFieldName => "invalid field name",
            InvalidQuery     => "invalid query",
            InvalidModifier  => "invalid update modifier",
            UniqueViolated   => "unique constraint violated",
            Corruption       => "data file corruption",
            HookMismatch     => "serialization hook mismatch",
            MissingId        => "missing unique identifier",
            JsonTranscoding  => "JSON transcoding error",
            Io               => "I/O error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// The central error type for Medlar.
#[derive(Debug)]
pub struct Error {
    /// The structured, "machine-readable" kind of this error.
    kind: ErrorKind,
    /// The human-readable description, grown at the front as the error
    /// travels up the stack (see [`ResultExt`]).
    message: Cow<'static, str>,
    /// The offending key of a unique violation.
    unique_key: Option<Bson>,
    /// The indexed field of a unique violation.
    unique_field: Option<String>,
    /// The measured malformed-line fraction of a refused load.
    corruption_ratio: Option<f64>,
    /// The lower-level failure this error wraps, if any.
    source: Option<Box<dyn error::Error + 'static>>,
}

impl Error {
    /// Creates an error with the specified kind and message and no
    /// structured payload.
    /// ```
    /// # extern crate medlar;
    /// #
    /// # use medlar::error::{ Error, ErrorKind };
    /// #
    /// # fn main() {
    /// #
    /// let error = Error::new(ErrorKind::MissingId, "sample error message");
    /// assert_eq!(error.kind(), ErrorKind::MissingId);
    /// assert!(error.to_string().contains("sample error message"));
    /// #
    /// # }
    /// ```
    pub fn new<S>(kind: ErrorKind, message: S) -> Self
        where S: Into<Cow<'static, str>>
    {
        Error {
            kind,
            message: message.into(),
            unique_key: None,
            unique_field: None,
            corruption_ratio: None,
            source: None,
        }
    }

    /// A unique-constraint rejection, carrying the offending key and the
    /// indexed field it collided on.
    /// ```
    /// # extern crate bson;
    /// # extern crate medlar;
    /// #
    /// # use bson::Bson;
    /// # use medlar::error::{ Error, ErrorKind };
    /// #
    /// # fn main() {
    /// #
    /// let error = Error::unique_violated(Bson::from(5), "email");
    /// assert_eq!(error.kind(), ErrorKind::UniqueViolated);
    /// assert_eq!(error.unique_key(), Some(&Bson::from(5)));
    /// assert_eq!(error.unique_field(), Some("email"));
    /// #
    /// # }
    /// ```
    pub fn unique_violated<F: Into<String>>(key: Bson, field_name: F) -> Self {
        let field_name = field_name.into();
        let message = format!(
            "can't insert key {:?}, it violates the unique constraint on field `{}`",
            key, field_name,
        );

        Error {
            unique_key: Some(key),
            unique_field: Some(field_name),
            ..Error::new(ErrorKind::UniqueViolated, message)
        }
    }

    /// A refused load: `corrupt` of `total` non-empty lines failed to
    /// parse, which is more than the configured threshold tolerates.
    #[allow(clippy::cast_precision_loss)]
    pub fn corruption(corrupt: usize, total: usize, threshold: f64) -> Self {
        let ratio = if total == 0 { 0.0 } else { corrupt as f64 / total as f64 };
        let message = format!(
            "{} out of {} lines are corrupt; more than the {} threshold",
            corrupt, total, threshold,
        );

        Error {
            corruption_ratio: Some(ratio),
            ..Error::new(ErrorKind::Corruption, message)
        }
    }

    /// The structured kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The offending key, when this is a unique violation.
    pub fn unique_key(&self) -> Option<&Bson> {
        self.unique_key.as_ref()
    }

    /// The violated index's field name, when this is a unique violation.
    pub fn unique_field(&self) -> Option<&str> {
        self.unique_field.as_ref().map(String::as_str)
    }

    /// The measured malformed-line fraction, when this is a refused load.
    pub fn corruption_ratio(&self) -> Option<f64> {
        self.corruption_ratio
    }

    /// Prefixes the message with higher-level context, leaving the kind
    /// and the structured payload untouched.
    fn annotate(mut self, context: Cow<'static, str>) -> Self {
        self.message = Cow::Owned(format!("{}: {}", context, self.message));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;

        if let Some(source) = self.source.as_ref() {
            write!(f, ", caused by: {}", source)?
        }

        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source.as_ref().map(|source| &**source)
    }
}

impl From<io::Error> for Error {
    fn from(cause: io::Error) -> Self {
        Error {
            source: Some(Box::new(cause)),
            ..Error::new(ErrorKind::Io, "filesystem error")
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(cause: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(cause)),
            ..Error::new(ErrorKind::JsonTranscoding, "JSON transcoding error")
        }
    }
}

/// A trait for annotating errors with context on their way up the stack.
pub trait ResultExt<T>: Sized {
    /// If this `Result` is an `Err`, prefix its message with the given
    /// static context.
    /// ```
    /// # extern crate medlar;
    /// #
    /// # use medlar::error::{ Error, ErrorKind, Result, ResultExt };
    /// #
    /// # fn main() -> Result<()> {
    /// #
    /// let ok: Result<_> = Ok("success!");
    /// assert_eq!(ok.context("never shown")?, "success!");
    ///
    /// let err: Result<i32> = Err(Error::new(
    ///     ErrorKind::InvalidQuery, "inner detail"
    /// ));
    /// let annotated = err.context("while planning the query").unwrap_err();
    /// assert_eq!(annotated.kind(), ErrorKind::InvalidQuery);
    /// assert!(annotated.to_string().contains("while planning the query"));
    /// assert!(annotated.to_string().contains("inner detail"));
    /// #
    /// # Ok(())
    /// # }
    /// ```
    fn context(self, message: &'static str) -> Result<T>;

    /// If this `Result` is an `Err`, prefix its message with context built
    /// only on the error path.
    fn with_context<F: FnOnce() -> String>(self, message: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for result::Result<T, E> {
    fn context(self, message: &'static str) -> Result<T> {
        self.map_err(|error| error.into().annotate(Cow::Borrowed(message)))
    }

    fn with_context<F: FnOnce() -> String>(self, message: F) -> Result<T> {
        self.map_err(|error| error.into().annotate(Cow::Owned(message())))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;
    use super::*;

    #[test]
    fn context_preserves_kind_and_payload() {
        let base: Result<()> = Err(Error::unique_violated(Bson::from(5), "a"));
        let annotated = base.context("while inserting").unwrap_err();

        assert_eq!(annotated.kind(), ErrorKind::UniqueViolated);
        assert_eq!(annotated.unique_key(), Some(&Bson::from(5)));
        assert_eq!(annotated.unique_field(), Some("a"));
        assert!(annotated.to_string().contains("while inserting"));
        assert!(annotated.to_string().contains("unique constraint"));
    }

    #[test]
    fn corruption_reports_its_ratio() {
        let error = Error::corruption(2, 3, 0.1);

        assert_eq!(error.kind(), ErrorKind::Corruption);
        let ratio = error.corruption_ratio().unwrap();
        assert!((ratio - 2.0 / 3.0).abs() < 1e-9);
        assert!(error.unique_key().is_none());
    }

    #[test]
    fn io_errors_convert_and_keep_their_source() {
        let cause = io::Error::new(io::ErrorKind::NotFound, "no such file");
        let error = Error::from(cause);

        assert_eq!(error.kind(), ErrorKind::Io);
        assert!(error.source().is_some());
        assert!(error.to_string().contains("no such file"));
    }

    #[test]
    fn lazy_context_is_not_built_on_success() {
        let ok: Result<i32> = Ok(1);
        let value = ok
            .with_context(|| panic!("must not be called"))
            .unwrap();

        assert_eq!(value, 1);
    }

    #[test]
    fn display_leads_with_the_kind() {
        let error = Error::new(ErrorKind::InvalidModifier, "what happened");

        assert!(error.to_string().starts_with("invalid update modifier"));
        assert!(error.source().is_none());
    }
}
