//! Error taxonomy for the extraction pipeline.
//!
//! Errors fall into three classes:
//!
//! - **Resource exhaustion** (`PixstackFull`, `ObjectsLimit`,
//!   `DeblendOverflow`, `AllocFail`): the extraction aborts, working state is
//!   released, and the caller may retry after raising the corresponding
//!   tuning knob in [`crate::tunables`].
//! - **Argument validation** (`UnsupportedDtype`, `IllegalArg`,
//!   `RelthreshNoNoise`): detected before any work begins.
//! - **Numeric degeneracy** (singular moments, all-masked apertures) is
//!   never an error; it is reported per-object through flag bits.

use thiserror::Error;

/// Maximum length of the detail string, matching the original C surface.
const DETAIL_MAX: usize = 512;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A working buffer could not be allocated.
    #[error("memory allocation failed")]
    AllocFail {
        /// Which buffer failed, e.g. "pixel arena".
        what: &'static str,
    },

    /// The shared pixel arena filled up during segmentation.
    #[error("internal pixel buffer full")]
    PixstackFull {
        /// Capacity at the time of failure (see [`crate::tunables::set_extract_pixstack`]).
        capacity: usize,
    },

    /// Too many provisional objects were started during segmentation.
    #[error("limit of detected objects reached")]
    ObjectsLimit {
        /// Capacity at the time of failure (see [`crate::tunables::set_extract_object_limit`]).
        capacity: usize,
    },

    /// Multi-threshold deblending produced more sub-objects than allowed.
    #[error("object deblending overflow")]
    DeblendOverflow {
        /// Capacity at the time of failure (see [`crate::tunables::set_sub_object_limit`]).
        capacity: usize,
    },

    /// An input or output plane has an element type the operation cannot use.
    #[error("data type not supported")]
    UnsupportedDtype {
        dtype: &'static str,
        context: &'static str,
    },

    /// A parameter failed validation before any work began.
    #[error("illegal argument")]
    IllegalArg { detail: String },

    /// A relative detection threshold was requested on an image that carries
    /// neither a noise plane nor a scalar noise value.
    #[error("relative threshold requested but image has no noise")]
    RelthreshNoNoise,
}

impl Error {
    /// Stable integer status code, for parity with C-style callers.
    pub fn status(&self) -> i32 {
        match self {
            Error::AllocFail { .. } => 1,
            Error::PixstackFull { .. } => 2,
            Error::ObjectsLimit { .. } => 3,
            Error::DeblendOverflow { .. } => 4,
            Error::UnsupportedDtype { .. } => 5,
            Error::IllegalArg { .. } => 6,
            Error::RelthreshNoNoise => 7,
        }
    }

    /// Short descriptive message, at most 60 characters.
    pub fn message(&self) -> String {
        let msg = self.to_string();
        debug_assert!(msg.len() <= 60, "error message exceeds 60 chars: {msg}");
        msg
    }

    /// Longer message with specifics about the failure, at most 512 characters.
    pub fn detail(&self) -> String {
        let mut detail = match self {
            Error::AllocFail { what } => {
                format!("could not allocate the {what}")
            }
            Error::PixstackFull { capacity } => format!(
                "object pixel arena of {capacity} entries exhausted; \
                 raise it with set_extract_pixstack() and retry"
            ),
            Error::ObjectsLimit { capacity } => format!(
                "provisional object table of {capacity} entries exhausted; \
                 raise it with set_extract_object_limit() and retry"
            ),
            Error::DeblendOverflow { capacity } => format!(
                "deblending tree exceeded {capacity} sub-objects; \
                 raise it with set_sub_object_limit() and retry"
            ),
            Error::UnsupportedDtype { dtype, context } => {
                format!("element type {dtype} is not supported for {context}")
            }
            Error::IllegalArg { detail } => detail.clone(),
            Error::RelthreshNoNoise => {
                "a relative detection threshold needs a noise array or a \
                 scalar noise value on the input image"
                    .to_owned()
            }
        };
        detail.truncate(DETAIL_MAX);
        detail
    }
}

/// Convenience constructor for argument-validation failures.
pub(crate) fn illegal_arg(detail: impl Into<String>) -> Error {
    Error::IllegalArg {
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_distinct() {
        let errors = [
            Error::AllocFail { what: "x" },
            Error::PixstackFull { capacity: 1 },
            Error::ObjectsLimit { capacity: 1 },
            Error::DeblendOverflow { capacity: 1 },
            Error::UnsupportedDtype {
                dtype: "u8",
                context: "x",
            },
            Error::IllegalArg {
                detail: "x".into(),
            },
            Error::RelthreshNoNoise,
        ];
        let mut codes: Vec<i32> = errors.iter().map(Error::status).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_messages_fit_short_form() {
        let errors = [
            Error::AllocFail { what: "pixel arena" },
            Error::PixstackFull { capacity: 300_000 },
            Error::ObjectsLimit { capacity: 60_000 },
            Error::DeblendOverflow { capacity: 1024 },
            Error::UnsupportedDtype {
                dtype: "i32",
                context: "background output",
            },
            Error::RelthreshNoNoise,
        ];
        for err in &errors {
            assert!(err.message().len() <= 60);
            assert!(err.detail().len() <= 512);
        }
    }
}
