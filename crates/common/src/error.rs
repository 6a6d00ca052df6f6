//! Context-chaining support for the per-crate error types.
//!
//! Each weft crate defines its own `Error` enum with [`thiserror`] and keeps
//! a `Message` variant for ad-hoc failures. Implementing [`FromMessage`] and
//! invoking [`impl_context!`](crate::impl_context) next to the enum gives the
//! crate `.context(..)` / `.with_context(..)` adapters on both `Result` and
//! `Option` without routing every error through one shared type.

/// Conversion from a plain message into a crate error.
///
/// The [`impl_context!`](crate::impl_context) expansion builds its errors
/// through this trait, which keeps the generated adapters decoupled from the
/// shape of any particular error enum.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Generates a crate-local `Context` extension trait.
///
/// Invoke once per crate, inside the module that defines `Error: FromMessage`
/// and `type Result<T> = std::result::Result<T, Error>`. The expansion adds:
///
/// * `.context(msg)` / `.with_context(f)` on `Result<T, E>` for any
///   displayable `E`, prefixing the message onto the source text;
/// * the same two methods on `Option<T>`, turning `None` into an error.
///
/// ```ignore
/// use weft_common::FromMessage;
///
/// #[derive(Debug, thiserror::Error)]
/// pub enum Error {
///     #[error("{message}")]
///     Message { message: String },
/// }
///
/// impl FromMessage for Error {
///     fn from_message(message: String) -> Self {
///         Self::Message { message }
///     }
/// }
///
/// pub type Result<T> = std::result::Result<T, Error>;
///
/// weft_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                let ctx = context.into();
                self.map_err(|source| {
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    let ctx = f().into();
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use crate::FromMessage;

    #[derive(Debug, thiserror::Error)]
    enum Error {
        #[error("{message}")]
        Message { message: String },
    }

    impl FromMessage for Error {
        fn from_message(message: String) -> Self {
            Self::Message { message }
        }
    }

    type Result<T> = std::result::Result<T, Error>;

    crate::impl_context!();

    fn parse(input: &str) -> std::result::Result<u32, std::num::ParseIntError> {
        input.parse()
    }

    #[test]
    fn context_prefixes_source_text() {
        let err = parse("nope").context("reading retry count").unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("reading retry count: "));
        assert!(text.contains("invalid digit"));
    }

    #[test]
    fn context_passes_ok_through() {
        assert_eq!(parse("7").context("reading retry count").unwrap(), 7);
    }

    #[test]
    fn with_context_is_lazy_on_ok() {
        let called = std::cell::Cell::new(false);
        let value = parse("3")
            .with_context(|| {
                called.set(true);
                "unused"
            })
            .unwrap();
        assert_eq!(value, 3);
        assert!(!called.get());
    }

    #[test]
    fn option_none_becomes_message() {
        let missing: Option<u32> = None;
        let err = missing.context("no such entry").unwrap_err();
        assert_eq!(err.to_string(), "no such entry");
    }

    #[test]
    fn option_some_is_untouched() {
        assert_eq!(Some(5).context("no such entry").unwrap(), 5);
    }
}
