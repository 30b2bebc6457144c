//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for DriftFS.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DriftError(pub String);

impl fmt::Display for DriftError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for DriftError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `DriftError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for DriftError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                DriftError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DriftError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        DriftError(e.to_string())
    }
}
