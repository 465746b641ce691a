//! Error types for the `sifter` binary.

use thiserror::Error;

use super::*;

/// Error type alias used throughout the binary.
pub type Result<T> = core::result::Result<T, SifterCliError>;

/// Errors that end a `sifter` invocation.
#[derive(Error, Debug)]
pub enum SifterCliError {
  /// The configuration could not be loaded or is unusable.
  #[error("Configuration error: {0}")]
  Config(String),

  /// The pipeline reported an error.
  #[error(transparent)]
  Sifter(#[from] SifterError),

  /// Writing run outputs failed.
  #[error(transparent)]
  Io(#[from] std::io::Error),

  /// Serializing run outputs failed.
  #[error(transparent)]
  Json(#[from] serde_json::Error),
}

impl SifterCliError {
  /// Process exit code: `2` for configuration problems, `1` for everything else.
  ///
  /// A clean stop after Ctrl-C is not an error and exits with `0`.
  pub fn exit_code(&self) -> u8 {
    match self {
      SifterCliError::Config(_)
      | SifterCliError::Sifter(SifterError::Config(_) | SifterError::TomlDe(_)) => 2,
      _ => 1,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn maps_exit_codes() {
    assert_eq!(SifterCliError::Config("bad".into()).exit_code(), 2);
    assert_eq!(SifterCliError::from(SifterError::Config("no key".into())).exit_code(), 2);
    let fatal = SifterError::FatalThreshold { failed: 6, total: 10, threshold: 0.5 };
    assert_eq!(SifterCliError::from(fatal).exit_code(), 1);
  }
}
