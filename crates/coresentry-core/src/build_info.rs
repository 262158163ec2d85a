//! Build-time metadata embedded by the build script.
//!
//! The daemon logs these at startup and the CLI prints them with
//! `--version`.

/// The git commit hash at build time (short form).
pub const GIT_HASH: &str = env!("CORESENTRY_GIT_HASH");

/// The build timestamp as a Unix epoch string.
pub const BUILD_TIMESTAMP: &str = env!("CORESENTRY_BUILD_TIMESTAMP");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("CORESENTRY_BUILD_PROFILE");

/// The crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Return a formatted version string including git hash and profile.
///
/// Example: `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

/// Multi-line build report for the CLI `version` command.
pub fn long_version() -> String {
    format!(
        "coresentry {VERSION}\ncommit:  {GIT_HASH}\nprofile: {BUILD_PROFILE}\nbuilt:   {BUILD_TIMESTAMP}"
    )
}
