//! Crate-wide constants.

pub const APP_NAME: &str = "treebuild";

/// The only manifest format version this engine accepts.
pub const MANIFEST_VERSION: &str = "2";

/// Environment variable overriding the store location.
pub const STORE_ENV: &str = "TREEBUILD_STORE";

/// Environment variable overriding the module library directory.
pub const LIBDIR_ENV: &str = "TREEBUILD_LIBDIR";

pub const DEFAULT_STORE_DIR: &str = ".treebuild";
pub const DEFAULT_LIBDIR: &str = "/usr/lib/treebuild";

/// Name given to the pipeline synthesized from a build-environment document.
pub const BUILD_ENV_PIPELINE: &str = "build-env";

/// Prefix accepted in front of pipeline references (`name:<pipeline>`).
pub const PIPELINE_REF_PREFIX: &str = "name:";
