use std::sync::LazyLock;

/// Defines the application version.
///
/// `IMAGE_VERSION` is always set by the build script, the git fields only when the
/// crate is built from a git checkout.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let sha = option_env!("VERGEN_GIT_SHA").unwrap_or("unknown");
    let dirty = matches!(option_env!("VERGEN_GIT_DIRTY"), Some("true"));
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        sha,
        if dirty { "-dirty" } else { "" }
    )
});
