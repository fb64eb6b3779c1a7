const WITH_GIT: &str = concat!(
    env!("NETBRIDGE_VERSION_LABEL"),
    " (git ",
    env!("NETBRIDGE_GIT_SHA"),
    ", built ",
    env!("NETBRIDGE_BUILD_TIME"),
    ")",
);
const WITHOUT_GIT: &str = concat!(
    env!("NETBRIDGE_VERSION_LABEL"),
    " (built ",
    env!("NETBRIDGE_BUILD_TIME"),
    ")",
);

/// Version string shown by `--version`.
pub const VERSION: &str = if env!("NETBRIDGE_GIT_SHA").is_empty() {
    WITHOUT_GIT
} else {
    WITH_GIT
};
