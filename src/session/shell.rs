//! Shell discovery and environment for local terminals.
//!
//! The lookup functions take the platform and a filesystem check as
//! arguments, so the same inputs always pick the same shell.

use crate::config::TerminalConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

pub const UNIX_SHELL_CANDIDATES: &[&str] = &[
    "/bin/zsh",
    "/usr/bin/zsh",
    "/bin/bash",
    "/usr/bin/bash",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/bin/dash",
];
pub const UNIX_FALLBACK_SHELL: &str = "/bin/sh";

const MACOS_PATH_ADDITIONS: &[&str] = &[
    "/opt/homebrew/bin",
    "/opt/homebrew/sbin",
    "/usr/local/bin",
    "/usr/bin",
    "/bin",
    "/usr/sbin",
    "/sbin",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Macos,
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Macos
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Unix
        }
    }

    pub fn is_windows(self) -> bool {
        matches!(self, Platform::Windows)
    }

    pub fn name(self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Macos => "macos",
            Platform::Windows => "windows",
            Platform::Unix => std::env::consts::OS,
        }
    }

    fn path_separator(self) -> char {
        if self.is_windows() { ';' } else { ':' }
    }
}

/// Inputs to shell discovery that come from outside the filesystem.
#[derive(Debug, Default, Clone)]
pub struct ShellHints<'a> {
    pub override_shell: Option<&'a str>,
    pub env_shell: Option<&'a str>,
    pub comspec: Option<&'a str>,
    /// Shells that already failed to start.
    pub skip: &'a [PathBuf],
}

/// Picks the shell for a new terminal.
///
/// Unix tries the override, `$SHELL`, then the fixed candidate list and
/// keeps the first that `exists` and is not skipped, falling back to
/// `/bin/sh`. Windows names executables for PATH resolution instead of
/// probing the disk.
pub fn find_available_shell(
    platform: Platform,
    hints: &ShellHints<'_>,
    exists: impl Fn(&Path) -> bool,
) -> PathBuf {
    let skipped = |path: &Path| hints.skip.iter().any(|failed| failed == path);

    if platform.is_windows() {
        let candidates = [
            non_empty(hints.override_shell),
            Some("powershell.exe"),
            Some(non_empty(hints.comspec).unwrap_or("cmd.exe")),
        ];
        return candidates
            .into_iter()
            .flatten()
            .map(PathBuf::from)
            .find(|path| !skipped(path.as_path()))
            .unwrap_or_else(|| PathBuf::from("cmd.exe"));
    }

    let preferred = [non_empty(hints.override_shell), non_empty(hints.env_shell)];
    preferred
        .into_iter()
        .flatten()
        .chain(UNIX_SHELL_CANDIDATES.iter().copied())
        .map(PathBuf::from)
        .find(|path| !skipped(path.as_path()) && exists(path.as_path()))
        .unwrap_or_else(|| PathBuf::from(UNIX_FALLBACK_SHELL))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn shell_name(shell: &Path) -> String {
    shell
        .file_stem()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

pub fn shell_args(shell: &Path, login_shell: bool) -> Vec<String> {
    match shell_name(shell).as_str() {
        "bash" | "zsh" | "fish" if login_shell => vec!["-l".to_string()],
        "powershell" | "pwsh" => vec!["-NoLogo".to_string()],
        _ => Vec::new(),
    }
}

/// Builds the child environment from `base`.
///
/// Names and values stay as raw OS strings, so variables that are not
/// UTF-8 pass through untouched. `TERM`, `COLORTERM` and `LANG` get
/// defaults when unset or empty. On macOS the usual system and Homebrew
/// directories are appended to `PATH`, then `extra_path` on every
/// platform; entries already present keep their position.
pub fn prepare_environment<I>(
    base: I,
    platform: Platform,
    term: &str,
    extra_path: &[String],
) -> BTreeMap<OsString, OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: BTreeMap<OsString, OsString> = base.into_iter().collect();

    for (key, default) in [
        ("TERM", term),
        ("COLORTERM", "truecolor"),
        ("LANG", "en_US.UTF-8"),
    ] {
        let entry = env.entry(OsString::from(key)).or_default();
        if entry.is_empty() {
            *entry = OsString::from(default);
        }
    }

    let mut additions: Vec<&str> = Vec::new();
    if platform == Platform::Macos {
        additions.extend(MACOS_PATH_ADDITIONS);
    }
    additions.extend(extra_path.iter().map(String::as_str));
    if additions.is_empty() {
        return env;
    }

    // Windows spells it `Path`; keep whatever key the parent used.
    let path_key = env
        .keys()
        .find(|key| key.eq_ignore_ascii_case("PATH"))
        .cloned()
        .unwrap_or_else(|| OsString::from("PATH"));
    let current = env.get(&path_key).cloned().unwrap_or_default();
    let Some(current) = current.to_str() else {
        tracing::debug!("PATH is not valid UTF-8; leaving it unchanged");
        return env;
    };
    let separator = platform.path_separator();
    let mut entries: Vec<String> = current
        .split(separator)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect();
    for addition in additions {
        if !addition.is_empty() && !entries.iter().any(|entry| entry == addition) {
            entries.push(addition.to_string());
        }
    }
    env.insert(path_key, OsString::from(entries.join(&separator.to_string())));
    env
}

/// Home directory when it is usable, otherwise the filesystem root.
pub fn working_directory(
    platform: Platform,
    home: Option<PathBuf>,
    is_dir: impl Fn(&Path) -> bool,
) -> PathBuf {
    match home {
        Some(home) if !home.as_os_str().is_empty() && is_dir(&home) => home,
        _ if platform.is_windows() => PathBuf::from("C:\\"),
        _ => PathBuf::from("/"),
    }
}

fn home_dir(platform: Platform) -> Option<PathBuf> {
    let keys: &[&str] = if platform.is_windows() {
        &["USERPROFILE", "HOME"]
    } else {
        &["HOME"]
    };
    keys.iter()
        .filter_map(|key| env::var_os(key))
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Everything needed to start one shell on a pty.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchPlan {
    pub platform: Platform,
    pub shell: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    #[serde(skip)]
    pub env: BTreeMap<OsString, OsString>,
}

impl LaunchPlan {
    /// Resolves a plan against the live process environment and disk.
    pub fn resolve(config: &TerminalConfig, skip: &[PathBuf]) -> Self {
        let platform = Platform::current();
        let env_shell = env::var_os("SHELL").and_then(utf8_value);
        let comspec = env::var_os("COMSPEC").and_then(utf8_value);
        let hints = ShellHints {
            override_shell: config.shell.as_deref(),
            env_shell: env_shell.as_deref(),
            comspec: comspec.as_deref(),
            skip,
        };
        let shell = find_available_shell(platform, &hints, Path::is_file);
        let args = shell_args(&shell, config.login_shell);
        let cwd = working_directory(platform, home_dir(platform), Path::is_dir);
        let env = prepare_environment(env::vars_os(), platform, &config.term, &config.extra_path);
        Self {
            platform,
            shell,
            args,
            cwd,
            env,
        }
    }

    pub fn path_variable(&self) -> Option<&OsStr> {
        self.env
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("PATH"))
            .map(|(_, value)| value.as_os_str())
    }
}

fn utf8_value(value: OsString) -> Option<String> {
    value.into_string().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs
            .iter()
            .map(|(key, value)| (OsString::from(key), OsString::from(value)))
            .collect()
    }

    fn disk(paths: &[&str]) -> impl Fn(&Path) -> bool {
        let present: HashSet<PathBuf> = paths.iter().map(PathBuf::from).collect();
        move |path: &Path| present.contains(path)
    }

    #[test]
    fn unix_prefers_override_then_env_shell() {
        let exists = disk(&["/usr/bin/fish", "/bin/zsh", "/bin/bash"]);
        let hints = ShellHints {
            override_shell: Some("/usr/bin/fish"),
            env_shell: Some("/bin/bash"),
            ..ShellHints::default()
        };
        assert_eq!(
            find_available_shell(Platform::Linux, &hints, &exists),
            PathBuf::from("/usr/bin/fish")
        );
        let hints = ShellHints {
            env_shell: Some("/bin/bash"),
            ..ShellHints::default()
        };
        assert_eq!(
            find_available_shell(Platform::Linux, &hints, &exists),
            PathBuf::from("/bin/bash")
        );
    }

    #[test]
    fn unix_walks_candidates_and_skips_missing() {
        let exists = disk(&["/usr/bin/bash", "/bin/dash"]);
        let hints = ShellHints {
            override_shell: Some("/opt/missing/zsh"),
            env_shell: Some("   "),
            ..ShellHints::default()
        };
        assert_eq!(
            find_available_shell(Platform::Macos, &hints, &exists),
            PathBuf::from("/usr/bin/bash")
        );
    }

    #[test]
    fn unix_skips_failed_shell_and_falls_back_to_sh() {
        let exists = disk(&["/bin/bash"]);
        let failed = vec![PathBuf::from("/bin/bash")];
        let hints = ShellHints {
            skip: &failed,
            ..ShellHints::default()
        };
        assert_eq!(
            find_available_shell(Platform::Linux, &hints, &exists),
            PathBuf::from(UNIX_FALLBACK_SHELL)
        );
    }

    #[test]
    fn discovery_is_deterministic() {
        let exists = disk(&["/bin/zsh", "/bin/bash"]);
        let hints = ShellHints::default();
        let first = find_available_shell(Platform::Linux, &hints, &exists);
        for _ in 0..10 {
            assert_eq!(find_available_shell(Platform::Linux, &hints, &exists), first);
        }
        assert_eq!(first, PathBuf::from("/bin/zsh"));
    }

    #[test]
    fn windows_uses_powershell_then_comspec() {
        let nothing = disk(&[]);
        let hints = ShellHints {
            comspec: Some("C:\\Windows\\system32\\cmd.exe"),
            ..ShellHints::default()
        };
        assert_eq!(
            find_available_shell(Platform::Windows, &hints, &nothing),
            PathBuf::from("powershell.exe")
        );
        let failed = vec![PathBuf::from("powershell.exe")];
        let hints = ShellHints {
            comspec: Some("C:\\Windows\\system32\\cmd.exe"),
            skip: &failed,
            ..ShellHints::default()
        };
        assert_eq!(
            find_available_shell(Platform::Windows, &hints, &nothing),
            PathBuf::from("C:\\Windows\\system32\\cmd.exe")
        );
    }

    #[test]
    fn shell_args_follow_shell_kind() {
        assert_eq!(shell_args(Path::new("/bin/bash"), true), vec!["-l"]);
        assert_eq!(shell_args(Path::new("/usr/bin/fish"), true), vec!["-l"]);
        assert!(shell_args(Path::new("/bin/zsh"), false).is_empty());
        assert!(shell_args(Path::new("/bin/sh"), true).is_empty());
        assert_eq!(
            shell_args(Path::new("powershell.exe"), true),
            vec!["-NoLogo"]
        );
    }

    #[test]
    fn environment_defaults_fill_unset_and_empty() {
        let base = vars(&[
            ("TERM", ""),
            ("LANG", "de_DE.UTF-8"),
            ("PATH", "/usr/bin:/bin"),
        ]);
        let env = prepare_environment(base, Platform::Linux, "xterm-256color", &[]);
        assert_eq!(env[OsStr::new("TERM")], "xterm-256color");
        assert_eq!(env[OsStr::new("COLORTERM")], "truecolor");
        assert_eq!(env[OsStr::new("LANG")], "de_DE.UTF-8");
        assert_eq!(env[OsStr::new("PATH")], "/usr/bin:/bin");
    }

    #[test]
    fn macos_path_is_augmented_without_duplicates() {
        let base = vars(&[("PATH", "/usr/bin:/custom/bin")]);
        let env = prepare_environment(base, Platform::Macos, "xterm-256color", &[]);
        assert_eq!(
            env[OsStr::new("PATH")],
            "/usr/bin:/custom/bin:/opt/homebrew/bin:/opt/homebrew/sbin:/usr/local/bin:/bin:/usr/sbin:/sbin"
        );
    }

    #[test]
    fn extra_path_uses_existing_windows_key() {
        let base = vars(&[("Path", "C:\\Windows")]);
        let env = prepare_environment(
            base,
            Platform::Windows,
            "xterm-256color",
            &["C:\\Tools".to_string()],
        );
        assert_eq!(env[OsStr::new("Path")], "C:\\Windows;C:\\Tools");
        assert!(!env.contains_key(OsStr::new("PATH")));
    }

    #[test]
    fn working_directory_falls_back_to_root() {
        let is_dir = disk(&["/home/op"]);
        assert_eq!(
            working_directory(Platform::Linux, Some(PathBuf::from("/home/op")), &is_dir),
            PathBuf::from("/home/op")
        );
        assert_eq!(
            working_directory(Platform::Linux, Some(PathBuf::from("/home/gone")), &is_dir),
            PathBuf::from("/")
        );
        assert_eq!(
            working_directory(Platform::Windows, None, &is_dir),
            PathBuf::from("C:\\")
        );
    }

    #[cfg(unix)]
    #[test]
    fn environment_keeps_values_that_are_not_utf8() {
        use std::os::unix::ffi::OsStringExt;

        let raw = OsString::from_vec(vec![b'a', 0xff, 0xfe]);
        let raw_path = OsString::from_vec(b"/usr/bin:/opt/\xffbin".to_vec());
        let base = vec![
            (OsString::from("BLOB"), raw.clone()),
            (OsString::from("PATH"), raw_path.clone()),
        ];
        let env = prepare_environment(
            base,
            Platform::Macos,
            "xterm-256color",
            &["/extra".to_string()],
        );
        assert_eq!(env[OsStr::new("BLOB")], raw);
        // PATH that cannot be split as text is passed through unchanged.
        assert_eq!(env[OsStr::new("PATH")], raw_path);
        assert_eq!(env[OsStr::new("TERM")], "xterm-256color");
    }

    #[cfg(unix)]
    #[test]
    fn resolve_survives_non_utf8_process_environment() {
        use std::os::unix::ffi::OsStrExt;

        let key = "NETBRIDGE_TEST_NON_UTF8_VALUE";
        let value = OsStr::from_bytes(&[0xff, 0xfe]);
        // SAFETY: the variable name is unique to this test.
        unsafe { env::set_var(key, value) };
        let plan = LaunchPlan::resolve(&TerminalConfig::default(), &[]);
        unsafe { env::remove_var(key) };
        assert_eq!(plan.env.get(OsStr::new(key)).map(OsString::as_os_str), Some(value));
        assert!(!plan.shell.as_os_str().is_empty());
    }
}
