use std::env;
use std::path::Path;
use std::process::Command;

fn main() {
    let label = env::var("NETBRIDGE_VERSION_LABEL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    let git_sha = git_revision();
    let build_time = build_timestamp();

    println!("cargo:rustc-env=NETBRIDGE_VERSION_LABEL={label}");
    println!("cargo:rustc-env=NETBRIDGE_GIT_SHA={git_sha}");
    println!("cargo:rustc-env=NETBRIDGE_BUILD_TIME={build_time}");

    println!("cargo:rerun-if-env-changed=NETBRIDGE_VERSION_LABEL");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=.git/HEAD");
}

fn git_revision() -> String {
    if let Ok(value) = env::var("GITHUB_SHA") {
        let value = value.trim();
        return value.chars().take(7).collect();
    }
    if !Path::new(".git").exists() {
        return String::new();
    }
    let Some(sha) = git(&["rev-parse", "--short", "HEAD"]) else {
        return String::new();
    };
    let dirty = git(&["status", "--porcelain"]).is_some();
    if dirty { format!("{sha}-dirty") } else { sha }
}

fn build_timestamp() -> String {
    let rfc3339 = &time::format_description::well_known::Rfc3339;
    let reproducible = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .and_then(|epoch| time::OffsetDateTime::from_unix_timestamp(epoch).ok());
    reproducible
        .unwrap_or_else(time::OffsetDateTime::now_utc)
        .format(rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
