// keg-core/src/build/devtools.rs
// Host probing: compiler lookup and environment fact detection.

use std::env;
use std::path::PathBuf;

use keg_aio::process::run_command_async;
use keg_common::error::{KegError, Result};
use keg_common::model::facts::{Arch, EnvironmentFacts, OsFamily};
use keg_common::model::version::lenient_version;
use tracing::debug;

pub fn find_compiler(name: &str) -> Result<PathBuf> {
    let env_var_name = match name {
        "cc" => "CC",
        "c++" | "cxx" => "CXX",
        _ => "",
    };
    if !env_var_name.is_empty() {
        if let Ok(compiler_path) = env::var(env_var_name) {
            let path = PathBuf::from(compiler_path);
            if path.is_file() {
                debug!("Using compiler from env var {}: {}", env_var_name, path.display());
                return Ok(path);
            }
            debug!(
                "Env var {} points to non-existent file: {}",
                env_var_name,
                path.display()
            );
        }
    }

    debug!("Searching PATH for '{name}'");
    which::which(name).map_err(|e| {
        KegError::Configuration(format!("Failed to find compiler '{name}' on PATH: {e}"))
    })
}

/// Major component of a `uname -r` release string (`"20.6.0"` -> 20,
/// `"6.8.0-45-generic"` -> 6).
pub fn parse_os_major(release: &str) -> Option<u32> {
    release
        .trim()
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|major| major.parse().ok())
}

async fn command_stdout(command: &str, args: &[&str]) -> Option<String> {
    match run_command_async(command, args, None).await {
        Ok(out) if out.status.success() => {
            Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
        }
        Ok(_) => None,
        Err(e) => {
            debug!("Probe `{command}` unavailable: {e}");
            None
        }
    }
}

/// Derives facts from the running host. The toolchain version comes from
/// `cc -dumpversion` and is left unset when no compiler answers. Options are
/// empty; callers add them with [`EnvironmentFacts::with_option`].
pub async fn detect_environment_facts() -> Result<EnvironmentFacts> {
    let release = command_stdout("uname", &["-r"]).await.ok_or_else(|| {
        KegError::CommandExec("`uname -r` failed; cannot determine OS version".to_string())
    })?;
    let os_major = parse_os_major(&release).ok_or_else(|| {
        KegError::Parse("uname", format!("Unrecognised release string '{release}'"))
    })?;

    let mut facts = EnvironmentFacts::new(Arch::current(), OsFamily::current(), os_major);
    if let Some(raw) = command_stdout("cc", &["-dumpversion"]).await {
        match lenient_version(&raw) {
            Ok(version) => facts = facts.with_toolchain(version),
            Err(e) => debug!("Ignoring unparseable toolchain version '{raw}': {e}"),
        }
    }
    debug!(
        "Detected environment: {} {} {} toolchain={:?}",
        facts.arch, facts.os, facts.os_major, facts.toolchain
    );
    Ok(facts)
}
