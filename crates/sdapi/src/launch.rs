//! Per-device launch scripts.
//!
//! Each device gets its own copy of the user's `webui-user` script with the
//! command-line arguments rewritten to bind a private port and device id:
//! `--autolaunch` is dropped, `--api` is ensured, and any `--port` or
//! `--device-id` the user set is replaced.

use std::path::{Path, PathBuf};

const WINDOWS_ARGS_PREFIX: &str = "set COMMANDLINE_ARGS=";
const UNIX_ARGS_PREFIX: &str = "export COMMANDLINE_ARGS=";

/// Errors writing a device launch script.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("render backend launch script not found at {} (check SD_LOCATION)", .0.display())]
    MissingBaseScript(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Script flavour of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    /// The user's own launch script inside the backend directory.
    pub fn base_script_name(&self) -> &'static str {
        match self {
            Self::Windows => "webui-user.bat",
            Self::Unix => "webui-user.sh",
        }
    }

    pub fn device_script_name(&self, device_id: &str) -> String {
        match self {
            Self::Windows => format!("df-start-gpu-{device_id}.bat"),
            Self::Unix => format!("df-start-gpu-{device_id}.sh"),
        }
    }
}

/// Rewrite a `COMMANDLINE_ARGS` value for one device.
pub fn rewrite_args(args: &str, port: u16, device_id: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut skipping = false;
    for token in args.split_whitespace() {
        if token.starts_with("--") {
            skipping = false;
        }
        if skipping {
            continue;
        }
        match token {
            "--autolaunch" => {}
            "--port" | "--device-id" => skipping = true,
            t if t.starts_with("--port=") || t.starts_with("--device-id=") => {}
            t => kept.push(t),
        }
    }

    let mut out: Vec<String> = kept.into_iter().map(str::to_string).collect();
    if !out.iter().any(|t| t == "--api") {
        out.push("--api".to_string());
    }
    out.extend([
        "--port".to_string(),
        port.to_string(),
        "--device-id".to_string(),
        device_id.to_string(),
    ]);
    out.join(" ")
}

/// Produce the device script from the contents of the user's script.
pub fn rewrite_launch_script(contents: &str, platform: Platform, port: u16, device_id: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut found = false;

    for line in contents.lines() {
        let rewritten = match platform {
            Platform::Windows => line
                .strip_prefix(WINDOWS_ARGS_PREFIX)
                .map(|args| format!("{WINDOWS_ARGS_PREFIX}{}", rewrite_args(args, port, device_id))),
            Platform::Unix => unix_args(line).map(|args| {
                format!(
                    "{UNIX_ARGS_PREFIX}\"{}\"",
                    rewrite_args(args, port, device_id)
                )
            }),
        };
        match rewritten {
            Some(l) if !found => {
                found = true;
                lines.push(l);
            }
            // Later assignments would override the rewritten one.
            Some(_) => lines.push(match platform {
                Platform::Windows => format!("rem {line}"),
                Platform::Unix if line.starts_with('#') => line.to_string(),
                Platform::Unix => format!("#{line}"),
            }),
            None => lines.push(line.to_string()),
        }
    }

    if !found {
        let args = rewrite_args("", port, device_id);
        match platform {
            Platform::Windows => {
                let line = format!("{WINDOWS_ARGS_PREFIX}{args}");
                let call = lines
                    .iter()
                    .position(|l| l.trim_start().to_ascii_lowercase().starts_with("call "));
                match call {
                    Some(i) => lines.insert(i, line),
                    None => lines.push(line),
                }
            }
            Platform::Unix => lines.push(format!("{UNIX_ARGS_PREFIX}\"{args}\"")),
        }
    }

    if platform == Platform::Unix {
        lines.push("source webui.sh".to_string());
    }

    let mut out = lines.join(if platform == Platform::Windows { "\r\n" } else { "\n" });
    out.push_str(if platform == Platform::Windows { "\r\n" } else { "\n" });
    out
}

/// Arguments of an (optionally commented) `export COMMANDLINE_ARGS=` line,
/// without surrounding quotes.
fn unix_args(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('#').unwrap_or(line);
    let args = rest.strip_prefix(UNIX_ARGS_PREFIX)?;
    let args = args.trim();
    let args = args.strip_prefix('"').unwrap_or(args);
    Some(args.strip_suffix('"').unwrap_or(args))
}

/// Comment out an active `export COMMANDLINE_ARGS=` line in the user's
/// Unix script, which would otherwise override the device arguments when
/// `webui.sh` sources it. Returns `None` when nothing needs changing.
pub fn comment_out_user_args(contents: &str) -> Option<String> {
    if !contents.lines().any(|l| l.starts_with(UNIX_ARGS_PREFIX)) {
        return None;
    }
    let mut out: String = contents
        .lines()
        .map(|l| {
            if l.starts_with(UNIX_ARGS_PREFIX) {
                format!("#{l}")
            } else {
                l.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    if contents.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

/// Write `df-start-gpu-<id>` into `sd_location` and return its path.
pub fn write_launch_script(
    sd_location: &Path,
    platform: Platform,
    port: u16,
    device_id: &str,
) -> Result<PathBuf, LaunchError> {
    let base = sd_location.join(platform.base_script_name());
    if !base.is_file() {
        return Err(LaunchError::MissingBaseScript(base));
    }
    let contents = std::fs::read_to_string(&base).map_err(|source| LaunchError::Io {
        path: base.clone(),
        source,
    })?;

    if platform == Platform::Unix {
        if let Some(updated) = comment_out_user_args(&contents) {
            tracing::warn!(
                script = %base.display(),
                "Commented out COMMANDLINE_ARGS in the user launch script; it overrides per-device arguments",
            );
            std::fs::write(&base, updated).map_err(|source| LaunchError::Io {
                path: base.clone(),
                source,
            })?;
        }
    }

    let target = sd_location.join(platform.device_script_name(device_id));
    let script = rewrite_launch_script(&contents, platform, port, device_id);
    std::fs::write(&target, script).map_err(|source| LaunchError::Io {
        path: target.clone(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o777)).map_err(
            |source| LaunchError::Io {
                path: target.clone(),
                source,
            },
        )?;
    }

    Ok(target)
}
