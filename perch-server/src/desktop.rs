//! Desktop integrations: a terminal running a coding agent on a failing
//! app, and an editor on an app's config file
//!
//! Launcher templates come from `config.toml`. Placeholders (`{dir}`,
//! `{path}`, ...) are replaced with shell-quoted values and the result runs
//! through `/bin/sh -c`.

use crate::defaults::DESKTOP_LAUNCH_SETTLE;
use crate::settings::Settings;
use crate::supervisor::Focus;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum DesktopError {
    #[error("{0} is not configured in config.toml")]
    NotConfigured(&'static str),

    #[error("failed to prepare launch: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` failed: {detail}")]
    Failed { command: String, detail: String },
}

impl DesktopError {
    /// Caller-side problem (fixable in config) rather than a runtime failure
    pub fn is_config(&self) -> bool {
        matches!(self, DesktopError::NotConfigured(_))
    }
}

/// POSIX single-quote a value.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Substitute `{key}` placeholders with shell-quoted values.
pub fn render_command(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), &shell_quote(value))
    })
}

/// The configured template unless it is missing or blank.
fn configured_or<'a>(configured: &'a Option<String>, fallback: &'static str) -> &'a str {
    configured
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(fallback)
}

fn default_terminal_command() -> &'static str {
    if cfg!(target_os = "macos") {
        "open -a Terminal {script}"
    } else {
        "x-terminal-emulator -e {script}"
    }
}

fn default_editor_command() -> &'static str {
    if cfg!(target_os = "macos") {
        "open {path}"
    } else {
        "xdg-open {path}"
    }
}

/// Run a launcher. Fails if it exits non-zero within `settle`; anything
/// still running after that is left alone (terminals often block).
pub async fn launch(command_line: &str, settle: Duration) -> Result<(), DesktopError> {
    tracing::info!(command = %command_line, "Launching");
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    match timeout(settle, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                crate::instances::describe_exit(&output.status)
            } else {
                stderr
            };
            Err(DesktopError::Failed {
                command: command_line.to_string(),
                detail,
            })
        }
        Ok(Err(e)) => Err(DesktopError::Io(e)),
        Err(_) => Ok(()),
    }
}

fn unique_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{nanos}", std::process::id())
}

fn agent_prompt(focus: &Focus) -> String {
    let mut prompt = format!(
        "The app \"{app}\" managed by perch failed to start.\n\n\
         perch runs local dev servers defined by files in its config directory.\n\
         Config for this app: {config}\n\n\
         Recent output:\n```\n",
        app = focus.app,
        config = focus.config_path.display(),
    );
    for line in &focus.logs {
        prompt.push_str(&crate::logs::strip_ansi(line));
        prompt.push('\n');
    }
    prompt.push_str(
        "```\n\nPlease find and fix the cause. Editing the config file or the \
         project makes perch pick up the change; restart the app from the \
         dashboard to verify.\n",
    );
    prompt
}

fn write_agent_script(
    dir: &Path,
    focus: &Focus,
    agent: &str,
    scratch: &Path,
) -> std::io::Result<(PathBuf, PathBuf)> {
    let suffix = unique_suffix();
    let prompt_file = scratch.join(format!("perch-prompt-{}-{suffix}.txt", focus.app));
    let script = scratch.join(format!("perch-agent-{}-{suffix}.sh", focus.app));

    std::fs::write(&prompt_file, agent_prompt(focus))?;
    let body = format!(
        "#!/bin/sh\ncd {dir} || exit 1\nprompt=\"$(cat {prompt})\"\nrm -f {prompt} {script}\nexec {agent} \"$prompt\"\n",
        dir = shell_quote(&dir.to_string_lossy()),
        prompt = shell_quote(&prompt_file.to_string_lossy()),
        script = shell_quote(&script.to_string_lossy()),
    );
    std::fs::write(&script, body)?;
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
    Ok((script, prompt_file))
}

/// Open a terminal in the app's directory running the configured agent
/// with a prompt describing the failure.
pub async fn open_terminal(settings: &Settings, focus: &Focus) -> Result<(), DesktopError> {
    let agent = settings
        .agent_command()
        .ok_or(DesktopError::NotConfigured("agent_command"))?;
    let (script, prompt_file) =
        write_agent_script(&focus.dir, focus, agent, &std::env::temp_dir())?;

    let template = configured_or(&settings.terminal_command, default_terminal_command());
    let script_path = script.to_string_lossy();
    let dir = focus.dir.to_string_lossy();
    let prompt_path = prompt_file.to_string_lossy();
    let command = render_command(
        template,
        &[
            ("script", &*script_path),
            ("dir", &*dir),
            ("prompt_file", &*prompt_path),
            ("agent", agent),
        ],
    );

    let result = launch(&command, DESKTOP_LAUNCH_SETTLE).await;
    if result.is_err() {
        let _ = std::fs::remove_file(&script);
        let _ = std::fs::remove_file(&prompt_file);
    }
    result
}

/// Open a config file in the configured editor.
pub async fn open_editor(settings: &Settings, path: &Path) -> Result<(), DesktopError> {
    let template = configured_or(&settings.editor_command, default_editor_command());
    let template = if template.contains("{path}") {
        template.to_string()
    } else {
        format!("{template} {{path}}")
    };
    let path = path.to_string_lossy();
    let command = render_command(&template, &[("path", &*path)]);
    launch(&command, DESKTOP_LAUNCH_SETTLE).await
}
