//! Per-transport job serialization (spec §4.6) and the EXEC shell-escaping /
//! macro-substitution contract (spec §9).

use std::path::{Path, PathBuf};

use am_common::{Alert, MacroExpander, MediaType, MediaTypeKind};

/// The serialized payload handed to a worker for one dispatched alert. One
/// variant per media type kind, with exactly the field tuple spec §4.6
/// names for that transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchJob {
    Email {
        alertid: i64,
        sendto: String,
        subject: String,
        message: String,
        smtp_server: String,
        smtp_port: u16,
        smtp_helo: String,
        smtp_email: String,
        smtp_security: String,
        smtp_verify_peer: bool,
        smtp_verify_host: bool,
        smtp_authentication: bool,
        username: String,
        password: String,
    },
    Xmpp {
        alertid: i64,
        sendto: String,
        subject: String,
        message: String,
        username: String,
        password: String,
    },
    Sms {
        alertid: i64,
        sendto: String,
        message: String,
        modem_device: String,
    },
    TextGateway {
        alertid: i64,
        sendto: String,
        message: String,
        username: String,
        password: String,
        endpoint_path: String,
    },
    Exec {
        alertid: i64,
        /// The fully assembled shell command line: script path plus one
        /// single-quote-escaped argument per newline-separated parameter.
        command_line: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum JobBuildError {
    #[error("unsupported media type (code {0})")]
    Unsupported(i32),
    #[error("script not executable: {0}")]
    ScriptNotExecutable(String),
}

/// Build the job payload for `alert` against `media_type`. `scripts_dir` and
/// `expander` are only consulted for the EXEC kind.
pub fn build_job(
    alert: &Alert,
    media_type: &MediaType,
    scripts_dir: &Path,
    expander: &dyn MacroExpander,
) -> Result<DispatchJob, JobBuildError> {
    match media_type.kind {
        MediaTypeKind::Email => Ok(DispatchJob::Email {
            alertid: alert.alertid,
            sendto: alert.sendto.clone(),
            subject: alert.subject.clone(),
            message: alert.message.clone(),
            smtp_server: media_type.smtp_server.clone(),
            smtp_port: media_type.smtp_port,
            smtp_helo: media_type.smtp_helo.clone(),
            smtp_email: media_type.smtp_email.clone(),
            smtp_security: media_type.smtp_security.clone(),
            smtp_verify_peer: media_type.smtp_verify_peer,
            smtp_verify_host: media_type.smtp_verify_host,
            smtp_authentication: media_type.smtp_authentication,
            username: media_type.username.clone(),
            password: media_type.passwd.clone(),
        }),
        MediaTypeKind::Xmpp => Ok(DispatchJob::Xmpp {
            alertid: alert.alertid,
            sendto: alert.sendto.clone(),
            subject: alert.subject.clone(),
            message: alert.message.clone(),
            username: media_type.username.clone(),
            password: media_type.passwd.clone(),
        }),
        MediaTypeKind::Sms => Ok(DispatchJob::Sms {
            alertid: alert.alertid,
            sendto: alert.sendto.clone(),
            message: alert.message.clone(),
            modem_device: media_type.gsm_modem.clone(),
        }),
        MediaTypeKind::TextGateway => Ok(DispatchJob::TextGateway {
            alertid: alert.alertid,
            sendto: alert.sendto.clone(),
            message: alert.message.clone(),
            username: media_type.username.clone(),
            password: media_type.passwd.clone(),
            endpoint_path: media_type.endpoint_path.clone(),
        }),
        MediaTypeKind::Exec => build_exec_job(alert, media_type, scripts_dir, expander),
        MediaTypeKind::Unsupported(code) => Err(JobBuildError::Unsupported(code)),
    }
}

fn build_exec_job(
    alert: &Alert,
    media_type: &MediaType,
    scripts_dir: &Path,
    expander: &dyn MacroExpander,
) -> Result<DispatchJob, JobBuildError> {
    let script_path: PathBuf = scripts_dir.join(&media_type.exec_path);
    check_executable(&script_path)?;

    let mut command_line = shell_quote(&script_path.to_string_lossy());
    for param in media_type.exec_params.lines() {
        if param.is_empty() {
            continue;
        }
        let expanded = expander.expand(param, alert);
        command_line.push(' ');
        command_line.push_str(&shell_quote(&expanded));
    }

    Ok(DispatchJob::Exec {
        alertid: alert.alertid,
        command_line,
    })
}

#[cfg(unix)]
fn check_executable(path: &Path) -> Result<(), JobBuildError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = std::fs::metadata(path)
        .map_err(|e| JobBuildError::ScriptNotExecutable(format!("{}: {e}", path.display())))?;
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(JobBuildError::ScriptNotExecutable(format!(
            "{}: not executable",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_executable(path: &Path) -> Result<(), JobBuildError> {
    if !path.exists() {
        return Err(JobBuildError::ScriptNotExecutable(format!(
            "{}: not found",
            path.display()
        )));
    }
    Ok(())
}

/// Wrap `s` in single quotes, escaping embedded single quotes as `'\''`
/// (spec §9 "Shell argument escaping").
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}
