use anyhow::{bail, format_err, Error};

/// Run a command to completion and return its stdout as a string.
///
/// A non-zero exit or a termination by signal is an error carrying the
/// command's stderr, which is what `virsh` and `qemu-img` put their
/// diagnostics on.
pub fn run_command(mut command: std::process::Command) -> Result<String, Error> {
    let output = command
        .output()
        .map_err(|err| format_err!("failed to execute {:?} - {}", command, err))?;

    if !output.status.success() {
        let msg = String::from_utf8_lossy(&output.stderr);
        let msg = msg.trim();
        match output.status.code() {
            Some(code) if msg.is_empty() => {
                bail!("command {:?} failed - status code: {}", command, code)
            }
            Some(code) => bail!("command {:?} failed - status code: {} - {}", command, code, msg),
            None => bail!("command {:?} terminated by signal", command),
        }
    }

    let stdout = String::from_utf8(output.stdout)?;
    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() -> Result<(), Error> {
        let mut command = std::process::Command::new("echo");
        command.arg("hello");
        assert_eq!(run_command(command)?, "hello\n");
        Ok(())
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let command = std::process::Command::new("false");
        let err = run_command(command).unwrap_err();
        assert!(err.to_string().contains("status code: 1"));
    }

    #[test]
    fn stderr_ends_up_in_the_error() {
        let mut command = std::process::Command::new("sh");
        command.arg("-c").arg("echo boom >&2; exit 3");
        let err = run_command(command).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("status code: 3"));
        assert!(msg.contains("boom"));
    }
}
