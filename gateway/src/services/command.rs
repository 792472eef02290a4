use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Run an external program to completion and return its stdout.
///
/// A non-zero exit becomes an error carrying the combined output, which is
/// what the node operator needs to see in the log.
pub async fn run(program: &str, args: &[String]) -> Result<String> {
    debug!("exec: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to spawn {}", program))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{} {} exited with {}: {}",
            program,
            args.first().map(String::as_str).unwrap_or_default(),
            output.status,
            format!("{} {}", stdout.trim(), stderr.trim()).trim()
        );
    }

    Ok(stdout)
}

/// Convenience for literal argument lists.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
