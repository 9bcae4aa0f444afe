use anyhow::{bail, Context, Result};

/// Puts a suggested fix command on the system clipboard.
pub fn copy_command(command: &str) -> Result<()> {
    let command = command.trim();
    if command.is_empty() {
        bail!("nothing to copy");
    }
    let mut clipboard = arboard::Clipboard::new().context("failed to access clipboard")?;
    clipboard
        .set_text(command.to_string())
        .context("failed to set clipboard text")?;
    Ok(())
}
