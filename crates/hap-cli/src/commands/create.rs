//! `hap create`

use anyhow::{Context, Result, bail};
use std::path::Path;
use tokio::process::Command;

/// Create `dir` with a git repository and a starter Hapfile.
pub async fn run(dir: &Path) -> Result<()> {
    match create(dir).await {
        Ok(()) => {
            println!("create {} completed.", dir.display());
            Ok(())
        }
        Err(e) => {
            println!("create {} failed.", dir.display());
            Err(e)
        }
    }
}

async fn create(dir: &Path) -> Result<()> {
    let hapfile = dir.join("Hapfile");
    if hapfile.exists() {
        bail!("{} already exists", hapfile.display());
    }

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let output = Command::new("git")
        .args(["init", "-q", "."])
        .current_dir(dir)
        .output()
        .await
        .context("Failed to run git")?;
    if !output.status.success() {
        bail!(
            "git init failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let username = std::env::var("USER").ok().filter(|u| !u.is_empty());
    let text = starter_hapfile(username.as_deref(), dirs::home_dir().as_deref());
    tokio::fs::write(&hapfile, text)
        .await
        .with_context(|| format!("Failed to write {}", hapfile.display()))?;
    Ok(())
}

/// A `[default]` section with the local username and, when present, the
/// conventional RSA key.
fn starter_hapfile(username: Option<&str>, home: Option<&Path>) -> String {
    let mut text = String::from("[default]\n");
    if let Some(username) = username {
        text.push_str(&format!("username = \"{}\"\n", username));
    }
    if home.is_some_and(|home| home.join(".ssh/id_rsa").is_file()) {
        text.push_str("identity = \"~/.ssh/id_rsa\"\n");
    }
    text
}
