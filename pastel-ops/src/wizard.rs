//! Operator interaction: confirmations during orchestration and the
//! interactive first-time setup wizard
//!
//! Orchestration code only talks to the [`Operator`] trait so that the same
//! flows run interactively on a terminal, unattended (`--yes`), or against a
//! scripted operator in tests.

use anyhow::{Context, Result};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;

use crate::config::{AppConfig, ElevationConfig, PathsConfig, RemoteConfig};
use crate::errors::OpsError;

/// Whoever answers confirmations during an orchestration run
pub trait Operator: Send + Sync {
    /// Yes/no question; `default` is used on an empty answer
    fn confirm(&self, question: &str, default: bool) -> Result<bool, OpsError>;

    /// Informational message the operator must see (funding address, next steps)
    fn notify(&self, message: &str);

    /// False when nobody is there to answer; loops that would re-prompt
    /// forever must give up instead
    fn is_interactive(&self) -> bool;
}

/// Terminal operator reading answers from stdin
pub struct ConsolePrompt;

impl Operator for ConsolePrompt {
    fn confirm(&self, question: &str, default: bool) -> Result<bool, OpsError> {
        Ok(prompt_yes_no(question, default)?)
    }

    fn notify(&self, message: &str) {
        println!("📣 {}", message);
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

/// Accepts every confirmation; used with `--yes`
pub struct Unattended;

impl Operator for Unattended {
    fn confirm(&self, question: &str, _default: bool) -> Result<bool, OpsError> {
        info!("Auto-confirmed: {}", question);
        Ok(true)
    }

    fn notify(&self, message: &str) {
        info!("{}", message);
    }

    fn is_interactive(&self) -> bool {
        false
    }
}

pub struct SetupWizard;

impl SetupWizard {
    /// Run the interactive setup wizard and save the result
    pub async fn run(current: &AppConfig) -> Result<()> {
        println!();
        println!("🛠️  ======================================");
        println!("   PASTEL-OPS CONFIGURATION WIZARD");
        println!("🛠️  ======================================");
        println!();

        let paths = Self::configure_paths(&current.paths)?;
        let remote = Self::configure_remote(&current.remote)?;
        let elevation = Self::configure_elevation()?;

        let config = AppConfig {
            paths,
            remote,
            elevation,
            service: current.service.clone(),
            polling: current.polling.clone(),
            source: current.source.clone(),
        };

        Self::display_summary(&config);

        if prompt_yes_no("💾 Save this configuration?", true)? {
            let saved = config.save().await.context("Failed to save configuration")?;
            println!();
            println!("✅ Configuration saved to {}", saved.display());
        } else {
            println!("❌ Configuration cancelled.");
        }

        Ok(())
    }

    fn configure_paths(current: &PathsConfig) -> Result<PathsConfig> {
        println!("📁 LOCAL INSTALLATION (cold node)");
        println!("────────────────────────────────────────");

        let pastel_exec_dir = prompt_with_default(
            "Pastel executables directory",
            &current.pastel_exec_dir.to_string_lossy(),
        )?;
        let working_dir = prompt_with_default(
            "Pastel data directory",
            &current.working_dir.to_string_lossy(),
        )?;
        println!();

        Ok(PathsConfig {
            pastel_exec_dir: PathBuf::from(pastel_exec_dir),
            working_dir: PathBuf::from(working_dir),
        })
    }

    fn configure_remote(current: &RemoteConfig) -> Result<RemoteConfig> {
        println!("🌐 REMOTE HOT NODE");
        println!("────────────────────────────────────────");

        let host = prompt_optional("Hot node address")?.or_else(|| current.host.clone());
        let port: u16 = prompt_with_default_parse("SSH port", &current.port.to_string())?;
        let user = prompt_optional("SSH user")?.or_else(|| current.user.clone());
        let identity_file = prompt_optional("SSH private key file (empty for ssh-agent)")?
            .map(PathBuf::from)
            .or_else(|| current.identity_file.clone());
        let pastel_dir =
            prompt_optional("Pastel installation directory on the hot node")?.or_else(|| current.pastel_dir.clone());
        let working_dir =
            prompt_optional("Pastel data directory on the hot node (empty for default)")?.or_else(|| current.working_dir.clone());
        println!();

        Ok(RemoteConfig {
            host,
            port,
            user,
            identity_file,
            pastel_dir,
            working_dir,
            ..current.clone()
        })
    }

    fn configure_elevation() -> Result<ElevationConfig> {
        println!("🔐 SYSTEM PRIVILEGES");
        println!("────────────────────────────────────────");
        println!("Registering systemd units needs sudo.");

        let store_credentials = prompt_yes_no("Store the sudo password in the OS keyring?", false)?;
        let cached_password = if store_credentials {
            prompt_password("sudo password")?
        } else {
            None
        };
        println!();

        Ok(ElevationConfig {
            store_credentials,
            cached_password,
        })
    }

    fn display_summary(config: &AppConfig) {
        println!("📋 CONFIGURATION SUMMARY");
        println!("────────────────────────────────────────");
        println!("📁 Executables: {}", config.paths.pastel_exec_dir.display());
        println!("📁 Data dir:    {}", config.paths.working_dir.display());
        println!(
            "🌐 Hot node:    {}@{}:{}",
            config.remote.user.as_deref().unwrap_or("?"),
            config.remote.host.as_deref().unwrap_or("?"),
            config.remote.port
        );
        println!("🌐 Remote dir:  {}", config.remote.pastel_dir.as_deref().unwrap_or("not set"));
        println!(
            "🔐 Keyring:     {}",
            if config.elevation.store_credentials { "✅ Yes" } else { "❌ No" }
        );
        println!();
    }
}

fn read_answer() -> io::Result<String> {
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_with_default(prompt: &str, default: &str) -> io::Result<String> {
    print!("❓ {} [{}]: ", prompt, default);
    let input = read_answer()?;
    Ok(if input.is_empty() { default.to_string() } else { input })
}

fn prompt_with_default_parse<T: std::str::FromStr>(prompt: &str, default: &str) -> io::Result<T>
where
    T::Err: std::fmt::Display,
{
    loop {
        let input = prompt_with_default(prompt, default)?;
        match input.parse::<T>() {
            Ok(value) => return Ok(value),
            Err(e) => println!("❌ Invalid input: {}. Please try again.", e),
        }
    }
}

fn prompt_optional(prompt: &str) -> io::Result<Option<String>> {
    print!("❓ {}: ", prompt);
    let input = read_answer()?;
    Ok(if input.is_empty() { None } else { Some(input) })
}

fn prompt_yes_no(prompt: &str, default: bool) -> io::Result<bool> {
    let default_str = if default { "Y/n" } else { "y/N" };

    loop {
        print!("❓ {} [{}]: ", prompt, default_str);
        let input = read_answer()?.to_lowercase();

        if input.is_empty() {
            return Ok(default);
        }
        match input.as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => println!("❌ Please enter 'y' or 'n'."),
        }
    }
}

fn prompt_password(prompt: &str) -> io::Result<Option<String>> {
    // TODO: switch to a no-echo reader once one is in the dependency set
    println!("⚠️  WARNING: Password input will be visible on screen.");
    print!("🔐 {}: ", prompt);
    let input = read_answer()?;
    Ok(if input.is_empty() { None } else { Some(input) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unattended_accepts_everything() {
        let operator = Unattended;
        assert!(operator.confirm("Transfer 1000 PSL?", false).unwrap());
        assert!(!operator.is_interactive());
    }
}
