//! CLI Commands
//!
//! Implementation of all wallet CLI commands.

pub mod accounts;
pub mod balance;
pub mod history;
pub mod import;
pub mod init;
pub mod password;
pub mod requests;
pub mod sync;

use anyhow::{anyhow, Context as _, Result};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::registry::Selector;
use crate::session::{Remotes, WalletSession};

/// Where the wallet lives and how to reach its remotes
pub struct Context {
    pub data_dir: PathBuf,
    pub config: WalletConfig,
}

impl Context {
    /// Load `config.toml` from `data_dir` unless another file is given
    pub fn load(data_dir: PathBuf, config_path: Option<&Path>) -> Result<Self> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_dir.join("config.toml"));
        let config = WalletConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        Ok(Self { data_dir, config })
    }

    /// A locked session over the HTTP remotes
    pub fn session(&self) -> Result<Arc<WalletSession>> {
        let remotes = Remotes::http(&self.config)?;
        let session = WalletSession::new(self.config.clone(), &self.data_dir, remotes)?;
        Ok(Arc::new(session))
    }

    /// Prompt for the password and unlock the cached wallet
    pub fn unlock(&self) -> Result<Arc<WalletSession>> {
        let session = self.session()?;
        if !session.has_cached_wallet() {
            print_error("No wallet found. Run 'wallet-core init' first.");
            return Err(anyhow!("no wallet in {}", self.data_dir.display()));
        }

        let password = prompt_password("Enter wallet password: ")?;
        match session.unlock(&password) {
            Ok(_) => Ok(session),
            Err(WalletError::RateLimited { retry_after_secs }) => {
                let msg = format!(
                    "Too many failed attempts. Try again in {} seconds",
                    retry_after_secs
                );
                print_error(&msg);
                Err(anyhow!(msg))
            }
            Err(e) => {
                print_error(&e.to_string());
                Err(e.into())
            }
        }
    }
}

/// `all`, `secondary`, `imported:N`, `hd:N` or a bare HD account index
pub fn parse_selector(s: &str) -> Result<Selector> {
    let s = s.trim().to_ascii_lowercase();
    let index = |n: &str| n.parse::<u32>().map_err(|_| anyhow!("invalid account {:?}", s));

    match s.split_once(':') {
        _ if s == "all" => Ok(Selector::All),
        _ if s == "secondary" => Ok(Selector::Secondary),
        Some(("hd", n)) => Ok(Selector::Hd(index(n)?)),
        Some(("imported", n)) => Ok(Selector::Imported(index(n)? as usize)),
        None => Ok(Selector::Hd(index(s.as_str())?)),
        Some(_) => Err(anyhow!("invalid account {:?}", s)),
    }
}

/// Prompt for password input (hidden)
pub fn prompt_password(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let password = rpassword::read_password()?;
    Ok(password)
}

/// Prompt for confirmation
pub fn prompt_confirm(message: &str) -> Result<bool> {
    print!("{} [y/N]: ", message);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y") || input.trim().eq_ignore_ascii_case("yes"))
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("\x1b[31mError:\x1b[0m {}", message);
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("\x1b[32m{}\x1b[0m", message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("\x1b[33mWarning:\x1b[0m {}", message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selector() {
        assert_eq!(parse_selector("all").unwrap(), Selector::All);
        assert_eq!(parse_selector("2").unwrap(), Selector::Hd(2));
        assert_eq!(parse_selector("hd:1").unwrap(), Selector::Hd(1));
        assert_eq!(parse_selector("Imported:0").unwrap(), Selector::Imported(0));
        assert_eq!(parse_selector("secondary").unwrap(), Selector::Secondary);
        assert!(parse_selector("savings").is_err());
        assert!(parse_selector("foo:1").is_err());
    }
}
