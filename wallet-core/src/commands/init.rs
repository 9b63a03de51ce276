//! Wallet initialization command

use anyhow::{anyhow, Result};
use std::io::{self, Write};

use crate::keys::{validate_mnemonic, WalletKeys};
use crate::registry::Selector;

use super::{print_error, print_success, print_warning, prompt_confirm, prompt_password, Context};

const DEFAULT_ACCOUNT_LABEL: &str = "My Bitcoin Wallet";

/// Run the init command
pub async fn run(ctx: &Context, recover: bool) -> Result<()> {
    let session = ctx.session()?;

    // Check if wallet already exists
    if session.has_cached_wallet() {
        print_error("Wallet already exists at this location");
        println!("Path: {}", ctx.data_dir.display());

        if !prompt_confirm("Overwrite existing wallet?")? {
            println!("Aborted.");
            return Ok(());
        }

        print_warning("Existing wallet will be overwritten!");
    }

    let keys = if recover {
        let phrase = prompt_mnemonic()?;
        validate_mnemonic(&phrase)?;
        WalletKeys::from_mnemonic(&phrase)?
    } else {
        generate_keys()?
    };

    println!();
    let password = prompt_new_password()?;

    if recover {
        println!("Scanning for used addresses...");
    }
    let guid = session
        .create(&keys, &password, DEFAULT_ACCOUNT_LABEL, recover)
        .await?;

    println!();
    print_success("Wallet created successfully!");
    println!();
    println!("Wallet id: {}", guid);
    println!("Your receiving address:");
    println!("  {}", session.registry().receive_address(Selector::Hd(0))?);
    println!();
    println!("Wallet saved to: {}", ctx.data_dir.display());

    if !recover {
        println!();
        print_warning("IMPORTANT: Write down your recovery phrase and store it safely!");
        print_warning("Anyone with this phrase can access your funds.");
        print_warning("If you lose it, you cannot recover your wallet.");
    }

    Ok(())
}

/// Generate fresh keys and have the user confirm the phrase
fn generate_keys() -> Result<WalletKeys> {
    let keys = WalletKeys::generate()?;
    let words = keys.mnemonic_words();

    println!();
    println!("Your recovery phrase ({} words):", words.len());
    println!();

    for (i, word) in words.iter().enumerate() {
        print!("{:>2}. {:<12}", i + 1, word);
        if (i + 1) % 4 == 0 {
            println!();
        }
    }
    println!();

    println!();
    if !prompt_confirm("Have you written down your recovery phrase?")? {
        return Err(anyhow!("Please write down your recovery phrase before continuing"));
    }

    let verify_index = rand::random::<usize>() % words.len();
    println!();
    print!("Verify: Enter word #{}: ", verify_index + 1);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    if input.trim() != words[verify_index] {
        return Err(anyhow!("Verification failed. Please try again."));
    }

    Ok(keys)
}

/// Prompt user to enter their recovery phrase
fn prompt_mnemonic() -> Result<String> {
    println!();
    println!("Enter your 12 or 24-word recovery phrase:");
    println!("(You can enter all words on one line, separated by spaces)");
    println!();

    print!("> ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    let words: Vec<String> = input.split_whitespace().map(str::to_lowercase).collect();
    if words.len() != 12 && words.len() != 24 {
        return Err(anyhow!("Expected 12 or 24 words, got {}", words.len()));
    }

    Ok(words.join(" "))
}

/// Prompt for a new password with confirmation
pub(super) fn prompt_new_password() -> Result<String> {
    loop {
        let password = prompt_password("Enter wallet password: ")?;

        if password.len() < 8 {
            print_error("Password must be at least 8 characters");
            continue;
        }

        let confirm = prompt_password("Confirm password: ")?;

        if password != confirm {
            print_error("Passwords do not match");
            continue;
        }

        return Ok(password);
    }
}
