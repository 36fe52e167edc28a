//! Hash a password for seeding or repairing a `users` row.
//!
//! Usage:
//!   hash-password                  # prompts on stdin
//!   hash-password "MyP@ssw0rd-123"
//!
//! Cost parameters come from `ARGON2_MEMORY_KIB`, `ARGON2_ITERATIONS` and
//! `ARGON2_PARALLELISM`, the same variables the server reads, so the hash
//! matches what the server itself would produce.

use std::env;
use std::io::{self, Write};

use anyhow::{bail, Context};
use bms_api::{
    auth::{validate_password_strength, PasswordManager},
    config::Argon2Config,
};

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let password = match env::args().nth(1) {
        Some(pwd) => pwd,
        None => {
            // Reading from stdin keeps the password out of the process list
            print!("Enter password to hash: ");
            io::stdout().flush()?;

            let mut password = String::new();
            io::stdin().read_line(&mut password)?;
            password.trim().to_string()
        }
    };

    if password.is_empty() {
        bail!("Password cannot be empty");
    }

    if let Err(e) = validate_password_strength(&password) {
        eprintln!("Warning: {e}. The hash is still generated.");
    }

    let argon2 = Argon2Config::from_env().context("Invalid Argon2 configuration")?;
    let manager = PasswordManager::new(&argon2).context("Invalid Argon2 parameters")?;
    let password_hash = manager.hash(&password)?;

    println!("{password_hash}");
    eprintln!(
        "\nStore it with:\n  UPDATE users SET password_hash = '{password_hash}' WHERE email = '<email>';"
    );

    Ok(())
}
