//! Generates a hopnet node identity keyfile.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;

use hopnet_core::{derive_address, KeyPair};

/// Generate a node identity keyfile.
#[derive(Parser, Debug)]
#[command(name = "hopnet-keygen")]
#[command(about = "Generate a hopnet node identity keyfile")]
#[command(version)]
struct Cli {
    /// Where to write the hex-encoded secret key.
    #[arg(long, default_value = "node.key")]
    out: PathBuf,

    /// Overwrite an existing keyfile.
    #[arg(long)]
    force: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.out.exists() && !cli.force {
        bail!("{:?} already exists; pass --force to overwrite", cli.out);
    }

    let keypair = KeyPair::generate();
    let address = derive_address(&keypair.public_key());

    std::fs::write(&cli.out, hex::encode(keypair.secret_bytes()))
        .with_context(|| format!("writing {:?}", cli.out))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&cli.out, std::fs::Permissions::from_mode(0o600))?;
    }

    println!("keyfile: {}", cli.out.display());
    println!("address: {}", hex::encode(address));
    Ok(())
}
