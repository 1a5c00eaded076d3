//! Standalone keypair generation: generate an Ed25519 signing key for
//! `swarm-node` and print the address peers will know it by.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use swarm_core::keys;
use swarm_core::peer::Address;

#[derive(Parser, Debug)]
#[command(name = "swarm-keygen", about = "Generate an Ed25519 signing key for swarm-node")]
struct Args {
    /// Where to write the generated key (hex-encoded, 32 bytes).
    #[arg(long = "out", default_value = "swarm.key")]
    out: PathBuf,

    /// Overwrite an existing key file instead of refusing.
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    if args.out.exists() && !args.force {
        bail!("{} already exists, pass --force to overwrite", args.out.display());
    }

    let signing_key = keys::generate_and_save(&args.out)?;
    let address = Address::from_public_key(&signing_key.verifying_key());

    println!("address:     {address}");
    println!("public key:  {}", hex::encode(signing_key.verifying_key().to_bytes()));
    println!("key file:    {}", args.out.display());
    Ok(())
}
