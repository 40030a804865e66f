//! Key-generation utility: the out-of-scope "key-generation utility"
//! collaborator. Generates an X25519 keypair and writes `<name>.secret`
//! (both keys, for our own use) and `<name>.public` (for handing to the
//! peer), refusing to clobber existing files.

use clap::Parser;
use tappet::keys;

/// Generates an X25519 keypair for use with tappet.
#[derive(Parser, Debug)]
#[command(name = "tappet-keygen", version, about)]
struct Args {
    /// Stem used to name the generated `<name>.secret` and `<name>.public` files.
    name: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let (secret, public) = keys::generate_keypair();

    match keys::write_keypair(&args.name, &secret, &public) {
        Ok((secret_path, public_path)) => {
            tracing::info!(secret = %secret_path.display(), public = %public_path.display(), "keypair written");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to write keypair");
            std::process::exit(1);
        }
    }
}
