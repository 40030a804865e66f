use tappet::config::Config;
use tappet::error::FatalError;
use tappet::tunnel::Tunnel;

fn main() {
    let cfg = Config::parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    if let Err(e) = run(&cfg) {
        tracing::error!(error = %e, "tunnel exited");
        std::process::exit(-1);
    }
}

fn run(cfg: &Config) -> Result<(), FatalError> {
    refuse_root()?;
    let mut tunnel = Tunnel::new(cfg)?;
    tunnel.run()
}

/// Refuse to run as root, as an ordinary-user safety measure against
/// accidentally creating interfaces or clobbering files we shouldn't touch.
#[cfg(unix)]
fn refuse_root() -> Result<(), FatalError> {
    if unsafe { libc::geteuid() } == 0 {
        return Err(FatalError::RefusedRoot);
    }
    Ok(())
}

#[cfg(not(unix))]
fn refuse_root() -> Result<(), FatalError> {
    Ok(())
}
