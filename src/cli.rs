// Command-line interface
//
// Configuration lives in the environment; the CLI only carries local
// overrides and a config check for deploy pipelines.

use std::net::SocketAddr;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "vecgate", version, about = "HA router and WAL replication layer for a vector-database pair")]
pub struct Cli {
    /// Override BIND_ADDR from the environment
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Validate configuration and database connectivity, then exit
    #[arg(long)]
    pub check_config: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bind_override() {
        let cli = Cli::parse_from(["vecgate", "--bind", "127.0.0.1:9000"]);
        assert_eq!(cli.bind, Some("127.0.0.1:9000".parse().unwrap()));
        assert!(!cli.check_config);
    }

    #[test]
    fn defaults_to_no_overrides() {
        let cli = Cli::parse_from(["vecgate"]);
        assert!(cli.bind.is_none());
    }
}
