use clap::{Args, Parser, Subcommand};
use getset::Getters;
use std::path::PathBuf;

/// keystone: a distributed transaction coordinator
#[derive(Debug, Parser, Getters)]
#[command(name = "keystone")]
#[command(about = "keystone: distributed transaction coordinator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    #[getset(get = "pub")]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the coordinator server
    Serve(ServeArgs),
    /// Query the status of a global transaction
    Status(QueryArgs),
    /// Force rollback of a global transaction
    Rollback(QueryArgs),
}

#[derive(Debug, Args, Getters)]
pub struct ServeArgs {
    /// Port to host the coordinator on
    #[arg(short, long, default_value_t = 8091)]
    #[getset(get = "pub")]
    port: u16,
    /// Optional: path to a TOML configuration file
    #[arg(short, long)]
    #[getset(get = "pub")]
    config: Option<PathBuf>,
    /// Run in verbose mode
    #[arg(short, long)]
    #[getset(get = "pub")]
    verbose: bool,
}

#[derive(Debug, Args, Getters)]
pub struct QueryArgs {
    /// Hostname or IP address of the coordinator
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    #[getset(get = "pub")]
    host: String,
    /// Port to connect to
    #[arg(short, long, default_value_t = 8091)]
    #[getset(get = "pub")]
    port: u16,
    /// Global transaction id
    #[arg(short, long)]
    #[getset(get = "pub")]
    xid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let cli = Cli::parse_from(["keystone", "serve"]);
        match cli.command() {
            Commands::Serve(args) => {
                assert_eq!(*args.port(), 8091);
                assert!(args.config().is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn status_requires_a_xid() {
        let cli = Cli::parse_from(["keystone", "status", "--xid", "svc:1:1"]);
        match cli.command() {
            Commands::Status(args) => {
                assert_eq!(args.xid(), "svc:1:1");
                assert_eq!(args.host(), "127.0.0.1");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["keystone", "status"]).is_err());
    }
}
