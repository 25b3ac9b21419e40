//! Command line arguments.

use clap::Parser;
use std::path::PathBuf;

/// Realtime comment relay for social circles.
///
/// Settings not given in the config file are read from `RELAY_*`
/// environment variables.
#[derive(Parser, Debug)]
#[command(name = "circle-relay", version, about)]
pub struct Args {
    /// Path to a TOML config file. Without it the default locations are searched.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_config_flag_forms() {
        let args = Args::try_parse_from(["circle-relay"]).unwrap();
        assert!(args.config.is_none());

        for argv in [
            vec!["circle-relay", "--config", "relay.toml"],
            vec!["circle-relay", "-c", "relay.toml"],
            vec!["circle-relay", "--config=relay.toml"],
        ] {
            let args = Args::try_parse_from(argv).unwrap();
            assert_eq!(args.config, Some(PathBuf::from("relay.toml")));
        }
    }

    #[test]
    fn test_help_and_version() {
        let err = Args::try_parse_from(["circle-relay", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);

        let err = Args::try_parse_from(["circle-relay", "--version"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_rejects_unknown_and_incomplete_arguments() {
        assert!(Args::try_parse_from(["circle-relay", "--bogus"]).is_err());
        assert!(Args::try_parse_from(["circle-relay", "--config"]).is_err());
    }

    #[test]
    fn test_command_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
