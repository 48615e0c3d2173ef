use std::path::PathBuf;

use clap::Parser;

/// Call center dispatch server
#[derive(Debug, Parser)]
#[command(name = "dispatch-server", version, about)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Configuration file (JSON)
    #[arg(short, long, default_value = "base.json")]
    pub config: PathBuf,

    /// File receiving call detail records
    #[arg(long, default_value = "cdrFile.txt")]
    pub cdr_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "debug")]
    pub log_level: String,

    /// File receiving a copy of the logs
    #[arg(long, default_value = "logfile.txt")]
    pub log_file: PathBuf,

    /// Emit JSON logs on stdout
    #[arg(long)]
    pub json_logs: bool,

    /// Configuration file poll interval in seconds
    #[arg(long, default_value_t = 60)]
    pub monitor_interval: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["dispatch-server"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.config, PathBuf::from("base.json"));
        assert_eq!(args.cdr_file, PathBuf::from("cdrFile.txt"));
        assert_eq!(args.log_file, PathBuf::from("logfile.txt"));
        assert_eq!(args.monitor_interval, 60);
        assert!(!args.json_logs);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "dispatch-server",
            "--port",
            "9090",
            "--config",
            "/etc/dispatch.json",
            "--json-logs",
            "--log-level",
            "warn",
        ]);
        assert_eq!(args.port, 9090);
        assert_eq!(args.config, PathBuf::from("/etc/dispatch.json"));
        assert!(args.json_logs);
        assert_eq!(args.log_level, "warn");
    }
}
