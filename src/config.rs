use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser, Clone, Default)]
pub struct Config {
    /// Directory holding the RDB snapshot.
    #[arg(long)]
    pub dir: Option<String>,

    /// File name of the RDB snapshot inside `dir`.
    #[arg(long)]
    pub dbfilename: Option<String>,

    #[arg(short, long, default_value_t = 6379)]
    pub port: u16,

    /// "<host> <port>" of the primary to follow. Absent means primary role.
    #[arg(long)]
    pub replicaof: Option<String>,
}

impl Config {
    pub fn is_replica(&self) -> bool {
        self.replicaof.is_some()
    }

    /// Primary address as "host:port", with the `localhost` alias resolved.
    pub fn primary_addr(&self) -> Option<String> {
        let raw = self.replicaof.as_deref()?;
        let (host, port) = raw.split_once(' ')?;
        let host = if host == "localhost" { "127.0.0.1" } else { host };
        Some(format!("{host}:{port}"))
    }

    /// `<dir>/<dbfilename>` when both are configured.
    pub fn rdb_path(&self) -> Option<PathBuf> {
        let dir = self.dir.as_deref()?;
        let dbfilename = self.dbfilename.as_deref()?;
        let mut path = PathBuf::from(dir);
        path.push(dbfilename);
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_addr_splits_host_and_port() {
        let config = Config {
            replicaof: Some("localhost 6379".to_string()),
            ..Default::default()
        };
        assert!(config.is_replica());
        assert_eq!(config.primary_addr().unwrap(), "127.0.0.1:6379");
    }

    #[test]
    fn rdb_path_requires_both_parts() {
        let config = Config {
            dir: Some("/tmp/rdb".to_string()),
            ..Default::default()
        };
        assert!(config.rdb_path().is_none());

        let config = Config {
            dir: Some("/tmp/rdb".to_string()),
            dbfilename: Some("dump.rdb".to_string()),
            ..Default::default()
        };
        assert_eq!(config.rdb_path().unwrap(), PathBuf::from("/tmp/rdb/dump.rdb"));
    }
}
