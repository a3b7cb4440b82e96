use std::fs;

use anyhow::Context;
use serde_derive::Deserialize;

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// Bound, in seconds, on every handshake exchange: the sockdir
    /// negotiation and the byte-count resume exchange. 10 seconds by
    /// default. A `-o ConnectTimeout=<n>` transport option is honored
    /// when neither this nor --timeout is given.
    pub timeout_secs: Option<u64>,
    /// How many consecutive transport spawn failures to absorb before
    /// giving up on the session. 5 by default.
    pub spawn_retries: Option<u32>,
    /// Path of the sshim binary on the remote host. Defaults to the
    /// name this invocation was launched with, which works whenever
    /// the binary is installed the same way on both ends.
    pub remote_shim: Option<String>,
    /// When set, remote invocations are spawned with
    /// --log-file=<this> so the remote proxy and daemon logs land
    /// somewhere inspectable on the remote host.
    pub remote_log_file: Option<String>,
    /// Verbosity to forward to remote invocations, same meaning as
    /// repeated -v flags.
    pub remote_verbose: Option<u8>,
}

pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    match config_file {
        Some(path) => {
            let config_str = fs::read_to_string(path).context("reading config toml")?;
            toml::from_str(&config_str).context("parsing config file")
        }
        None => Ok(Config::default()),
    }
}
