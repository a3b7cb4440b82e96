//! Transport argument-vector surgery.
//!
//! The local proxy re-invokes the transport client on every reconnect
//! with the shim spliced in between the host and the user command. To
//! find that boundary we have to know which transport options take a
//! value, so that `-l user host cmd` does not mistake `user` for the
//! host. The tables below cover the standard openssh-style option set.

use std::collections::HashMap;

use anyhow::{anyhow, bail};
use tracing::trace;

/// Single-letter options that consume a value, attached or as the next
/// argument.
const VALUE_FLAGS: &str = "bceilmpwDEFIJLOQRSW";
/// Single-letter options that never take a value.
const UNARY_FLAGS: &str = "afgknqstvxyACGKMNTVXY1246";

/// The transport invocation split at the host boundary. `prefix` holds
/// everything up to and including the host; the shim arguments get
/// spliced in right after it on every spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportCommand {
    pub program: String,
    pub prefix: Vec<String>,
    /// -o key=value pairs, absorbed for our own configuration but
    /// still passed through to the transport untouched.
    pub absorbed: HashMap<String, String>,
    pub command: Vec<String>,
}

pub fn split(argv: &[String]) -> anyhow::Result<TransportCommand> {
    let program = argv
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("no transport client named"))?;

    let mut prefix = Vec::new();
    let mut absorbed = HashMap::new();
    let mut host = None;
    let mut i = 1;
    while i < argv.len() {
        let arg = &argv[i];
        match arg.strip_prefix('-') {
            Some(cluster) if !cluster.is_empty() => {
                prefix.push(arg.clone());
                for (pos, c) in cluster.char_indices() {
                    if c == 'o' || VALUE_FLAGS.contains(c) {
                        let attached = &cluster[pos + c.len_utf8()..];
                        let value = if !attached.is_empty() {
                            attached.to_string()
                        } else {
                            i += 1;
                            let v = argv.get(i).ok_or_else(|| {
                                anyhow!("transport option -{} is missing its value", c)
                            })?;
                            prefix.push(v.clone());
                            v.clone()
                        };
                        if c == 'o' {
                            if let Some((k, v)) = value.split_once('=') {
                                absorbed.insert(k.trim().to_string(), v.trim().to_string());
                            }
                        }
                        break;
                    } else if !UNARY_FLAGS.contains(c) {
                        // not in either table: assume value-less rather
                        // than risk eating the host name as a value
                        trace!("unrecognized transport flag -{}", c);
                    }
                }
                i += 1;
            }
            _ => {
                host = Some(arg.clone());
                prefix.push(arg.clone());
                i += 1;
                break;
            }
        }
    }

    if host.is_none() {
        bail!("transport arguments name no host");
    }
    let command: Vec<String> = argv[i..].to_vec();
    if command.is_empty() {
        bail!("no remote command given");
    }

    Ok(TransportCommand { program, prefix, absorbed, command })
}

impl TransportCommand {
    /// The argument vector for one spawn of the transport client, with
    /// the remote shim invocation spliced in at the host boundary. The
    /// epoch changes on every call and the sockdir appears once it has
    /// been negotiated.
    pub fn spawn_args(
        &self,
        shim: &str,
        epoch: u64,
        sockdir: Option<&str>,
        extra: &[String],
    ) -> Vec<String> {
        let mut args = self.prefix.clone();
        args.push(String::from(shim));
        args.push(String::from("--remote"));
        args.push(format!("--try={}", epoch));
        if let Some(dir) = sockdir {
            args.push(format!("--sockdir={}", dir));
        }
        args.extend(extra.iter().cloned());
        args.extend(self.command.iter().cloned());
        args
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn to_vec(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| String::from(*s)).collect()
    }

    #[test]
    fn finds_host_boundary() {
        let cases = vec![
            // (argv, expected prefix, expected command)
            (
                vec!["ssh", "host", "cat"],
                vec!["host"],
                vec!["cat"],
            ),
            (
                vec!["ssh", "-p", "2222", "-i", "key", "host", "cat", "file"],
                vec!["-p", "2222", "-i", "key", "host"],
                vec!["cat", "file"],
            ),
            // attached values
            (
                vec!["ssh", "-p2222", "host", "true"],
                vec!["-p2222", "host"],
                vec!["true"],
            ),
            // clustered value-less flags ending in a value-taking one
            (
                vec!["ssh", "-4Ap", "2222", "host", "true"],
                vec!["-4Ap", "2222", "host"],
                vec!["true"],
            ),
            // -l would eat the next word, so "user" must not be the host
            (
                vec!["ssh", "-l", "user", "host", "true"],
                vec!["-l", "user", "host"],
                vec!["true"],
            ),
            // command flags are left alone
            (
                vec!["ssh", "host", "ls", "-la", "/tmp"],
                vec!["host"],
                vec!["ls", "-la", "/tmp"],
            ),
        ];

        for (argv, want_prefix, want_command) in cases {
            let argv = to_vec(&argv);
            let cmd = split(&argv).expect("split to succeed");
            assert_eq!(cmd.program, "ssh", "argv: {:?}", argv);
            assert_eq!(cmd.prefix, to_vec(&want_prefix), "argv: {:?}", argv);
            assert_eq!(cmd.command, to_vec(&want_command), "argv: {:?}", argv);
        }
    }

    #[test]
    fn absorbs_o_options() {
        let argv = to_vec(&[
            "ssh",
            "-o",
            "ConnectTimeout=3",
            "-oStrictHostKeyChecking=no",
            "host",
            "true",
        ]);
        let cmd = split(&argv).expect("split to succeed");
        assert_eq!(cmd.absorbed.get("ConnectTimeout").map(String::as_str), Some("3"));
        assert_eq!(
            cmd.absorbed.get("StrictHostKeyChecking").map(String::as_str),
            Some("no")
        );
        // and they still ride along to the transport
        assert_eq!(
            cmd.prefix,
            to_vec(&["-o", "ConnectTimeout=3", "-oStrictHostKeyChecking=no", "host"])
        );
    }

    #[test]
    fn rejects_incomplete_invocations() {
        let cases = vec![
            vec!["ssh"],
            vec!["ssh", "-p", "22"],
            vec!["ssh", "host"],
            vec!["ssh", "-p"],
        ];
        for argv in cases {
            assert!(split(&to_vec(&argv)).is_err(), "argv: {:?}", argv);
        }
    }

    #[test]
    fn splices_shim_invocation() {
        let argv = to_vec(&["ssh", "-p", "22", "host", "wc", "-c"]);
        let cmd = split(&argv).expect("split to succeed");

        let spawn = cmd.spawn_args("/usr/bin/sshim", 3, None, &[]);
        assert_eq!(
            spawn,
            to_vec(&["-p", "22", "host", "/usr/bin/sshim", "--remote", "--try=3", "wc", "-c"])
        );

        let spawn = cmd.spawn_args(
            "/usr/bin/sshim",
            4,
            Some("/tmp/sshim-abc"),
            &[String::from("--timeout=3")],
        );
        assert_eq!(
            spawn,
            to_vec(&[
                "-p",
                "22",
                "host",
                "/usr/bin/sshim",
                "--remote",
                "--try=4",
                "--sockdir=/tmp/sshim-abc",
                "--timeout=3",
                "wc",
                "-c"
            ])
        );
    }
}
