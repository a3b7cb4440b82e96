use clap::Parser;
use tracing::error;

fn main() {
    let args = sshim::Args::parse();
    let remote = args.remote;

    if let Err(err) = sshim::run(args) {
        error!("{:?}", err);
        // The remote roles must stay silent: their stderr is either the
        // stream-2 data channel or the null device. Only the local
        // proxy may talk to the user.
        if !remote {
            eprintln!("sshim: {:#}", err);
        }
        std::process::exit(1);
    }
}
