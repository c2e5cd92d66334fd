/*
 * replika is a single replica of a replicated key/value store. It takes the
 * simulator's UDP port, its own replica id, and its peers' ids on the
 * command line, announces itself, and then serves client get/put requests
 * via leader-based consensus with its peers.
 */

#![warn(clippy::all)]

use replika::errinput;
use replika::error::Result;
use replika::raft::BROADCAST;
use replika::Server;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("port")
                .required(true)
                .value_parser(clap::value_parser!(u16))
                .help("UDP port of the simulator"),
        )
        .arg(clap::Arg::new("id").required(true).help("Replica id (4 characters)"))
        .arg(
            clap::Arg::new("peers")
                .required(true)
                .num_args(1..)
                .help("Ids of all other replicas in the group"),
        )
        .arg(
            clap::Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .help("Log level (off, error, warn, info, debug, trace)"),
        )
        .get_matches();

    let loglevel = args.get_one::<String>("log-level").unwrap().parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("replika");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let port = *args.get_one::<u16>("port").unwrap();
    let id = args.get_one::<String>("id").unwrap().clone();
    let peers: Vec<String> = args.get_many::<String>("peers").unwrap().cloned().collect();

    for replica in std::iter::once(&id).chain(peers.iter()) {
        if replica.len() != 4 || replica == BROADCAST {
            return errinput!("invalid replica id {replica}");
        }
    }
    if peers.contains(&id) {
        return errinput!("replica {id} can't be its own peer");
    }

    Server::new(id, peers, port)?.serve()
}
