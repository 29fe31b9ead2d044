use std::net::*;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tftp_server::{ServerConfig, TftpServer};

use clap::{crate_version, App, Arg};

fn main() {
    env_logger::init();

    let arg_ip = "IP address";
    let arg_dir = "Directory";
    let arg_timeout = "Timeout";
    let arg_readonly = "Readonly";
    let arg_no_read = "No read";
    let arg_max_retries = "Max retries";
    let arg_max_blksize = "Max blksize";

    // TODO: test argument handling
    let matches = App::new("TFTP Server")
        .about("A server implementation of the TFTP Protocol (IETF RFC 1350, 2347-2349)")
        .version(crate_version!())
        .arg(
            Arg::with_name(arg_ip)
                .short("a")
                .long("address")
                .help("specifies an address[:port] to listen on")
                .takes_value(true)
                .multiple(true)
                .value_name("IPAddr[:PORT]"),
        )
        .arg(
            Arg::with_name(arg_dir)
                .short("d")
                .long("directory")
                .help("specifies the directory to serve (current by default)")
                .takes_value(true)
                .value_name("DIRECTORY"),
        )
        .arg(
            Arg::with_name(arg_timeout)
                .short("t")
                .long("timeout")
                .help("the (non-zero) number of seconds before an idle transfer is retransmitted")
                .takes_value(true)
                .value_name("SECONDS"),
        )
        .arg(
            Arg::with_name(arg_readonly)
                .short("r")
                .long("readonly")
                .help("rejects all write requests"),
        )
        .arg(
            Arg::with_name(arg_no_read)
                .long("no-read")
                .help("rejects all read requests"),
        )
        .arg(
            Arg::with_name(arg_max_retries)
                .long("max-retries")
                .help("the number of retransmits attempted before abandoning a transfer")
                .takes_value(true)
                .value_name("COUNT"),
        )
        .arg(
            Arg::with_name(arg_max_blksize)
                .long("max-blksize")
                .help("the largest blksize a client may negotiate")
                .takes_value(true)
                .value_name("BYTES"),
        )
        .get_matches();

    let addrs = matches
        .values_of(arg_ip)
        .map(|ips| {
            ips.map(|s| {
                // try parsing in order: first ip:port, then just ip
                if let Ok(sk) = SocketAddr::from_str(s) {
                    (sk.ip(), Some(sk.port()))
                } else if let Ok(ip) = IpAddr::from_str(s) {
                    (ip, None)
                } else {
                    panic!("error parsing argument \"{}\" as ip address", s);
                }
            })
            .collect()
        })
        .unwrap_or_else(|| {
            vec![
                (IpAddr::from([127, 0, 0, 1]), Some(69)),
                (IpAddr::from([0; 16]), Some(69)),
            ]
        });

    let timeout = matches
        .value_of(arg_timeout)
        .map(|s| {
            let n = u64::from_str(s).expect(&format!("error parsing \"{}\" as timeout", s));
            if n == 0 {
                panic!("timeout may not be 0 seconds")
            }
            n
        })
        .unwrap_or(3);
    let timeout = Duration::from_secs(timeout);

    let dir = matches.value_of(arg_dir).map(|dir| {
        let path = Path::new(dir);
        assert!(path.exists(), "specified path \"{}\" does not exist", dir);
        path.to_owned()
    });

    let max_retries = matches
        .value_of(arg_max_retries)
        .map(|s| u32::from_str(s).expect(&format!("error parsing \"{}\" as max-retries", s)))
        .unwrap_or(4);

    let max_blksize = matches
        .value_of(arg_max_blksize)
        .map(|s| u16::from_str(s).expect(&format!("error parsing \"{}\" as max-blksize", s)))
        .unwrap_or(1468);

    let cfg = ServerConfig {
        readonly: matches.is_present(arg_readonly),
        can_read: !matches.is_present(arg_no_read),
        addrs,
        dir,
        timeout,
        max_retries,
        max_blksize,
    };

    let mut server = TftpServer::with_cfg(&cfg).expect("Error creating server");

    match server.run() {
        Ok(_) => println!("Server completed successfully!"),
        Err(e) => println!("Error: {:?}", e),
    }
}
