// Terminal chat client for the tricast relay.
//
// Connects with a display name, then reads lines from stdin and sends them:
//   text        reliable (relayed by the server over TCP)
//   /t text     reliable
//   /u text     unicast datagram (relayed by the server over UDP)
//   /m text     group datagram (multicast, no server involved)
//
// A printer thread shows incoming traffic tagged [TCP], [UDP] or
// [MULTICAST]. If the server goes away the client reports it and exits with
// status 1.

use std::io::{self, BufRead, Write};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing::error;
use tricast_relay::client::{ClientConfig, GroupConfig, Incoming, RelayClient};
use tricast_relay::command::{Command, parse_line};

#[derive(Debug, Parser)]
#[command(name = "chat", about = "Chat over the tricast relay")]
struct Args {
    /// Relay server host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Relay server port (TCP and UDP).
    #[arg(long, default_value_t = 8000)]
    port: u16,
    /// Multicast group address.
    #[arg(long, default_value_t = Ipv4Addr::new(224, 0, 0, 1))]
    group: Ipv4Addr,
    /// Multicast group port.
    #[arg(long, default_value_t = 8001)]
    group_port: u16,
    /// Do not join the multicast group.
    #[arg(long)]
    no_group: bool,
    /// Display name; prompted for when omitted.
    #[arg(long)]
    name: Option<String>,
}

fn main() {
    tricast_relay::init_logging();
    let args = Args::parse();

    let display_name = match args.name.clone().filter(|name| !name.is_empty()) {
        Some(name) => name,
        None => match prompt_name() {
            Some(name) => name,
            None => std::process::exit(1),
        },
    };
    let config = ClientConfig {
        server_host: args.host,
        server_port: args.port,
        display_name,
        group: (!args.no_group).then(|| GroupConfig {
            address: args.group,
            port: args.group_port,
            ..GroupConfig::default()
        }),
    };

    let client = match RelayClient::connect(config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("could not connect: {e}");
            std::process::exit(1);
        }
    };

    let printer = client.clone();
    thread::spawn(move || print_incoming(&printer));

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let sent = match parse_line(&line) {
            None => continue,
            Some(Command::Reliable(text)) => client.send_reliable(&text),
            Some(Command::Unicast(text)) => client.send_unicast(&text),
            Some(Command::Group(text)) => client.send_group(&text),
            Some(Command::Invalid(name)) => {
                println!("Invalid command /{name}");
                continue;
            }
        };
        if let Err(e) = sent {
            error!("send failed: {e}");
        }
    }
    client.close();
}

/// Ask for a display name until a non-empty one is entered. `None` on EOF.
fn prompt_name() -> Option<String> {
    let stdin = io::stdin();
    loop {
        print!("Your name: ");
        let _ = io::stdout().flush();
        let mut name = String::new();
        match stdin.lock().read_line(&mut name) {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        let name = name.trim();
        if !name.is_empty() {
            return Some(name.to_owned());
        }
    }
}

/// Print everything the client receives; exit the process when the server
/// disconnects.
fn print_incoming(client: &RelayClient) {
    while let Some(incoming) = client.recv() {
        match incoming {
            Incoming::Reliable(text) => println!("[TCP] {text}"),
            Incoming::Unicast(text) => println!("[UDP] {text}"),
            Incoming::Group(text) => println!("[MULTICAST] {text}"),
            Incoming::Disconnected => {
                error!("server disconnected");
                std::process::exit(1);
            }
        }
    }
}
