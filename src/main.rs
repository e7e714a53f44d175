use clap::Parser;
use dnsseedd::config::{self, SeederConfig};
use dnsseedd::dns::{DnsServer, SharedAnswers};
use dnsseedd::seeder::Seeder;
use dnsseedd::stats::NodeCounts;
use log::{info, LevelFilter};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};
use std::collections::HashMap;
use std::process;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Comma-separated list of JSON network files to load.
    #[arg(long)]
    netfile: Option<String>,

    /// Port for the DNS server to listen on.
    #[arg(short = 'p', long = "port", default_value_t = 8053)]
    dns_port: u16,

    /// Write a network template file and exit.
    #[arg(short = 'j', long = "template")]
    template: bool,

    /// Display verbose output.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Display debug output.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Display stats output.
    #[arg(short = 's', long = "stats")]
    stats: bool,
}

fn load_configs(netfile: &str) -> Vec<SeederConfig> {
    let mut configs = Vec::new();

    for path in netfile.split(',').filter(|p| !p.is_empty()) {
        match config::load_network(path) {
            Ok(cfg) => configs.push(cfg),
            Err(e) => {
                eprintln!("error loading data from netfile {path} - {e}");
                process::exit(1);
            }
        }
    }

    if configs.is_empty() {
        eprintln!("error - no filenames specified, please add --netfile <file[,file2]>");
        process::exit(1);
    }

    if let Err(e) = config::check_duplicates(&configs) {
        eprintln!("error - {e}");
        process::exit(1);
    }

    configs
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.template {
        if let Err(e) = config::write_template() {
            eprintln!("error creating template file: {e}");
            process::exit(1);
        }
        println!("template file has been created");
        return;
    }

    let level = if args.debug {
        LevelFilter::Debug
    } else if args.verbose || args.stats {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    let _ = TermLogger::init(
        level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );

    let Some(netfile) = args.netfile.as_deref() else {
        eprintln!("error - no filenames specified, please add --netfile <file[,file2]>");
        process::exit(1);
    };
    let configs = load_configs(netfile);

    for cfg in &configs {
        info!("system is configured for network: {}", cfg.name);
    }
    if !args.verbose && !args.debug {
        info!("running in quiet mode with limited output produced");
    }

    let answers: SharedAnswers = Arc::new(RwLock::new(HashMap::new()));

    // One counter block per network, shared between its seeder and the DNS
    // front-end.
    let counts: Vec<Arc<std::sync::RwLock<NodeCounts>>> = configs
        .iter()
        .map(|_| Arc::new(std::sync::RwLock::new(NodeCounts::new())))
        .collect();

    let socket = match UdpSocket::bind(("0.0.0.0", args.dns_port)).await {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("failed to bind DNS port {}: {e}", args.dns_port);
            process::exit(1);
        }
    };
    info!("DNS server listening on udp port {}", args.dns_port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let front_end = DnsServer::new(
        answers.clone(),
        configs
            .iter()
            .zip(&counts)
            .map(|(cfg, counts)| (cfg.dns_host.clone(), Arc::clone(counts)))
            .collect(),
    );
    let dns_task = tokio::spawn(front_end.serve(socket, shutdown_rx.clone()));

    let mut seeders = Vec::new();
    for (cfg, counts) in configs.into_iter().zip(counts) {
        let seeder = Seeder::new(cfg, answers.clone(), counts);
        seeders.push(tokio::spawn(seeder.run(shutdown_rx.clone())));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("failed to listen for shutdown signal: {e}");
    }
    println!("\nshutting down on signal");

    // Flip the shutdown flag and wait for the seeders to wind down.
    let _ = shutdown_tx.send(true);
    for handle in seeders {
        let _ = handle.await;
    }
    let _ = dns_task.await;

    println!("program exiting, bye");
}
