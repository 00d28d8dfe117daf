//! dnsbench command-line binary
//!
//! Parses the flags into a validated [`Config`], opens the input source
//! and the per-worker socket banks, wires SIGINT into the coordinator's
//! interrupt channel, runs the engine and prints the report.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use dnsbench::clock::split_secs;
use dnsbench::config::{Config, ConfigError, Family};
use dnsbench::dns::{EdnsOption, TsigKey};
use dnsbench::engine::coordinator::{self, RunOutcome};
use dnsbench::input::QueryInput;
use dnsbench::net::poll::Pipe;
use dnsbench::net::{self, Mode, SocketOpts, Transport};
use dnsbench::{logging, stats};

/// DNS load generator and performance tester
#[derive(Parser, Debug)]
#[command(name = "dnsbench", version)]
#[command(about = "Benchmark DNS servers over UDP, TCP and TLS")]
struct Args {
    /// Address family of the DNS transport: any, inet or inet6
    #[arg(short = 'f', long, default_value = "any")]
    family: String,

    /// Transport mode: udp, tcp or tls
    #[arg(short = 'm', long, default_value = "udp")]
    mode: String,

    /// The server to query
    #[arg(short = 's', long, default_value = dnsbench::config::defaults::SERVER_NAME)]
    server: String,

    /// The port on which to query the server (default 53, or 853 for tls)
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// The local address from which to send queries
    #[arg(short = 'a', long)]
    local_addr: Option<String>,

    /// The local port from which to send queries (client k binds port+k)
    #[arg(short = 'x', long, default_value_t = 0)]
    local_port: u16,

    /// The input data file (stdin when omitted)
    #[arg(short = 'd', long)]
    datafile: Option<PathBuf>,

    /// The number of clients to act as
    #[arg(short = 'c', long, default_value_t = 1)]
    clients: u32,

    /// The number of worker threads to run
    #[arg(short = 'T', long, default_value_t = 1)]
    threads: u32,

    /// Run through the input at most N times (0 = unlimited; defaults to
    /// 1 unless a time limit is given)
    #[arg(short = 'n', long)]
    maxruns: Option<u32>,

    /// Run for at most this many seconds (fractional allowed)
    #[arg(short = 'l', long, default_value_t = 0.0)]
    timelimit: f64,

    /// Socket send/receive buffer size in kilobytes
    #[arg(short = 'b', long, default_value_t = 0)]
    bufsize: u32,

    /// The timeout for query completion in seconds (fractional allowed)
    #[arg(short = 't', long, default_value_t = dnsbench::config::defaults::TIMEOUT_SECS)]
    timeout: f64,

    /// Enable EDNS0
    #[arg(short = 'e', long)]
    edns: bool,

    /// Send an EDNS option (code:hexvalue, implies EDNS)
    #[arg(short = 'E', long)]
    edns_option: Option<String>,

    /// Set the DNSSEC OK bit (implies EDNS)
    #[arg(short = 'D', long)]
    dnssec: bool,

    /// TSIG key: [hmac-sha256:]name:base64secret
    #[arg(short = 'y', long)]
    tsig: Option<String>,

    /// The maximum number of queries outstanding
    #[arg(short = 'q', long, default_value_t = dnsbench::config::defaults::MAX_OUTSTANDING)]
    max_outstanding: u32,

    /// Limit the number of queries per second (0 = unlimited)
    #[arg(short = 'Q', long, default_value_t = 0)]
    max_qps: u32,

    /// Print queries-per-second statistics every N seconds
    #[arg(short = 'S', long, default_value_t = 0.0)]
    stats_interval: f64,

    /// Report every query and additional information to stdout
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log level for diagnostics on stderr
    #[arg(long, default_value = dnsbench::config::defaults::default_log_level())]
    log_level: String,
}

fn main() {
    let args = Args::parse();
    logging::init(&args.log_level);

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args)?;

    let input = Arc::new(
        QueryInput::open(args.datafile.as_deref())
            .map_err(|e| ConfigError::Input(e.to_string()))?,
    );
    input.set_max_passes(config.max_passes);

    print_initial_status(&config);

    let opts = SocketOpts {
        server_addr: config.server_addr,
        server_name: config.server_name.clone(),
        local_addr: config.local_addr,
        local_port: config.local_port,
        bufsize_kb: config.bufsize_kb,
    };
    let mut banks: Vec<Vec<Box<dyn Transport>>> = Vec::with_capacity(config.threads as usize);
    for i in 0..config.threads {
        let limits = config.worker_limits(i);
        banks.push(net::open_sockets(
            config.mode,
            &opts,
            limits.socket_offset,
            limits.nsocks,
        )?);
    }

    let interrupt = Arc::new(Pipe::new()?);
    let handler_pipe = Arc::clone(&interrupt);
    ctrlc::set_handler(move || handler_pipe.wake())?;

    let config = Arc::new(config);
    let outcome = coordinator::run(Arc::clone(&config), Arc::clone(&input), banks, interrupt)?;

    print_final_status(&config, &input, &outcome);
    let run_time = outcome.end_time.saturating_sub(outcome.start_time);
    outcome.summary.print(run_time);
    stats::print_latency_details(&outcome.reports);

    Ok(())
}

fn build_config(args: &Args) -> Result<Config, ConfigError> {
    let family: Family = args.family.parse()?;
    let mode: Mode = args.mode.parse().map_err(ConfigError::InvalidValue)?;
    let port = args.port.unwrap_or(match mode {
        Mode::Tls => dnsbench::config::defaults::DNS_TLS_PORT,
        _ => dnsbench::config::defaults::DNS_PORT,
    });
    let server_addr = net::resolve_server(family, &args.server, port)
        .map_err(|_| ConfigError::Resolve(args.server.clone()))?;
    let local_addr = args
        .local_addr
        .as_deref()
        .map(|s| {
            s.parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidValue(format!("invalid local address '{}'", s)))
        })
        .transpose()?;

    let tsig = args
        .tsig
        .as_deref()
        .map(|s| s.parse::<TsigKey>())
        .transpose()
        .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
    let edns_option = args
        .edns_option
        .as_deref()
        .map(|s| s.parse::<EdnsOption>())
        .transpose()
        .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

    // With neither a pass count nor a time limit, default to one pass.
    let max_passes = args
        .maxruns
        .unwrap_or(if args.timelimit > 0.0 { 0 } else { 1 });

    let mut config = Config {
        mode,
        server_addr,
        server_name: args.server.clone(),
        local_addr,
        local_port: args.local_port,
        clients: args.clients,
        threads: args.threads,
        max_passes,
        time_limit_us: secs_to_us(args.timelimit),
        timeout_us: secs_to_us(args.timeout),
        bufsize_kb: args.bufsize,
        edns: args.edns || args.dnssec || edns_option.is_some(),
        dnssec: args.dnssec,
        tsig,
        edns_option,
        max_outstanding: args.max_outstanding,
        max_qps: args.max_qps,
        stats_interval_us: secs_to_us(args.stats_interval),
        verbose: args.verbose,
    };
    config.validate()?;
    config.apply_thread_caps();
    Ok(config)
}

fn secs_to_us(secs: f64) -> u64 {
    if secs <= 0.0 {
        0
    } else {
        (secs * 1_000_000.0) as u64
    }
}

fn print_initial_status(config: &Config) {
    let argv: Vec<String> = std::env::args().collect();
    let name = argv
        .first()
        .map(|a| {
            Path::new(a)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| a.clone())
        })
        .unwrap_or_else(|| "dnsbench".to_string());
    print!("[Status] Command line: {}", name);
    for arg in argv.iter().skip(1) {
        print!(" {}", arg);
    }
    println!();

    println!("[Status] Sending queries (to {})", config.server_addr.ip());
    println!(
        "[Status] Started at: {}",
        chrono::Local::now().format("%a %b %e %H:%M:%S %Y")
    );

    print!("[Status] Stopping after ");
    if config.time_limit_us > 0 {
        let (sec, usec) = split_secs(config.time_limit_us);
        print!("{}.{:06} seconds", sec, usec);
    }
    if config.time_limit_us > 0 && config.max_passes > 0 {
        print!(" or ");
    }
    if config.max_passes > 0 {
        print!(
            "{} run{} through file",
            config.max_passes,
            if config.max_passes == 1 { "" } else { "s" }
        );
    }
    println!();
}

fn print_final_status(config: &Config, input: &QueryInput, outcome: &RunOutcome) {
    let reason = if outcome.interrupted {
        "interruption"
    } else if config.max_passes > 0 && input.passes() >= config.max_passes {
        "end of file"
    } else {
        "time limit"
    };
    println!("[Status] Testing complete ({})", reason);
    println!();
}
