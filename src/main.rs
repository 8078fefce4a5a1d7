use std::{
    error::Error,
    io,
    net::{SocketAddr, TcpListener, UdpSocket},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    thread,
    time::Duration,
};

use arc_swap::ArcSwap;
use shadowlease::{
    config::Config,
    leasedb::LeaseDb,
    logging, mgmt,
    repository::{JsonFileRepository, LeaseRepository, MemoryRepository},
    v4,
};
use tracing::{error, info, warn, Level};

const HELP: &str = "\
shadowlease - DHCPv4 address assignment server

USAGE:
  shadowlease [OPTIONS]

OPTIONS:
  --config PATH      configuration file [default: config.json]
  --leases PATH      lease file, bindings are kept in memory when omitted
  --bind ADDR        DHCP listen address [default: 0.0.0.0:67]
  --workers N        number of worker threads [default: 4]
  --mgmt ADDR        management listen address, e.g. 127.0.0.1:8547
  --log-level LEVEL  trace, debug, info, warn or error [default: info]
  --log-json         log as JSON lines
  -h, --help         print this help
";

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

struct Args {
    config: PathBuf,
    leases: Option<PathBuf>,
    bind: SocketAddr,
    workers: usize,
    mgmt: Option<SocketAddr>,
    log_level: Level,
    log_json: bool,
}

fn parse_args() -> Result<Option<Args>, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        return Ok(None);
    }

    let args = Args {
        config: pargs
            .opt_value_from_str("--config")?
            .unwrap_or_else(|| PathBuf::from("config.json")),
        leases: pargs.opt_value_from_str("--leases")?,
        bind: pargs
            .opt_value_from_str("--bind")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], v4::worker::SERVER_PORT))),
        workers: pargs.opt_value_from_str("--workers")?.unwrap_or(4),
        mgmt: pargs.opt_value_from_str("--mgmt")?,
        log_level: pargs.opt_value_from_str("--log-level")?.unwrap_or(Level::INFO),
        log_json: pargs.contains("--log-json"),
    };

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        eprintln!("Warning: unused arguments left: {remaining:?}");
    }
    Ok(Some(args))
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if args.log_json {
        logging::init_json(args.log_level);
    } else {
        logging::init_stdout(args.log_level);
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = Config::load(&args.config)?;
    info!(
        path = %args.config.display(),
        links = config.links.len(),
        server_id = %config.server_id,
        "loaded configuration"
    );
    let config = Arc::new(ArcSwap::from_pointee(config));

    let repository: Arc<dyn LeaseRepository> = match &args.leases {
        Some(path) => Arc::new(JsonFileRepository::open(path)?),
        None => {
            warn!("no lease file given, bindings are kept in memory only");
            Arc::new(MemoryRepository::new())
        }
    };
    let leases = Arc::new(LeaseDb::new(repository));
    leases.restore()?;
    leases.spawn_cleanup_thread(CLEANUP_INTERVAL)?;

    #[cfg(unix)]
    shadowlease::signal::spawn_sighup_handler(config.clone(), args.config.clone())?;

    if let Some(addr) = args.mgmt {
        let listener = TcpListener::bind(addr)?;
        info!(%addr, "management listener started");
        let mgmt_config = config.clone();
        let mgmt_leases = leases.clone();
        let config_path = args.config.clone();
        thread::Builder::new()
            .name("mgmt".to_string())
            .spawn(move || mgmt::listener(listener, mgmt_config, mgmt_leases, config_path))?;
    }

    let socket = UdpSocket::bind(args.bind)?;
    // replies to clients without an address are broadcast
    socket.set_broadcast(true)?;
    let workers = args.workers.max(1);
    info!(bind = %args.bind, workers, "listening for DHCPv4");

    thread::scope(|s| -> io::Result<()> {
        for n in 0..workers {
            let socket = socket.try_clone()?;
            let leases = leases.clone();
            let config = config.clone();
            thread::Builder::new()
                .name(format!("v4worker-{n}"))
                .spawn_scoped(s, move || v4::v4_worker(socket, leases, config))?;
        }
        Ok(())
    })?;

    Ok(())
}
