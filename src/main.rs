//! dtlspipe command-line entry point
//!
//! Subcommands:
//!
//! ```bash
//! # Generate a key, run a server and a client
//! dtlspipe genpsk
//! DTLSPIPE_PSK=<hex> dtlspipe server 0.0.0.0:2443 127.0.0.1:51820
//! DTLSPIPE_PSK=<hex> dtlspipe client 127.0.0.1:51821 example.org:2443
//!
//! # Hop between endpoints, weighted by address-range size
//! DTLSPIPE_PSK=<hex> dtlspipe hoppingclient 127.0.0.1:51821 \
//!     '192.168.0.0/16,10.0.0.0/8:50000-60000'
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dtlspipe::addrgen::{EndpointGen, EqualMultiEndpointGen, SingleEndpoint};
use dtlspipe::admission::{allow_by_rate_limit, parse_time_limit, TimeLimit};
use dtlspipe::ciphers;
use dtlspipe::client::{Client, ClientConfig};
use dtlspipe::keystore::{gen_psk_hex, psk_from_hex, StaticKeystore, MAX_PSK_LENGTH};
use dtlspipe::ratelimit::RateLimiter;
use dtlspipe::server::{Server, ServerConfig};
use dtlspipe::tracker::StaleMode;
use dtlspipe::{PSK_ENV_VAR, VERSION};

const PROG_NAME: &str = "dtlspipe";

/// Exit code for usage errors and startup failures.
const EXIT_USAGE: u8 = 2;

/// Exit code for key-generation failures.
const EXIT_GEN: u8 = 1;

/// Parsed command line.
struct Args {
    timeout: Duration,
    idle_time: Duration,
    psk: Option<String>,
    key_length: usize,
    identity: String,
    mtu: usize,
    skip_hello_verify: bool,
    cid: bool,
    ciphers: Vec<webrtc_dtls::cipher_suite::CipherSuiteId>,
    curves: Vec<webrtc_dtls::curve::named_curve::NamedCurve>,
    stale_mode: StaleMode,
    rate_limit: Option<RateLimiter>,
    time_limit: TimeLimit,
    cpuprofile: Option<std::path::PathBuf>,
    command: Command,
}

enum Command {
    Server { bind: String, remote: String },
    Client { bind: String, remote: String },
    HoppingClient { bind: String, groups: Vec<String> },
    GenPsk,
    Ciphers,
    Curves,
    Version,
}

impl Args {
    fn defaults() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            idle_time: Duration::from_secs(30),
            psk: None,
            key_length: 16,
            identity: String::new(),
            mtu: 1400,
            skip_hello_verify: true,
            cid: true,
            ciphers: Vec::new(),
            curves: Vec::new(),
            stale_mode: StaleMode::Either,
            rate_limit: Some(RateLimiter::new(20, Duration::from_secs(60))),
            time_limit: TimeLimit::default(),
            cpuprofile: None,
            command: Command::Version,
        }
    }

    /// Parse flags and the positional subcommand. Errors are usage errors.
    fn parse(argv: &[String]) -> Result<Self, String> {
        let mut args = Self::defaults();
        let mut positional: Vec<String> = Vec::new();
        let mut iter = argv.iter().peekable();

        while let Some(arg) = iter.next() {
            if !arg.starts_with('-') {
                positional.push(arg.clone());
                // Everything after the subcommand is positional.
                positional.extend(iter.by_ref().cloned());
                break;
            }
            let name = arg.trim_start_matches('-');
            let (name, inline_value) = match name.split_once('=') {
                Some((n, v)) => (n, Some(v.to_string())),
                None => (name, None),
            };
            let mut value = |iter: &mut std::iter::Peekable<std::slice::Iter<String>>| {
                inline_value
                    .clone()
                    .or_else(|| iter.next().cloned())
                    .ok_or_else(|| format!("flag -{name} needs a value"))
            };
            match name {
                "timeout" => args.timeout = parse_duration_flag("timeout", &value(&mut iter)?)?,
                "idle-time" => {
                    args.idle_time = parse_duration_flag("idle-time", &value(&mut iter)?)?;
                }
                "psk" => args.psk = Some(value(&mut iter)?),
                "key-length" => {
                    let v = value(&mut iter)?;
                    args.key_length = v
                        .parse()
                        .map_err(|_| format!("invalid -key-length {v:?}"))?;
                }
                "identity" => args.identity = value(&mut iter)?,
                "mtu" => {
                    let v = value(&mut iter)?;
                    args.mtu = v.parse().map_err(|_| format!("invalid -mtu {v:?}"))?;
                }
                "skip-hello-verify" => {
                    args.skip_hello_verify = parse_bool_flag(inline_value.clone())?;
                }
                "cid" => args.cid = parse_bool_flag(inline_value.clone())?,
                "ciphers" => {
                    args.ciphers = ciphers::parse_cipher_list(&value(&mut iter)?)
                        .map_err(|e| e.to_string())?;
                }
                "curves" => {
                    args.curves = ciphers::parse_curve_list(&value(&mut iter)?)
                        .map_err(|e| e.to_string())?;
                }
                "stale-mode" => args.stale_mode = value(&mut iter)?.parse()?,
                "rate-limit" => {
                    let v = value(&mut iter)?;
                    args.rate_limit = if v.is_empty() {
                        None
                    } else {
                        Some(v.parse().map_err(|e: dtlspipe::ratelimit::RateLimitError| {
                            e.to_string()
                        })?)
                    };
                }
                "time-limit" => {
                    let v = value(&mut iter)?;
                    args.time_limit =
                        parse_time_limit(&v).map_err(|e| format!("invalid -time-limit {v:?}: {e}"))?;
                }
                "cpuprofile" => args.cpuprofile = Some(value(&mut iter)?.into()),
                other => return Err(format!("unknown flag: -{other}")),
            }
        }

        args.command = match positional.as_slice() {
            [] => return Err("no command given".into()),
            [cmd] => match cmd.as_str() {
                "genpsk" => Command::GenPsk,
                "ciphers" => Command::Ciphers,
                "curves" => Command::Curves,
                "version" => Command::Version,
                other => return Err(format!("unknown command: {other:?}")),
            },
            [cmd, bind, remote] if cmd == "server" => Command::Server {
                bind: bind.clone(),
                remote: remote.clone(),
            },
            [cmd, bind, remote] if cmd == "client" => Command::Client {
                bind: bind.clone(),
                remote: remote.clone(),
            },
            [cmd, bind, groups @ ..] if cmd == "hoppingclient" && !groups.is_empty() => {
                Command::HoppingClient {
                    bind: bind.clone(),
                    groups: groups.to_vec(),
                }
            }
            other => return Err(format!("unexpected arguments: {other:?}")),
        };

        Ok(args)
    }
}

fn parse_duration_flag(flag: &str, value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| format!("invalid -{flag} {value:?}: {e}"))
}

/// Bool flags take no value argument; `-flag=false` turns them off.
fn parse_bool_flag(inline: Option<String>) -> Result<bool, String> {
    match inline.as_deref() {
        None | Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(format!("invalid boolean value {other:?}")),
    }
}

fn usage() {
    eprintln!(
        r#"Usage:

{p} [OPTION]... server <BIND ADDRESS> <REMOTE ADDRESS>

  Listen on BIND ADDRESS for DTLS datagrams, forward decrypted UDP
  datagrams to REMOTE ADDRESS.

{p} [OPTION]... client <BIND ADDRESS> <REMOTE ADDRESS>

  Listen on BIND ADDRESS for UDP datagrams, forward encrypted DTLS
  datagrams to REMOTE ADDRESS.

{p} [OPTION]... hoppingclient <BIND ADDRESS> <ENDPOINT GROUP> [ENDPOINT GROUP]...

  Like client, but pick a random remote endpoint per session. Endpoint
  group syntax:

    ENDPOINT-GROUP = address-term *( "," address-term ) ":" Port
    address-term   = Domain / IP-range / IP-prefix / IP-address
    IP-range       = ( IPv4address ".." IPv4address ) /
                     ( IPv6address ".." IPv6address )
    IP-prefix      = IP-address "/" 1*DIGIT
    Port           = port / port "-" port

  A group is chosen uniformly at random; within the group, terms are
  weighted by the number of addresses they cover. Domains and single
  addresses count as one address.

  Example: '192.168.0.0/16,10.0.0.0/8,172.16.0.0..172.31.255.255:50000-60000'

{p} [OPTION]... genpsk

  Generate a PSK and print it hex-encoded.

{p} ciphers | curves

  Print supported cipher suites / elliptic curves, one per line.

{p} version

  Print program version.

Options:
  -timeout D            network operation timeout (default 10s)
  -idle-time D          max idle time per session direction (default 30s)
  -psk HEX              hex-encoded pre-shared key (overrides {env})
  -key-length N         genpsk: key length in bytes, at most {maxlen} (default 16)
  -identity S           client: PSK identity sent to the server
  -mtu N                DTLS fragment MTU (default 1400)
  -skip-hello-verify    server: skip the HelloVerifyRequest round (default true)
  -cid                  enable the connection-id extension (default true)
  -ciphers C1:C2:...    colon-separated cipher suite list
  -curves C1:C2:...     colon-separated curve list
  -stale-mode MODE      both, either, left or right (default either)
  -rate-limit N/D       per-source-IP admission rate; empty disables (default 20/1m)
  -time-limit D[-D2]    hard session duration limit; a range draws uniformly
  -cpuprofile PATH      write a CPU flamegraph to PATH on shutdown
"#,
        p = PROG_NAME,
        env = PSK_ENV_VAR,
        maxlen = MAX_PSK_LENGTH,
    );
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Resolve the PSK from the `-psk` flag or the environment.
fn resolve_psk(args: &Args) -> Result<Vec<u8>, String> {
    let hex = match &args.psk {
        Some(flag) => flag.clone(),
        None => match std::env::var(PSK_ENV_VAR) {
            Ok(v) if !v.is_empty() => v,
            _ => {
                return Err(format!(
                    "no -psk option provided and {PSK_ENV_VAR} environment variable is not set"
                ))
            }
        },
    };
    psk_from_hex(&hex).map_err(|e| format!("can't decode PSK: {e}"))
}

fn parse_bind(bind: &str) -> Result<SocketAddr, String> {
    bind.parse()
        .map_err(|_| format!("can't parse bind address {bind:?}"))
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = term.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt, shutting down");
    }
}

fn cmd_genpsk(args: &Args) -> u8 {
    if args.key_length > MAX_PSK_LENGTH {
        eprintln!("key length is too big");
        return EXIT_GEN;
    }
    match gen_psk_hex(args.key_length) {
        Ok(psk) => {
            println!("{psk}");
            0
        }
        Err(e) => {
            eprintln!("key generation error: {e}");
            EXIT_GEN
        }
    }
}

fn cmd_ciphers() -> u8 {
    for &id in ciphers::FULL_CIPHER_LIST {
        println!("{}", ciphers::cipher_id_to_name(id));
    }
    0
}

fn cmd_curves() -> u8 {
    for &curve in ciphers::FULL_CURVE_LIST {
        println!("{}", ciphers::curve_to_name(curve));
    }
    0
}

/// Endpoint generator that logs each pick, for hopping visibility.
struct LoggedEndpoints<G>(G);

impl<G: EndpointGen> EndpointGen for LoggedEndpoints<G> {
    fn endpoint(&self) -> String {
        let endpoint = self.0.endpoint();
        info!(endpoint = %endpoint, "selected new endpoint");
        endpoint
    }

    fn power(&self) -> num_bigint::BigUint {
        self.0.power()
    }
}

async fn cmd_client(args: Args, bind: &str, endpoints: Arc<dyn EndpointGen>) -> u8 {
    let psk = match resolve_psk(&args) {
        Ok(psk) => psk,
        Err(e) => {
            error!("can't get PSK: {e}");
            return EXIT_USAGE;
        }
    };
    let bind_addr = match parse_bind(bind) {
        Ok(addr) => addr,
        Err(e) => {
            error!("{e}");
            return EXIT_USAGE;
        }
    };

    let mut cfg = ClientConfig::new(bind_addr, endpoints, Arc::new(StaticKeystore::new(&psk)));
    cfg.psk_identity = args.identity;
    cfg.timeout = args.timeout;
    cfg.idle_timeout = args.idle_time;
    cfg.mtu = args.mtu;
    cfg.cipher_suites = args.ciphers;
    cfg.elliptic_curves = args.curves;
    cfg.stale_mode = args.stale_mode;
    cfg.time_limit = args.time_limit;
    cfg.allow = allow_by_rate_limit(args.rate_limit.map(Arc::new));
    cfg.enable_cid = args.cid;
    cfg.shutdown = CancellationToken::new();

    let client = match Client::new(cfg).await {
        Ok(client) => client,
        Err(e) => {
            error!("client startup failed: {e}");
            return EXIT_USAGE;
        }
    };

    wait_for_shutdown().await;
    client.close().await;
    info!("dtlspipe client stopped");
    0
}

async fn cmd_server(args: Args, bind: &str, remote: &str) -> u8 {
    let psk = match resolve_psk(&args) {
        Ok(psk) => psk,
        Err(e) => {
            error!("can't get PSK: {e}");
            return EXIT_USAGE;
        }
    };
    let bind_addr = match parse_bind(bind) {
        Ok(addr) => addr,
        Err(e) => {
            error!("{e}");
            return EXIT_USAGE;
        }
    };

    info!("starting dtlspipe server: {bind} =[unwrap from DTLS]=> {remote}");

    let mut cfg = ServerConfig::new(
        bind_addr,
        remote.to_string(),
        Arc::new(StaticKeystore::new(&psk)),
    );
    cfg.timeout = args.timeout;
    cfg.idle_timeout = args.idle_time;
    cfg.mtu = args.mtu;
    cfg.skip_hello_verify = args.skip_hello_verify;
    cfg.cipher_suites = args.ciphers;
    cfg.elliptic_curves = args.curves;
    cfg.stale_mode = args.stale_mode;
    cfg.time_limit = args.time_limit;
    cfg.allow = allow_by_rate_limit(args.rate_limit.map(Arc::new));
    cfg.enable_cid = args.cid;
    cfg.shutdown = CancellationToken::new();

    let server = match Server::new(cfg).await {
        Ok(server) => server,
        Err(e) => {
            error!("server startup failed: {e}");
            return EXIT_USAGE;
        }
    };

    wait_for_shutdown().await;
    server.close().await;
    info!("dtlspipe server stopped");
    0
}

async fn run() -> u8 {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match Args::parse(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{PROG_NAME}: {e}");
            usage();
            return EXIT_USAGE;
        }
    };

    #[cfg(unix)]
    let profiler = match args.cpuprofile.clone() {
        None => None,
        Some(path) => match pprof::ProfilerGuard::new(99) {
            Ok(guard) => Some((path, guard)),
            Err(e) => {
                eprintln!("can't start CPU profiler: {e}");
                return EXIT_USAGE;
            }
        },
    };

    let mut args = args;
    let command = std::mem::replace(&mut args.command, Command::Version);
    let code = match command {
        Command::GenPsk => cmd_genpsk(&args),
        Command::Ciphers => cmd_ciphers(),
        Command::Curves => cmd_curves(),
        Command::Version => {
            println!("{VERSION}");
            0
        }
        Command::Server { bind, remote } => {
            init_logging();
            cmd_server(args, &bind, &remote).await
        }
        Command::Client { bind, remote } => {
            init_logging();
            info!("starting dtlspipe client: {bind} =[wrap into DTLS]=> {remote}");
            let endpoints = Arc::new(SingleEndpoint(remote));
            cmd_client(args, &bind, endpoints).await
        }
        Command::HoppingClient { bind, groups } => {
            init_logging();
            info!("starting dtlspipe client: {bind} =[wrap into DTLS]=> {groups:?}");
            let gen = match EqualMultiEndpointGen::from_specs(&groups) {
                Ok(gen) => gen,
                Err(e) => {
                    error!("can't construct endpoint generator: {e}");
                    return EXIT_USAGE;
                }
            };
            cmd_client(args, &bind, Arc::new(LoggedEndpoints(gen))).await
        }
    };

    #[cfg(unix)]
    if let Some((path, guard)) = profiler {
        match guard.report().build() {
            Ok(report) => match std::fs::File::create(&path) {
                Ok(file) => {
                    if let Err(e) = report.flamegraph(file) {
                        eprintln!("can't write CPU profile: {e}");
                    }
                }
                Err(e) => eprintln!("can't create {}: {e}", path.display()),
            },
            Err(e) => eprintln!("can't build CPU profile report: {e}"),
        }
    }

    code
}

#[tokio::main]
async fn main() -> ExitCode {
    ExitCode::from(run().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &[&str]) -> Result<Args, String> {
        let argv: Vec<String> = line.iter().map(ToString::to_string).collect();
        Args::parse(&argv)
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = parse(&["version"]).unwrap();
        assert_eq!(args.timeout, Duration::from_secs(10));
        assert_eq!(args.idle_time, Duration::from_secs(30));
        assert_eq!(args.mtu, 1400);
        assert_eq!(args.key_length, 16);
        assert!(args.skip_hello_verify);
        assert!(args.cid);
        assert_eq!(args.stale_mode, StaleMode::Either);
        assert_eq!(args.rate_limit.unwrap().to_string(), "20/1m");
    }

    #[test]
    fn flags_with_separate_and_inline_values() {
        let args = parse(&["-timeout", "5s", "-mtu=1200", "client", "127.0.0.1:1", "h:2"]).unwrap();
        assert_eq!(args.timeout, Duration::from_secs(5));
        assert_eq!(args.mtu, 1200);
        assert!(matches!(args.command, Command::Client { .. }));
    }

    #[test]
    fn bool_flags_take_no_value() {
        let args = parse(&["-cid", "-skip-hello-verify=false", "ciphers"]).unwrap();
        assert!(args.cid);
        assert!(!args.skip_hello_verify);
    }

    #[test]
    fn empty_rate_limit_disables_admission_limiting() {
        let args = parse(&["-rate-limit=", "version"]).unwrap();
        assert!(args.rate_limit.is_none());
    }

    #[test]
    fn hopping_client_collects_groups() {
        let args = parse(&[
            "hoppingclient",
            "127.0.0.1:51821",
            "example.org:20000-50000",
            "10.0.0.0/8:443",
        ])
        .unwrap();
        match args.command {
            Command::HoppingClient { groups, .. } => assert_eq!(groups.len(), 2),
            _ => panic!("expected hoppingclient"),
        }
    }

    #[test]
    fn usage_errors_are_reported() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
        assert!(parse(&["server", "only-bind"]).is_err());
        assert!(parse(&["hoppingclient", "bind-only"]).is_err());
        assert!(parse(&["-unknown-flag", "version"]).is_err());
        assert!(parse(&["-timeout", "nonsense", "version"]).is_err());
    }

    #[test]
    fn time_limit_and_stale_mode_parse() {
        let args = parse(&["-time-limit", "1s-2s", "-stale-mode", "both", "version"]).unwrap();
        assert_eq!(args.stale_mode, StaleMode::Both);
        let draw = args.time_limit.draw();
        assert!(draw >= Duration::from_secs(1) && draw < Duration::from_secs(2));
    }
}
