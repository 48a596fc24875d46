use std::io::BufRead;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry_net::opts::{parse_args, Mode};
use gantry_net::{keystore, serve};

fn usage(msg: Option<&str>) -> i32 {
    if let Some(msg) = msg {
        eprintln!("{msg}\n");
    }
    eprintln!(
        "Usage:\n\
         Forward local clients (push):\n\
         \tgantry-net [-Xtd] -s connpoint [tag@]host port\n\
         \t    (inherit socket) -S fd_no host port\n\n\
         Serve a local binary (pull):\n\
         \tgantry-net -l port [ip] -exec /usr/bin/app arg1 .. argn\n\n\
         Bridge inbound connections to ARCAN_CONNPATH:\n\
         \tgantry-net [-Xtd] -l port [ip]\n\n\
         Bridge one outbound connection:\n\
         \tgantry-net [tag@]host [port]\n\n\
         Forward-local options:\n\
         \t-X            \tdisable EXIT-redirect to ARCAN_CONNPATH env (if set)\n\
         \t-r, --retry n \tlimit retry-reconnect attempts to 'n' tries\n\n\
         Options:\n\
         \t-a, --auth    \tread authentication secret from stdin\n\
         \t-t            \tsingle-client (no fork)\n\
         \t-d spec       \tset trace bitmap (decimal or group1,group2,...)\n\n\
         Environment variables:\n\
         \tARCAN_CONNPATH \tlocal connpoint for inbound/outbound bridging\n\
         \tARCAN_STATEPATH\tkeystore and state directory\n\
         \tA12_CACHE_DIR  \tbinary blob cache\n\n\
         Keystore mode (ignores connection arguments):\n\
         \tgantry-net keystore tag host [port={}]\n\n\
         Trace groups:\n\
         \t{}",
        keystore::DEFAULT_PORT,
        gantry_net::TRACE_GROUPS.join(", ")
    );
    1
}

fn init_tracing(trace: u32) {
    let default = if trace != 0 { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn keystore_command(args: &[String]) -> i32 {
    let dir = match keystore::statepath() {
        Some(d) => d,
        None => return usage(Some("missing basedir with keystore (set ARCAN_STATEPATH)")),
    };
    if args.len() < 2 {
        return usage(Some("missing tag / host arguments"));
    }

    let tag = &args[0];
    let host = &args[1];
    let port = match args.get(2) {
        None => keystore::DEFAULT_PORT,
        Some(p) => match p.parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => return usage(Some("port argument is invalid or out of range")),
        },
    };

    match keystore::register(&dir, tag, host, port) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("couldn't register {tag}: {e}");
            1
        }
    }
}

fn read_stdin_secret() -> Option<Vec<u8>> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok()?;
    let trimmed = line.trim_end_matches('\n');
    (!trimmed.is_empty()).then(|| trimmed.as_bytes().to_vec())
}

fn run() -> i32 {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && args[1] == "keystore" {
        return keystore_command(&args[2..]);
    }
    if args.len() < 2 || (args.len() == 2 && (args[1] == "-h" || args[1] == "--help")) {
        return usage(None);
    }

    let (opts, argi) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(msg) => return usage(Some(&msg)),
    };

    init_tracing(opts.trace);

    // Broken pipes surface as write errors; child reaping is implicit since
    // forked bridges are terminal.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }

    if let Some(cache) = std::env::var_os("A12_CACHE_DIR") {
        if let Err(e) = std::fs::create_dir_all(&cache) {
            tracing::warn!(error = %e, "couldn't prepare blob cache directory");
        }
    }

    let secret = if opts.read_secret {
        read_stdin_secret()
    } else {
        None
    };
    let secret = secret.as_deref();

    match opts.mode {
        Mode::Cl | Mode::Exec => serve::run_listen(&opts, secret),
        Mode::Srv => serve::run_connect(&opts, secret),
        Mode::SrvInherit => {
            // The descriptor must actually be a socket before we build on it.
            let fd = opts.sockfd.unwrap_or(-1);
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } == -1 {
                return usage(Some("couldn't stat -S descriptor"));
            }
            if st.st_mode & libc::S_IFMT != libc::S_IFSOCK {
                return usage(Some("-S descriptor does not point to a socket"));
            }
            serve::run_preauth(&opts, secret)
        }
        Mode::Unset => {
            if argi < args.len() {
                serve::run_outbound(
                    &args[argi],
                    args.get(argi + 1).map(String::as_str),
                    &opts,
                    secret,
                )
            } else {
                usage(Some("no mode specified, please use -s or -l form"))
            }
        }
    }
}

fn main() {
    std::process::exit(run());
}
