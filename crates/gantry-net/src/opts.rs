//! Command-line parsing for the proxy.
//!
//! The grammar is positional and mode-driven, so the arguments are walked by
//! hand rather than through a derive layer.

use std::os::unix::io::RawFd;

/// Top-level operating mode, fixed by the first mode switch seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No mode switch given; positional host/tag means an outbound bridge.
    Unset,
    /// `-s`: local connpoint, outbound connection per local client.
    Srv,
    /// `-S`: like `Srv` but the local primitive is an inherited socket.
    SrvInherit,
    /// `-l`: accept inbound connections, local client from `ARCAN_CONNPATH`.
    Cl,
    /// `-l ... -exec`: inbound connections spawn a local client binary.
    Exec,
}

/// How accepted connections are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// One connection at a time, in-process.
    Single,
    /// Fork per connection.
    Fork,
}

#[derive(Debug)]
pub struct Opts {
    pub mode: Mode,
    pub dispatch: Dispatch,
    pub cp: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    /// Keystore tag for outbound `tag@` forms.
    pub tag: Option<String>,
    pub sockfd: Option<RawFd>,
    pub exec_bin: Option<String>,
    pub exec_argv: Vec<String>,
    /// Outbound retry budget; negative means retry forever.
    pub retry_count: i32,
    /// Read an authentication secret from stdin before serving.
    pub read_secret: bool,
    pub redirect_exit: Option<String>,
    pub devicehint_cp: Option<String>,
    pub trace: u32,
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            mode: Mode::Unset,
            dispatch: Dispatch::Fork,
            cp: None,
            host: None,
            port: None,
            tag: None,
            sockfd: None,
            exec_bin: None,
            exec_argv: Vec::new(),
            retry_count: -1,
            read_secret: false,
            // Default so the remote side cannot actually close the session:
            // on exit we redirect back to the local connpoint if one is set.
            redirect_exit: std::env::var("ARCAN_CONNPATH").ok(),
            devicehint_cp: std::env::var("ARCAN_CONNPATH").ok(),
            trace: 0,
        }
    }
}

/// Trace groups selectable by name with `-d`.
pub const TRACE_GROUPS: [&str; 9] = [
    "video",
    "audio",
    "system",
    "event",
    "missing",
    "alloc",
    "crypto",
    "vdetail",
    "btransfer",
];

/// Parse a `-d` argument: a decimal bitmap, or comma-separated group names.
pub fn parse_trace(spec: &str) -> u32 {
    if let Ok(v) = spec.parse::<u32>() {
        return v;
    }
    let mut res = 0;
    for part in spec.split(',') {
        if let Some(bit) = TRACE_GROUPS
            .iter()
            .position(|g| g.eq_ignore_ascii_case(part))
        {
            res |= 1 << bit;
        }
    }
    res
}

fn valid_port(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && s.parse::<u32>().map_or(false, |p| p > 0 && p <= 65535)
}

/// Walk the argument list. Remaining positional arguments (the outbound
/// `[tag@]host [port]` form) are left for the caller, which receives the
/// index of the first one.
pub fn parse_args(args: &[String]) -> Result<(Opts, usize), String> {
    const MODEERR: &str = "mixed or multiple -s / -S / -l arguments";
    let mut opts = Opts::default();

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        if !arg.starts_with('-') {
            break;
        }

        match arg {
            "-d" => {
                let spec = args
                    .get(i + 1)
                    .ok_or("-d without trace value argument")?;
                opts.trace = parse_trace(spec);
                i += 1;
            }
            "-s" => {
                if opts.mode != Mode::Unset {
                    return Err(MODEERR.into());
                }
                opts.mode = Mode::Srv;
                let cp = args.get(i + 1).ok_or("-s without connpoint")?;
                if cp.is_empty() || !cp.bytes().all(|b| b.is_ascii_alphanumeric()) {
                    return Err("invalid character in connpoint [a-Z,0-9]".into());
                }
                opts.cp = Some(cp.clone());
                opts.host = Some(
                    args.get(i + 2)
                        .ok_or("-s without room for host")?
                        .clone(),
                );
                let port = args.get(i + 3).ok_or("-s without room for port")?;
                if !valid_port(port) {
                    return Err("invalid port argument".into());
                }
                opts.port = Some(port.clone());
                if i + 4 != args.len() {
                    return Err("trailing arguments to -s connpoint host port".into());
                }
                return Ok((opts, args.len()));
            }
            "-S" => {
                if opts.mode != Mode::Unset {
                    return Err(MODEERR.into());
                }
                opts.mode = Mode::SrvInherit;
                let fd: RawFd = args
                    .get(i + 1)
                    .ok_or("-S without descriptor")?
                    .parse()
                    .map_err(|_| "-S descriptor is not a number")?;
                opts.sockfd = Some(fd);
                opts.host = Some(
                    args.get(i + 2)
                        .ok_or("-S without room for host")?
                        .clone(),
                );
                let port = args.get(i + 3).ok_or("-S without room for port")?;
                if !valid_port(port) {
                    return Err("invalid port argument".into());
                }
                opts.port = Some(port.clone());
                if i + 4 != args.len() {
                    return Err("trailing arguments to -S fd host port".into());
                }
                return Ok((opts, args.len()));
            }
            "-l" => {
                if opts.mode != Mode::Unset {
                    return Err(MODEERR.into());
                }
                opts.mode = Mode::Cl;
                let port = args.get(i + 1).ok_or("-l without port argument")?;
                if !valid_port(port) {
                    return Err("invalid values in port argument".into());
                }
                opts.port = Some(port.clone());
                i += 2;

                if i == args.len() {
                    return Ok((opts, i));
                }
                if args[i] != "-exec" {
                    opts.host = Some(args[i].clone());
                    i += 1;
                    if i == args.len() {
                        return Ok((opts, i));
                    }
                }
                if args[i] != "-exec" {
                    return Err("unexpected trailing argument, expected -exec or end".into());
                }
                if i + 1 == args.len() {
                    return Err("-exec without bin arg0 .. argn".into());
                }
                opts.mode = Mode::Exec;
                opts.exec_bin = Some(args[i + 1].clone());
                opts.exec_argv = args[i + 2..].to_vec();
                return Ok((opts, args.len()));
            }
            "-t" => opts.dispatch = Dispatch::Single,
            "-X" => {
                opts.redirect_exit = None;
            }
            "-a" | "--auth" => opts.read_secret = true,
            "-r" | "--retry" => {
                let n = args
                    .get(i + 1)
                    .ok_or("missing count argument to -r,--retry")?;
                opts.retry_count = n
                    .parse()
                    .map_err(|_| "retry count is not a number")?;
                i += 1;
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    Ok((opts, i))
}
